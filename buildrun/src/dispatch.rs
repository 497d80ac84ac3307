//! Phase handler registry.
//!
//! A handler turns one attempt into proposer calls. Phases map to handlers
//! by id through `[dispatch.handlers]`; unmapped phases use `generic`.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::core::types::{PatchProposal, Phase, ProposalStatus, TokenUsage};
use crate::io::cancel::CancelToken;
use crate::io::config::DispatchConfig;
use crate::io::context::FileContext;
use crate::io::proposer::{PatchProposer, ProposalRequest, ProposerError};
use crate::io::resolver::ResolvedClient;

pub const GENERIC: &str = "generic";
pub const BATCHED: &str = "batched";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("phase {phase_id} maps to unknown handler {handler}")]
    UnknownHandler { phase_id: String, handler: String },
    #[error("handler {0} registered twice")]
    DuplicateHandler(String),
}

/// Inputs for one attempt, shared by every proposer call it makes.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRequest<'a> {
    pub run_id: &'a str,
    pub phase: &'a Phase,
    pub client: &'a ResolvedClient,
    pub context: &'a FileContext,
    pub diagnostics: Option<&'a str>,
    pub clarification: Option<&'a str>,
}

impl HandlerRequest<'_> {
    fn proposal_request(&self, deliverables: &[String]) -> ProposalRequest {
        ProposalRequest {
            run_id: self.run_id.to_string(),
            phase_id: self.phase.id.clone(),
            description: self.phase.description.clone(),
            attempt_index: self.phase.attempt_index,
            escalation_level: self.client.escalation_level,
            provider: self.client.provider.clone(),
            model: self.client.model.clone(),
            max_tokens: self.client.max_tokens,
            scope: self.phase.scope.clone(),
            deliverables: deliverables.to_vec(),
            context: self.context.clone(),
            diagnostics: self.diagnostics.map(str::to_string),
            clarification: self.clarification.map(str::to_string),
        }
    }
}

pub trait Handler {
    fn name(&self) -> &str;

    fn propose(
        &self,
        proposer: &dyn PatchProposer,
        request: &HandlerRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<PatchProposal, ProposerError>;
}

/// One proposer call covering the whole phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericHandler;

impl Handler for GenericHandler {
    fn name(&self) -> &str {
        GENERIC
    }

    fn propose(
        &self,
        proposer: &dyn PatchProposer,
        request: &HandlerRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<PatchProposal, ProposerError> {
        proposer.propose(&request.proposal_request(&request.phase.deliverables), cancel)
    }
}

/// Splits deliverables into fixed-size batches, one proposer call each.
///
/// Operations are merged in batch order. The first batch that does not
/// come back COMPLETE ends the attempt and its status becomes the merged
/// status.
#[derive(Debug, Clone, Copy)]
pub struct BatchedHandler {
    batch_size: usize,
}

impl BatchedHandler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl Handler for BatchedHandler {
    fn name(&self) -> &str {
        BATCHED
    }

    fn propose(
        &self,
        proposer: &dyn PatchProposer,
        request: &HandlerRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<PatchProposal, ProposerError> {
        let deliverables = &request.phase.deliverables;
        if deliverables.is_empty() {
            return GenericHandler.propose(proposer, request, cancel);
        }

        let mut merged = PatchProposal::new(ProposalStatus::Complete, Vec::new());
        let mut summaries = Vec::new();
        let batches = deliverables.chunks(self.batch_size);
        let total = batches.len();
        for (n, batch) in batches.enumerate() {
            if cancel.is_cancelled() {
                return Err(ProposerError::Cancelled);
            }
            debug!(batch = n + 1, total, files = batch.len(), "proposing batch");
            let proposal = proposer.propose(&request.proposal_request(batch), cancel)?;
            merged.operations.extend(proposal.operations);
            if let Some(summary) = proposal.summary {
                summaries.push(summary);
            }
            if let Some(usage) = proposal.usage {
                let acc = merged.usage.get_or_insert_with(TokenUsage::default);
                acc.input_tokens = acc.input_tokens.saturating_add(usage.input_tokens);
                acc.output_tokens = acc.output_tokens.saturating_add(usage.output_tokens);
            }
            if proposal.status != ProposalStatus::Complete {
                info!(batch = n + 1, total, status = ?proposal.status, "batch stopped the attempt");
                merged.status = proposal.status;
                merged.question = proposal.question;
                break;
            }
        }
        if !summaries.is_empty() {
            merged.summary = Some(summaries.join("\n"));
        }
        Ok(merged)
    }
}

/// Static phase-to-handler registry.
pub struct PhaseDispatcher {
    handlers: Vec<Box<dyn Handler>>,
    routes: BTreeMap<String, String>,
}

impl PhaseDispatcher {
    /// Register the built-in handlers and bind the configured routes. A route
    /// naming a handler that does not exist is a configuration error.
    pub fn bind(config: &DispatchConfig) -> Result<Self, DispatchError> {
        let mut dispatcher = Self {
            handlers: Vec::new(),
            routes: BTreeMap::new(),
        };
        dispatcher.register(Box::new(GenericHandler))?;
        dispatcher.register(Box::new(BatchedHandler::new(config.batch_size)))?;
        for (phase_id, handler) in &config.handlers {
            dispatcher.route(phase_id, handler)?;
        }
        Ok(dispatcher)
    }

    pub fn register(&mut self, handler: Box<dyn Handler>) -> Result<(), DispatchError> {
        if self.get(handler.name()).is_some() {
            return Err(DispatchError::DuplicateHandler(handler.name().to_string()));
        }
        self.handlers.push(handler);
        Ok(())
    }

    pub fn route(&mut self, phase_id: &str, handler: &str) -> Result<(), DispatchError> {
        if self.get(handler).is_none() {
            return Err(DispatchError::UnknownHandler {
                phase_id: phase_id.to_string(),
                handler: handler.to_string(),
            });
        }
        self.routes.insert(phase_id.to_string(), handler.to_string());
        Ok(())
    }

    /// Handler for `phase_id`; the generic handler when no route exists.
    pub fn resolve(&self, phase_id: &str) -> &dyn Handler {
        let name = self
            .routes
            .get(phase_id)
            .map_or(GENERIC, String::as_str);
        self.get(name)
            .or_else(|| self.get(GENERIC))
            .unwrap_or(&GenericHandler)
    }

    fn get(&self, name: &str) -> Option<&dyn Handler> {
        self.handlers
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.as_ref())
    }
}
