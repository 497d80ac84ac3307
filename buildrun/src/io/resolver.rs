//! Provider and model selection for each proposer call.
//!
//! Providers are tried in configured order. A provider that fails for
//! infrastructure reasons `disable_after` times in a row is disabled for the
//! rest of the run and never re-enabled.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::retry::EscalationLadder;
use crate::core::types::TokenUsage;
use crate::io::config::ProviderConfig;
use crate::io::telemetry::{TelemetrySink, UsageRecord};

/// Provider, model and token ceiling for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedClient {
    pub provider: String,
    pub model: String,
    pub tier: String,
    pub max_tokens: u64,
    pub escalation_level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("every provider is disabled for this run")]
    NoProvider,
    #[error("escalation ladder is empty")]
    EmptyLadder,
}

/// Failures that count against a provider. Patch-quality problems never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraFailure {
    Authentication,
    Connectivity,
}

#[derive(Debug, Clone)]
struct ProviderSlot {
    config: ProviderConfig,
    streak: u32,
    disabled: bool,
}

#[derive(Debug, Clone)]
pub struct LlmClientResolver {
    providers: Vec<ProviderSlot>,
    ladder: EscalationLadder,
    telemetry: Option<TelemetrySink>,
}

impl LlmClientResolver {
    pub fn new(providers: &[ProviderConfig], ladder: EscalationLadder) -> Self {
        Self {
            providers: providers
                .iter()
                .map(|config| ProviderSlot {
                    config: config.clone(),
                    streak: 0,
                    disabled: false,
                })
                .collect(),
            ladder,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: TelemetrySink) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// First enabled provider, with the model for `escalation_level`. Levels
    /// past the end of a model list reuse its last model.
    pub fn resolve(&self, escalation_level: u32) -> Result<ResolvedClient, ResolveError> {
        let rung = self
            .ladder
            .rung(escalation_level)
            .ok_or(ResolveError::EmptyLadder)?;
        let slot = self
            .providers
            .iter()
            .find(|slot| !slot.disabled)
            .ok_or(ResolveError::NoProvider)?;
        let models = &slot.config.models;
        let index = usize::try_from(escalation_level)
            .unwrap_or(usize::MAX)
            .min(models.len().saturating_sub(1));
        let model = models.get(index).cloned().unwrap_or_default();
        debug!(provider = %slot.config.name, %model, escalation_level, "resolved client");
        Ok(ResolvedClient {
            provider: slot.config.name.clone(),
            model,
            tier: rung.tier.clone(),
            max_tokens: rung.max_tokens,
            escalation_level,
        })
    }

    pub fn record_success(&mut self, provider: &str) {
        if let Some(slot) = self.slot_mut(provider) {
            slot.streak = 0;
        }
    }

    /// Count an infrastructure failure. Returns true when this call disabled
    /// the provider.
    pub fn record_failure(&mut self, provider: &str, failure: InfraFailure) -> bool {
        let Some(slot) = self.slot_mut(provider) else {
            return false;
        };
        if slot.disabled {
            return false;
        }
        slot.streak += 1;
        if slot.streak >= slot.config.disable_after {
            slot.disabled = true;
            warn!(provider, ?failure, streak = slot.streak, "provider disabled for this run");
            return true;
        }
        debug!(provider, ?failure, streak = slot.streak, "provider failure recorded");
        false
    }

    pub fn is_disabled(&self, provider: &str) -> bool {
        self.providers
            .iter()
            .any(|slot| slot.config.name == provider && slot.disabled)
    }

    pub fn has_enabled_provider(&self) -> bool {
        self.providers.iter().any(|slot| !slot.disabled)
    }

    /// Best-effort usage ledger entry.
    pub fn record_usage(
        &self,
        run_id: &str,
        phase_id: &str,
        attempt_index: u32,
        client: &ResolvedClient,
        usage: &TokenUsage,
    ) {
        let Some(sink) = &self.telemetry else {
            return;
        };
        sink.record_usage(&UsageRecord {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt_index,
            provider: client.provider.clone(),
            model: client.model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            recorded_at: Utc::now(),
        });
    }

    fn slot_mut(&mut self, provider: &str) -> Option<&mut ProviderSlot> {
        self.providers
            .iter_mut()
            .find(|slot| slot.config.name == provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig {
                name: "primary".to_string(),
                models: vec!["small".to_string(), "large".to_string()],
                disable_after: 2,
            },
            ProviderConfig {
                name: "fallback".to_string(),
                models: vec!["only".to_string()],
                disable_after: 1,
            },
        ]
    }

    #[test]
    fn model_and_budget_follow_escalation_level() {
        let resolver = LlmClientResolver::new(&providers(), EscalationLadder::default());
        let base = resolver.resolve(0).expect("resolve");
        let top = resolver.resolve(2).expect("resolve");
        assert_eq!((base.provider.as_str(), base.model.as_str()), ("primary", "small"));
        assert_eq!(top.model, "large", "levels past the list reuse the last model");
        assert!(top.max_tokens > base.max_tokens);
    }

    /// Verifies disable-after-N and that successes reset the streak.
    #[test]
    fn consecutive_failures_disable_provider_for_good() {
        let mut resolver = LlmClientResolver::new(&providers(), EscalationLadder::default());

        assert!(!resolver.record_failure("primary", InfraFailure::Connectivity));
        resolver.record_success("primary");
        assert!(!resolver.record_failure("primary", InfraFailure::Connectivity));
        assert!(resolver.record_failure("primary", InfraFailure::Authentication));
        assert!(resolver.is_disabled("primary"));

        resolver.record_success("primary");
        assert!(resolver.is_disabled("primary"), "never re-enabled");
        assert_eq!(resolver.resolve(0).expect("resolve").provider, "fallback");

        assert!(resolver.record_failure("fallback", InfraFailure::Connectivity));
        assert_eq!(resolver.resolve(0), Err(ResolveError::NoProvider));
        assert!(!resolver.has_enabled_provider());
    }

    #[test]
    fn usage_ledger_is_written_when_configured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let usage_path = temp.path().join("usage.jsonl");
        let sink = TelemetrySink::new(temp.path().join("budget.jsonl"), &usage_path);
        let resolver =
            LlmClientResolver::new(&providers(), EscalationLadder::default()).with_telemetry(sink);
        let client = resolver.resolve(0).expect("resolve");
        resolver.record_usage(
            "r",
            "p",
            1,
            &client,
            &TokenUsage {
                input_tokens: 3,
                output_tokens: 4,
            },
        );
        let text = std::fs::read_to_string(usage_path).expect("read");
        assert!(text.contains("\"provider\":\"primary\""));
    }
}
