//! Typed client for the Supervisor coordination API.
//!
//! Endpoints:
//! - `POST /runs/{run}/phases/{phase}/status`
//! - `POST /runs/{run}/phases/{phase}/attempts`
//! - `POST /approvals`, `GET /approvals/{id}`
//! - `POST /clarifications`, `GET /clarifications/{id}`

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{
    ApprovalRequest, AttemptOutcome, CiCounts, ClarificationRequest, PhaseState, StopReason,
    TokenUsage,
};
use crate::io::config::SupervisorConfig;

/// Longest error body carried into `SupervisorError::Http`.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor request timed out")]
    Timeout,
    #[error("supervisor unreachable: {message}")]
    Network { message: String },
    #[error("supervisor returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("supervisor response could not be decoded: {message}")]
    InvalidResponse { message: String },
    #[error("no supervisor configured to handle {what}")]
    Unavailable { what: &'static str },
    #[error("invalid supervisor base URL: {message}")]
    InvalidUrl { message: String },
}

impl SupervisorError {
    /// Worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, SupervisorError::Timeout | SupervisorError::Network { .. })
            || matches!(self, SupervisorError::Http { status, .. } if *status >= 500)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStatusUpdate {
    pub state: PhaseState,
    pub attempt_index: u32,
    pub escalation_level: u32,
    pub revision_epoch: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub updated_at: DateTime<Utc>,
}

/// What happened in one attempt, as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptReport {
    pub attempt_index: u32,
    pub escalation_level: u32,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub outcome: AttemptOutcome,
    pub message: String,
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touched_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci: Option<CiCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<String>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApproval {
    pub run_id: String,
    pub phase_id: String,
    pub payload_hash: String,
    pub summary: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClarification {
    pub run_id: String,
    pub phase_id: String,
    pub question: String,
}

/// The coordination surface the executor depends on.
pub trait Supervisor {
    fn update_phase_status(
        &self,
        run_id: &str,
        phase_id: &str,
        update: &PhaseStatusUpdate,
    ) -> Result<(), SupervisorError>;

    fn submit_attempt(
        &self,
        run_id: &str,
        phase_id: &str,
        report: &AttemptReport,
    ) -> Result<(), SupervisorError>;

    fn request_approval(&self, request: &NewApproval) -> Result<ApprovalRequest, SupervisorError>;

    fn poll_approval(&self, id: &str) -> Result<ApprovalRequest, SupervisorError>;

    fn request_clarification(
        &self,
        request: &NewClarification,
    ) -> Result<ClarificationRequest, SupervisorError>;

    fn poll_clarification(&self, id: &str) -> Result<ClarificationRequest, SupervisorError>;
}

/// HTTP/JSON client with a bearer credential and bounded per-call timeouts.
#[derive(Debug, Clone)]
pub struct SupervisorApiClient {
    base_url: Url,
    token: Option<String>,
    http: Client,
}

impl SupervisorApiClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, SupervisorError> {
        let base_url = Url::parse(base_url.into().trim()).map_err(|e| {
            SupervisorError::InvalidUrl {
                message: e.to_string(),
            }
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SupervisorError::InvalidUrl {
                message: format!("{base_url} cannot carry a path"),
            });
        }
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .user_agent(concat!("buildrun/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SupervisorError::Network {
                message: e.to_string(),
            })?;
        Ok(Self {
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
            http,
        })
    }

    /// Client for `config`, or `None` when no base URL is configured.
    /// The bearer token is read from `config.token_env` once, here.
    pub fn from_config(config: &SupervisorConfig) -> Result<Option<Self>> {
        let Some(base_url) = &config.base_url else {
            return Ok(None);
        };
        let token = config
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        let client = Self::new(
            base_url.clone(),
            token,
            Duration::from_secs(config.timeout_secs),
            Duration::from_secs(config.connect_timeout_secs),
        )
        .context("build supervisor client")?;
        Ok(Some(client))
    }

    /// Base URL extended with `segments`, each percent-encoded as one
    /// path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn post_json<B: Serialize>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<String, SupervisorError> {
        self.send(self.authorized(self.http.post(self.url(segments)).json(body)))
    }

    fn get(&self, segments: &[&str]) -> Result<String, SupervisorError> {
        self.send(self.authorized(self.http.get(self.url(segments))))
    }

    fn send(&self, builder: RequestBuilder) -> Result<String, SupervisorError> {
        let response = builder.send().map_err(map_transport)?;
        let status = response.status();
        let body = response.text().map_err(map_transport)?;
        if !status.is_success() {
            let mut message = body;
            truncate_at_char(&mut message, MAX_ERROR_BODY);
            warn!(status = status.as_u16(), "supervisor returned error status");
            return Err(SupervisorError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }
}

fn map_transport(err: reqwest::Error) -> SupervisorError {
    if err.is_timeout() {
        SupervisorError::Timeout
    } else if err.is_decode() {
        SupervisorError::InvalidResponse {
            message: err.to_string(),
        }
    } else {
        SupervisorError::Network {
            message: err.to_string(),
        }
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, SupervisorError> {
    serde_json::from_str(body).map_err(|e| SupervisorError::InvalidResponse {
        message: e.to_string(),
    })
}

fn truncate_at_char(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

impl Supervisor for SupervisorApiClient {
    #[instrument(skip_all, fields(run_id = %run_id, phase_id = %phase_id, state = %update.state))]
    fn update_phase_status(
        &self,
        run_id: &str,
        phase_id: &str,
        update: &PhaseStatusUpdate,
    ) -> Result<(), SupervisorError> {
        self.post_json(&["runs", run_id, "phases", phase_id, "status"], update)?;
        Ok(())
    }

    #[instrument(
        skip_all,
        fields(run_id = %run_id, phase_id = %phase_id, attempt = report.attempt_index)
    )]
    fn submit_attempt(
        &self,
        run_id: &str,
        phase_id: &str,
        report: &AttemptReport,
    ) -> Result<(), SupervisorError> {
        self.post_json(&["runs", run_id, "phases", phase_id, "attempts"], report)?;
        Ok(())
    }

    #[instrument(skip_all, fields(phase_id = %request.phase_id))]
    fn request_approval(&self, request: &NewApproval) -> Result<ApprovalRequest, SupervisorError> {
        let body = self.post_json(&["approvals"], request)?;
        let approval: ApprovalRequest = decode(&body)?;
        debug!(approval_id = %approval.id, "approval requested");
        Ok(approval)
    }

    fn poll_approval(&self, id: &str) -> Result<ApprovalRequest, SupervisorError> {
        decode(&self.get(&["approvals", id])?)
    }

    #[instrument(skip_all, fields(phase_id = %request.phase_id))]
    fn request_clarification(
        &self,
        request: &NewClarification,
    ) -> Result<ClarificationRequest, SupervisorError> {
        decode(&self.post_json(&["clarifications"], request)?)
    }

    fn poll_clarification(&self, id: &str) -> Result<ClarificationRequest, SupervisorError> {
        decode(&self.get(&["clarifications", id])?)
    }
}

/// Offline stand-in used when no Supervisor is configured. Reports go to the
/// log; approvals and clarifications are refused, never granted.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSupervisor;

impl Supervisor for LocalSupervisor {
    fn update_phase_status(
        &self,
        run_id: &str,
        phase_id: &str,
        update: &PhaseStatusUpdate,
    ) -> Result<(), SupervisorError> {
        info!(
            run_id,
            phase_id,
            state = %update.state,
            attempt = update.attempt_index,
            "phase status"
        );
        Ok(())
    }

    fn submit_attempt(
        &self,
        run_id: &str,
        phase_id: &str,
        report: &AttemptReport,
    ) -> Result<(), SupervisorError> {
        info!(
            run_id,
            phase_id,
            attempt = report.attempt_index,
            outcome = %report.outcome,
            message = %report.message,
            "attempt finished"
        );
        Ok(())
    }

    fn request_approval(&self, _request: &NewApproval) -> Result<ApprovalRequest, SupervisorError> {
        Err(SupervisorError::Unavailable { what: "approvals" })
    }

    fn poll_approval(&self, _id: &str) -> Result<ApprovalRequest, SupervisorError> {
        Err(SupervisorError::Unavailable { what: "approvals" })
    }

    fn request_clarification(
        &self,
        _request: &NewClarification,
    ) -> Result<ClarificationRequest, SupervisorError> {
        Err(SupervisorError::Unavailable {
            what: "clarifications",
        })
    }

    fn poll_clarification(&self, _id: &str) -> Result<ClarificationRequest, SupervisorError> {
        Err(SupervisorError::Unavailable {
            what: "clarifications",
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use crate::core::types::{ApprovalStatus, ClarificationStatus};

    /// One-shot HTTP server. Returns the base URL and a handle yielding the
    /// raw request it received.
    fn serve_once(
        status: u16,
        body: &'static str,
        delay: Duration,
    ) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read line");
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().expect("length");
                }
                request.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut body_buf = vec![0u8; content_length];
            reader.read_exact(&mut body_buf).expect("body");
            request.push_str(&String::from_utf8_lossy(&body_buf));

            thread::sleep(delay);
            let mut stream = stream;
            let response = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            request
        });
        (format!("http://{addr}"), handle)
    }

    fn client(base_url: &str, token: Option<&str>) -> SupervisorApiClient {
        SupervisorApiClient::new(
            base_url,
            token.map(str::to_string),
            Duration::from_millis(800),
            Duration::from_millis(800),
        )
        .expect("client")
    }

    #[test]
    fn poll_approval_decodes_and_sends_bearer() {
        let body = r#"{"id":"ap-1","phase_id":"p1","payload_hash":"abc","requested_at":"2026-01-01T00:00:00Z","status":"APPROVED"}"#;
        let (url, server) = serve_once(200, body, Duration::ZERO);
        let approval = client(&url, Some("s3cret")).poll_approval("ap-1").expect("poll");
        let request = server.join().expect("server");

        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert!(request.starts_with("GET /approvals/ap-1 "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer s3cret"));
    }

    #[test]
    fn request_clarification_posts_json() {
        let body = r#"{"id":"c-1","phase_id":"p1","question":"which db?","status":"PENDING"}"#;
        let (url, server) = serve_once(201, body, Duration::ZERO);
        let clarification = client(&url, None)
            .request_clarification(&NewClarification {
                run_id: "r".to_string(),
                phase_id: "p1".to_string(),
                question: "which db?".to_string(),
            })
            .expect("request");
        let request = server.join().expect("server");

        assert_eq!(clarification.status, ClarificationStatus::Pending);
        assert!(request.starts_with("POST /clarifications "));
        assert!(request.contains("\"question\":\"which db?\""));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    /// Verifies ids are sent as single encoded path segments under the base path.
    #[test]
    fn ids_are_encoded_as_path_segments() {
        let (url, server) = serve_once(200, "{}", Duration::ZERO);
        client(&format!("{url}/api/"), None)
            .update_phase_status(
                "run 1",
                "web/ui",
                &PhaseStatusUpdate {
                    state: PhaseState::InProgress,
                    attempt_index: 0,
                    escalation_level: 0,
                    revision_epoch: 0,
                    stop_reason: None,
                    updated_at: Utc::now(),
                },
            )
            .expect("update");
        let request = server.join().expect("server");
        assert!(
            request.starts_with("POST /api/runs/run%201/phases/web%2Fui/status "),
            "{request}"
        );
    }

    #[test]
    fn base_url_must_parse() {
        let err = SupervisorApiClient::new(
            "not a url",
            None,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .expect_err("invalid");
        assert!(matches!(err, SupervisorError::InvalidUrl { .. }));
    }

    #[test]
    fn error_status_maps_to_http() {
        let (url, server) = serve_once(503, "{\"error\":\"down\"}", Duration::ZERO);
        let err = client(&url, None).poll_approval("x").expect_err("503");
        server.join().expect("server");
        assert!(matches!(err, SupervisorError::Http { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn garbage_body_maps_to_invalid_response() {
        let (url, server) = serve_once(200, "not json", Duration::ZERO);
        let err = client(&url, None).poll_clarification("c").expect_err("garbage");
        server.join().expect("server");
        assert!(matches!(err, SupervisorError::InvalidResponse { .. }));
    }

    #[test]
    fn slow_server_maps_to_timeout() {
        let (url, server) = serve_once(200, "{}", Duration::from_secs(2));
        let err = client(&url, None).poll_approval("x").expect_err("timeout");
        assert_eq!(err, SupervisorError::Timeout);
        server.join().expect("server");
    }

    #[test]
    fn refused_connection_maps_to_network() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let err = client(&format!("http://127.0.0.1:{port}"), None)
            .poll_approval("x")
            .expect_err("refused");
        assert!(matches!(err, SupervisorError::Network { .. }));
    }

    #[test]
    fn local_supervisor_never_approves() {
        let err = LocalSupervisor
            .request_approval(&NewApproval {
                run_id: "r".to_string(),
                phase_id: "p".to_string(),
                payload_hash: "h".to_string(),
                summary: String::new(),
                paths: Vec::new(),
            })
            .expect_err("refused");
        assert!(matches!(err, SupervisorError::Unavailable { .. }));
        assert!(!err.is_transient());
    }
}
