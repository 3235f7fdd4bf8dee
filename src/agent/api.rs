//! Client for the control surface every agent exposes on its published port.
//!
//! The contract the core depends on:
//! - `GET /system/health` for the live version and cognitive state.
//! - `POST /system/shutdown` with a reason; 2xx accepts, 409 with
//!   `{"deferred": true}` defers, anything else rejects.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::client::{HttpClient, HttpRequestError};

#[derive(Error, Debug)]
pub enum AgentApiError {
    #[error("agent health request failed: {0}")]
    Health(#[source] HttpRequestError),
}

/// Live state reported by an agent. Every field is best-effort; an agent
/// running older code may omit any of them.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AgentHealth {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub codename: Option<String>,
    #[serde(default)]
    pub code_hash: Option<String>,
    #[serde(default)]
    pub cognitive_state: Option<String>,
    #[serde(default)]
    pub uptime_seconds: Option<f64>,
    #[serde(default)]
    pub initialization_complete: Option<bool>,
}

/// Result of soliciting a graceful shutdown.
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownOutcome {
    /// The agent accepted and will exit on its own.
    Accepted,
    /// The agent elected to keep running (wisdom-based deferral).
    Deferred { reason: Option<String> },
    /// The agent answered but refused without deferring.
    Rejected { status: u16, detail: String },
    /// No usable answer: connection error or timeout.
    Unreachable { detail: String },
}

#[derive(Serialize)]
struct ShutdownRequest<'a> {
    reason: &'a str,
}

#[derive(Deserialize, Default)]
struct DeferralBody {
    #[serde(default)]
    deferred: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Seam between the orchestration layers and the agent HTTP surface.
#[cfg_attr(test, mockall::automock)]
pub trait AgentApi: Send + Sync {
    fn health(&self, address: &str, port: u16, token: &str) -> Result<AgentHealth, AgentApiError>;

    fn request_shutdown(
        &self,
        address: &str,
        port: u16,
        token: &str,
        reason: &str,
    ) -> ShutdownOutcome;
}

pub struct AgentApiClient {
    http: HttpClient,
}

impl AgentApiClient {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    fn url(address: &str, port: u16, path: &str) -> String {
        format!("http://{address}:{port}{path}")
    }
}

impl AgentApi for AgentApiClient {
    fn health(&self, address: &str, port: u16, token: &str) -> Result<AgentHealth, AgentApiError> {
        self.http
            .get_json(&Self::url(address, port, "/system/health"), Some(token))
            .map_err(AgentApiError::Health)
    }

    fn request_shutdown(
        &self,
        address: &str,
        port: u16,
        token: &str,
        reason: &str,
    ) -> ShutdownOutcome {
        let url = Self::url(address, port, "/system/shutdown");
        match self
            .http
            .post_json(&url, Some(token), &ShutdownRequest { reason })
        {
            Ok(()) => ShutdownOutcome::Accepted,
            Err(HttpRequestError::UnsuccessfulResponse { status, body }) => {
                let parsed: DeferralBody = serde_json::from_str(&body).unwrap_or_default();
                if status.as_u16() == 409 && parsed.deferred {
                    ShutdownOutcome::Deferred {
                        reason: parsed.reason,
                    }
                } else {
                    ShutdownOutcome::Rejected {
                        status: status.as_u16(),
                        detail: body,
                    }
                }
            }
            Err(err) => ShutdownOutcome::Unreachable {
                detail: err.to_string(),
            },
        }
    }
}
