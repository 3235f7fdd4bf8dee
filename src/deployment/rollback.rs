//! Rollback requests and operator-facing proposals.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::DeploymentId;
use crate::tracker::ImageKind;

/// Positional selector accepted in rollback requests.
pub const SELECTOR_N_MINUS_1: &str = "n-1";
pub const SELECTOR_N_MINUS_2: &str = "n-2";

/// Operator request to roll a deployment back. `target_version` applies to
/// every image kind; `target_versions` overrides per kind and may mix
/// positional selectors with explicit images.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackRequest {
    pub deployment_id: DeploymentId,
    #[serde(default)]
    pub target_version: Option<String>,
    #[serde(default)]
    pub target_versions: Option<HashMap<String, String>>,
}

impl RollbackRequest {
    pub fn to_n_minus_1(deployment_id: DeploymentId) -> Self {
        Self {
            deployment_id,
            target_version: None,
            target_versions: None,
        }
    }

    /// The selector for one image kind: per-kind override first, then the
    /// global selector, then n-1.
    pub fn selector_for(&self, kind: ImageKind) -> &str {
        self.target_versions
            .as_ref()
            .and_then(|m| m.get(kind.as_str()))
            .map(String::as_str)
            .or(self.target_version.as_deref())
            .unwrap_or(SELECTOR_N_MINUS_1)
    }
}

/// A rollback the orchestrator suggests after a failed rollout. Waits for
/// the operator to approve or dismiss it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RollbackProposal {
    pub deployment_id: DeploymentId,
    pub proposed_at: DateTime<Utc>,
    pub reason: String,
    /// Resolved target image per kind.
    pub targets: HashMap<ImageKind, String>,
}
