//! Deployment records: state, counters and the event timeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::notification::UpdateNotification;
use crate::agent::identity::AgentId;
use crate::utils::time;

pub type DeploymentId = String;

pub fn new_deployment_id() -> DeploymentId {
    ulid::Ulid::new().to_string().to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Rejected,
    RollingBack,
    RollbackProposed,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Completed
                | DeploymentState::Failed
                | DeploymentState::Cancelled
                | DeploymentState::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Pending => "pending",
            DeploymentState::InProgress => "in_progress",
            DeploymentState::Paused => "paused",
            DeploymentState::Completed => "completed",
            DeploymentState::Failed => "failed",
            DeploymentState::Cancelled => "cancelled",
            DeploymentState::Rejected => "rejected",
            DeploymentState::RollingBack => "rolling_back",
            DeploymentState::RollbackProposed => "rollback_proposed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Staged,
    Launched,
    WaveStarted,
    WaveCompleted,
    AgentOutcome,
    AuxiliaryUpdated,
    Paused,
    Resumed,
    Cancelled,
    Rejected,
    Completed,
    Failed,
    RollbackProposed,
    RollbackStarted,
}

/// One entry of a deployment's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub detail: String,
}

/// Result of one agent's update chain, aggregated per wave and deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentUpdateOutcome {
    Updated,
    Deferred { reason: Option<String> },
    Failed { reason: String },
    SkippedDoNotAutostart,
    SkippedAlreadyCurrent,
}

impl AgentUpdateOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, AgentUpdateOutcome::Failed { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            AgentUpdateOutcome::Updated => "updated".to_string(),
            AgentUpdateOutcome::Deferred { reason: Some(r) } => format!("deferred: {r}"),
            AgentUpdateOutcome::Deferred { reason: None } => "deferred".to_string(),
            AgentUpdateOutcome::Failed { reason } => format!("failed: {reason}"),
            AgentUpdateOutcome::SkippedDoNotAutostart => {
                "skipped: do-not-autostart".to_string()
            }
            AgentUpdateOutcome::SkippedAlreadyCurrent => {
                "skipped: already on target version".to_string()
            }
        }
    }
}

/// The orchestrator's stateful record of one notification, from staging to
/// a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub deployment_id: DeploymentId,
    pub status: DeploymentState,
    pub notification: UpdateNotification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub message: String,
    pub agents_total: usize,
    pub agents_updated: usize,
    pub agents_deferred: usize,
    pub agents_failed: usize,
    pub agents_skipped: usize,
    pub events: Vec<DeploymentEvent>,
}

impl DeploymentStatus {
    pub fn new(
        deployment_id: DeploymentId,
        notification: UpdateNotification,
        message: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id,
            status: DeploymentState::Pending,
            notification,
            staged_at: None,
            started_at: None,
            completed_at: None,
            message: message.into(),
            agents_total: 0,
            agents_updated: 0,
            agents_deferred: 0,
            agents_failed: 0,
            agents_skipped: 0,
            events: Vec::new(),
        }
    }

    pub fn push_event(&mut self, kind: EventKind, agent_id: Option<AgentId>, detail: impl Into<String>) {
        self.events.push(DeploymentEvent {
            timestamp: time::now(),
            kind,
            agent_id,
            detail: detail.into(),
        });
    }

    /// Moves the deployment into a terminal state, stamping `completed_at`
    /// and appending exactly one terminal event. Agents never reached
    /// (cancellation, gate failure) are accounted as skipped so the
    /// counters always sum to the total.
    pub fn finish(&mut self, state: DeploymentState, detail: impl Into<String>) {
        debug_assert!(state.is_terminal());
        let accounted =
            self.agents_updated + self.agents_deferred + self.agents_failed + self.agents_skipped;
        if self.agents_total > accounted {
            self.agents_skipped += self.agents_total - accounted;
        }
        let detail = detail.into();
        self.status = state;
        self.completed_at = Some(time::now());
        self.message = detail.clone();
        let kind = match state {
            DeploymentState::Completed => EventKind::Completed,
            DeploymentState::Failed => EventKind::Failed,
            DeploymentState::Cancelled => EventKind::Cancelled,
            _ => EventKind::Rejected,
        };
        self.push_event(kind, None, detail);
    }

    pub fn count(&mut self, outcome: &AgentUpdateOutcome) {
        match outcome {
            AgentUpdateOutcome::Updated => self.agents_updated += 1,
            AgentUpdateOutcome::Deferred { .. } => self.agents_deferred += 1,
            AgentUpdateOutcome::Failed { .. } => self.agents_failed += 1,
            AgentUpdateOutcome::SkippedDoNotAutostart
            | AgentUpdateOutcome::SkippedAlreadyCurrent => self.agents_skipped += 1,
        }
    }

    /// Invariant: in a terminal state the counters account for every agent.
    pub fn counters_consistent(&self) -> bool {
        self.agents_updated + self.agents_deferred + self.agents_failed + self.agents_skipped
            == self.agents_total
    }
}
