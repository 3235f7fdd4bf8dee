//! The deployment orchestrator: the state machine that turns a CD
//! notification into a coordinated fleet transition.
//!
//! A notification is evaluated against the tracker's current versions,
//! staged for operator launch (or auto-started when low-risk), then rolled
//! out in canary waves with gate checks at every cohort boundary. Rollbacks
//! run the same machinery toward older images and finish by recording
//! instead of promoting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::canary::{partition_into_waves, Wave};
use super::error::DeploymentError;
use super::notification::{DeployStrategy, TokenScope, UpdateNotification};
use super::rollback::{RollbackProposal, RollbackRequest, SELECTOR_N_MINUS_1, SELECTOR_N_MINUS_2};
use super::status::{
    new_deployment_id, AgentUpdateOutcome, DeploymentEvent, DeploymentId, DeploymentState,
    DeploymentStatus, EventKind,
};
use super::updater::{AgentUpdater, UpdateTarget};
use crate::agent::identity::ServerId;
use crate::container::manager::ClientManager;
use crate::discovery::{AgentDiscovery, DiscoveredAgent};
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::tracker::{ImageKind, VersionMeta, VersionTracker};
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};
use crate::utils::time;

/// Orchestrator thresholds and pacing. All of it is configuration; the
/// defaults match a small fleet.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentConfig {
    /// Fraction of a wave that may fail before the deployment fails.
    pub failure_threshold: f64,
    /// Aggregated deferral rate that pauses the deployment.
    pub deferral_ceiling: f64,
    /// Agents updated concurrently within a wave.
    pub wave_concurrency: usize,
    /// Terminal deployments retained for history queries.
    pub history_cap: usize,
    /// Poll granularity while paused or waiting for resume.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub pause_poll: Duration,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.34,
            deferral_ceiling: 0.5,
            wave_concurrency: 3,
            history_cap: 20,
            pause_poll: Duration::from_secs(1),
        }
    }
}

/// Compose files for the non-agent containers (gui, nginx) and the host
/// they live on. Kinds without a compose file are skipped with an event.
#[derive(Debug, Clone, Default)]
pub struct AuxiliaryTargets {
    pub compose_files: HashMap<ImageKind, PathBuf>,
    pub server: Option<ServerId>,
}

/// What the CD pipeline gets back from a notification.
#[derive(Debug, Clone, Serialize)]
pub struct NotifyReceipt {
    pub deployment_id: DeploymentId,
    pub status: DeploymentState,
    pub message: String,
    pub agents_affected: usize,
}

/// Per-agent line of a deployment preview.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPreview {
    pub agent_id: String,
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    pub canary_group: &'static str,
    pub action: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPreview {
    pub deployment_id: DeploymentId,
    pub status: DeploymentState,
    pub targets: HashMap<ImageKind, String>,
    pub agents: Vec<AgentPreview>,
    pub will_update: usize,
    pub will_skip: usize,
}

/// Shared cancel/pause flags observed by the rollout thread at cohort and
/// per-agent boundaries.
#[derive(Default)]
struct RolloutControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl RolloutControl {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Everything a rollout thread needs to drive one deployment.
#[derive(Debug, Clone)]
struct RolloutPlan {
    targets: HashMap<ImageKind, String>,
    expected_version: Option<String>,
    reason: String,
    rollback: bool,
}

#[derive(Default)]
struct OrchestratorInner {
    deployments: HashMap<DeploymentId, DeploymentStatus>,
    /// Insertion order, oldest first.
    order: Vec<DeploymentId>,
    /// The single slot for a deployment with a running rollout.
    active: Option<DeploymentId>,
    plans: HashMap<DeploymentId, RolloutPlan>,
    controls: HashMap<DeploymentId, Arc<RolloutControl>>,
    proposals: HashMap<DeploymentId, RollbackProposal>,
}

/// The cloneable core shared between the API surface and the rollout
/// threads.
#[derive(Clone)]
struct Shared {
    tracker: Arc<VersionTracker>,
    discovery: Arc<dyn AgentDiscovery>,
    updater: Arc<dyn AgentUpdater>,
    clients: Arc<ClientManager>,
    auxiliary: Arc<AuxiliaryTargets>,
    config: DeploymentConfig,
    inner: Arc<Mutex<OrchestratorInner>>,
}

pub struct DeploymentOrchestrator {
    shared: Shared,
    threads: Mutex<Vec<StartedThreadContext>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        tracker: Arc<VersionTracker>,
        discovery: Arc<dyn AgentDiscovery>,
        updater: Arc<dyn AgentUpdater>,
        clients: Arc<ClientManager>,
        auxiliary: AuxiliaryTargets,
        config: DeploymentConfig,
    ) -> Self {
        Self {
            shared: Shared {
                tracker,
                discovery,
                updater,
                clients,
                auxiliary: Arc::new(auxiliary),
                config,
                inner: Arc::new(Mutex::new(OrchestratorInner::default())),
            },
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Ingests a CD notification: validates the token scope, compares the
    /// targets against the tracker, and either records a no-op, stages the
    /// deployment for operator launch, or auto-starts a low-risk one.
    pub fn notify(
        &self,
        notification: UpdateNotification,
        scope: TokenScope,
    ) -> Result<NotifyReceipt, DeploymentError> {
        scope.validate(&notification)?;

        let images = notification.images();
        let deployment_id = new_deployment_id();

        // Which kinds actually change anything.
        let mut differing: HashMap<ImageKind, String> = HashMap::new();
        for (kind, image) in &images {
            let current = self.shared.tracker.current(*kind)?;
            if current.map(|v| v.image != *image).unwrap_or(true) {
                differing.insert(*kind, image.to_string());
            }
        }

        // Snapshot the fleet before taking the state lock.
        let affected = if differing.contains_key(&ImageKind::Agent) {
            self.shared.discovery.discover_agents().len()
        } else {
            0
        };

        let mut inner = self.shared.lock_inner();

        if images.is_empty() || differing.is_empty() {
            let mut status = DeploymentStatus::new(
                deployment_id.clone(),
                notification,
                "No updates needed",
            );
            status.finish(DeploymentState::Completed, "No updates needed");
            insert_deployment(&mut inner, status);
            self.shared.prune_history(&mut inner);
            return Ok(NotifyReceipt {
                deployment_id,
                status: DeploymentState::Completed,
                message: "No updates needed".to_string(),
                agents_affected: 0,
            });
        }

        // A second notification conflicts while a non-terminal deployment
        // covers any of the same image kinds.
        for (id, deployment) in &inner.deployments {
            if deployment.status.is_terminal() {
                continue;
            }
            let overlapping = deployment
                .notification
                .images()
                .iter()
                .any(|(kind, _)| differing.contains_key(kind));
            if overlapping {
                return Err(DeploymentError::Conflict(format!(
                    "deployment '{id}' is still {} for an overlapping image kind",
                    deployment.status.as_str()
                )));
            }
        }

        let low_risk = notification.strategy != DeployStrategy::Manual
            && !notification.is_critical_risk()
            && differing.len() <= 1;
        // Low-risk deployments may auto-start, but only when the pipeline
        // asked for an immediate rollout; canary and manual strategies
        // always wait for an operator.
        let auto_start = low_risk && notification.strategy == DeployStrategy::Immediate;

        for (kind, image) in &differing {
            self.shared.tracker.stage(
                *kind,
                image,
                VersionMeta {
                    digest: notification.commit_sha.as_deref(),
                    deployment_id: Some(&deployment_id),
                    deployed_by: Some("cd-pipeline"),
                },
            )?;
        }

        let plan = RolloutPlan {
            targets: differing,
            expected_version: notification.version.clone(),
            reason: notification.shutdown_reason(),
            rollback: false,
        };

        let mut status = DeploymentStatus::new(
            deployment_id.clone(),
            notification,
            "Staged for operator review",
        );
        status.staged_at = Some(time::now());
        status.agents_total = affected;
        status.push_event(EventKind::Staged, None, "staged for operator review");

        inner.plans.insert(deployment_id.clone(), plan);
        insert_deployment(&mut inner, status);

        // An occupied active slot degrades an auto-start to staging.
        let (state, message) = if auto_start && inner.active.is_none() {
            self.start_rollout(&mut inner, &deployment_id)?;
            (
                DeploymentState::InProgress,
                "Low-risk update started automatically".to_string(),
            )
        } else {
            (
                DeploymentState::Pending,
                "Update staged for operator review".to_string(),
            )
        };
        info!(deployment_id, status = state.as_str(), "notification processed");

        Ok(NotifyReceipt {
            deployment_id,
            status: state,
            message,
            agents_affected: affected,
        })
    }

    /// Launches a staged deployment, or resumes a paused one.
    pub fn launch(&self, deployment_id: &str) -> Result<(), DeploymentError> {
        let mut inner = self.shared.lock_inner();
        let deployment = get_deployment(&inner, deployment_id)?;
        match deployment.status {
            DeploymentState::Pending => self.start_rollout(&mut inner, deployment_id),
            DeploymentState::Paused => {
                if let Some(control) = inner.controls.get(deployment_id) {
                    control.resume();
                }
                let deployment = get_deployment_mut(&mut inner, deployment_id)?;
                deployment.status = DeploymentState::InProgress;
                deployment.push_event(EventKind::Resumed, None, "resumed by operator");
                Ok(())
            }
            other => Err(DeploymentError::Conflict(format!(
                "deployment is {}, not pending or paused",
                other.as_str()
            ))),
        }
    }

    /// Pauses an active deployment: in-flight agent updates complete, no
    /// further agents are scheduled.
    pub fn pause(&self, deployment_id: &str) -> Result<(), DeploymentError> {
        let mut inner = self.shared.lock_inner();
        let deployment = get_deployment(&inner, deployment_id)?;
        if deployment.status != DeploymentState::InProgress {
            return Err(DeploymentError::Conflict(format!(
                "deployment is {}, not in progress",
                deployment.status.as_str()
            )));
        }
        if let Some(control) = inner.controls.get(deployment_id) {
            control.pause();
        }
        let deployment = get_deployment_mut(&mut inner, deployment_id)?;
        deployment.status = DeploymentState::Paused;
        deployment.push_event(EventKind::Paused, None, "paused by operator");
        Ok(())
    }

    /// Cancels any non-terminal deployment. In-flight updates complete;
    /// staged tracker slots for its kinds are cleared.
    pub fn cancel(&self, deployment_id: &str, reason: &str) -> Result<(), DeploymentError> {
        let mut inner = self.shared.lock_inner();
        let deployment = get_deployment(&inner, deployment_id)?;
        if deployment.status.is_terminal() {
            return Err(DeploymentError::Conflict(
                "deployment already reached a terminal state".to_string(),
            ));
        }
        if let Some(control) = inner.controls.get(deployment_id) {
            control.cancel();
        }
        self.shared.clear_staged_kinds(&inner, deployment_id)?;
        let deployment = get_deployment_mut(&mut inner, deployment_id)?;
        deployment.finish(DeploymentState::Cancelled, format!("cancelled: {reason}"));
        if inner.active.as_deref() == Some(deployment_id) {
            inner.active = None;
        }
        self.shared.prune_history(&mut inner);
        Ok(())
    }

    /// Rejects a staged deployment before launch.
    pub fn reject(&self, deployment_id: &str, reason: &str) -> Result<(), DeploymentError> {
        let mut inner = self.shared.lock_inner();
        let deployment = get_deployment(&inner, deployment_id)?;
        if deployment.status != DeploymentState::Pending {
            return Err(DeploymentError::Conflict(format!(
                "deployment is {}, only staged deployments can be rejected",
                deployment.status.as_str()
            )));
        }
        self.shared.clear_staged_kinds(&inner, deployment_id)?;
        let deployment = get_deployment_mut(&mut inner, deployment_id)?;
        deployment.finish(DeploymentState::Rejected, format!("rejected: {reason}"));
        self.shared.prune_history(&mut inner);
        Ok(())
    }

    /// Rolls a deployment back toward older images. Positional selectors
    /// resolve through the tracker; validation errors reject the request,
    /// warnings are recorded on the timeline.
    pub fn rollback(&self, request: &RollbackRequest) -> Result<(), DeploymentError> {
        let deployment_id = request.deployment_id.clone();
        let mut inner = self.shared.lock_inner();
        let deployment = get_deployment(&inner, &deployment_id)?;
        if deployment.status == DeploymentState::Pending {
            return Err(DeploymentError::Conflict(
                "deployment was never launched, reject it instead".to_string(),
            ));
        }

        let kinds: Vec<ImageKind> = deployment
            .notification
            .images()
            .iter()
            .map(|(kind, _)| *kind)
            .collect();
        let targets = self.shared.resolve_rollback_targets(&kinds, request)?;

        let named: HashMap<String, String> = targets
            .iter()
            .map(|(kind, image)| (kind.as_str().to_string(), image.clone()))
            .collect();
        let validation = self.shared.tracker.validate_rollback(&named)?;
        if !validation.valid {
            return Err(DeploymentError::BadRequest(format!(
                "rollback validation failed: {}",
                validation.errors.join("; ")
            )));
        }

        // Stop whatever the current rollout thread is doing.
        if let Some(control) = inner.controls.get(&deployment_id) {
            control.cancel();
        }

        let deployment = get_deployment_mut(&mut inner, &deployment_id)?;
        deployment.status = DeploymentState::RollingBack;
        deployment.agents_updated = 0;
        deployment.agents_deferred = 0;
        deployment.agents_failed = 0;
        deployment.agents_skipped = 0;
        deployment.completed_at = None;
        for warning in &validation.warnings {
            deployment.push_event(
                EventKind::RollbackStarted,
                None,
                format!("warning: {warning}"),
            );
        }
        let detail = targets
            .iter()
            .map(|(kind, image)| format!("{kind} -> {image}"))
            .collect::<Vec<_>>()
            .join(", ");
        deployment.push_event(
            EventKind::RollbackStarted,
            None,
            format!("rolling back: {detail}"),
        );

        inner.proposals.remove(&deployment_id);
        inner.plans.insert(
            deployment_id.clone(),
            RolloutPlan {
                targets,
                expected_version: None,
                reason: format!("Rolling back deployment {deployment_id}"),
                rollback: true,
            },
        );
        inner.active = Some(deployment_id.clone());
        self.spawn_rollout(&mut inner, &deployment_id);
        Ok(())
    }

    /// Executes a previously proposed rollback.
    pub fn approve_rollback(&self, deployment_id: &str) -> Result<(), DeploymentError> {
        let proposal = {
            let inner = self.shared.lock_inner();
            inner
                .proposals
                .get(deployment_id)
                .cloned()
                .ok_or_else(|| {
                    DeploymentError::NotFound(format!("rollback proposal for '{deployment_id}'"))
                })?
        };
        let request = RollbackRequest {
            deployment_id: proposal.deployment_id,
            target_version: None,
            target_versions: Some(
                proposal
                    .targets
                    .iter()
                    .map(|(kind, image)| (kind.as_str().to_string(), image.clone()))
                    .collect(),
            ),
        };
        self.rollback(&request)
    }

    pub fn rollback_proposals(&self) -> Vec<RollbackProposal> {
        let inner = self.shared.lock_inner();
        let mut proposals: Vec<RollbackProposal> = inner.proposals.values().cloned().collect();
        proposals.sort_by(|a, b| b.proposed_at.cmp(&a.proposed_at));
        proposals
    }

    /// The deployment a given id points at, or the active one.
    pub fn status(&self, deployment_id: Option<&str>) -> Option<DeploymentStatus> {
        let inner = self.shared.lock_inner();
        match deployment_id {
            Some(id) => inner.deployments.get(id).cloned(),
            None => inner
                .active
                .as_ref()
                .and_then(|id| inner.deployments.get(id))
                .cloned(),
        }
    }

    /// Staged deployments awaiting launch, newest first.
    pub fn pending_deployments(&self) -> Vec<DeploymentStatus> {
        let inner = self.shared.lock_inner();
        let mut pending: Vec<DeploymentStatus> = inner
            .deployments
            .values()
            .filter(|d| d.status == DeploymentState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.staged_at.cmp(&a.staged_at));
        pending
    }

    /// Terminal deployments, newest first, bounded by `limit`.
    pub fn history(&self, limit: usize) -> Vec<DeploymentStatus> {
        let inner = self.shared.lock_inner();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.deployments.get(id))
            .filter(|d| d.status.is_terminal())
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn events(&self, deployment_id: &str) -> Result<Vec<DeploymentEvent>, DeploymentError> {
        let inner = self.shared.lock_inner();
        Ok(get_deployment(&inner, deployment_id)?.events.clone())
    }

    /// Who will update and who will be skipped, without touching anything.
    pub fn preview(&self, deployment_id: &str) -> Result<DeploymentPreview, DeploymentError> {
        let (status, plan) = {
            let inner = self.shared.lock_inner();
            let deployment = get_deployment(&inner, deployment_id)?;
            let plan = inner
                .plans
                .get(deployment_id)
                .cloned()
                .ok_or_else(|| DeploymentError::NotFound(format!("plan for '{deployment_id}'")))?;
            (deployment.status, plan)
        };

        let mut agents = Vec::new();
        let (mut will_update, mut will_skip) = (0usize, 0usize);
        if let Some(agent_image) = plan.targets.get(&ImageKind::Agent) {
            for agent in self.shared.discovery.discover_agents() {
                let action = if agent.do_not_autostart {
                    will_skip += 1;
                    "skip_do_not_autostart"
                } else if already_current(&agent, agent_image, plan.expected_version.as_deref()) {
                    will_skip += 1;
                    "skip_already_current"
                } else {
                    will_update += 1;
                    "update"
                };
                agents.push(AgentPreview {
                    agent_id: agent.identity.agent_id.to_string(),
                    server_id: agent.identity.server_id.to_string(),
                    current_version: agent.version.clone(),
                    canary_group: agent.canary_group.as_str(),
                    action,
                });
            }
        }

        Ok(DeploymentPreview {
            deployment_id: deployment_id.to_string(),
            status,
            targets: plan.targets,
            agents,
            will_update,
            will_skip,
        })
    }

    /// The exact reason each agent would receive, for operator review
    /// before launch.
    pub fn shutdown_reasons(
        &self,
        deployment_id: &str,
    ) -> Result<HashMap<String, String>, DeploymentError> {
        let plan = {
            let inner = self.shared.lock_inner();
            get_deployment(&inner, deployment_id)?;
            inner
                .plans
                .get(deployment_id)
                .cloned()
                .ok_or_else(|| DeploymentError::NotFound(format!("plan for '{deployment_id}'")))?
        };
        if !plan.targets.contains_key(&ImageKind::Agent) {
            return Ok(HashMap::new());
        }
        Ok(self
            .shared
            .discovery
            .discover_agents()
            .into_iter()
            .map(|agent| (agent.identity.agent_id.to_string(), plan.reason.clone()))
            .collect())
    }

    /// Stops every rollout thread; used at process shutdown.
    pub fn shutdown(&self) {
        let mut threads = self.threads.lock().expect("threads lock poisoned");
        for thread in threads.drain(..) {
            if thread.is_finished() {
                let _ = thread.join();
            } else if let Err(err) = thread.stop() {
                warn!(%err, "rollout thread did not stop cleanly");
            }
        }
    }

    /// Marks the deployment in progress and spawns its rollout thread.
    /// Caller holds the state lock.
    fn start_rollout(
        &self,
        inner: &mut OrchestratorInner,
        deployment_id: &str,
    ) -> Result<(), DeploymentError> {
        if let Some(active) = &inner.active {
            if active != deployment_id {
                return Err(DeploymentError::Conflict(format!(
                    "deployment '{active}' already occupies the active slot"
                )));
            }
        }
        let deployment = get_deployment_mut(inner, deployment_id)?;
        deployment.status = DeploymentState::InProgress;
        deployment.started_at = Some(time::now());
        deployment.push_event(EventKind::Launched, None, "rollout launched");
        inner.active = Some(deployment_id.to_string());
        self.spawn_rollout(inner, deployment_id);
        Ok(())
    }

    fn spawn_rollout(&self, inner: &mut OrchestratorInner, deployment_id: &str) {
        let control = Arc::new(RolloutControl::default());
        inner
            .controls
            .insert(deployment_id.to_string(), control.clone());

        let shared = self.shared.clone();
        let id = deployment_id.to_string();
        let thread_name = format!("rollout-{}", &id[..id.len().min(10)]);
        let context = NotStartedThreadContext::new(thread_name, move |stop_consumer| {
            shared.run_rollout(&id, control, stop_consumer);
        })
        .start();

        let mut threads = self.threads.lock().expect("threads lock poisoned");
        threads.retain(|t| !t.is_finished());
        threads.push(context);
    }
}

impl Shared {
    /// Body of the rollout thread. Walks the cohorts in order, updates
    /// agents with bounded concurrency, evaluates the gates between waves,
    /// refreshes the auxiliary containers and settles the tracker.
    fn run_rollout(
        &self,
        deployment_id: &str,
        control: Arc<RolloutControl>,
        stop_consumer: EventConsumer<CancellationMessage>,
    ) {
        let Some(plan) = self.lock_inner().plans.get(deployment_id).cloned() else {
            warn!(deployment_id, "rollout thread found no plan, giving up");
            return;
        };

        if let Some(agent_image) = plan.targets.get(&ImageKind::Agent) {
            self.discovery.invalidate();
            let agents = self.discovery.discover_agents();
            let waves = partition_into_waves(agents);
            let total: usize = waves.iter().map(|w| w.agents.len()).sum();
            self.with_live_deployment(deployment_id, |d| {
                d.agents_total = total;
            });

            let target = UpdateTarget {
                image: agent_image.clone(),
                expected_version: plan.expected_version.clone(),
                reason: plan.reason.clone(),
            };

            for wave in waves {
                if !self.wait_for_clearance(&control, &stop_consumer) {
                    return;
                }
                if !self.run_wave(deployment_id, &wave, &target, &control, &stop_consumer) {
                    return;
                }
            }
        }

        // A pause at the final cohort boundary still waits for the
        // operator before anything is promoted.
        if !self.wait_for_clearance(&control, &stop_consumer) {
            return;
        }
        if !self.refresh_auxiliary(deployment_id, &plan, &control) {
            return;
        }
        self.settle_tracker(deployment_id, &plan);
    }

    /// Updates one cohort and evaluates the gates. Returns false when the
    /// rollout must stop (cancelled, gate failure, process shutdown).
    fn run_wave(
        &self,
        deployment_id: &str,
        wave: &Wave,
        target: &UpdateTarget,
        control: &Arc<RolloutControl>,
        stop_consumer: &EventConsumer<CancellationMessage>,
    ) -> bool {
        self.with_live_deployment(deployment_id, |d| {
            d.push_event(
                EventKind::WaveStarted,
                None,
                format!(
                    "wave '{}' with {} agents",
                    wave.group.as_str(),
                    wave.agents.len()
                ),
            );
        });

        let mut wave_failed = 0usize;
        let mut wave_attempted = 0usize;

        for chunk in wave.agents.chunks(self.config.wave_concurrency.max(1)) {
            if control.is_cancelled() || stop_consumer.is_cancelled(Duration::ZERO) {
                return false;
            }
            let outcomes: Vec<(&DiscoveredAgent, AgentUpdateOutcome)> =
                std::thread::scope(|scope| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|agent| {
                            scope.spawn(move || (agent, self.updater.update_agent(agent, target)))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().expect("agent update thread panicked"))
                        .collect()
                });

            for (agent, outcome) in outcomes {
                if !matches!(
                    outcome,
                    AgentUpdateOutcome::SkippedDoNotAutostart
                        | AgentUpdateOutcome::SkippedAlreadyCurrent
                ) {
                    wave_attempted += 1;
                }
                if outcome.is_failure() {
                    wave_failed += 1;
                }
                self.with_live_deployment(deployment_id, |d| {
                    d.count(&outcome);
                    d.push_event(
                        EventKind::AgentOutcome,
                        Some(agent.identity.agent_id.clone()),
                        outcome.describe(),
                    );
                });
            }
        }

        self.with_live_deployment(deployment_id, |d| {
            d.push_event(
                EventKind::WaveCompleted,
                None,
                format!("wave '{}' completed", wave.group.as_str()),
            );
        });

        // Gate (a): too many failures in this wave fail the deployment and
        // propose a rollback.
        let failure_rate = wave_failed as f64 / wave_attempted.max(1) as f64;
        if wave_failed > 0 && failure_rate > self.config.failure_threshold {
            let detail = format!(
                "gate failed: {wave_failed}/{wave_attempted} agents failed in wave '{}'",
                wave.group.as_str()
            );
            warn!(deployment_id, %detail, "stopping rollout");
            self.finalize(deployment_id, DeploymentState::Failed, &detail);
            self.propose_rollback(deployment_id, &detail);
            return false;
        }

        // Gate (b): too much aggregated deferral pauses for the operator.
        let (deferred, attempted) = {
            let inner = self.lock_inner();
            match inner.deployments.get(deployment_id) {
                Some(d) => (
                    d.agents_deferred,
                    d.agents_updated + d.agents_deferred + d.agents_failed,
                ),
                None => return false,
            }
        };
        let deferral_rate = deferred as f64 / attempted.max(1) as f64;
        if deferred > 0 && deferral_rate > self.config.deferral_ceiling {
            info!(deployment_id, deferral_rate, "deferral ceiling reached, pausing");
            control.pause();
            self.with_live_deployment(deployment_id, |d| {
                d.status = DeploymentState::Paused;
                d.push_event(
                    EventKind::Paused,
                    None,
                    format!("paused: deferral rate {deferred}/{attempted} above ceiling"),
                );
            });
        }
        true
    }

    /// Blocks while the deployment is paused. Returns false when it should
    /// abort instead of continuing.
    fn wait_for_clearance(
        &self,
        control: &Arc<RolloutControl>,
        stop_consumer: &EventConsumer<CancellationMessage>,
    ) -> bool {
        loop {
            if control.is_cancelled() {
                return false;
            }
            if !control.is_paused() {
                return true;
            }
            if stop_consumer.is_cancelled(self.config.pause_poll) {
                return false;
            }
        }
    }

    /// Recreates the gui/nginx containers named in the plan through their
    /// configured compose files.
    fn refresh_auxiliary(
        &self,
        deployment_id: &str,
        plan: &RolloutPlan,
        control: &Arc<RolloutControl>,
    ) -> bool {
        for kind in [ImageKind::Gui, ImageKind::Nginx] {
            if !plan.targets.contains_key(&kind) || control.is_cancelled() {
                continue;
            }
            let Some(compose_file) = self.auxiliary.compose_files.get(&kind) else {
                self.with_live_deployment(deployment_id, |d| {
                    d.push_event(
                        EventKind::AuxiliaryUpdated,
                        None,
                        format!("{kind}: no compose file configured, skipped"),
                    );
                });
                continue;
            };

            let host = match &self.auxiliary.server {
                Some(server) => self.clients.host(server),
                None => self.clients.hosts().next(),
            };
            let Some(host) = host else {
                self.finalize(
                    deployment_id,
                    DeploymentState::Failed,
                    &format!("{kind}: no container host available"),
                );
                return false;
            };

            match host.client.compose_up(compose_file) {
                Ok(()) => {
                    self.with_live_deployment(deployment_id, |d| {
                        d.push_event(
                            EventKind::AuxiliaryUpdated,
                            None,
                            format!("{kind} container recreated"),
                        );
                    });
                }
                Err(err) => {
                    self.finalize(
                        deployment_id,
                        DeploymentState::Failed,
                        &format!("{kind} recreation failed: {err}"),
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Settles the tracker once every cohort is done: promote on a forward
    /// rollout, record on a rollback.
    fn settle_tracker(&self, deployment_id: &str, plan: &RolloutPlan) {
        if self.is_terminal(deployment_id) {
            return;
        }

        let result: Result<(), DeploymentError> =
            plan.targets.iter().try_for_each(|(kind, image)| {
                if plan.rollback {
                    self.tracker.record(
                        *kind,
                        image,
                        VersionMeta {
                            deployment_id: Some(deployment_id),
                            deployed_by: Some("rollback"),
                            ..Default::default()
                        },
                    )?;
                } else {
                    self.tracker.promote(*kind, Some(deployment_id))?;
                }
                Ok(())
            });

        match result {
            Ok(()) => {
                let detail = {
                    let inner = self.lock_inner();
                    match inner.deployments.get(deployment_id) {
                        Some(d) => format!(
                            "{}: {} updated, {} deferred, {} failed, {} skipped",
                            if plan.rollback {
                                "rollback completed"
                            } else {
                                "deployment completed"
                            },
                            d.agents_updated,
                            d.agents_deferred,
                            d.agents_failed,
                            d.agents_skipped
                        ),
                        None => return,
                    }
                };
                self.finalize(deployment_id, DeploymentState::Completed, &detail);
            }
            Err(err) => {
                self.finalize(
                    deployment_id,
                    DeploymentState::Failed,
                    &format!("version tracking failed: {err}"),
                );
            }
        }
    }

    /// Proposes rolling every kind of the failed deployment back to n-1.
    fn propose_rollback(&self, deployment_id: &str, reason: &str) {
        let options = match self.tracker.rollback_options() {
            Ok(options) => options,
            Err(err) => {
                warn!(deployment_id, %err, "cannot build rollback proposal");
                return;
            }
        };

        let mut inner = self.lock_inner();
        let Some(deployment) = inner.deployments.get(deployment_id) else {
            return;
        };
        let targets: HashMap<ImageKind, String> = deployment
            .notification
            .images()
            .iter()
            .filter_map(|(kind, _)| {
                options
                    .get(kind)
                    .and_then(|o| o.n_minus_1.as_ref())
                    .map(|v| (*kind, v.image.clone()))
            })
            .collect();

        if targets.is_empty() {
            warn!(deployment_id, "no previous versions tracked, skipping rollback proposal");
            return;
        }

        let proposal = RollbackProposal {
            deployment_id: deployment_id.to_string(),
            proposed_at: time::now(),
            reason: reason.to_string(),
            targets,
        };
        if let Some(deployment) = inner.deployments.get_mut(deployment_id) {
            deployment.push_event(
                EventKind::RollbackProposed,
                None,
                "rollback to n-1 proposed, awaiting operator decision",
            );
        }
        inner.proposals.insert(deployment_id.to_string(), proposal);
    }

    fn resolve_rollback_targets(
        &self,
        kinds: &[ImageKind],
        request: &RollbackRequest,
    ) -> Result<HashMap<ImageKind, String>, DeploymentError> {
        let options = self.tracker.rollback_options()?;
        let mut targets = HashMap::new();
        for kind in kinds {
            let selector = request.selector_for(*kind);
            let image = match selector {
                SELECTOR_N_MINUS_1 => options
                    .get(kind)
                    .and_then(|o| o.n_minus_1.as_ref())
                    .map(|v| v.image.clone())
                    .ok_or_else(|| {
                        DeploymentError::BadRequest(format!("no n-1 version tracked for {kind}"))
                    })?,
                SELECTOR_N_MINUS_2 => options
                    .get(kind)
                    .and_then(|o| o.n_minus_2.as_ref())
                    .map(|v| v.image.clone())
                    .ok_or_else(|| {
                        DeploymentError::BadRequest(format!("no n-2 version tracked for {kind}"))
                    })?,
                explicit => explicit.to_string(),
            };
            targets.insert(*kind, image);
        }
        Ok(targets)
    }

    fn finalize(&self, deployment_id: &str, state: DeploymentState, detail: &str) {
        let mut inner = self.lock_inner();
        if let Some(deployment) = inner.deployments.get_mut(deployment_id) {
            if !deployment.status.is_terminal() {
                deployment.finish(state, detail);
            }
        }
        if inner.active.as_deref() == Some(deployment_id) {
            inner.active = None;
        }
        self.prune_history(&mut inner);
    }

    /// Applies `f` to the deployment unless it already reached a terminal
    /// state (a cancel may have won the race).
    fn with_live_deployment<F>(&self, deployment_id: &str, f: F)
    where
        F: FnOnce(&mut DeploymentStatus),
    {
        let mut inner = self.lock_inner();
        if let Some(deployment) = inner.deployments.get_mut(deployment_id) {
            if !deployment.status.is_terminal() {
                f(deployment);
            }
        }
    }

    fn is_terminal(&self, deployment_id: &str) -> bool {
        let inner = self.lock_inner();
        inner
            .deployments
            .get(deployment_id)
            .map(|d| d.status.is_terminal())
            .unwrap_or(true)
    }

    fn clear_staged_kinds(
        &self,
        inner: &OrchestratorInner,
        deployment_id: &str,
    ) -> Result<(), DeploymentError> {
        if let Some(plan) = inner.plans.get(deployment_id) {
            if !plan.rollback {
                for kind in plan.targets.keys() {
                    self.tracker.clear_staged(Some(*kind))?;
                }
            }
        }
        Ok(())
    }

    /// Drops the oldest terminal deployments beyond the history cap.
    fn prune_history(&self, inner: &mut OrchestratorInner) {
        let terminal: Vec<DeploymentId> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .deployments
                    .get(*id)
                    .map(|d| d.status.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if terminal.len() <= self.config.history_cap {
            return;
        }
        for id in &terminal[..terminal.len() - self.config.history_cap] {
            inner.deployments.remove(id);
            inner.plans.remove(id);
            inner.controls.remove(id);
            inner.proposals.remove(id);
            inner.order.retain(|o| o != id);
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, OrchestratorInner> {
        self.inner.lock().expect("orchestrator lock poisoned")
    }
}

fn already_current(agent: &DiscoveredAgent, image: &str, expected_version: Option<&str>) -> bool {
    match expected_version {
        Some(expected) => agent.version.as_deref() == Some(expected),
        None => agent.image == image,
    }
}

fn insert_deployment(inner: &mut OrchestratorInner, status: DeploymentStatus) {
    inner.order.push(status.deployment_id.clone());
    inner
        .deployments
        .insert(status.deployment_id.clone(), status);
}

fn get_deployment<'a>(
    inner: &'a OrchestratorInner,
    deployment_id: &str,
) -> Result<&'a DeploymentStatus, DeploymentError> {
    inner
        .deployments
        .get(deployment_id)
        .ok_or_else(|| DeploymentError::NotFound(deployment_id.to_string()))
}

fn get_deployment_mut<'a>(
    inner: &'a mut OrchestratorInner,
    deployment_id: &str,
) -> Result<&'a mut DeploymentStatus, DeploymentError> {
    inner
        .deployments
        .get_mut(deployment_id)
        .ok_or_else(|| DeploymentError::NotFound(deployment_id.to_string()))
}
