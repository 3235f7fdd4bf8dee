//! Per-agent update protocol.
//!
//! For one discovered agent and one target image: solicit a graceful
//! shutdown (the agent may defer), await the container's exit or force-stop
//! it, recreate it through its compose file with pull-always semantics, and
//! verify the relaunched agent reports the expected version.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::status::AgentUpdateOutcome;
use crate::agent::api::{AgentApi, ShutdownOutcome};
use crate::agent::registry::ContainerRegistry;
use crate::container::manager::{ClientManager, Host};
use crate::container::{ContainerClientError, ContainerStatus};
use crate::discovery::DiscoveredAgent;
use crate::utils::retry::retry;

/// What one agent is being driven toward.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateTarget {
    pub image: String,
    /// Version (or commit) the relaunched agent must report; when absent,
    /// verification only requires the agent to come back healthy.
    pub expected_version: Option<String>,
    /// Human-readable reason delivered with the shutdown request.
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdaterTimeouts {
    /// How long a cooperating agent gets to exit on its own.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub exit_wait: Duration,
    /// Grace period handed to the runtime when force-stopping.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub stop_grace: Duration,
    /// Budget for the relaunched agent to come up and report its version.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub warmup: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub poll_interval: Duration,
}

impl Default for UpdaterTimeouts {
    fn default() -> Self {
        Self {
            exit_wait: Duration::from_secs(90),
            stop_grace: Duration::from_secs(10),
            warmup: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Seam between the orchestrator's wave scheduling and the concrete
/// container/agent plumbing.
#[cfg_attr(test, mockall::automock)]
pub trait AgentUpdater: Send + Sync {
    fn update_agent(&self, agent: &DiscoveredAgent, target: &UpdateTarget) -> AgentUpdateOutcome;
}

pub struct ContainerAgentUpdater {
    registry: Arc<ContainerRegistry>,
    clients: Arc<ClientManager>,
    api: Arc<dyn AgentApi>,
    timeouts: UpdaterTimeouts,
}

impl ContainerAgentUpdater {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        clients: Arc<ClientManager>,
        api: Arc<dyn AgentApi>,
        timeouts: UpdaterTimeouts,
    ) -> Self {
        Self {
            registry,
            clients,
            api,
            timeouts,
        }
    }

    fn is_already_current(agent: &DiscoveredAgent, target: &UpdateTarget) -> bool {
        match &target.expected_version {
            Some(expected) => agent.version.as_deref() == Some(expected),
            None => agent.image == target.image,
        }
    }

    /// Step 1: ask the agent to shut down. Returns `Ok(true)` when the
    /// container should be considered stopping, `Ok(false)` when it must be
    /// force-stopped, and `Err` with the final outcome when the chain ends
    /// here.
    fn solicit_shutdown(
        &self,
        host: &Host,
        agent: &DiscoveredAgent,
        target: &UpdateTarget,
    ) -> Result<bool, AgentUpdateOutcome> {
        if !agent.status.is_running() {
            // Nothing to ask; straight to recreation.
            return Ok(false);
        }

        let Some(port) = agent.api_port else {
            warn!(agent = %agent.identity, "agent has no published API port, forcing stop");
            return Ok(false);
        };
        let token = match self.registry.service_token(&agent.key()) {
            Ok(token) => token,
            Err(err) => {
                warn!(agent = %agent.identity, %err, "no usable service token, forcing stop");
                return Ok(false);
            }
        };

        match self
            .api
            .request_shutdown(&host.address, port, &token, &target.reason)
        {
            ShutdownOutcome::Accepted => Ok(true),
            ShutdownOutcome::Deferred { reason } => {
                info!(agent = %agent.identity, ?reason, "agent deferred the update");
                Err(AgentUpdateOutcome::Deferred { reason })
            }
            ShutdownOutcome::Rejected { status, detail } => {
                Err(AgentUpdateOutcome::Failed {
                    reason: format!("agent rejected shutdown (status {status}): {detail}"),
                })
            }
            ShutdownOutcome::Unreachable { detail } => {
                warn!(agent = %agent.identity, detail, "agent unreachable, forcing stop");
                Ok(false)
            }
        }
    }

    /// Step 2: wait for the container to exit on its own, then force-stop
    /// if the exit budget is exhausted.
    fn await_exit(&self, host: &Host, agent: &DiscoveredAgent) -> Result<(), AgentUpdateOutcome> {
        let exited = retry(
            self.attempts(self.timeouts.exit_wait),
            self.timeouts.poll_interval,
            || match host.client.get(&agent.container_name) {
                Ok(info) if info.status == ContainerStatus::Exited => Ok(()),
                Ok(info) => Err(format!("container still {}", info.status.as_str())),
                Err(ContainerClientError::NotFound(_)) => Ok(()),
                Err(err) => {
                    debug!(agent = %agent.identity, %err, "container status poll failed");
                    Err(err.to_string())
                }
            },
        );
        match exited {
            Ok(()) => Ok(()),
            Err(detail) => {
                info!(agent = %agent.identity, detail, "exit budget exhausted, force-stopping");
                self.force_stop(host, agent)
            }
        }
    }

    fn force_stop(&self, host: &Host, agent: &DiscoveredAgent) -> Result<(), AgentUpdateOutcome> {
        if let Err(err) = host
            .client
            .stop(&agent.container_name, self.timeouts.stop_grace)
        {
            warn!(agent = %agent.identity, %err, "graceful stop failed, killing");
            host.client.kill(&agent.container_name).map_err(|err| {
                AgentUpdateOutcome::Failed {
                    reason: format!("could not stop container: {err}"),
                }
            })?;
        }
        Ok(())
    }

    /// Step 3: recreate on the target image. Compose with pull-always when
    /// a compose file exists; restart in place is only legal when the image
    /// reference is unchanged.
    fn recreate(
        &self,
        host: &Host,
        agent: &DiscoveredAgent,
        target: &UpdateTarget,
    ) -> Result<(), AgentUpdateOutcome> {
        if let Some(compose_file) = &agent.compose_file {
            return host
                .client
                .compose_up(compose_file)
                .map_err(|err| AgentUpdateOutcome::Failed {
                    reason: format!("recreate failed: {err}"),
                });
        }

        if agent.image == target.image {
            return host
                .client
                .restart(&agent.container_name)
                .map_err(|err| AgentUpdateOutcome::Failed {
                    reason: format!("restart failed: {err}"),
                });
        }

        Err(AgentUpdateOutcome::Failed {
            reason: format!(
                "recreate failed: no compose file and image changed from {} to {}",
                agent.image, target.image
            ),
        })
    }

    /// Step 4: wait for the relaunched agent to report a health payload
    /// matching the target version.
    fn verify(
        &self,
        host: &Host,
        agent: &DiscoveredAgent,
        target: &UpdateTarget,
    ) -> Result<Option<String>, AgentUpdateOutcome> {
        let Some(port) = agent.api_port else {
            // No API surface to verify against; trust the recreation.
            return Ok(None);
        };
        let token = match self.registry.service_token(&agent.key()) {
            Ok(token) => token,
            Err(_) => return Ok(None),
        };

        let verified = retry(
            self.attempts(self.timeouts.warmup),
            self.timeouts.poll_interval,
            || {
                let health = self
                    .api
                    .health(&host.address, port, &token)
                    .map_err(|err| err.to_string())?;
                match (&target.expected_version, health.version) {
                    (Some(expected), Some(version)) if version == *expected => Ok(Some(version)),
                    (Some(_), version) => Err(format!(
                        "agent reports version {}",
                        version.as_deref().unwrap_or("unknown")
                    )),
                    (None, version) => Ok(version),
                }
            },
        );
        verified.map_err(|last| AgentUpdateOutcome::Failed {
            reason: format!(
                "verification failed: {last}, expected {}",
                target
                    .expected_version
                    .as_deref()
                    .unwrap_or("a healthy agent"),
            ),
        })
    }

    /// How many polls fit in a time budget.
    fn attempts(&self, budget: Duration) -> usize {
        let interval = self.timeouts.poll_interval.as_millis().max(1);
        (budget.as_millis() / interval).max(1) as usize
    }
}

impl AgentUpdater for ContainerAgentUpdater {
    fn update_agent(&self, agent: &DiscoveredAgent, target: &UpdateTarget) -> AgentUpdateOutcome {
        if agent.do_not_autostart {
            return AgentUpdateOutcome::SkippedDoNotAutostart;
        }
        if Self::is_already_current(agent, target) {
            return AgentUpdateOutcome::SkippedAlreadyCurrent;
        }
        let Some(host) = self.clients.host(&agent.identity.server_id) else {
            return AgentUpdateOutcome::Failed {
                reason: format!("unknown host '{}'", agent.identity.server_id),
            };
        };

        let chain = || -> Result<Option<String>, AgentUpdateOutcome> {
            match self.solicit_shutdown(host, agent, target)? {
                true => self.await_exit(host, agent)?,
                false if agent.status.is_running() => self.force_stop(host, agent)?,
                false => {}
            }
            self.recreate(host, agent, target)?;
            self.verify(host, agent, target)
        };

        match chain() {
            Ok(verified_version) => {
                if let Some(version) = &verified_version {
                    if let Err(err) =
                        self.registry
                            .update_agent_state(&agent.key(), Some(version), None)
                    {
                        warn!(agent = %agent.identity, %err, "could not record updated version");
                    }
                }
                info!(agent = %agent.identity, target = %target.image, "agent updated");
                AgentUpdateOutcome::Updated
            }
            Err(outcome) => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::api::{AgentHealth, MockAgentApi};
    use crate::agent::identity::{AgentId, AgentKey, ServerId};
    use crate::agent::registry::tests::test_cipher;
    use crate::agent::registry::{CanaryGroup, RegistryEntry};
    use crate::container::{ContainerInfo, ContainerStatus, MockContainerClient};
    use crate::storage::JsonDocument;
    use assert_matches::assert_matches;
    use mockall::predicate::{always, eq};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn fast_timeouts() -> UpdaterTimeouts {
        UpdaterTimeouts {
            exit_wait: Duration::from_millis(50),
            stop_grace: Duration::from_secs(1),
            warmup: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn discovered(id: &str) -> DiscoveredAgent {
        use crate::agent::identity::AgentIdentity;
        DiscoveredAgent {
            identity: AgentIdentity {
                agent_id: AgentId::new(id).unwrap(),
                occurrence_id: None,
                server_id: ServerId::new("main").unwrap(),
            },
            display_name: id.to_string(),
            container_name: format!("fleet-{id}"),
            image: "agent:1.0.0".to_string(),
            status: ContainerStatus::Running,
            api_port: Some(18080),
            version: Some("1.0.0".to_string()),
            codename: None,
            code_hash: None,
            cognitive_state: None,
            canary_group: CanaryGroup::Explorer,
            do_not_autostart: false,
            compose_file: Some(PathBuf::from("/opt/fleet/datum/docker-compose.yml")),
            registered: true,
        }
    }

    fn target() -> UpdateTarget {
        UpdateTarget {
            image: "agent:1.0.1".to_string(),
            expected_version: Some("1.0.1".to_string()),
            reason: "Security fix (target version 1.0.1)".to_string(),
        }
    }

    fn exited_container(name: &str) -> ContainerInfo {
        ContainerInfo {
            name: name.to_string(),
            image: "agent:1.0.0".to_string(),
            status: ContainerStatus::Exited,
            env: HashMap::new(),
            ports: HashMap::new(),
        }
    }

    fn registry_with_token(dir: &TempDir) -> Arc<ContainerRegistry> {
        let registry = ContainerRegistry::load(
            JsonDocument::new(dir.path().join("agents_metadata.json")),
            test_cipher(),
        )
        .unwrap();
        registry
            .register(RegistryEntry::new(
                AgentId::new("datum").unwrap(),
                None,
                ServerId::new("main").unwrap(),
                "base",
                8001,
            ))
            .unwrap();
        registry
            .set_service_token(&AgentKey::id(AgentId::new("datum").unwrap()), "svc-token")
            .unwrap();
        Arc::new(registry)
    }

    fn updater(
        registry: Arc<ContainerRegistry>,
        client: MockContainerClient,
        api: MockAgentApi,
    ) -> ContainerAgentUpdater {
        let mut manager = ClientManager::new();
        manager.add_host(
            ServerId::new("main").unwrap(),
            "127.0.0.1",
            Arc::new(client),
        );
        ContainerAgentUpdater::new(registry, Arc::new(manager), Arc::new(api), fast_timeouts())
    }

    #[test]
    fn do_not_autostart_is_skipped_without_touching_the_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = discovered("datum");
        agent.do_not_autostart = true;

        let client = MockContainerClient::new();
        let api = MockAgentApi::new();
        let outcome = updater(registry_with_token(&dir), client, api)
            .update_agent(&agent, &target());
        assert_eq!(outcome, AgentUpdateOutcome::SkippedDoNotAutostart);
    }

    #[test]
    fn already_on_expected_version_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = discovered("datum");
        agent.version = Some("1.0.1".to_string());

        let outcome = updater(
            registry_with_token(&dir),
            MockContainerClient::new(),
            MockAgentApi::new(),
        )
        .update_agent(&agent, &target());
        assert_eq!(outcome, AgentUpdateOutcome::SkippedAlreadyCurrent);
    }

    #[test]
    fn accepted_shutdown_runs_full_chain() {
        let dir = tempfile::tempdir().unwrap();
        let agent = discovered("datum");

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown()
            .with(
                eq("127.0.0.1"),
                eq(18080),
                eq("svc-token"),
                eq("Security fix (target version 1.0.1)"),
            )
            .times(1)
            .returning(|_, _, _, _| ShutdownOutcome::Accepted);
        api.expect_health().returning(|_, _, _| {
            Ok(AgentHealth {
                version: Some("1.0.1".to_string()),
                ..Default::default()
            })
        });

        let mut client = MockContainerClient::new();
        client
            .expect_get()
            .with(eq("fleet-datum"))
            .returning(|name| Ok(exited_container(name)));
        client
            .expect_compose_up()
            .withf(|path| path == Path::new("/opt/fleet/datum/docker-compose.yml"))
            .times(1)
            .returning(|_| Ok(()));

        let registry = registry_with_token(&dir);
        let outcome = updater(registry.clone(), client, api).update_agent(&agent, &target());
        assert_eq!(outcome, AgentUpdateOutcome::Updated);

        // The verified version is pushed back into the registry.
        let entry = registry
            .resolve(&AgentKey::id(AgentId::new("datum").unwrap()))
            .unwrap();
        assert_eq!(entry.current_version.as_deref(), Some("1.0.1"));
    }

    #[test]
    fn deferral_ends_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let agent = discovered("datum");

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown().returning(|_, _, _, _| {
            ShutdownOutcome::Deferred {
                reason: Some("critical task running".to_string()),
            }
        });

        // No container calls expected at all.
        let client = MockContainerClient::new();
        let outcome =
            updater(registry_with_token(&dir), client, api).update_agent(&agent, &target());
        assert_eq!(
            outcome,
            AgentUpdateOutcome::Deferred {
                reason: Some("critical task running".to_string())
            }
        );
    }

    #[test]
    fn rejection_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let agent = discovered("datum");

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown().returning(|_, _, _, _| {
            ShutdownOutcome::Rejected {
                status: 422,
                detail: "not today".to_string(),
            }
        });

        let outcome = updater(registry_with_token(&dir), MockContainerClient::new(), api)
            .update_agent(&agent, &target());
        assert_matches!(outcome, AgentUpdateOutcome::Failed { reason } if reason.contains("rejected"));
    }

    #[test]
    fn unreachable_agent_is_force_stopped_and_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let agent = discovered("datum");

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown().returning(|_, _, _, _| {
            ShutdownOutcome::Unreachable {
                detail: "connection refused".to_string(),
            }
        });
        api.expect_health().returning(|_, _, _| {
            Ok(AgentHealth {
                version: Some("1.0.1".to_string()),
                ..Default::default()
            })
        });

        let mut client = MockContainerClient::new();
        client
            .expect_stop()
            .with(eq("fleet-datum"), always())
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_compose_up().times(1).returning(|_| Ok(()));

        let outcome =
            updater(registry_with_token(&dir), client, api).update_agent(&agent, &target());
        assert_eq!(outcome, AgentUpdateOutcome::Updated);
    }

    #[test]
    fn exit_deadline_forces_a_stop() {
        let dir = tempfile::tempdir().unwrap();
        let agent = discovered("datum");

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown()
            .returning(|_, _, _, _| ShutdownOutcome::Accepted);
        api.expect_health().returning(|_, _, _| {
            Ok(AgentHealth {
                version: Some("1.0.1".to_string()),
                ..Default::default()
            })
        });

        let mut client = MockContainerClient::new();
        // Container never exits on its own.
        client.expect_get().returning(|name| {
            Ok(ContainerInfo {
                status: ContainerStatus::Running,
                ..exited_container(name)
            })
        });
        client.expect_stop().times(1).returning(|_, _| Ok(()));
        client.expect_compose_up().times(1).returning(|_| Ok(()));

        let outcome =
            updater(registry_with_token(&dir), client, api).update_agent(&agent, &target());
        assert_eq!(outcome, AgentUpdateOutcome::Updated);
    }

    #[test]
    fn recreate_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let agent = discovered("datum");

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown()
            .returning(|_, _, _, _| ShutdownOutcome::Accepted);

        let mut client = MockContainerClient::new();
        client
            .expect_get()
            .returning(|name| Ok(exited_container(name)));
        client.expect_compose_up().returning(|_| {
            Err(ContainerClientError::CommandFailed(
                "compose file broken".to_string(),
            ))
        });

        let outcome =
            updater(registry_with_token(&dir), client, api).update_agent(&agent, &target());
        assert_matches!(outcome, AgentUpdateOutcome::Failed { reason } if reason.contains("recreate failed"));
    }

    #[test]
    fn version_mismatch_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let agent = discovered("datum");

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown()
            .returning(|_, _, _, _| ShutdownOutcome::Accepted);
        // Agent comes back still reporting the old version.
        api.expect_health().returning(|_, _, _| {
            Ok(AgentHealth {
                version: Some("1.0.0".to_string()),
                ..Default::default()
            })
        });

        let mut client = MockContainerClient::new();
        client
            .expect_get()
            .returning(|name| Ok(exited_container(name)));
        client.expect_compose_up().returning(|_| Ok(()));

        let outcome =
            updater(registry_with_token(&dir), client, api).update_agent(&agent, &target());
        assert_matches!(
            outcome,
            AgentUpdateOutcome::Failed { reason }
                if reason.contains("verification failed") && reason.contains("1.0.0")
        );
    }

    #[test]
    fn restart_in_place_requires_unchanged_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = discovered("datum");
        agent.compose_file = None;

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown()
            .returning(|_, _, _, _| ShutdownOutcome::Accepted);

        let mut client = MockContainerClient::new();
        client
            .expect_get()
            .returning(|name| Ok(exited_container(name)));

        // Image changed: no compose file means the chain must fail.
        let outcome =
            updater(registry_with_token(&dir), client, api).update_agent(&agent, &target());
        assert_matches!(outcome, AgentUpdateOutcome::Failed { reason } if reason.contains("no compose file"));
    }

    #[test]
    fn restart_in_place_when_image_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = discovered("datum");
        agent.compose_file = None;
        agent.image = "agent:1.0.1".to_string();
        // Same image reference but an older reported version: a repulled
        // digest is being picked up by restarting in place.

        let mut api = MockAgentApi::new();
        api.expect_request_shutdown()
            .returning(|_, _, _, _| ShutdownOutcome::Accepted);
        api.expect_health().returning(|_, _, _| {
            Ok(AgentHealth {
                version: Some("1.0.1".to_string()),
                ..Default::default()
            })
        });

        let mut client = MockContainerClient::new();
        client
            .expect_get()
            .returning(|name| Ok(exited_container(name)));
        client
            .expect_restart()
            .with(eq("fleet-datum"))
            .times(1)
            .returning(|_| Ok(()));

        let outcome =
            updater(registry_with_token(&dir), client, api).update_agent(&agent, &target());
        assert_eq!(outcome, AgentUpdateOutcome::Updated);
    }
}
