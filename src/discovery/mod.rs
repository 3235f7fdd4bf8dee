//! Fleet discovery: the consistent snapshot of every managed agent.
//!
//! Enumerates containers on every known host, keeps the ones carrying the
//! agent-id environment marker, merges them with the registry and enriches
//! running agents with a best-effort health fetch. Host failures degrade to
//! an empty host snapshot; health failures degrade the live fields to
//! `None`. Snapshots are memoized per host for a short TTL and health
//! fetches back off exponentially per agent after repeated failures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::agent::api::AgentApi;
use crate::agent::identity::{AgentId, AgentIdentity, AgentKey, ServerId};
use crate::agent::registry::{CanaryGroup, ContainerRegistry};
use crate::container::manager::{ClientManager, Host};
use crate::container::{ContainerInfo, ContainerStatus};
use crate::defaults::{AGENT_API_CONTAINER_PORT, AGENT_ID_ENV_VAR, OCCURRENCE_ID_ENV_VAR};

const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(900);

/// Transient join of container state, registry metadata and live agent
/// health.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiscoveredAgent {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub display_name: String,
    pub container_name: String,
    pub image: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cognitive_state: Option<String>,
    pub canary_group: CanaryGroup,
    pub do_not_autostart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<PathBuf>,
    /// Whether a registry entry exists for this container.
    pub registered: bool,
}

impl DiscoveredAgent {
    pub fn key(&self) -> AgentKey {
        AgentKey::from(&self.identity)
    }
}

/// Seam between the orchestrator and the live fleet.
#[cfg_attr(test, mockall::automock)]
pub trait AgentDiscovery: Send + Sync {
    /// Current fleet snapshot across all hosts. Never fails as a whole;
    /// unreachable hosts contribute nothing.
    fn discover_agents(&self) -> Vec<DiscoveredAgent>;

    /// Drops the memoized snapshots so the next call hits the hosts.
    fn invalidate(&self);
}

struct CachedHost {
    taken_at: Instant,
    agents: Vec<DiscoveredAgent>,
}

#[derive(Default)]
struct BackoffState {
    consecutive_failures: u32,
    retry_after: Option<Instant>,
}

impl BackoffState {
    fn blocked(&self, now: Instant) -> bool {
        self.retry_after.is_some_and(|at| now < at)
    }

    fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        let exp = self.consecutive_failures.saturating_sub(1).min(16);
        let delay = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(exp))
            .min(BACKOFF_CAP);
        self.retry_after = Some(now + delay);
    }
}

pub struct FleetDiscovery {
    clients: Arc<ClientManager>,
    registry: Arc<ContainerRegistry>,
    api: Arc<dyn AgentApi>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<ServerId, CachedHost>>,
    backoff: Mutex<HashMap<(AgentId, ServerId), BackoffState>>,
}

impl FleetDiscovery {
    pub fn new(
        clients: Arc<ClientManager>,
        registry: Arc<ContainerRegistry>,
        api: Arc<dyn AgentApi>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            clients,
            registry,
            api,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
        }
    }

    fn discover_host(&self, host: &Host) -> Vec<DiscoveredAgent> {
        let containers = match host.client.list_containers() {
            Ok(containers) => containers,
            Err(err) => {
                warn!(server_id = %host.server_id, %err, "could not list containers, skipping host");
                return Vec::new();
            }
        };

        let mut agents: Vec<DiscoveredAgent> = containers
            .into_iter()
            .filter_map(|container| self.build_agent(host, container))
            .collect();
        agents.sort_by(|a, b| {
            (&a.identity.agent_id, &a.identity.occurrence_id)
                .cmp(&(&b.identity.agent_id, &b.identity.occurrence_id))
        });
        agents
    }

    fn build_agent(&self, host: &Host, container: ContainerInfo) -> Option<DiscoveredAgent> {
        let raw_id = container.env.get(AGENT_ID_ENV_VAR)?;
        let agent_id = match AgentId::new(raw_id) {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    container = container.name,
                    %err,
                    "container declares a malformed agent id, skipping"
                );
                return None;
            }
        };

        let identity = AgentIdentity {
            agent_id,
            occurrence_id: container.env.get(OCCURRENCE_ID_ENV_VAR).cloned(),
            server_id: host.server_id.clone(),
        };
        let key = AgentKey::from(&identity);
        let entry = self.registry.resolve(&key).ok();

        let mut agent = DiscoveredAgent {
            display_name: entry
                .as_ref()
                .map(|e| e.display_name.clone())
                .unwrap_or_else(|| identity.agent_id.display_name()),
            container_name: container.name,
            image: container.image,
            status: container.status,
            api_port: container
                .ports
                .get(&AGENT_API_CONTAINER_PORT)
                .copied()
                .or(entry.as_ref().map(|e| e.port)),
            version: None,
            codename: None,
            code_hash: None,
            cognitive_state: None,
            canary_group: entry
                .as_ref()
                .map(|e| e.canary_group)
                .unwrap_or_default(),
            do_not_autostart: entry.as_ref().is_some_and(|e| e.do_not_autostart),
            compose_file: entry.as_ref().and_then(|e| e.compose_file.clone()),
            registered: entry.is_some(),
            identity,
        };

        if agent.status.is_running() {
            self.fetch_health(host, &key, &mut agent);
        }
        Some(agent)
    }

    /// Best-effort health fetch; on success the observation is pushed back
    /// into the registry.
    fn fetch_health(&self, host: &Host, key: &AgentKey, agent: &mut DiscoveredAgent) {
        let Some(port) = agent.api_port else {
            return;
        };
        let token = match self.registry.service_token(key) {
            Ok(token) => token,
            Err(err) => {
                debug!(agent = %agent.identity, %err, "no usable service token, skipping health fetch");
                return;
            }
        };

        let backoff_key = (agent.identity.agent_id.clone(), host.server_id.clone());
        let now = Instant::now();
        {
            let backoff = self.backoff.lock().expect("backoff lock poisoned");
            if backoff.get(&backoff_key).is_some_and(|b| b.blocked(now)) {
                debug!(agent = %agent.identity, "health fetch backing off");
                return;
            }
        }

        match self.api.health(&host.address, port, &token) {
            Ok(health) => {
                self.backoff
                    .lock()
                    .expect("backoff lock poisoned")
                    .remove(&backoff_key);

                agent.version = health.version.clone();
                agent.codename = health.codename.clone();
                agent.code_hash = health.code_hash.clone();
                agent.cognitive_state = health.cognitive_state.clone();

                if let Err(err) = self.registry.update_agent_state(
                    key,
                    health.version.as_deref(),
                    health.cognitive_state.as_deref(),
                ) {
                    warn!(agent = %agent.identity, %err, "could not record agent state observation");
                }
            }
            Err(err) => {
                warn!(agent = %agent.identity, %err, "agent health fetch failed");
                self.backoff
                    .lock()
                    .expect("backoff lock poisoned")
                    .entry(backoff_key)
                    .or_default()
                    .record_failure(now);
            }
        }
    }
}

impl AgentDiscovery for FleetDiscovery {
    fn discover_agents(&self) -> Vec<DiscoveredAgent> {
        let mut all = Vec::new();
        for host in self.clients.hosts() {
            let now = Instant::now();
            {
                let cache = self.cache.lock().expect("cache lock poisoned");
                if let Some(cached) = cache.get(&host.server_id) {
                    if now.duration_since(cached.taken_at) < self.cache_ttl {
                        all.extend(cached.agents.iter().cloned());
                        continue;
                    }
                }
            }

            let agents = self.discover_host(host);
            self.cache.lock().expect("cache lock poisoned").insert(
                host.server_id.clone(),
                CachedHost {
                    taken_at: now,
                    agents: agents.clone(),
                },
            );
            all.extend(agents);
        }
        all.sort_by(|a, b| {
            (&a.identity.server_id, &a.identity.agent_id)
                .cmp(&(&b.identity.server_id, &b.identity.agent_id))
        });
        all
    }

    fn invalidate(&self) {
        self.cache.lock().expect("cache lock poisoned").clear();
    }
}
