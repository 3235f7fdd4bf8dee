//! Persistent registry of managed agents.
//!
//! Holds everything the orchestrator needs to know about an agent that
//! cannot be discovered from its container: allocated port, compose file,
//! encrypted service credential, canary cohort, deployment label and
//! observed-version history. Metadata is persisted on every mutation that
//! affects orchestration.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::identity::{AgentId, AgentKey, ServerId};
use super::token::{TokenCipher, TokenCipherError};
use crate::storage::{DocumentStoreError, JsonDocument};
use crate::utils::time;

/// Cognitive state an agent reports while doing productive work.
const PRODUCTIVE_STATE: &str = "work";

/// Observed version changes kept per agent; oldest evicted first.
const VERSION_TRANSITIONS_MAX: usize = 10;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("agent '{0}' not found")]
    NotFound(String),

    #[error("key '{0}' matches {1} agents, a more specific key is required")]
    Ambiguous(String, usize),

    #[error("agent '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("port {port} is already allocated on server '{server}'")]
    PortInUse { port: u16, server: ServerId },

    #[error("agent '{0}' has no service token")]
    MissingToken(String),

    #[error("service token error: {0}")]
    Token(#[from] TokenCipherError),

    #[error("registry persistence error: {0}")]
    Store(#[from] DocumentStoreError),
}

/// Canary cohort governing rollout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CanaryGroup {
    Explorer,
    EarlyAdopter,
    General,
    #[default]
    Unassigned,
}

impl CanaryGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanaryGroup::Explorer => "explorer",
            CanaryGroup::EarlyAdopter => "early_adopter",
            CanaryGroup::General => "general",
            CanaryGroup::Unassigned => "unassigned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explorer" => Some(CanaryGroup::Explorer),
            "early_adopter" => Some(CanaryGroup::EarlyAdopter),
            "general" => Some(CanaryGroup::General),
            "unassigned" => Some(CanaryGroup::Unassigned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OauthStatus {
    #[default]
    Pending,
    Configured,
    Verified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionTransition {
    pub version: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurrence_id: Option<String>,
    pub server_id: ServerId,
    pub display_name: String,
    pub template: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<PathBuf>,
    /// Always ciphertext; see [`ContainerRegistry::service_token`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_token: Option<String>,
    #[serde(default)]
    pub canary_group: CanaryGroup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(default)]
    pub do_not_autostart: bool,
    #[serde(default)]
    pub oauth_status: OauthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_work_state_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version_transitions: Vec<VersionTransition>,
    pub created_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn new(
        agent_id: AgentId,
        occurrence_id: Option<String>,
        server_id: ServerId,
        template: impl Into<String>,
        port: u16,
    ) -> Self {
        let display_name = agent_id.display_name();
        Self {
            agent_id,
            occurrence_id,
            server_id,
            display_name,
            template: template.into(),
            port,
            compose_file: None,
            encrypted_token: None,
            canary_group: CanaryGroup::default(),
            deployment: None,
            do_not_autostart: false,
            oauth_status: OauthStatus::default(),
            current_version: None,
            last_work_state_at: None,
            version_transitions: Vec::new(),
            created_at: time::now(),
        }
    }

    pub fn with_compose_file(mut self, compose_file: impl Into<PathBuf>) -> Self {
        self.compose_file = Some(compose_file.into());
        self
    }

    fn matches_exact(&self, key: &AgentKey) -> bool {
        self.agent_id == key.agent_id
            && self.occurrence_id == key.occurrence_id
            && Some(&self.server_id) == key.server_id.as_ref()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RegistryData {
    agents: Vec<RegistryEntry>,
}

pub struct ContainerRegistry {
    document: JsonDocument,
    cipher: Arc<TokenCipher>,
    inner: Mutex<RegistryData>,
}

impl ContainerRegistry {
    /// Loads the registry metadata document, starting empty when none
    /// exists yet.
    pub fn load(document: JsonDocument, cipher: Arc<TokenCipher>) -> Result<Self, RegistryError> {
        let data: RegistryData = document.load()?.unwrap_or_default();
        debug!(agents = data.agents.len(), "registry metadata loaded");
        Ok(Self {
            document,
            cipher,
            inner: Mutex::new(data),
        })
    }

    pub fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let key = AgentKey {
            agent_id: entry.agent_id.clone(),
            occurrence_id: entry.occurrence_id.clone(),
            server_id: Some(entry.server_id.clone()),
        };
        if inner.agents.iter().any(|e| e.matches_exact(&key)) {
            return Err(RegistryError::AlreadyRegistered(display_key(&key)));
        }
        if let Some(existing) = inner
            .agents
            .iter()
            .find(|e| e.server_id == entry.server_id && e.port == entry.port)
        {
            return Err(RegistryError::PortInUse {
                port: existing.port,
                server: existing.server_id.clone(),
            });
        }

        let mut candidate = inner.clone();
        candidate.agents.push(entry);
        self.document.save(&candidate)?;
        *inner = candidate;
        Ok(())
    }

    pub fn remove(&self, key: &AgentKey) -> Result<RegistryEntry, RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let index = resolve_index(&inner.agents, key)?;
        let mut candidate = inner.clone();
        let removed = candidate.agents.remove(index);
        self.document.save(&candidate)?;
        *inner = candidate;
        Ok(removed)
    }

    /// Resolves a possibly partial key to exactly one entry.
    /// Precedence: exact > id+server > id alone; multiple matches at the
    /// chosen level are an error.
    pub fn resolve(&self, key: &AgentKey) -> Result<RegistryEntry, RegistryError> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let index = resolve_index(&inner.agents, key)?;
        Ok(inner.agents[index].clone())
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .agents
            .clone()
    }

    pub fn set_canary_group(&self, key: &AgentKey, group: CanaryGroup) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            entry.canary_group = group;
            true
        })
    }

    pub fn set_deployment(&self, key: &AgentKey, label: &str) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            entry.deployment = Some(label.to_string());
            true
        })
    }

    pub fn get_by_deployment(&self, label: &str) -> Vec<RegistryEntry> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .agents
            .iter()
            .filter(|e| e.deployment.as_deref() == Some(label))
            .cloned()
            .collect()
    }

    pub fn set_do_not_autostart(&self, key: &AgentKey, flag: bool) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            entry.do_not_autostart = flag;
            true
        })
    }

    pub fn set_oauth_status(
        &self,
        key: &AgentKey,
        status: OauthStatus,
    ) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            entry.oauth_status = status;
            true
        })
    }

    /// Records a live observation from the agent's health endpoint. Only
    /// persists when the observation actually changed something.
    pub fn update_agent_state(
        &self,
        key: &AgentKey,
        version: Option<&str>,
        cognitive_state: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            let mut changed = false;

            if let Some(version) = version {
                if entry.current_version.as_deref() != Some(version) {
                    entry.current_version = Some(version.to_string());
                    entry.version_transitions.push(VersionTransition {
                        version: version.to_string(),
                        observed_at: time::now(),
                    });
                    if entry.version_transitions.len() > VERSION_TRANSITIONS_MAX {
                        let excess = entry.version_transitions.len() - VERSION_TRANSITIONS_MAX;
                        entry.version_transitions.drain(..excess);
                    }
                    changed = true;
                }
            }

            if cognitive_state == Some(PRODUCTIVE_STATE) {
                entry.last_work_state_at = Some(time::now());
                changed = true;
            }

            changed
        })
    }

    /// Encrypts and stores the service token for an agent.
    pub fn set_service_token(&self, key: &AgentKey, plaintext: &str) -> Result<(), RegistryError> {
        let encrypted = self.cipher.encrypt(plaintext)?;
        self.with_entry(key, move |entry| {
            entry.encrypted_token = Some(encrypted);
            true
        })
    }

    /// Decrypts the service token on demand. The plaintext is returned to
    /// the caller and not retained.
    pub fn service_token(&self, key: &AgentKey) -> Result<String, RegistryError> {
        let entry = self.resolve(key)?;
        let encrypted = entry
            .encrypted_token
            .as_deref()
            .ok_or_else(|| RegistryError::MissingToken(entry.agent_id.to_string()))?;
        self.cipher.decrypt(encrypted).map_err(|err| {
            warn!(agent_id = %entry.agent_id, "service token could not be decrypted");
            RegistryError::Token(err)
        })
    }

    /// Applies `mutate` to the resolved entry; persists iff it returns true.
    /// The in-memory state only advances once the document hit disk.
    fn with_entry<F>(&self, key: &AgentKey, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut RegistryEntry) -> bool,
    {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let index = resolve_index(&inner.agents, key)?;
        let mut candidate = inner.clone();
        if mutate(&mut candidate.agents[index]) {
            self.document.save(&candidate)?;
            *inner = candidate;
        }
        Ok(())
    }
}

fn resolve_index(agents: &[RegistryEntry], key: &AgentKey) -> Result<usize, RegistryError> {
    if key.server_id.is_some() || key.occurrence_id.is_some() {
        let exact: Vec<usize> = agents
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.agent_id == key.agent_id
                    && (key.occurrence_id.is_none() || e.occurrence_id == key.occurrence_id)
                    && (key.server_id.is_none() || Some(&e.server_id) == key.server_id.as_ref())
            })
            .map(|(i, _)| i)
            .collect();
        return match exact.len() {
            0 => Err(RegistryError::NotFound(display_key(key))),
            1 => Ok(exact[0]),
            n => Err(RegistryError::Ambiguous(display_key(key), n)),
        };
    }

    let by_id: Vec<usize> = agents
        .iter()
        .enumerate()
        .filter(|(_, e)| e.agent_id == key.agent_id)
        .map(|(i, _)| i)
        .collect();
    match by_id.len() {
        0 => Err(RegistryError::NotFound(display_key(key))),
        1 => Ok(by_id[0]),
        n => Err(RegistryError::Ambiguous(display_key(key), n)),
    }
}

fn display_key(key: &AgentKey) -> String {
    let mut s = key.agent_id.to_string();
    if let Some(occ) = &key.occurrence_id {
        s.push('.');
        s.push_str(occ);
    }
    if let Some(server) = &key.server_id {
        s.push('@');
        s.push_str(server);
    }
    s
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    pub(crate) fn test_cipher() -> Arc<TokenCipher> {
        Arc::new(TokenCipher::new("test-secret"))
    }

    fn registry(dir: &TempDir) -> ContainerRegistry {
        ContainerRegistry::load(
            JsonDocument::new(dir.path().join("agents_metadata.json")),
            test_cipher(),
        )
        .unwrap()
    }

    fn entry(id: &str, server: &str, port: u16) -> RegistryEntry {
        RegistryEntry::new(
            AgentId::new(id).unwrap(),
            None,
            ServerId::new(server).unwrap(),
            "base",
            port,
        )
    }

    fn key(id: &str) -> AgentKey {
        AgentKey::id(AgentId::new(id).unwrap())
    }

    #[test]
    fn register_and_resolve_by_id_alone() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();

        let found = reg.resolve(&key("datum")).unwrap();
        assert_eq!(found.port, 8001);
        assert_eq!(found.display_name, "Datum");
    }

    #[test]
    fn resolution_prefers_more_specific_keys() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();
        reg.register(entry("datum", "backup", 8001)).unwrap();

        // id alone is ambiguous across two servers
        assert_matches!(
            reg.resolve(&key("datum")),
            Err(RegistryError::Ambiguous(_, 2))
        );

        // id + server resolves
        let found = reg
            .resolve(&key("datum").with_server(ServerId::new("backup").unwrap()))
            .unwrap();
        assert_eq!(&*found.server_id, "backup");
    }

    #[test]
    fn resolution_with_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let mut first = entry("datum", "main", 8001);
        first.occurrence_id = Some("1".to_string());
        let mut second = entry("datum", "main", 8002);
        second.occurrence_id = Some("2".to_string());
        reg.register(first).unwrap();
        reg.register(second).unwrap();

        let found = reg
            .resolve(
                &key("datum")
                    .with_server(ServerId::new("main").unwrap())
                    .with_occurrence("2"),
            )
            .unwrap();
        assert_eq!(found.port, 8002);
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        assert_matches!(reg.resolve(&key("ghost")), Err(RegistryError::NotFound(_)));
    }

    #[test]
    fn port_must_be_unique_per_server() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();

        assert_matches!(
            reg.register(entry("sage", "main", 8001)),
            Err(RegistryError::PortInUse { port: 8001, .. })
        );
        // Same port on a different server is fine.
        reg.register(entry("sage", "backup", 8001)).unwrap();
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();
        assert_matches!(
            reg.register(entry("datum", "main", 8002)),
            Err(RegistryError::AlreadyRegistered(_))
        );
    }

    #[test]
    fn mutations_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = registry(&dir);
            reg.register(entry("datum", "main", 8001)).unwrap();
            reg.set_canary_group(&key("datum"), CanaryGroup::Explorer)
                .unwrap();
            reg.set_deployment(&key("datum"), "stable").unwrap();
            reg.set_do_not_autostart(&key("datum"), true).unwrap();
            reg.set_oauth_status(&key("datum"), OauthStatus::Verified)
                .unwrap();
        }

        let reg = registry(&dir);
        let found = reg.resolve(&key("datum")).unwrap();
        assert_eq!(found.canary_group, CanaryGroup::Explorer);
        assert_eq!(found.deployment.as_deref(), Some("stable"));
        assert!(found.do_not_autostart);
        assert_eq!(found.oauth_status, OauthStatus::Verified);
    }

    #[test]
    fn tokens_are_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();
        reg.set_service_token(&key("datum"), "plaintext-token")
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("agents_metadata.json")).unwrap();
        assert!(!raw.contains("plaintext-token"));

        assert_eq!(
            reg.service_token(&key("datum")).unwrap(),
            "plaintext-token"
        );
    }

    #[test]
    fn missing_token_degrades_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();
        assert_matches!(
            reg.service_token(&key("datum")),
            Err(RegistryError::MissingToken(_))
        );
    }

    #[test]
    fn agent_state_observation_records_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();

        reg.update_agent_state(&key("datum"), Some("1.0.0"), Some("wakeup"))
            .unwrap();
        reg.update_agent_state(&key("datum"), Some("1.0.0"), Some("work"))
            .unwrap();
        reg.update_agent_state(&key("datum"), Some("1.0.1"), Some("work"))
            .unwrap();

        let found = reg.resolve(&key("datum")).unwrap();
        assert_eq!(found.current_version.as_deref(), Some("1.0.1"));
        assert!(found.last_work_state_at.is_some());
        let versions: Vec<&str> = found
            .version_transitions
            .iter()
            .map(|t| t.version.as_str())
            .collect();
        assert_eq!(versions, vec!["1.0.0", "1.0.1"]);
    }

    #[test]
    fn version_transitions_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();

        for i in 0..15 {
            reg.update_agent_state(&key("datum"), Some(&format!("1.0.{i}")), None)
                .unwrap();
        }

        let found = reg.resolve(&key("datum")).unwrap();
        assert_eq!(found.version_transitions.len(), VERSION_TRANSITIONS_MAX);
        // Oldest evicted first.
        assert_eq!(found.version_transitions[0].version, "1.0.5");
        assert_eq!(found.version_transitions.last().unwrap().version, "1.0.14");
    }

    #[test]
    fn get_by_deployment_filters_label() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.register(entry("datum", "main", 8001)).unwrap();
        reg.register(entry("sage", "main", 8002)).unwrap();
        reg.set_deployment(&key("datum"), "stable").unwrap();
        reg.set_deployment(&key("sage"), "edge").unwrap();

        let stable = reg.get_by_deployment("stable");
        assert_eq!(stable.len(), 1);
        assert_eq!(&*stable[0].agent_id, "datum");
        assert!(reg.get_by_deployment("nope").is_empty());
    }

    #[test]
    fn remove_deletes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = registry(&dir);
            reg.register(entry("datum", "main", 8001)).unwrap();
            reg.remove(&key("datum")).unwrap();
        }
        let reg = registry(&dir);
        assert!(reg.entries().is_empty());
    }
}
