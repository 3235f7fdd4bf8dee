use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use thiserror::Error;

const AGENT_ID_MAX_LENGTH: usize = 63;

/// Unique identifier of a logical agent.
/// Follows [RFC 1035 label names](https://kubernetes.io/docs/concepts/overview/working-with-objects/names/#rfc-1035-label-names):
/// lowercase alphanumeric characters or dashes, starts with alphabetic, ends
/// with alphanumeric, 63 characters at most.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Hash, Eq, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub struct AgentId(String);

#[derive(Error, Debug, PartialEq)]
pub enum IdentityError {
    #[error("agent id must contain 63 characters at most, contain lowercase alphanumeric characters or dashes only, start with alphabetic, and end with alphanumeric")]
    InvalidAgentId,
    #[error("server id must not be empty")]
    EmptyServerId,
}

impl AgentId {
    pub fn new(s: &str) -> Result<Self, IdentityError> {
        Self::try_from(s.to_string())
    }

    /// Human-readable name derived from the id. An id carrying a trailing
    /// six-character alphanumeric suffix (replica naming used in
    /// production) renders as `Title (suffix)`; anything else title-cases.
    pub fn display_name(&self) -> String {
        let title = |s: &str| {
            s.split('-')
                .filter(|part| !part.is_empty())
                .map(|part| {
                    let mut chars = part.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        };

        match self.0.rsplit_once('-') {
            Some((base, suffix))
                if suffix.len() == 6 && suffix.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                format!("{} ({})", title(base), suffix)
            }
            _ => title(&self.0),
        }
    }

    fn is_valid_format(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= AGENT_ID_MAX_LENGTH
            && s.starts_with(|c: char| c.is_ascii_lowercase())
            && s.ends_with(|c: char| c.is_ascii_alphanumeric())
            && s.chars()
                .all(|c| c.eq(&'-') || c.is_ascii_digit() || c.is_ascii_lowercase())
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if AgentId::is_valid_format(&s) {
            Ok(AgentId(s))
        } else {
            Err(IdentityError::InvalidAgentId)
        }
    }
}

impl Deref for AgentId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a container host.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Hash, Eq, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub struct ServerId(String);

impl ServerId {
    pub fn new(s: &str) -> Result<Self, IdentityError> {
        Self::try_from(s.to_string())
    }
}

impl TryFrom<String> for ServerId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.trim().is_empty() {
            Err(IdentityError::EmptyServerId)
        } else {
            Ok(ServerId(s))
        }
    }
}

impl Deref for ServerId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified agent identity: which logical agent, which replica, on
/// which host.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Hash, Eq)]
pub struct AgentIdentity {
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_id: Option<String>,
    pub server_id: ServerId,
}

impl Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.occurrence_id {
            Some(occ) => write!(f, "{}.{}@{}", self.agent_id, occ, self.server_id),
            None => write!(f, "{}@{}", self.agent_id, self.server_id),
        }
    }
}

/// Lookup key accepted by the registry: the occurrence and server parts are
/// optional and resolution prefers the most specific match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentKey {
    pub agent_id: AgentId,
    pub occurrence_id: Option<String>,
    pub server_id: Option<ServerId>,
}

impl AgentKey {
    pub fn id(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            occurrence_id: None,
            server_id: None,
        }
    }

    pub fn with_server(mut self, server_id: ServerId) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn with_occurrence(mut self, occurrence_id: impl Into<String>) -> Self {
        self.occurrence_id = Some(occurrence_id.into());
        self
    }
}

impl From<&AgentIdentity> for AgentKey {
    fn from(identity: &AgentIdentity) -> Self {
        Self {
            agent_id: identity.agent_id.clone(),
            occurrence_id: identity.occurrence_id.clone(),
            server_id: Some(identity.server_id.clone()),
        }
    }
}
