//! Process-wide constants shared across modules.

/// Environment variable that marks a container as a managed agent.
/// Containers without it are ignored by discovery.
pub const AGENT_ID_ENV_VAR: &str = "FLEET_AGENT_ID";

/// Optional environment variable distinguishing replicas of the same agent
/// on one host.
pub const OCCURRENCE_ID_ENV_VAR: &str = "FLEET_OCCURRENCE_ID";

/// Container port every agent publishes its control API on.
pub const AGENT_API_CONTAINER_PORT: u16 = 8080;

pub const FLEET_CONTROL_VERSION: &str = env!("CARGO_PKG_VERSION");

// Persisted state layout under the data directory.
pub const VERSION_STATE_FILE: &str = "version_state.json";
pub const REGISTRY_METADATA_FILE: &str = "agents_metadata.json";

#[cfg(target_os = "macos")]
pub const DEFAULT_DATA_DIR: &str = "/opt/homebrew/var/lib/fleet-control";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_DATA_DIR: &str = "/var/lib/fleet-control";

/// Environment prefix for configuration overrides.
pub const CONFIG_ENV_PREFIX: &str = "FLEET_CONTROL";
