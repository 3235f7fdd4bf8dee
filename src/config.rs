//! Process configuration: a YAML file plus environment overrides
//! (prefix `FLEET_CONTROL`, `__` as the nesting separator).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::defaults::{CONFIG_ENV_PREFIX, DEFAULT_DATA_DIR};
use crate::deployment::orchestrator::DeploymentConfig;
use crate::deployment::updater::UpdaterTimeouts;
use crate::logging::LoggingConfig;
use crate::server::auth::AuthConfig;
use crate::server::ServerConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetControlConfig {
    /// Directory holding the persisted state documents.
    pub data_dir: PathBuf,
    pub log: LoggingConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    /// Process-wide secret the per-agent service tokens are encrypted with.
    pub token_secret: String,
    /// Container hosts, keyed by server id.
    pub hosts: HashMap<String, HostConfig>,
    pub deployment: DeploymentConfig,
    pub discovery: DiscoveryConfig,
    pub updater: UpdaterTimeouts,
    pub outbound_http: OutboundHttpConfig,
    pub auxiliary: AuxiliaryConfig,
}

impl Default for FleetControlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log: LoggingConfig::default(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            token_secret: String::new(),
            hosts: HashMap::from([("main".to_string(), HostConfig::default())]),
            deployment: DeploymentConfig::default(),
            discovery: DiscoveryConfig::default(),
            updater: UpdaterTimeouts::default(),
            outbound_http: OutboundHttpConfig::default(),
            auxiliary: AuxiliaryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Remote container runtime endpoint (`tcp://...`, `ssh://...`);
    /// absent means the local socket.
    pub endpoint: Option<Url>,
    /// Address published agent ports are reachable at.
    pub address: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            address: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// How long per-host fleet snapshots are memoized.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub cache_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutboundHttpConfig {
    /// Request timeout for agent control-surface calls.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub connect_timeout: Duration,
}

impl Default for OutboundHttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Compose files for the gui and nginx containers; used when a deployment
/// carries those image kinds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuxiliaryConfig {
    pub gui_compose_file: Option<PathBuf>,
    pub nginx_compose_file: Option<PathBuf>,
    /// Host the auxiliary containers run on; defaults to any known host.
    pub server: Option<String>,
}

/// Loads configuration from an optional YAML file with environment
/// overrides, then checks the fields nothing can run without.
pub fn load(path: Option<&Path>) -> Result<FleetControlConfig, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path.to_path_buf()));
    }
    builder = builder.add_source(config::Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"));
    let settings: FleetControlConfig = builder.build()?.try_deserialize()?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(config: &FleetControlConfig) -> Result<(), ConfigError> {
    if config.auth.operator_token.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "auth.operator_token must be set".to_string(),
        ));
    }
    if config.token_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("token_secret must be set".to_string()));
    }
    if config.hosts.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one container host must be configured".to_string(),
        ));
    }
    Ok(())
}
