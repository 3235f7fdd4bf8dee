//! Container-host capability layer.
//!
//! Every host the fleet runs on is driven through the [`ContainerClient`]
//! trait; concrete backends (local docker socket, remote endpoint) plug in
//! behind it. The core update path needs list-with-env, lifecycle verbs and
//! a compose-up equivalent; exec exists for log retrieval.

pub mod docker;
pub mod manager;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerClientError {
    #[error("container '{0}' not found")]
    NotFound(String),

    #[error("container command failed: {0}")]
    CommandFailed(String),

    #[error("could not launch container command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("could not parse container runtime output: {0}")]
    Parse(String),
}

/// Lifecycle state of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Exited,
    Restarting,
    Paused,
    Created,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            "restarting" => ContainerStatus::Restarting,
            "paused" => ContainerStatus::Paused,
            "created" => ContainerStatus::Created,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Created => "created",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

/// Snapshot of one container, env included so discovery can identify agents.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub env: HashMap<String, String>,
    /// container port -> published host port
    pub ports: HashMap<u16, u16>,
}

#[cfg_attr(test, mockall::automock)]
pub trait ContainerClient: Send + Sync {
    /// Lists all containers on the host, stopped ones included.
    fn list_containers(&self) -> Result<Vec<ContainerInfo>, ContainerClientError>;

    fn get(&self, name: &str) -> Result<ContainerInfo, ContainerClientError>;

    fn start(&self, name: &str) -> Result<(), ContainerClientError>;

    /// Graceful stop with the given grace period before the runtime kills.
    fn stop(&self, name: &str, timeout: Duration) -> Result<(), ContainerClientError>;

    fn kill(&self, name: &str) -> Result<(), ContainerClientError>;

    fn restart(&self, name: &str) -> Result<(), ContainerClientError>;

    /// Brings a compose project up detached, always pulling, so a fresh
    /// container is created on the image the compose file references.
    fn compose_up(&self, compose_file: &Path) -> Result<(), ContainerClientError>;

    fn exec(&self, name: &str, command: &[String]) -> Result<String, ContainerClientError>;
}
