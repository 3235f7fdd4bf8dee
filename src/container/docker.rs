//! Docker CLI backend for [`ContainerClient`].
//!
//! Talks to the local socket by default or to a remote daemon through the
//! `-H` endpoint, which keeps TLS and ssh transports in docker's hands.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{ContainerClient, ContainerClientError, ContainerInfo, ContainerStatus};

pub struct DockerCliClient {
    binary: String,
    host: Option<String>,
}

impl DockerCliClient {
    /// Client for the local daemon.
    pub fn local() -> Self {
        Self {
            binary: "docker".to_string(),
            host: None,
        }
    }

    /// Client for a remote daemon endpoint (`tcp://...`, `ssh://...`).
    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            host: Some(endpoint.into()),
        }
    }

    #[cfg(test)]
    fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            host: None,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, ContainerClientError> {
        let mut cmd = Command::new(&self.binary);
        if let Some(host) = &self.host {
            cmd.arg("-H").arg(host);
        }
        cmd.args(args);
        debug!(?args, "running container command");

        let output = cmd.output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.contains("No such container") || stderr.contains("No such object") {
            // docker prints the offending name after the colon
            let name = args.last().copied().unwrap_or_default();
            return Err(ContainerClientError::NotFound(name.to_string()));
        }
        Err(ContainerClientError::CommandFailed(stderr.trim().to_string()))
    }

    fn inspect(&self, names: &[&str]) -> Result<Vec<ContainerInfo>, ContainerClientError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect"];
        args.extend_from_slice(names);
        let raw = self.run(&args)?;
        parse_inspect_output(&raw)
    }
}

impl ContainerClient for DockerCliClient {
    fn list_containers(&self) -> Result<Vec<ContainerInfo>, ContainerClientError> {
        let raw = self.run(&["ps", "-a", "--format", "{{.Names}}"])?;
        let names: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        self.inspect(&names)
    }

    fn get(&self, name: &str) -> Result<ContainerInfo, ContainerClientError> {
        self.inspect(&[name])?
            .into_iter()
            .next()
            .ok_or_else(|| ContainerClientError::NotFound(name.to_string()))
    }

    fn start(&self, name: &str) -> Result<(), ContainerClientError> {
        self.run(&["start", name]).map(|_| ())
    }

    fn stop(&self, name: &str, timeout: Duration) -> Result<(), ContainerClientError> {
        let secs = timeout.as_secs().max(1).to_string();
        self.run(&["stop", "-t", secs.as_str(), name]).map(|_| ())
    }

    fn kill(&self, name: &str) -> Result<(), ContainerClientError> {
        self.run(&["kill", name]).map(|_| ())
    }

    fn restart(&self, name: &str) -> Result<(), ContainerClientError> {
        self.run(&["restart", name]).map(|_| ())
    }

    fn compose_up(&self, compose_file: &Path) -> Result<(), ContainerClientError> {
        let path = compose_file.to_string_lossy();
        self.run(&[
            "compose",
            "-f",
            &*path,
            "up",
            "-d",
            "--pull",
            "always",
            "--remove-orphans",
        ])
        .map(|_| ())
    }

    fn exec(&self, name: &str, command: &[String]) -> Result<String, ContainerClientError> {
        let mut args = vec!["exec", name];
        args.extend(command.iter().map(String::as_str));
        self.run(&args)
    }
}

#[derive(Deserialize)]
struct InspectEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Env", default)]
    env: Vec<String>,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Deserialize, Default)]
struct InspectNetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

fn parse_inspect_output(raw: &str) -> Result<Vec<ContainerInfo>, ContainerClientError> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(raw).map_err(|err| ContainerClientError::Parse(err.to_string()))?;
    Ok(entries.into_iter().map(ContainerInfo::from).collect())
}

impl From<InspectEntry> for ContainerInfo {
    fn from(entry: InspectEntry) -> Self {
        let env = entry
            .config
            .env
            .iter()
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let ports = entry
            .network_settings
            .ports
            .iter()
            .filter_map(|(container_port, bindings)| {
                let container_port: u16 =
                    container_port.split('/').next()?.parse().ok()?;
                let host_port: u16 = bindings.as_ref()?.first()?.host_port.parse().ok()?;
                Some((container_port, host_port))
            })
            .collect();

        ContainerInfo {
            name: entry.name.trim_start_matches('/').to_string(),
            image: entry.config.image,
            status: ContainerStatus::parse(&entry.state.status),
            env,
            ports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const INSPECT_FIXTURE: &str = r#"[
      {
        "Name": "/fleet-datum",
        "Config": {
          "Image": "registry.example.com/agent:1.0.0",
          "Env": [
            "FLEET_AGENT_ID=datum",
            "PATH=/usr/bin",
            "MALFORMED_NO_EQUALS"
          ]
        },
        "State": { "Status": "running" },
        "NetworkSettings": {
          "Ports": {
            "8080/tcp": [ { "HostIp": "0.0.0.0", "HostPort": "18080" } ],
            "9000/tcp": null
          }
        }
      },
      {
        "Name": "/unrelated",
        "Config": { "Image": "nginx:latest", "Env": [] },
        "State": { "Status": "exited" },
        "NetworkSettings": { "Ports": {} }
      }
    ]"#;

    #[test]
    fn parses_inspect_entries() {
        let infos = parse_inspect_output(INSPECT_FIXTURE).unwrap();
        assert_eq!(infos.len(), 2);

        let agent = &infos[0];
        assert_eq!(agent.name, "fleet-datum");
        assert_eq!(agent.image, "registry.example.com/agent:1.0.0");
        assert_eq!(agent.status, ContainerStatus::Running);
        assert_eq!(agent.env.get("FLEET_AGENT_ID").map(String::as_str), Some("datum"));
        assert!(!agent.env.contains_key("MALFORMED_NO_EQUALS"));
        assert_eq!(agent.ports.get(&8080), Some(&18080));
        assert!(!agent.ports.contains_key(&9000));

        assert_eq!(infos[1].status, ContainerStatus::Exited);
    }

    #[test]
    fn parse_rejects_non_json() {
        assert_matches!(
            parse_inspect_output("Error: no such object"),
            Err(ContainerClientError::Parse(_))
        );
    }

    #[test]
    fn run_surfaces_failing_command() {
        let client = DockerCliClient::with_binary("false");
        assert_matches!(
            client.run(&["anything"]),
            Err(ContainerClientError::CommandFailed(_))
        );
    }

    #[test]
    fn run_captures_stdout() {
        let client = DockerCliClient::with_binary("echo");
        let out = client.run(&["hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let client = DockerCliClient::with_binary("definitely-not-a-real-binary");
        assert_matches!(
            client.run(&["ps"]),
            Err(ContainerClientError::Spawn(_))
        );
    }
}
