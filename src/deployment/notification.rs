//! Update notifications posted by the CD pipeline, and the token scoping
//! that constrains them.

use serde::{Deserialize, Serialize};

use super::error::DeploymentError;
use crate::tracker::ImageKind;

/// Longest changelog digest embedded into a shutdown reason.
const CHANGELOG_DIGEST_MAX: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployStrategy {
    #[default]
    Canary,
    Immediate,
    Manual,
}

/// Notification payload from the CD pipeline. Unknown fields are rejected
/// at the boundary; `message` and `changelog` stay opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateNotification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gui_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub strategy: DeployStrategy,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

fn default_message() -> String {
    "Update available".to_string()
}

impl UpdateNotification {
    /// The image targets present in the notification.
    pub fn images(&self) -> Vec<(ImageKind, &str)> {
        [
            (ImageKind::Agent, &self.agent_image),
            (ImageKind::Gui, &self.gui_image),
            (ImageKind::Nginx, &self.nginx_image),
        ]
        .into_iter()
        .filter_map(|(kind, image)| image.as_deref().map(|i| (kind, i)))
        .collect()
    }

    pub fn image_for(&self, kind: ImageKind) -> Option<&str> {
        match kind {
            ImageKind::Agent => self.agent_image.as_deref(),
            ImageKind::Gui => self.gui_image.as_deref(),
            ImageKind::Nginx => self.nginx_image.as_deref(),
        }
    }

    /// Version label used in operator-facing messages: the explicit version
    /// if given, else the tag of the first image, else the short commit.
    pub fn version_label(&self) -> String {
        if let Some(version) = &self.version {
            return version.clone();
        }
        if let Some((_, image)) = self.images().first() {
            if let Some((_, tag)) = image.rsplit_once(':') {
                return tag.to_string();
            }
        }
        self.commit_sha
            .as_deref()
            .map(|sha| sha.chars().take(8).collect())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn is_critical_risk(&self) -> bool {
        self.risk_level
            .as_deref()
            .map(|risk| {
                let risk = risk.to_ascii_lowercase();
                risk == "critical" || risk == "breaking"
            })
            .unwrap_or(false)
    }

    /// Human-readable reason sent to each agent with the shutdown request:
    /// the pipeline's message, the target version, and a bounded changelog
    /// digest when one was provided.
    pub fn shutdown_reason(&self) -> String {
        let mut reason = format!("{} (target version {})", self.message, self.version_label());
        if let Some(changelog) = &self.changelog {
            let digest: String = changelog
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .take(3)
                .collect::<Vec<_>>()
                .join("; ");
            if !digest.is_empty() {
                let mut digest = digest;
                if digest.chars().count() > CHANGELOG_DIGEST_MAX {
                    digest = digest.chars().take(CHANGELOG_DIGEST_MAX).collect();
                    digest.push('…');
                }
                reason.push_str(" | changes: ");
                reason.push_str(&digest);
            }
        }
        reason
    }
}

/// Scope bound to a CD bearer token. Scoped tokens may only submit
/// notifications for their own image kind; the legacy token may submit
/// anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    Agent,
    Gui,
    Nginx,
    Legacy,
}

impl TokenScope {
    pub fn kind(&self) -> Option<ImageKind> {
        match self {
            TokenScope::Agent => Some(ImageKind::Agent),
            TokenScope::Gui => Some(ImageKind::Gui),
            TokenScope::Nginx => Some(ImageKind::Nginx),
            TokenScope::Legacy => None,
        }
    }

    /// Enforces the scope on a notification: a scoped token must provide
    /// its own image and nothing else.
    pub fn validate(&self, notification: &UpdateNotification) -> Result<(), DeploymentError> {
        let Some(own_kind) = self.kind() else {
            return Ok(());
        };

        for (kind, _) in notification.images() {
            if kind != own_kind {
                return Err(DeploymentError::Forbidden(format!(
                    "token scoped to '{own_kind}' may not submit {kind} images"
                )));
            }
        }
        if notification.image_for(own_kind).is_none() {
            return Err(DeploymentError::BadRequest(format!(
                "token scoped to '{own_kind}' must provide the {own_kind} image"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn notification(agent: Option<&str>, gui: Option<&str>) -> UpdateNotification {
        UpdateNotification {
            agent_image: agent.map(str::to_string),
            gui_image: gui.map(str::to_string),
            nginx_image: None,
            version: None,
            commit_sha: None,
            strategy: DeployStrategy::Canary,
            message: "Security fix".to_string(),
            risk_level: None,
            changelog: None,
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"agent_image": "agent:1.0.1", "surprise": true}"#;
        assert!(serde_json::from_str::<UpdateNotification>(raw).is_err());
    }

    #[test]
    fn defaults_apply_to_sparse_payloads() {
        let parsed: UpdateNotification =
            serde_json::from_str(r#"{"agent_image": "agent:1.0.1"}"#).unwrap();
        assert_eq!(parsed.strategy, DeployStrategy::Canary);
        assert_eq!(parsed.message, "Update available");
        assert_eq!(parsed.images(), vec![(ImageKind::Agent, "agent:1.0.1")]);
    }

    #[test]
    fn version_label_falls_back_to_image_tag() {
        let n = notification(Some("registry.example.com/agent:1.0.1"), None);
        assert_eq!(n.version_label(), "1.0.1");

        let mut with_version = n.clone();
        with_version.version = Some("2024.2".to_string());
        assert_eq!(with_version.version_label(), "2024.2");
    }

    #[test]
    fn critical_risk_detection() {
        let mut n = notification(Some("agent:1.0.1"), None);
        assert!(!n.is_critical_risk());
        n.risk_level = Some("Critical".to_string());
        assert!(n.is_critical_risk());
        n.risk_level = Some("breaking".to_string());
        assert!(n.is_critical_risk());
        n.risk_level = Some("low".to_string());
        assert!(!n.is_critical_risk());
    }

    #[test]
    fn shutdown_reason_includes_message_and_version() {
        let n = notification(Some("agent:1.0.1"), None);
        assert_eq!(n.shutdown_reason(), "Security fix (target version 1.0.1)");
    }

    #[test]
    fn shutdown_reason_digests_changelog() {
        let mut n = notification(Some("agent:1.0.1"), None);
        n.changelog = Some("fix: memory leak\nfeat: new telemetry\n\nchore: bump deps\nignored fourth line".to_string());
        let reason = n.shutdown_reason();
        assert!(reason.contains("fix: memory leak; feat: new telemetry; chore: bump deps"));
        assert!(!reason.contains("ignored fourth line"));
    }

    #[test]
    fn shutdown_reason_bounds_changelog() {
        let mut n = notification(Some("agent:1.0.1"), None);
        n.changelog = Some("x".repeat(2000));
        assert!(n.shutdown_reason().len() < 400);
    }

    #[test]
    fn legacy_scope_accepts_anything() {
        let n = notification(Some("agent:1.0.1"), Some("gui:2.0.0"));
        assert!(TokenScope::Legacy.validate(&n).is_ok());
    }

    #[test]
    fn scoped_token_rejects_foreign_images() {
        let n = notification(None, Some("gui:2.0.0"));
        assert_matches!(
            TokenScope::Agent.validate(&n),
            Err(DeploymentError::Forbidden(_))
        );
    }

    #[test]
    fn scoped_token_requires_its_own_image() {
        let n = notification(None, None);
        assert_matches!(
            TokenScope::Agent.validate(&n),
            Err(DeploymentError::BadRequest(_))
        );
    }

    #[test]
    fn scoped_token_accepts_matching_image() {
        let n = notification(Some("agent:1.0.1"), None);
        assert!(TokenScope::Agent.validate(&n).is_ok());
    }
}
