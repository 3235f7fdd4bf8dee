//! Durable sliding window of image versions per image kind.
//!
//! Each kind keeps up to three historical versions plus one staged
//! candidate: `n_plus_1` (staged), `n` (current), `n_minus_1`, `n_minus_2`.
//! Recording or promoting shifts the window down and drops the oldest slot.
//! State lives in one JSON document replaced atomically; mutations are
//! serialized by a single mutex held across the shift-and-persist sequence,
//! so no partial update is ever observable on disk.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::{DocumentStoreError, JsonDocument};
use crate::utils::time;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("version state persistence error: {0}")]
    Store(#[from] DocumentStoreError),
}

/// The kinds of images the fleet runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Agent,
    Gui,
    Nginx,
}

impl ImageKind {
    pub const ALL: [ImageKind; 3] = [ImageKind::Agent, ImageKind::Gui, ImageKind::Nginx];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Agent => "agent",
            ImageKind::Gui => "gui",
            ImageKind::Nginx => "nginx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(ImageKind::Agent),
            "gui" => Some(ImageKind::Gui),
            "nginx" => Some(ImageKind::Nginx),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One deployed (or staged) image version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerVersion {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub deployed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_by: Option<String>,
}

/// Version window for one image kind. `n_plus_1` is provisional; the other
/// slots are ordered by deployment time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_plus_1: Option<ContainerVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<ContainerVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_minus_1: Option<ContainerVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_minus_2: Option<ContainerVersion>,
}

impl VersionState {
    /// Shifts the window down around `new_current`:
    /// n → n−1 → n−2 → dropped; any staged value is cleared.
    fn shift_in(&mut self, new_current: ContainerVersion) {
        self.n_minus_2 = self.n_minus_1.take();
        self.n_minus_1 = self.n.take();
        self.n = Some(new_current);
        self.n_plus_1 = None;
    }

    fn tracked_images(&self) -> impl Iterator<Item = &str> {
        [&self.n, &self.n_minus_1, &self.n_minus_2]
            .into_iter()
            .flatten()
            .map(|v| v.image.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollbackOptions {
    pub current: Option<ContainerVersion>,
    pub n_minus_1: Option<ContainerVersion>,
    pub n_minus_2: Option<ContainerVersion>,
    pub staged: Option<ContainerVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub position: &'static str,
    pub status: &'static str,
    #[serde(flatten)]
    pub version: ContainerVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollbackValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Extra context attached to staged/recorded versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionMeta<'a> {
    pub digest: Option<&'a str>,
    pub deployment_id: Option<&'a str>,
    pub deployed_by: Option<&'a str>,
}

type StateMap = HashMap<ImageKind, VersionState>;

/// Legacy state files used a pluralized key for the agent kind.
const LEGACY_AGENT_KEY: &str = "agents";

pub struct VersionTracker {
    document: JsonDocument,
    /// `None` until the first access; loads are lazy and memoized.
    state: Mutex<Option<StateMap>>,
}

impl VersionTracker {
    pub fn new(document: JsonDocument) -> Self {
        Self {
            document,
            state: Mutex::new(None),
        }
    }

    pub fn stage(
        &self,
        kind: ImageKind,
        image: &str,
        meta: VersionMeta,
    ) -> Result<(), TrackerError> {
        self.mutate(|state| {
            state.entry(kind).or_default().n_plus_1 = Some(new_version(image, meta));
            info!(kind = %kind, image, "staged version as n+1");
        })
    }

    /// Promotes the staged version to current, shifting the window down.
    /// Warns and leaves everything untouched when nothing is staged.
    pub fn promote(&self, kind: ImageKind, deployment_id: Option<&str>) -> Result<(), TrackerError> {
        let mut guard = self.lock_loaded()?;
        let state = loaded(&mut guard);

        let Some(mut staged) = state.get(&kind).and_then(|s| s.n_plus_1.clone()) else {
            warn!(kind = %kind, "no staged version, nothing to promote");
            return Ok(());
        };
        if let Some(id) = deployment_id {
            staged.deployment_id = Some(id.to_string());
        }
        staged.deployed_at = time::now();

        let mut candidate = state.clone();
        candidate.entry(kind).or_default().shift_in(staged);
        self.persist_and_commit(state, candidate)?;
        info!(kind = %kind, "promoted staged version to current");
        Ok(())
    }

    /// Records a deployment directly, without prior staging. Clears any
    /// staged value for the kind.
    pub fn record(
        &self,
        kind: ImageKind,
        image: &str,
        meta: VersionMeta,
    ) -> Result<(), TrackerError> {
        self.mutate(|state| {
            state.entry(kind).or_default().shift_in(new_version(image, meta));
            info!(kind = %kind, image, "recorded deployment");
        })
    }

    pub fn current(&self, kind: ImageKind) -> Result<Option<ContainerVersion>, TrackerError> {
        let mut guard = self.lock_loaded()?;
        Ok(loaded(&mut guard).get(&kind).and_then(|s| s.n.clone()))
    }

    pub fn rollback_options(&self) -> Result<HashMap<ImageKind, RollbackOptions>, TrackerError> {
        let mut guard = self.lock_loaded()?;
        let state = loaded(&mut guard);
        Ok(ImageKind::ALL
            .into_iter()
            .map(|kind| {
                let s = state.get(&kind).cloned().unwrap_or_default();
                (
                    kind,
                    RollbackOptions {
                        current: s.n,
                        n_minus_1: s.n_minus_1,
                        n_minus_2: s.n_minus_2,
                        staged: s.n_plus_1,
                    },
                )
            })
            .collect())
    }

    /// Version history for one kind, newest first, tagged with positional
    /// labels.
    pub fn history(
        &self,
        kind: ImageKind,
        include_staged: bool,
    ) -> Result<Vec<HistoryEntry>, TrackerError> {
        let mut guard = self.lock_loaded()?;
        let s = loaded(&mut guard).get(&kind).cloned().unwrap_or_default();

        let mut history = Vec::new();
        if include_staged {
            if let Some(v) = s.n_plus_1 {
                history.push(HistoryEntry {
                    position: "n+1",
                    status: "staged",
                    version: v,
                });
            }
        }
        if let Some(v) = s.n {
            history.push(HistoryEntry {
                position: "n",
                status: "current",
                version: v,
            });
        }
        if let Some(v) = s.n_minus_1 {
            history.push(HistoryEntry {
                position: "n-1",
                status: "previous",
                version: v,
            });
        }
        if let Some(v) = s.n_minus_2 {
            history.push(HistoryEntry {
                position: "n-2",
                status: "older",
                version: v,
            });
        }
        Ok(history)
    }

    /// Drops the staged slot for one kind, or for all kinds when `None`.
    pub fn clear_staged(&self, kind: Option<ImageKind>) -> Result<(), TrackerError> {
        self.mutate(|state| {
            match kind {
                Some(kind) => {
                    state.entry(kind).or_default().n_plus_1 = None;
                }
                None => {
                    for s in state.values_mut() {
                        s.n_plus_1 = None;
                    }
                }
            }
            debug!(?kind, "cleared staged versions");
        })
    }

    /// Validates rollback targets. Targets outside the tracked window warn;
    /// mixed-image rollbacks warn; unknown kinds are errors and mark the
    /// result invalid.
    pub fn validate_rollback(
        &self,
        targets: &HashMap<String, String>,
    ) -> Result<RollbackValidation, TrackerError> {
        let mut guard = self.lock_loaded()?;
        let state = loaded(&mut guard);

        let mut result = RollbackValidation {
            valid: true,
            ..Default::default()
        };

        for (kind_name, target_image) in targets {
            let Some(kind) = ImageKind::parse(kind_name) else {
                result.errors.push(format!("unknown image kind: {kind_name}"));
                result.valid = false;
                continue;
            };

            let tracked = state
                .get(&kind)
                .map(|s| s.tracked_images().any(|image| image == target_image))
                .unwrap_or(false);
            if !tracked {
                result.warnings.push(format!(
                    "{kind}: target version {target_image} not in tracked history"
                ));
            }
        }

        let unique_targets: std::collections::HashSet<&String> = targets.values().collect();
        if unique_targets.len() > 1 {
            result
                .warnings
                .push("rolling back to different versions across image kinds".to_string());
        }

        Ok(result)
    }

    fn mutate<F>(&self, apply: F) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut StateMap),
    {
        let mut guard = self.lock_loaded()?;
        let state = loaded(&mut guard);
        let mut candidate = state.clone();
        apply(&mut candidate);
        self.persist_and_commit(state, candidate)
    }

    /// Saves `candidate` and commits it to memory. On a write failure the
    /// in-memory state keeps the pre-call value, matching what is on disk.
    fn persist_and_commit(
        &self,
        state: &mut StateMap,
        candidate: StateMap,
    ) -> Result<(), TrackerError> {
        self.document.save(&candidate)?;
        *state = candidate;
        Ok(())
    }

    fn lock_loaded(&self) -> Result<MutexGuard<'_, Option<StateMap>>, TrackerError> {
        let mut guard = self.state.lock().expect("tracker lock poisoned");
        if guard.is_none() {
            *guard = Some(self.load_state()?);
        }
        Ok(guard)
    }

    fn load_state(&self) -> Result<StateMap, TrackerError> {
        let Some(mut raw) = self.document.load_raw()? else {
            info!("no existing version state found, starting fresh");
            return Ok(StateMap::new());
        };

        // Transparent migration of the legacy pluralized agent key.
        if let Some(object) = raw.as_object_mut() {
            if !object.contains_key(ImageKind::Agent.as_str()) {
                if let Some(legacy) = object.remove(LEGACY_AGENT_KEY) {
                    info!("migrating legacy '{LEGACY_AGENT_KEY}' version key");
                    object.insert(ImageKind::Agent.as_str().to_string(), legacy);
                }
            }
        }

        let by_name: HashMap<String, VersionState> = serde_json::from_value(raw)
            .map_err(|source| DocumentStoreError::Malformed {
                path: self.document.path().display().to_string(),
                source,
            })?;

        let mut state = StateMap::new();
        for (name, s) in by_name {
            match ImageKind::parse(&name) {
                Some(kind) => {
                    state.insert(kind, s);
                }
                None => warn!(key = name, "ignoring unknown image kind in version state"),
            }
        }
        Ok(state)
    }
}

fn loaded<'a>(guard: &'a mut MutexGuard<'_, Option<StateMap>>) -> &'a mut StateMap {
    guard.as_mut().expect("state loaded by lock_loaded")
}

fn new_version(image: &str, meta: VersionMeta) -> ContainerVersion {
    ContainerVersion {
        image: image.to_string(),
        digest: meta.digest.map(str::to_string),
        deployed_at: time::now(),
        deployment_id: meta.deployment_id.map(str::to_string),
        deployed_by: meta.deployed_by.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker(dir: &TempDir) -> VersionTracker {
        VersionTracker::new(JsonDocument::new(dir.path().join("version_state.json")))
    }

    fn meta() -> VersionMeta<'static> {
        VersionMeta::default()
    }

    #[test]
    fn stage_then_promote_shifts_window() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);

        t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();
        t.record(ImageKind::Agent, "agent:1.0.1", meta()).unwrap();
        t.stage(ImageKind::Agent, "agent:1.0.2", meta()).unwrap();
        t.promote(ImageKind::Agent, Some("dep-1")).unwrap();

        let options = t.rollback_options().unwrap();
        let agent = &options[&ImageKind::Agent];
        assert_eq!(agent.current.as_ref().unwrap().image, "agent:1.0.2");
        assert_eq!(
            agent.current.as_ref().unwrap().deployment_id.as_deref(),
            Some("dep-1")
        );
        assert_eq!(agent.n_minus_1.as_ref().unwrap().image, "agent:1.0.1");
        assert_eq!(agent.n_minus_2.as_ref().unwrap().image, "agent:1.0.0");
        assert!(agent.staged.is_none());
    }

    #[test]
    fn promote_without_staged_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();
        t.promote(ImageKind::Agent, None).unwrap();

        assert_eq!(
            t.current(ImageKind::Agent).unwrap().unwrap().image,
            "agent:1.0.0"
        );
    }

    #[test]
    fn record_clears_any_staged_value() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.stage(ImageKind::Agent, "agent:9.9.9", meta()).unwrap();
        t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();

        let options = t.rollback_options().unwrap();
        assert!(options[&ImageKind::Agent].staged.is_none());
        assert_eq!(
            options[&ImageKind::Agent].current.as_ref().unwrap().image,
            "agent:1.0.0"
        );
    }

    #[test]
    fn oldest_version_drops_off_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        for v in ["1", "2", "3", "4"] {
            t.record(ImageKind::Agent, &format!("agent:{v}"), meta())
                .unwrap();
        }

        let options = t.rollback_options().unwrap();
        let agent = &options[&ImageKind::Agent];
        assert_eq!(agent.current.as_ref().unwrap().image, "agent:4");
        assert_eq!(agent.n_minus_2.as_ref().unwrap().image, "agent:2");
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = tracker(&dir);
            t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();
            t.record(ImageKind::Gui, "gui:2.0.0", meta()).unwrap();
            t.stage(ImageKind::Agent, "agent:1.0.1", meta()).unwrap();
        }

        let t = tracker(&dir);
        let options = t.rollback_options().unwrap();
        assert_eq!(
            options[&ImageKind::Agent].current.as_ref().unwrap().image,
            "agent:1.0.0"
        );
        assert_eq!(
            options[&ImageKind::Agent].staged.as_ref().unwrap().image,
            "agent:1.0.1"
        );
        assert_eq!(
            options[&ImageKind::Gui].current.as_ref().unwrap().image,
            "gui:2.0.0"
        );
    }

    #[test]
    fn clear_staged_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();
        t.stage(ImageKind::Agent, "agent:1.0.1", meta()).unwrap();
        t.clear_staged(Some(ImageKind::Agent)).unwrap();

        let options = t.rollback_options().unwrap();
        assert!(options[&ImageKind::Agent].staged.is_none());
        assert_eq!(
            options[&ImageKind::Agent].current.as_ref().unwrap().image,
            "agent:1.0.0"
        );
    }

    #[test]
    fn clear_staged_for_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.stage(ImageKind::Agent, "agent:1.0.1", meta()).unwrap();
        t.stage(ImageKind::Gui, "gui:2.0.1", meta()).unwrap();
        t.clear_staged(None).unwrap();

        let options = t.rollback_options().unwrap();
        assert!(options.values().all(|o| o.staged.is_none()));
    }

    #[test]
    fn history_labels_positions() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();
        t.record(ImageKind::Agent, "agent:1.0.1", meta()).unwrap();
        t.stage(ImageKind::Agent, "agent:1.0.2", meta()).unwrap();

        let without_staged = t.history(ImageKind::Agent, false).unwrap();
        let labels: Vec<_> = without_staged.iter().map(|h| h.position).collect();
        assert_eq!(labels, vec!["n", "n-1"]);

        let with_staged = t.history(ImageKind::Agent, true).unwrap();
        assert_eq!(with_staged[0].position, "n+1");
        assert_eq!(with_staged[0].status, "staged");
        assert_eq!(with_staged[0].version.image, "agent:1.0.2");
    }

    #[test]
    fn validate_rollback_warns_on_untracked_target() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();

        let targets = HashMap::from([("agent".to_string(), "agent:0.0.9".to_string())]);
        let validation = t.validate_rollback(&targets).unwrap();
        assert!(validation.valid);
        assert_eq!(validation.warnings.len(), 1);
        assert!(validation.warnings[0].contains("not in tracked history"));
        assert!(validation.errors.is_empty());
    }

    #[test]
    fn validate_rollback_accepts_tracked_target() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();
        t.record(ImageKind::Agent, "agent:1.0.1", meta()).unwrap();

        let targets = HashMap::from([("agent".to_string(), "agent:1.0.0".to_string())]);
        let validation = t.validate_rollback(&targets).unwrap();
        assert!(validation.valid);
        assert!(validation.warnings.is_empty());
    }

    #[test]
    fn validate_rollback_rejects_unknown_kind() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);

        let targets = HashMap::from([("database".to_string(), "db:1".to_string())]);
        let validation = t.validate_rollback(&targets).unwrap();
        assert!(!validation.valid);
        assert_eq!(validation.errors.len(), 1);
    }

    #[test]
    fn validate_rollback_warns_on_mixed_versions() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.record(ImageKind::Agent, "agent:1.0.0", meta()).unwrap();
        t.record(ImageKind::Gui, "gui:2.0.0", meta()).unwrap();

        let targets = HashMap::from([
            ("agent".to_string(), "agent:1.0.0".to_string()),
            ("gui".to_string(), "gui:2.0.0".to_string()),
        ]);
        let validation = t.validate_rollback(&targets).unwrap();
        assert!(validation.valid);
        assert!(validation
            .warnings
            .iter()
            .any(|w| w.contains("different versions")));
    }

    #[test]
    fn legacy_pluralized_agent_key_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version_state.json");
        std::fs::write(
            &path,
            r#"{
                "agents": {
                    "n": {"image": "agent:1.0.0", "deployed_at": "2025-01-01T00:00:00Z"}
                },
                "gui": {}
            }"#,
        )
        .unwrap();

        let t = VersionTracker::new(JsonDocument::new(path));
        assert_eq!(
            t.current(ImageKind::Agent).unwrap().unwrap().image,
            "agent:1.0.0"
        );
    }

    #[test]
    fn unknown_kinds_in_state_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version_state.json");
        std::fs::write(
            &path,
            r#"{
                "agent": {"n": {"image": "agent:1.0.0", "deployed_at": "2025-01-01T00:00:00Z"}},
                "database": {"n": {"image": "db:1", "deployed_at": "2025-01-01T00:00:00Z"}}
            }"#,
        )
        .unwrap();

        let t = VersionTracker::new(JsonDocument::new(path));
        assert_eq!(
            t.current(ImageKind::Agent).unwrap().unwrap().image,
            "agent:1.0.0"
        );
    }
}
