//! Atomic JSON document persistence.
//!
//! Every persisted state file (version window, registry metadata) is a single
//! JSON document replaced atomically: serialize, write to a sibling temp
//! file, rename over the target. A reader never observes a torn document.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DocumentStoreError {
    #[error("error creating directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("error reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("error writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("error renaming {path} into place: {source}")]
    Rename {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed document {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error serializing document {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One JSON document on disk, replaced atomically on every save.
pub struct JsonDocument {
    path: PathBuf,
}

impl JsonDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and deserializes the document. `Ok(None)` when the file does
    /// not exist yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, DocumentStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let value = serde_json::from_str(&raw).map_err(|source| {
                    DocumentStoreError::Malformed {
                        path: self.path.display().to_string(),
                        source,
                    }
                })?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(DocumentStoreError::Read {
                path: self.path.display().to_string(),
                source,
            }),
        }
    }

    /// Same as [`load`](Self::load) but returns the raw JSON value, for
    /// callers that need to migrate legacy layouts before typing the data.
    pub fn load_raw(&self) -> Result<Option<serde_json::Value>, DocumentStoreError> {
        self.load()
    }

    /// Serializes `value` and replaces the document atomically. The parent
    /// directory is created if missing. On Unix the file is created 0600;
    /// registry metadata holds encrypted credentials.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), DocumentStoreError> {
        let content = serde_json::to_string_pretty(value).map_err(|source| {
            DocumentStoreError::Serialize {
                path: self.path.display().to_string(),
                source,
            }
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| DocumentStoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        self.write_private(&tmp_path, &content)
            .map_err(|source| DocumentStoreError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;

        fs::rename(&tmp_path, &self.path).map_err(|source| DocumentStoreError::Rename {
            path: self.path.display().to_string(),
            source,
        })?;

        debug!(path = %self.path.display(), "document saved");
        Ok(())
    }

    fn write_private(&self, path: &Path, content: &str) -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);

        #[cfg(target_family = "unix")]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        counts: HashMap<String, u32>,
    }

    fn sample() -> Sample {
        Sample {
            name: "fleet".to_string(),
            counts: HashMap::from([("a".to_string(), 1), ("b".to_string(), 2)]),
        }
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let doc = JsonDocument::new(dir.path().join("absent.json"));
        assert!(doc.load::<Sample>().unwrap().is_none());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let doc = JsonDocument::new(dir.path().join("state.json"));
        doc.save(&sample()).unwrap();
        assert_eq!(doc.load::<Sample>().unwrap(), Some(sample()));
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let doc = JsonDocument::new(dir.path().join("nested/deeper/state.json"));
        doc.save(&sample()).unwrap();
        assert!(doc.path().exists());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let doc = JsonDocument::new(dir.path().join("state.json"));
        doc.save(&sample()).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["state.json"]);
    }

    #[test]
    fn stale_temp_file_does_not_corrupt_load() {
        // Simulates a crash between the temp write and the rename: the
        // target keeps its previous content.
        let dir = tempfile::tempdir().unwrap();
        let doc = JsonDocument::new(dir.path().join("state.json"));
        doc.save(&sample()).unwrap();
        fs::write(dir.path().join("state.tmp"), "{ partial garbage").unwrap();
        assert_eq!(doc.load::<Sample>().unwrap(), Some(sample()));
    }

    #[test]
    fn malformed_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json at all").unwrap();
        let doc = JsonDocument::new(path);
        assert!(matches!(
            doc.load::<Sample>(),
            Err(DocumentStoreError::Malformed { .. })
        ));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let doc = JsonDocument::new(dir.path().join("state.json"));
        doc.save(&sample()).unwrap();
        let mode = fs::metadata(doc.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
