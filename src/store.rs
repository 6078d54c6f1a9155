//! Durable state file used for crash recovery.
//!
//! The tracker's whole state is one JSON document at
//! `{state_dir}/state.json`. Every save writes a temp file in the same
//! directory, fsyncs it, renames it over the old file and fsyncs the
//! directory, so a crash leaves either the previous or the new document,
//! never a torn one, and a save that returned survives power loss.
//!
//! Unlike a cache, an unreadable state file is an error: silently starting
//! empty would drop every plan that was in flight.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Handle to the state file inside a state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Reads the state document, or `None` if none was ever written.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let path = self.path();
        tracing::debug!("Loading state from: {}", path.display());

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("State file does not exist, starting fresh");
                return Ok(None);
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Atomically replaces the state document.
    pub fn save<T: Serialize>(&self, state: &T) -> Result<(), StoreError> {
        self.write(&serde_json::to_vec_pretty(state)?)
    }

    /// Atomically replaces the state document with already-encoded JSON.
    pub fn write(&self, contents: &[u8]) -> Result<(), StoreError> {
        let path = self.path();
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(contents).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        sync_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        tracing::trace!(bytes = contents.len(), "Saved state to {}", path.display());
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Flushes the directory entry so the rename itself is durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
