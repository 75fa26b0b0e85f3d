use clonewatch_core::types::Checkpoint;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CheckpointIOError {
    #[error("checkpoint io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint at {path} is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON file holding the last block handed off for processing.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable checkpoints start from block 0.
    pub fn load(&self) -> Checkpoint {
        match self.try_load() {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => Checkpoint::default(),
            Err(err) => {
                warn!(%err, "ignoring checkpoint");
                Checkpoint::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<Checkpoint>, CheckpointIOError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(&self.path, source)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| CheckpointIOError::Malformed {
                path: self.path.display().to_string(),
                source,
            })
    }

    /// Writes a sibling temp file and renames it over the target.
    pub fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointIOError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| self.io_error(parent, source))?;
            }
        }
        let encoded = serde_json::to_vec(&checkpoint).map_err(|source| {
            CheckpointIOError::Malformed {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        let tmp_path = self
            .path
            .with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&tmp_path, encoded).map_err(|source| self.io_error(&tmp_path, source))?;
        fs::rename(&tmp_path, &self.path).map_err(|source| self.io_error(&self.path, source))?;
        Ok(())
    }

    fn io_error(&self, path: &Path, source: io::Error) -> CheckpointIOError {
        CheckpointIOError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
