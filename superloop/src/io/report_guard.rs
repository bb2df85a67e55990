//! Snapshot and restore of a role's canonical report file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::io::fsutil::write_atomic;

/// Contents of a report before a role ran; `None` when it did not exist.
#[derive(Debug, Clone)]
pub struct ReportSnapshot {
    path: PathBuf,
    contents: Option<Vec<u8>>,
}

impl ReportSnapshot {
    pub fn capture(path: &Path) -> Result<Self> {
        let contents = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        debug!(path = %path.display(), existed = contents.is_some(), "report captured");
        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Put the report back as captured. Returns whether anything changed.
    pub fn restore(&self) -> Result<bool> {
        let current = match fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        if current == self.contents {
            return Ok(false);
        }
        warn!(path = %self.path.display(), "restoring report after interrupted role");
        match &self.contents {
            Some(bytes) => write_atomic(&self.path, bytes)?,
            None => fs::remove_file(&self.path)
                .with_context(|| format!("remove {}", self.path.display()))?,
        }
        Ok(true)
    }
}
