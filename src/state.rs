//! Durable state snapshots.
//!
//! Each snapshot is MessagePack written to a temporary file in the target
//! directory, fsynced, and renamed over the previous version, so readers
//! observe either the old or the new state and never a torn write.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Identifies one version of a snapshot on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    modified: SystemTime,
    len: u64,
}

/// A file holding one serialized value.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// Create a handle for the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the snapshot.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamp of the snapshot on disk, or `None` if it does not exist.
    #[must_use]
    pub fn stamp(&self) -> Option<Stamp> {
        let meta = std::fs::metadata(&self.path).ok()?;
        Some(Stamp {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }

    /// Load the snapshot, or `T::default()` if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be decoded.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        rmp_serde::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display())))
    }

    /// Atomically replace the snapshot with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if encoding fails, or an I/O error if the
    /// file cannot be written.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(value)
            .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display())))?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
