//! Storage for per-change-set gate records.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/gates/
//!   feature%2Fcross-repo.json   # one GateRecord per change set, URL-encoded name
//! ```
//!
//! Records are replaced atomically on every save, so an `invalidate` received
//! between runs survives a restart.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use super::atomic::write_atomic;
use crate::types::{ChangeSetId, GateRecord, gate::SCHEMA_VERSION};

/// Errors that can occur while loading or saving gate records.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistent home of gate records, keyed by change set.
pub trait GateStore: Send + Sync + 'static {
    /// Loads the record for `id`, or `None` if it was never saved.
    fn load(&self, id: &ChangeSetId) -> Result<Option<GateRecord>>;

    /// Replaces the stored record for `record.change_set`.
    fn save(&self, record: &GateRecord) -> Result<()>;
}

/// In-process store. Records live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryGateStore {
    records: Mutex<HashMap<ChangeSetId, GateRecord>>,
}

impl MemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GateStore for MemoryGateStore {
    fn load(&self, id: &ChangeSetId) -> Result<Option<GateRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(id).cloned())
    }

    fn save(&self, record: &GateRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(record.change_set.clone(), record.clone());
        Ok(())
    }
}

/// One JSON document per change set under `<state_dir>/gates/`.
#[derive(Debug, Clone)]
pub struct FileGateStore {
    dir: PathBuf,
}

impl FileGateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("gates"),
        }
    }

    /// Path of the record file for `id`.
    pub fn record_path(&self, id: &ChangeSetId) -> PathBuf {
        self.dir
            .join(format!("{}.json", urlencoding::encode(id.as_str())))
    }
}

impl GateStore for FileGateStore {
    fn load(&self, id: &ChangeSetId) -> Result<Option<GateRecord>> {
        let bytes = match std::fs::read(self.record_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: GateRecord = serde_json::from_slice(&bytes)?;
        if record.schema_version != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                got: record.schema_version,
            });
        }
        Ok(Some(record))
    }

    fn save(&self, record: &GateRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(&record.change_set), &bytes)?;
        Ok(())
    }
}
