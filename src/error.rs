use std::path::PathBuf;
use thiserror::Error;

use crate::ant::{AntDeviceType, AntSlot};

/// ANT+ subsystem errors
#[derive(Error, Debug)]
pub enum AntError {
    #[error("device type {device_type:?} cannot serve slot {slot:?}")]
    Incompatible { slot: AntSlot, device_type: AntDeviceType },

    #[error("slot {0:?} is already bound; disconnect it first")]
    SlotBound(AntSlot),

    #[error("a search is already running for slot {0:?}")]
    SearchBusy(AntSlot),

    #[error("ANT+ is not in hardware mode")]
    NotAvailable,

    #[error("ANT+ node failed: {0}")]
    Node(String),

    #[error("settings could not be persisted: {0}")]
    Persist(#[from] ConfigError),
}

/// Configuration load/save errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Log store errors
#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("log store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("row serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("log store is corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("{format} export failed: {reason}")]
    Format { format: &'static str, reason: String },
}

/// Session logger errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] LogStoreError),

    #[error("export before reset failed: {0}")]
    Export(#[from] ExportError),

    #[error("resume failed: {0}")]
    Resume(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Requests made through a `RuntimeHandle`
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime has shut down")]
    Closed,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Ant(#[from] AntError),
}
