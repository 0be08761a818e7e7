//! Error taxonomy for the reconciliation core.
//!
//! Every variant is recoverable: callers log it and move on, and the next
//! scan cycle retries whatever state was left behind.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("JSON Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    /// File is still being written or temporarily locked.
    #[error("Transient I/O error on {path}: {reason}")]
    TransientIo { path: PathBuf, reason: String },

    /// Archive or descriptor could not be read even after retries.
    #[error("Corrupt artifact {path}: {reason}")]
    CorruptArtifact { path: PathBuf, reason: String },

    #[error("Dependency unsatisfied for '{name}': {chain}")]
    DependencyUnsatisfied { name: String, chain: String },

    #[error("Registration of '{name}' failed: {reason}")]
    Registration { name: String, reason: String },

    #[error("Store transaction failed for '{name}': {reason}")]
    StoreTransaction { name: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Refused: {0}")]
    Refused(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SyncError::CorruptArtifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transient(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SyncError::TransientIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn store(name: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::StoreTransaction {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a bounded immediate retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientIo { .. } | SyncError::CorruptArtifact { .. } | SyncError::Io(_)
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
