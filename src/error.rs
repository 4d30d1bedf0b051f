//! Error types for the table mirror.

use crate::types::RowId;
use thiserror::Error;

/// Main error type for mirror operations.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already registered: {0}")]
    TableAlreadyRegistered(String),

    #[error("Model mismatch for table {table}: expected {expected}, got {got}")]
    ModelMismatch {
        table: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("Change tracking backend error: {0}")]
    Backend(String),

    #[error("Failed to fetch row {row_id} from {table}: {reason}")]
    Fetch {
        table: String,
        row_id: RowId,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checkpoint is locked by another process")]
    Locked,

    #[error("Mirror is already listening")]
    AlreadyRunning,

    #[error("Apply target has shut down")]
    Shutdown,
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        MirrorError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for MirrorError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MirrorError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MirrorError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MirrorError::Deserialization(e.to_string())
    }
}

/// Result type for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;
