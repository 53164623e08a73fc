use thiserror::Error;

use crate::models::RunStatus;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Unsupported database type: {0}")]
    UnsupportedEngine(String),

    #[error("No enabled backup destinations configured for database {0}")]
    NoDestinations(i64),

    #[error("Invalid trigger expression '{expression}': {reason}")]
    InvalidTrigger { expression: String, reason: String },

    #[error("Dump failed: {0}")]
    DumpFailed(String),

    #[error("Backup timed out after {0} seconds")]
    DumpTimeout(u64),

    #[error("Destination {path}: {reason}")]
    Destination { path: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Task execution error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Generic error: {0}")]
    Generic(String),
}

impl AppError {
    pub fn dump(msg: impl Into<String>) -> Self {
        Self::DumpFailed(msg.into())
    }

    pub fn destination(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Destination {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Input/config errors are fatal for the single operation and never retried.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnsupportedEngine(_)
                | Self::NoDestinations(_)
                | Self::InvalidTrigger { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
