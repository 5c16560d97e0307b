//! Error types for visfix

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using visfix Error
pub type Result<T> = std::result::Result<T, Error>;

/// visfix error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Duplicate id: {kind} {id} already exists")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid state for {id}: expected {expected}, found {actual}")]
    InvalidState {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Verification failed for page {page}: {diff_percent:.2}% differs (threshold: {threshold:.2}%)")]
    VerificationFailed {
        page: String,
        diff_percent: f64,
        threshold: f64,
    },

    #[error("External service {service} failed: {reason}")]
    ExternalService { service: String, reason: String },

    #[error("Corrupt state in {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("Record {id} already has a pipeline run in flight")]
    InFlight { id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Integrity verification failed: {0}")]
    IntegrityError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn external(service: impl Into<String>, reason: impl ToString) -> Self {
        Error::ExternalService {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// IO failures worth a single retry
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Errors the orchestrator may escalate instead of aborting the run
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::VerificationFailed { .. }
                | Error::ExternalService { .. }
                | Error::InvalidInput(_)
        )
    }
}
