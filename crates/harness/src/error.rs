//! Error types for the collaborator adapters

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("No {0} command configured")]
    NotConfigured(&'static str),

    #[error("Command {program} failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Command {program} did not write {}", path.display())]
    MissingOutput { program: String, path: PathBuf },

    #[error("Invalid fix suggestion: {0}")]
    InvalidSuggestion(String),

    #[error("Screenshot not found: {0}")]
    ScreenshotNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Common(#[from] visfix_common::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// Convert for the engine, attributing failures to `service`
    pub fn into_engine(self, service: &str) -> visfix_common::Error {
        match self {
            HarnessError::Common(inner) => inner,
            HarnessError::ScreenshotNotFound(path) => visfix_common::Error::not_found("screenshot", path),
            other => visfix_common::Error::external(service, other),
        }
    }
}

impl From<HarnessError> for visfix_common::Error {
    fn from(e: HarnessError) -> Self {
        e.into_engine("harness")
    }
}
