//! Contracts for the external services the engine drives
//!
//! Capture, pixel comparison and fix generation live outside the engine.
//! Every call goes through [`call`], which bounds it with a timeout and a
//! cancellation token and reports failures as `ExternalService`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use visfix_common::{ArtifactRef, Error, Result};

/// Output of a screenshot comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub diff_percentage: f64,
    pub diff_pixel_count: u64,
}

/// A (selector, property) pair in a stylesheet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StyleTarget {
    pub selector: String,
    pub property: String,
}

/// What a fix generator gets to look at
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixContext {
    pub record_id: String,
    pub page: String,
    pub diff_percentage: f64,
    pub threshold: f64,
    pub baseline_ref: ArtifactRef,
    pub current_ref: ArtifactRef,
    pub stylesheet: PathBuf,
    pub stylesheet_text: String,
    pub suspect: Option<StyleTarget>,
}

/// A proposed property change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixSuggestion {
    pub selector: String,
    pub property: String,
    pub suggested_value: String,
    #[serde(default)]
    pub rationale: String,
}

/// Takes a screenshot of a page
#[async_trait]
pub trait Capture: Send + Sync {
    /// With a `run_id` the screenshot lands under `runs/<run_id>/current/`,
    /// otherwise in the page's shared `current/` slot.
    async fn capture(&self, page: &str, run_id: Option<&str>) -> Result<ArtifactRef>;
}

/// Diffs two screenshots
#[async_trait]
pub trait Compare: Send + Sync {
    async fn compare(&self, baseline: &ArtifactRef, current: &ArtifactRef) -> Result<Comparison>;
}

/// Proposes a stylesheet fix for a regression
#[async_trait]
pub trait FixGenerator: Send + Sync {
    async fn generate_fix(&self, context: &FixContext) -> Result<FixSuggestion>;
}

/// Run a collaborator call bounded by `timeout` and `cancel`
pub async fn call<T, F>(service: &str, timeout: Duration, cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ (Error::Cancelled | Error::ExternalService { .. }))) => Err(e),
            Ok(Err(e)) => Err(Error::external(service, e)),
            Err(_) => {
                warn!("{} timed out after {:?}", service, timeout);
                Err(Error::external(service, format!("timed out after {:?}", timeout)))
            }
        }
    }
}
