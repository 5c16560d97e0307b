//! Post-patch verification

use crate::collaborators::{call, Capture, Compare, Comparison};
use crate::config::TimeoutConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use visfix_common::{ArtifactKey, ArtifactRef, ArtifactStore, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub page: String,
    pub diff_percentage: f64,
    pub threshold: f64,
    pub outcome: VerificationOutcome,
    pub current_ref: ArtifactRef,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.outcome == VerificationOutcome::Pass
    }

    pub fn to_error(&self) -> Error {
        Error::VerificationFailed {
            page: self.page.clone(),
            diff_percent: self.diff_percentage,
            threshold: self.threshold,
        }
    }
}

/// Re-captures a page and compares it against its baseline. Never touches
/// stylesheets or baselines.
#[derive(Clone)]
pub struct FixVerifier {
    capture: Arc<dyn Capture>,
    compare: Arc<dyn Compare>,
    artifacts: ArtifactStore,
    timeouts: TimeoutConfig,
}

impl FixVerifier {
    pub fn new(
        capture: Arc<dyn Capture>,
        compare: Arc<dyn Compare>,
        artifacts: ArtifactStore,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            capture,
            compare,
            artifacts,
            timeouts,
        }
    }

    /// Capture `page` (into `run_id`'s directory when given) and compare it
    /// against `baseline`
    pub async fn measure(
        &self,
        page: &str,
        baseline: &ArtifactRef,
        run_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(ArtifactRef, Comparison)> {
        if !self.artifacts.exists(baseline).await {
            return Err(Error::not_found(
                "baseline artifact",
                self.artifacts.path_of(baseline).display().to_string(),
            ));
        }

        let current = call("capture", self.timeouts.capture(), cancel, self.capture.capture(page, run_id)).await?;
        let comparison = call(
            "compare",
            self.timeouts.compare(),
            cancel,
            self.compare.compare(baseline, &current),
        )
        .await?;

        debug!(
            page,
            diff = comparison.diff_percentage,
            pixels = comparison.diff_pixel_count,
            "Compared {} against {}",
            current,
            baseline
        );
        Ok((current, comparison))
    }

    /// Verify against the page's stored baseline
    pub async fn verify(&self, page: &str, threshold: f64, cancel: &CancellationToken) -> Result<VerificationResult> {
        let baseline = self.artifacts.locate(&ArtifactKey::baseline(page)).await?;
        self.verify_against(page, &baseline, threshold, cancel).await
    }

    /// Verify against an explicit baseline reference. Every verification
    /// captures into a fresh run directory so it never replaces a screenshot
    /// a record was decided on.
    pub async fn verify_against(
        &self,
        page: &str,
        baseline: &ArtifactRef,
        threshold: f64,
        cancel: &CancellationToken,
    ) -> Result<VerificationResult> {
        let run_id = format!("verify-{}", uuid::Uuid::new_v4().simple());
        let (current_ref, comparison) = self.measure(page, baseline, Some(&run_id), cancel).await?;

        // NaN never passes
        let outcome = if comparison.diff_percentage <= threshold {
            VerificationOutcome::Pass
        } else {
            VerificationOutcome::Fail
        };

        let result = VerificationResult {
            page: page.to_string(),
            diff_percentage: comparison.diff_percentage,
            threshold,
            outcome,
            current_ref,
        };

        if result.passed() {
            info!("Verification passed for {}: {:.2}% <= {:.2}%", page, result.diff_percentage, threshold);
        } else {
            warn!("Verification failed for {}: {:.2}% > {:.2}%", page, result.diff_percentage, threshold);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use test_case::test_case;

    struct StaticCapture;

    #[async_trait]
    impl Capture for StaticCapture {
        async fn capture(&self, page: &str, run_id: Option<&str>) -> Result<ArtifactRef> {
            Ok(ArtifactRef::new(match run_id {
                Some(run) => format!("runs/{}/current/{}.png", run, page),
                None => format!("current/{}.png", page),
            }))
        }
    }

    struct FixedDiff(f64);

    #[async_trait]
    impl Compare for FixedDiff {
        async fn compare(&self, _baseline: &ArtifactRef, _current: &ArtifactRef) -> Result<Comparison> {
            Ok(Comparison {
                diff_percentage: self.0,
                diff_pixel_count: 0,
            })
        }
    }

    async fn verifier(tmp: &TempDir, diff: f64) -> FixVerifier {
        let artifacts = ArtifactStore::new(tmp.path()).await.unwrap();
        artifacts.put(&ArtifactKey::baseline("form"), b"png").await.unwrap();
        FixVerifier::new(
            Arc::new(StaticCapture),
            Arc::new(FixedDiff(diff)),
            artifacts,
            TimeoutConfig::default(),
        )
    }

    #[test_case(0.0, VerificationOutcome::Pass ; "identical")]
    #[test_case(0.5, VerificationOutcome::Pass ; "at threshold")]
    #[test_case(0.51, VerificationOutcome::Fail ; "above threshold")]
    #[test_case(f64::NAN, VerificationOutcome::Fail ; "nan")]
    #[tokio::test]
    async fn test_threshold(diff: f64, expected: VerificationOutcome) {
        let tmp = TempDir::new().unwrap();
        let v = verifier(&tmp, diff).await;
        let result = v.verify("form", 0.5, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.outcome, expected);
        let captured = result.current_ref.path().to_string_lossy().to_string();
        assert!(captured.starts_with("runs/verify-"), "{}", captured);
        assert!(captured.ends_with("/current/form.png"), "{}", captured);
    }

    #[tokio::test]
    async fn test_missing_baseline() {
        let tmp = TempDir::new().unwrap();
        let v = verifier(&tmp, 0.0).await;
        let err = v.verify("home", 0.5, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
