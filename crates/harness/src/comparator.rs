//! Pixel comparison of screenshots

use crate::error::{HarnessError, HarnessResult};
use async_trait::async_trait;
use image::{DynamicImage, ImageOutputFormat, Pixel, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use visfix_common::{ArtifactKey, ArtifactKind, ArtifactRef, ArtifactStore};
use visfix_engine::{Compare, Comparison};

/// Result of a visual comparison
#[derive(Debug, Clone)]
pub struct VisualDiff {
    /// Percentage of pixels that differ
    pub diff_percent: f64,

    /// Number of different pixels
    pub diff_pixels: u64,

    /// Pixels in the larger of the two images
    pub total_pixels: u64,

    /// Diff image, when one was written
    pub diff_image: Option<ArtifactRef>,

    pub current_hash: String,
    pub baseline_hash: String,
}

/// Compares screenshots pixel by pixel
#[derive(Debug, Clone)]
pub struct PixelComparator {
    artifacts: ArtifactStore,
    /// Allowed per-channel difference (anti-aliasing, compression)
    tolerance: u8,
    save_diffs: bool,
}

impl PixelComparator {
    pub fn new(artifacts: ArtifactStore, tolerance: u8) -> Self {
        Self {
            artifacts,
            tolerance,
            save_diffs: true,
        }
    }

    pub fn with_diffs(mut self, save_diffs: bool) -> Self {
        self.save_diffs = save_diffs;
        self
    }

    /// Compare two screenshot files
    pub async fn compare_files(&self, baseline: &Path, current: &Path) -> HarnessResult<VisualDiff> {
        for path in [baseline, current] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(HarnessError::ScreenshotNotFound(path.display().to_string()));
            }
        }

        let baseline_hash = ArtifactStore::hash_file(baseline).await?;
        let current_hash = ArtifactStore::hash_file(current).await?;

        if baseline_hash == current_hash {
            debug!("Screenshots match exactly (same hash)");
            return Ok(VisualDiff {
                diff_percent: 0.0,
                diff_pixels: 0,
                total_pixels: 0,
                diff_image: None,
                current_hash,
                baseline_hash,
            });
        }

        let tolerance = self.tolerance;
        let (baseline_path, current_path) = (baseline.to_path_buf(), current.to_path_buf());
        let (diff_pixels, total_pixels, diff_img) = tokio::task::spawn_blocking(move || {
            let baseline_img = image::open(&baseline_path)?.to_rgba8();
            let current_img = image::open(&current_path)?.to_rgba8();
            Ok::<_, HarnessError>(diff_images(&baseline_img, &current_img, tolerance))
        })
        .await??;

        let diff_percent = if total_pixels == 0 {
            0.0
        } else {
            (diff_pixels as f64 / total_pixels as f64) * 100.0
        };

        let diff_image = if diff_pixels > 0 && self.save_diffs {
            Some(self.save_diff(current, diff_img).await?)
        } else {
            None
        };

        Ok(VisualDiff {
            diff_percent,
            diff_pixels,
            total_pixels,
            diff_image,
            current_hash,
            baseline_hash,
        })
    }

    async fn save_diff(&self, current: &Path, diff_img: RgbaImage) -> HarnessResult<ArtifactRef> {
        let name = current
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "screenshot".to_string());

        let png = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            DynamicImage::ImageRgba8(diff_img).write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)?;
            Ok::<_, HarnessError>(buf)
        })
        .await??;

        let mut key = ArtifactKey::new(ArtifactKind::Diff, name);
        if let Some(run) = self.run_of(current) {
            key = key.with_run(run);
        }
        let (artifact, _) = self.artifacts.put(&key, &png).await?;
        Ok(artifact)
    }

    /// Run id of a screenshot stored under `runs/<run>/`
    fn run_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.artifacts.root()).ok()?;
        let mut parts = rel.components();
        match (parts.next(), parts.next()) {
            (Some(first), Some(run)) if first.as_os_str() == "runs" => {
                Some(run.as_os_str().to_string_lossy().to_string())
            }
            _ => None,
        }
    }

    fn path_of(&self, artifact: &ArtifactRef) -> PathBuf {
        self.artifacts.path_of(artifact)
    }
}

#[async_trait]
impl Compare for PixelComparator {
    async fn compare(&self, baseline: &ArtifactRef, current: &ArtifactRef) -> visfix_common::Result<Comparison> {
        let diff = self
            .compare_files(&self.path_of(baseline), &self.path_of(current))
            .await
            .map_err(|e| e.into_engine("compare"))?;

        if diff.diff_pixels > 0 {
            warn!(
                "{}: {:.2}% pixels differ ({} of {})",
                current, diff.diff_percent, diff.diff_pixels, diff.total_pixels
            );
        }
        Ok(Comparison {
            diff_percentage: diff.diff_percent,
            diff_pixel_count: diff.diff_pixels,
        })
    }
}

/// Count differing pixels and render a diff image. Pixels outside the
/// overlap of differently sized images count as differing.
pub fn diff_images(baseline: &RgbaImage, current: &RgbaImage, tolerance: u8) -> (u64, u64, RgbaImage) {
    let width = baseline.width().max(current.width());
    let height = baseline.height().max(current.height());
    if baseline.dimensions() != current.dimensions() {
        warn!(
            "Screenshot dimensions differ: current {:?} vs baseline {:?}",
            current.dimensions(),
            baseline.dimensions()
        );
    }

    let mut diff_img = RgbaImage::new(width, height);
    let mut diff_pixels = 0u64;
    let total_pixels = (width as u64) * (height as u64);

    for y in 0..height {
        for x in 0..width {
            let differs = match (
                current.get_pixel_checked(x, y),
                baseline.get_pixel_checked(x, y),
            ) {
                (Some(a), Some(b)) => pixels_differ(a, b, tolerance),
                _ => true,
            };

            if differs {
                diff_pixels += 1;
                // Mark diff pixels in red
                diff_img.put_pixel(x, y, image::Rgba([255, 0, 0, 255]));
            } else if let Some(pixel) = current.get_pixel_checked(x, y) {
                // Keep original but dim it
                let channels = pixel.channels();
                diff_img.put_pixel(
                    x,
                    y,
                    image::Rgba([channels[0] / 2, channels[1] / 2, channels[2] / 2, 128]),
                );
            }
        }
    }

    (diff_pixels, total_pixels, diff_img)
}

fn pixels_differ(a: &image::Rgba<u8>, b: &image::Rgba<u8>, tolerance: u8) -> bool {
    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(x, y)| x.abs_diff(*y) > tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba(rgba))
    }

    #[test_case([10, 10, 10, 255], 0 ; "identical")]
    #[test_case([14, 12, 10, 255], 0 ; "within tolerance")]
    #[test_case([16, 10, 10, 255], 4 ; "beyond tolerance")]
    fn test_diff_images_tolerance(other: [u8; 4], expected: u64) {
        let a = solid(2, 2, [10, 10, 10, 255]);
        let b = solid(2, 2, other);
        let (diff, total, _) = diff_images(&a, &b, 5);
        assert_eq!(diff, expected);
        assert_eq!(total, 4);
    }

    #[test]
    fn test_size_mismatch_counts_as_diff() {
        let a = solid(2, 2, [0, 0, 0, 255]);
        let b = solid(2, 1, [0, 0, 0, 255]);
        let (diff, total, img) = diff_images(&a, &b, 5);
        assert_eq!((diff, total), (2, 4));
        assert_eq!(img.get_pixel(0, 1), &image::Rgba([255, 0, 0, 255]));
    }

    #[tokio::test]
    async fn test_compare_trait_writes_diff() {
        let tmp = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(tmp.path()).await.unwrap();

        let baseline_path = tmp.path().join("baseline").join("form.png");
        let current_path = tmp.path().join("current").join("form.png");
        solid(4, 1, [255, 255, 255, 255]).save(&baseline_path).unwrap();
        let mut current = solid(4, 1, [255, 255, 255, 255]);
        current.put_pixel(0, 0, image::Rgba([0, 0, 0, 255]));
        current.save(&current_path).unwrap();

        let comparator = PixelComparator::new(artifacts.clone(), 5);
        let baseline = artifacts.resolve(&ArtifactKey::baseline("form")).unwrap();
        let current_ref = artifacts.resolve(&ArtifactKey::current("form")).unwrap();

        let comparison = comparator.compare(&baseline, &current_ref).await.unwrap();
        assert_eq!(comparison.diff_pixel_count, 1);
        assert!((comparison.diff_percentage - 25.0).abs() < f64::EPSILON);
        assert!(tmp.path().join("diff").join("form.png").exists());
    }

    #[tokio::test]
    async fn test_run_capture_diff_stays_in_run() {
        let tmp = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(tmp.path()).await.unwrap();
        let baseline = artifacts.resolve(&ArtifactKey::baseline("form")).unwrap();
        let current = artifacts
            .resolve(&ArtifactKey::current("form").with_run("verify-1"))
            .unwrap();
        std::fs::create_dir_all(artifacts.path_of(&current).parent().unwrap()).unwrap();
        solid(2, 1, [255, 255, 255, 255]).save(artifacts.path_of(&baseline)).unwrap();
        solid(2, 1, [0, 0, 0, 255]).save(artifacts.path_of(&current)).unwrap();

        let comparator = PixelComparator::new(artifacts.clone(), 5);
        let comparison = comparator.compare(&baseline, &current).await.unwrap();
        assert_eq!(comparison.diff_pixel_count, 2);
        assert!(tmp.path().join("runs/verify-1/diff/form.png").exists());
        assert!(!tmp.path().join("diff").join("form.png").exists());
    }

    #[tokio::test]
    async fn test_missing_screenshot() {
        let tmp = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(tmp.path()).await.unwrap();
        let comparator = PixelComparator::new(artifacts.clone(), 5);

        let baseline = artifacts.resolve(&ArtifactKey::baseline("home")).unwrap();
        let current = artifacts.resolve(&ArtifactKey::current("home")).unwrap();
        let err = comparator.compare(&baseline, &current).await.unwrap_err();
        assert!(matches!(err, visfix_common::Error::NotFound { .. }));
    }
}
