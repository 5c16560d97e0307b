//! Screenshot artifact store
//!
//! Artifacts are addressed by (kind, page name, run id) and map to exactly one
//! path under the store root:
//! - `baseline/<name>.png`, `current/<name>.png`, `diff/<name>.png`
//! - `runs/<run>/<kind>/<name>.png` when a run id is set
//!
//! Lookups never search the filesystem. A missing artifact is a `NotFound`
//! error at the point it is requested.

use crate::types::{ArtifactKey, ArtifactKind, ArtifactRef};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

const ARTIFACT_EXT: &str = "png";

/// Store for baseline, current and diff screenshots
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open the store at `root`, creating the kind directories
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        for kind in [ArtifactKind::Baseline, ArtifactKind::Current, ArtifactKind::Diff] {
            let dir = root.join(kind.as_str());
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::io(&dir, e))?;
        }

        info!("Initialized artifact store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute SHA-256 hash of data
    pub fn hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Compute SHA-256 hash of a file
    pub async fn hash_file(path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let mut file = fs::File::open(path).await.map_err(|e| Error::io(path, e))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buffer).await.map_err(|e| Error::io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// The reference an artifact key maps to, relative to the store root
    pub fn resolve(&self, key: &ArtifactKey) -> Result<ArtifactRef> {
        let file = format!("{}.{}", sanitize_name(&key.name)?, ARTIFACT_EXT);
        let rel = match &key.run_id {
            Some(run) => PathBuf::from("runs")
                .join(sanitize_name(run)?)
                .join(key.kind.as_str())
                .join(file),
            None => PathBuf::from(key.kind.as_str()).join(file),
        };
        Ok(ArtifactRef::new(rel))
    }

    /// Filesystem path of a reference. Relative references are rooted at the store.
    pub fn path_of(&self, artifact: &ArtifactRef) -> PathBuf {
        if artifact.path().is_absolute() {
            artifact.path().to_path_buf()
        } else {
            self.root.join(artifact.path())
        }
    }

    pub async fn exists(&self, artifact: &ArtifactRef) -> bool {
        fs::try_exists(self.path_of(artifact)).await.unwrap_or(false)
    }

    /// Resolve a key and require the artifact to exist
    pub async fn locate(&self, key: &ArtifactKey) -> Result<ArtifactRef> {
        let artifact = self.resolve(key)?;
        if !self.exists(&artifact).await {
            return Err(Error::not_found(
                format!("{} artifact", key.kind),
                self.path_of(&artifact).display().to_string(),
            ));
        }
        Ok(artifact)
    }

    /// Store artifact bytes under a key, returning the reference and digest
    pub async fn put(&self, key: &ArtifactKey, data: &[u8]) -> Result<(ArtifactRef, String)> {
        let artifact = self.resolve(key)?;
        let path = self.path_of(&artifact);
        crate::fs::write_atomic(&path, data).await?;

        let digest = Self::hash(data);
        debug!("Stored artifact {} ({} bytes, digest: {})", artifact, data.len(), digest);
        Ok((artifact, digest))
    }

    /// Read artifact bytes
    pub async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let path = self.path_of(artifact);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::not_found("artifact", path.display().to_string()));
        }
        crate::fs::read(&path).await
    }

    /// Copy an existing artifact to the location of `key`
    pub async fn copy_to(&self, artifact: &ArtifactRef, key: &ArtifactKey) -> Result<ArtifactRef> {
        let target = self.resolve(key)?;
        let (src, dst) = (self.path_of(artifact), self.path_of(&target));
        if src != dst {
            crate::fs::copy_atomic(&src, &dst).await?;
            debug!("Copied artifact {} to {}", artifact, target);
        }
        Ok(target)
    }

    /// Copy `current` over `baseline` atomically and verify the copy.
    /// Returns the digest of the new baseline.
    pub async fn promote(&self, current: &ArtifactRef, baseline: &ArtifactRef) -> Result<String> {
        let src = self.path_of(current);
        let dst = self.path_of(baseline);

        let expected = Self::hash_file(&src).await.map_err(|e| match e {
            Error::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                Error::not_found("current artifact", src.display().to_string())
            }
            other => other,
        })?;
        crate::fs::copy_atomic(&src, &dst).await?;

        let actual = Self::hash_file(&dst).await?;
        if actual != expected {
            return Err(Error::IntegrityError(format!(
                "Baseline {} digest mismatch: expected {}, got {}",
                dst.display(),
                expected,
                actual
            )));
        }

        info!("Promoted {} to baseline {}", current, baseline);
        Ok(actual)
    }

    /// Names of all artifacts of a kind (outside runs)
    pub async fn list(&self, kind: ArtifactKind) -> Result<Vec<String>> {
        let dir = self.root.join(kind.as_str());
        let mut names = Vec::new();

        if fs::try_exists(&dir).await.unwrap_or(false) {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| Error::io(&dir, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(&dir, e))? {
                let path = entry.path();
                if path.extension().map(|e| e == ARTIFACT_EXT).unwrap_or(false) {
                    if let Some(stem) = path.file_stem() {
                        names.push(stem.to_string_lossy().to_string());
                    }
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Page and run names become single path components
fn sanitize_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(Error::InvalidInput(format!("invalid artifact name: {:?}", name)));
    }

    Ok(trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path()).await.unwrap();

        let a = store.resolve(&ArtifactKey::baseline("form")).unwrap();
        assert_eq!(a.path(), Path::new("baseline/form.png"));

        let b = store
            .resolve(&ArtifactKey::current("checkout/step 1").with_run("run-7"))
            .unwrap();
        assert_eq!(b.path(), Path::new("runs/run-7/current/checkout_step_1.png"));

        assert!(store.resolve(&ArtifactKey::current("..")).is_err());
    }

    #[tokio::test]
    async fn test_locate_missing_is_hard_error() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path()).await.unwrap();

        let err = store.locate(&ArtifactKey::current("home")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_put_and_promote() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path()).await.unwrap();

        let (baseline, _) = store.put(&ArtifactKey::baseline("form"), b"old").await.unwrap();
        let (current, digest) = store.put(&ArtifactKey::current("form"), b"new").await.unwrap();

        let promoted = store.promote(&current, &baseline).await.unwrap();
        assert_eq!(promoted, digest);
        assert_eq!(store.get(&baseline).await.unwrap(), b"new");
        assert_eq!(store.list(ArtifactKind::Baseline).await.unwrap(), vec!["form"]);
    }

    #[tokio::test]
    async fn test_copy_to_run_is_independent_of_shared_slot() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path()).await.unwrap();

        let (shared, _) = store.put(&ArtifactKey::current("form"), b"first").await.unwrap();
        let pinned = store
            .copy_to(&shared, &ArtifactKey::current("form").with_run("c1"))
            .await
            .unwrap();
        assert_eq!(pinned.path(), Path::new("runs/c1/current/form.png"));

        store.put(&ArtifactKey::current("form"), b"second").await.unwrap();
        assert_eq!(store.get(&pinned).await.unwrap(), b"first");

        let missing = store.resolve(&ArtifactKey::current("home")).unwrap();
        let err = store
            .copy_to(&missing, &ArtifactKey::current("home").with_run("c2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_promote_missing_current() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path()).await.unwrap();

        let baseline = store.resolve(&ArtifactKey::baseline("form")).unwrap();
        let current = store.resolve(&ArtifactKey::current("form")).unwrap();
        let err = store.promote(&current, &baseline).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
