//! Pre-mutation backups
//!
//! Each patch attempt gets a timestamped directory holding full copies of
//! every file it touches plus a `manifest.json`. A backup stays unreleased
//! for the whole attempt; only released backups are eligible for pruning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use visfix_common::{ArtifactStore, Error, Result};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    /// Absolute path of the file that was copied
    pub original: PathBuf,
    /// File name inside the backup directory
    pub stored: String,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<BackupEntry>,
    #[serde(default)]
    pub released: bool,
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
}

/// A backup directory and its manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub dir: PathBuf,
    pub manifest: BackupManifest,
}

impl Backup {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn is_released(&self) -> bool {
        self.manifest.released
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }
}

/// Backup pruning statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub total_backups: usize,
    pub deleted_backups: usize,
    pub deleted_bytes: u64,
}

/// Backup directory manager
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy every file into a fresh backup directory
    pub async fn snapshot<P: AsRef<Path>>(&self, files: &[P]) -> Result<Backup> {
        let id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.root.join(&id);
        fs::create_dir_all(&dir).await.map_err(|e| Error::io(&dir, e))?;

        let mut entries = Vec::with_capacity(files.len());
        for (i, file) in files.iter().enumerate() {
            let original = visfix_common::fs::identity(file);
            let data = visfix_common::fs::read(&original).await?;
            let name = original
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            let stored = format!("{:02}-{}", i, name);

            visfix_common::fs::write_atomic(dir.join(&stored), &data).await?;
            entries.push(BackupEntry {
                original,
                stored,
                digest: ArtifactStore::hash(&data),
                size: data.len() as u64,
            });
        }

        let backup = Backup {
            dir,
            manifest: BackupManifest {
                id,
                created_at: Utc::now(),
                entries,
                released: false,
                released_at: None,
            },
        };
        self.write_manifest(&backup).await?;

        debug!("Created backup {} ({} file(s))", backup.id(), backup.manifest.entries.len());
        Ok(backup)
    }

    /// Write every backed-up file back to its original location.
    /// The caller holds the file locks for the originals.
    pub async fn restore(&self, backup: &Backup) -> Result<()> {
        for entry in &backup.manifest.entries {
            let stored = backup.dir.join(&entry.stored);
            let data = visfix_common::fs::read(&stored).await?;

            let digest = ArtifactStore::hash(&data);
            if digest != entry.digest {
                return Err(Error::IntegrityError(format!(
                    "Backup copy {} digest mismatch: expected {}, got {}",
                    stored.display(),
                    entry.digest,
                    digest
                )));
            }

            visfix_common::fs::write_atomic(&entry.original, &data).await?;
            info!("Restored {} from backup {}", entry.original.display(), backup.id());
        }
        Ok(())
    }

    /// Mark a backup as no longer needed by its patch attempt
    pub async fn release(&self, backup: &mut Backup) -> Result<()> {
        if backup.manifest.released {
            return Ok(());
        }
        backup.manifest.released = true;
        backup.manifest.released_at = Some(Utc::now());
        self.write_manifest(backup).await?;
        debug!("Released backup {}", backup.id());
        Ok(())
    }

    pub async fn open(&self, id: &str) -> Result<Backup> {
        validate_id(id)?;
        let dir = self.root.join(id);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !fs::try_exists(&manifest_path).await.unwrap_or(false) {
            return Err(Error::not_found("backup", id));
        }
        let content = visfix_common::fs::read(&manifest_path).await?;
        let manifest: BackupManifest =
            serde_json::from_slice(&content).map_err(|e| Error::CorruptState {
                path: manifest_path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Backup { dir, manifest })
    }

    /// All readable backups, oldest first
    pub async fn list(&self) -> Result<Vec<Backup>> {
        let mut backups = Vec::new();
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(backups);
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::io(&self.root, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(&self.root, e))? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.open(&id).await {
                Ok(backup) => backups.push(backup),
                Err(e) => warn!("Skipping unreadable backup {}: {}", id, e),
            }
        }

        backups.sort_by(|a, b| {
            (a.manifest.created_at, &a.manifest.id).cmp(&(b.manifest.created_at, &b.manifest.id))
        });
        Ok(backups)
    }

    /// Delete released backups beyond the newest `keep`. Unreleased backups
    /// belong to an attempt still in progress and are never deleted.
    pub async fn prune(&self, keep: usize) -> Result<PruneStats> {
        let backups = self.list().await?;
        let mut stats = PruneStats {
            total_backups: backups.len(),
            ..Default::default()
        };

        let released: Vec<&Backup> = backups.iter().filter(|b| b.is_released()).collect();
        let excess = released.len().saturating_sub(keep);

        for backup in released.into_iter().take(excess) {
            let bytes: u64 = walkdir::WalkDir::new(&backup.dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum();

            match fs::remove_dir_all(&backup.dir).await {
                Ok(()) => {
                    stats.deleted_backups += 1;
                    stats.deleted_bytes += bytes;
                }
                Err(e) => warn!("Failed to delete backup {}: {}", backup.id(), e),
            }
        }

        info!(
            "Backup prune complete: deleted {}/{} backups ({} bytes freed)",
            stats.deleted_backups, stats.total_backups, stats.deleted_bytes
        );
        Ok(stats)
    }

    async fn write_manifest(&self, backup: &Backup) -> Result<()> {
        let json = serde_json::to_vec_pretty(&backup.manifest)?;
        visfix_common::fs::write_atomic(backup.manifest_path(), &json).await
    }
}

/// Backup ids name one directory directly under the backup root
fn validate_id(id: &str) -> Result<()> {
    let plain = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0'])
        && Path::new(id).components().count() == 1;
    if !plain {
        return Err(Error::InvalidInput(format!("invalid backup id: {:?}", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let tmp = TempDir::new().unwrap();
        let css = tmp.path().join("main.css");
        std::fs::write(&css, ".a { color: red; }").unwrap();

        let store = BackupStore::new(tmp.path().join("backups"));
        let backup = store.snapshot(&[&css]).await.unwrap();
        assert_eq!(backup.manifest.entries.len(), 1);
        assert!(!backup.is_released());

        std::fs::write(&css, ".a { color: blue; }").unwrap();
        store.restore(&backup).await.unwrap();
        assert_eq!(std::fs::read_to_string(&css).unwrap(), ".a { color: red; }");
    }

    #[tokio::test]
    async fn test_restore_rejects_tampered_copy() {
        let tmp = TempDir::new().unwrap();
        let css = tmp.path().join("main.css");
        std::fs::write(&css, "original").unwrap();

        let store = BackupStore::new(tmp.path().join("backups"));
        let backup = store.snapshot(&[&css]).await.unwrap();
        std::fs::write(backup.dir.join(&backup.manifest.entries[0].stored), "tampered").unwrap();

        let err = store.restore(&backup).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityError(_)));
    }

    #[tokio::test]
    async fn test_prune_keeps_unreleased() {
        let tmp = TempDir::new().unwrap();
        let css = tmp.path().join("main.css");
        std::fs::write(&css, "x").unwrap();
        let store = BackupStore::new(tmp.path().join("backups"));

        let mut first = store.snapshot(&[&css]).await.unwrap();
        let mut second = store.snapshot(&[&css]).await.unwrap();
        let in_progress = store.snapshot(&[&css]).await.unwrap();
        store.release(&mut first).await.unwrap();
        store.release(&mut second).await.unwrap();

        let stats = store.prune(1).await.unwrap();
        assert_eq!(stats.total_backups, 3);
        assert_eq!(stats.deleted_backups, 1);

        let remaining: Vec<String> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|b| b.id().to_string())
            .collect();
        assert!(!remaining.contains(&first.id().to_string()));
        assert!(remaining.contains(&second.id().to_string()));
        assert!(remaining.contains(&in_progress.id().to_string()));
    }

    #[test_case("../outside" ; "parent escape")]
    #[test_case("nested/dir" ; "separator")]
    #[test_case(".." ; "parent")]
    #[test_case("" ; "empty")]
    #[test_case("/etc" ; "absolute")]
    #[tokio::test]
    async fn test_open_rejects_path_ids(id: &str) {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("backups"));

        // A manifest outside the root must stay unreachable
        std::fs::create_dir_all(tmp.path().join("outside")).unwrap();
        std::fs::write(tmp.path().join("outside").join(MANIFEST_FILE), "{}").unwrap();

        let err = store.open(id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{:?}", err);
    }
}
