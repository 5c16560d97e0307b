//! Stylesheet patching
//!
//! A patch replaces one declaration value. The file is locked from read to
//! write, backed up before it is touched, and replaced atomically, so it is
//! either fully patched or byte-identical to the original.

use crate::backup::{Backup, BackupStore};
use crate::locator::{PropertyLocation, Stylesheet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use visfix_common::{Error, FileGuard, FileLocks, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied,
    /// Rollback could not restore the file; the backup is kept
    Failed,
    RolledBack,
}

impl std::fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchOutcome::Applied => write!(f, "applied"),
            PatchOutcome::Failed => write!(f, "failed"),
            PatchOutcome::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// One attempted property change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub id: String,
    pub target: PropertyLocation,
    pub old_value: String,
    pub new_value: String,
    pub backup: Backup,
    pub outcome: PatchOutcome,
}

impl PatchOperation {
    pub fn file(&self) -> &Path {
        &self.target.rule.file
    }

    pub fn line(&self) -> usize {
        self.target.line
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup.dir
    }
}

/// Applies and rolls back property patches
#[derive(Debug, Clone)]
pub struct PatchApplier {
    backups: BackupStore,
    locks: FileLocks,
}

impl PatchApplier {
    pub fn new(backups: BackupStore, locks: FileLocks) -> Self {
        Self { backups, locks }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Take the exclusive lock on `file` for a multi-step attempt. While it
    /// is held, use the `*_locked` methods; the plain ones would wait on it.
    pub async fn lock(&self, file: impl AsRef<Path>) -> Result<FileGuard> {
        self.locks.lock(file).await
    }

    /// Set `property` in the rule for `selector` to `new_value`
    pub async fn update_property(
        &self,
        file: impl AsRef<Path>,
        selector: &str,
        property: &str,
        new_value: &str,
    ) -> Result<PatchOperation> {
        let file = file.as_ref();
        validate_value(new_value)?;
        let guard = self.locks.lock(file).await?;
        self.apply_locked(&guard, file, selector, property, new_value).await
    }

    /// `update_property` for a caller already holding the lock on `file`
    pub async fn apply_locked(
        &self,
        guard: &FileGuard,
        file: impl AsRef<Path>,
        selector: &str,
        property: &str,
        new_value: &str,
    ) -> Result<PatchOperation> {
        let file = file.as_ref();
        check_guard(guard, file)?;
        let new_value = validate_value(new_value)?;

        let sheet = Stylesheet::load(file).await?;
        let target = sheet.locate(selector, property)?;

        let mut backup = self.backups.snapshot(&[file]).await?;
        let patched = sheet.with_value(&target, new_value);

        if let Err(e) = visfix_common::fs::write_atomic(file, patched.as_bytes()).await {
            error!("Failed to write patch to {}: {}", file.display(), e);
            // Nothing was written; the attempt is over
            if let Err(release_err) = self.backups.release(&mut backup).await {
                warn!("Failed to release backup {}: {}", backup.id(), release_err);
            }
            return Err(e);
        }

        info!(
            file = %file.display(),
            line = target.line,
            selector,
            property,
            "Patched {} -> {}",
            target.value,
            new_value
        );

        Ok(PatchOperation {
            id: uuid::Uuid::new_v4().to_string(),
            old_value: target.value.clone(),
            new_value: new_value.to_string(),
            target,
            backup,
            outcome: PatchOutcome::Applied,
        })
    }

    /// Restore the patched file from its backup
    pub async fn rollback(&self, op: &mut PatchOperation) -> Result<()> {
        let guard = self.locks.lock(op.file()).await?;
        self.rollback_locked(&guard, op).await
    }

    /// `rollback` for a caller already holding the lock on the patched file
    pub async fn rollback_locked(&self, guard: &FileGuard, op: &mut PatchOperation) -> Result<()> {
        let file: PathBuf = op.file().to_path_buf();
        check_guard(guard, &file)?;

        if let Err(e) = self.backups.restore(&op.backup).await {
            op.outcome = PatchOutcome::Failed;
            error!(
                "Rollback of {} failed, backup kept at {}: {}",
                file.display(),
                op.backup_path().display(),
                e
            );
            return Err(e);
        }

        op.outcome = PatchOutcome::RolledBack;
        self.backups.release(&mut op.backup).await?;
        info!("Rolled back {}:{} to {}", file.display(), op.line(), op.old_value);
        Ok(())
    }

    /// The patch was accepted; its backup is no longer needed by the attempt
    pub async fn release(&self, op: &mut PatchOperation) -> Result<()> {
        self.backups.release(&mut op.backup).await
    }

    /// Restore every file of a stored backup by id
    pub async fn restore_backup(&self, id: &str) -> Result<Backup> {
        let mut backup = self.backups.open(id).await?;
        let originals: Vec<PathBuf> = backup
            .manifest
            .entries
            .iter()
            .map(|e| e.original.clone())
            .collect();

        let _guards = self.locks.lock_all(&originals).await?;
        self.backups.restore(&backup).await?;
        self.backups.release(&mut backup).await?;
        info!("Restored backup {} ({} file(s))", id, originals.len());
        Ok(backup)
    }
}

fn check_guard(guard: &FileGuard, file: &Path) -> Result<()> {
    let identity = visfix_common::fs::identity(file);
    if guard.path() != identity {
        return Err(Error::InvalidInput(format!(
            "lock held on {}, not {}",
            guard.path().display(),
            identity.display()
        )));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<&str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidInput("empty property value".to_string()));
    }
    if value.contains([';', '{', '}', '\n', '\r']) {
        return Err(Error::InvalidInput(format!(
            "property value {:?} would change the stylesheet structure",
            value
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CSS: &str = ".btn-primary {\n    background-color: #3498db;\n}\n";

    fn setup() -> (TempDir, PathBuf, PatchApplier) {
        let tmp = TempDir::new().unwrap();
        let css = tmp.path().join("main.css");
        std::fs::write(&css, CSS).unwrap();
        let applier = PatchApplier::new(BackupStore::new(tmp.path().join("backups")), FileLocks::new());
        (tmp, css, applier)
    }

    #[tokio::test]
    async fn test_update_property_exact_line() {
        let (_tmp, css, applier) = setup();

        let op = applier
            .update_property(&css, ".btn-primary", "background-color", "#2ecc71")
            .await
            .unwrap();

        let content = std::fs::read_to_string(&css).unwrap();
        assert_eq!(content.lines().nth(1).unwrap(), "    background-color: #2ecc71;");
        assert_eq!(op.old_value, "#3498db");
        assert_eq!(op.new_value, "#2ecc71");
        assert_eq!(op.line(), 2);
        assert_eq!(op.outcome, PatchOutcome::Applied);

        let backed_up = std::fs::read_to_string(op.backup_path().join(&op.backup.manifest.entries[0].stored)).unwrap();
        assert_eq!(backed_up, CSS);
    }

    #[tokio::test]
    async fn test_missing_selector_leaves_file_untouched() {
        let (tmp, css, applier) = setup();

        let err = applier
            .update_property(&css, ".nope", "color", "red")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(std::fs::read_to_string(&css).unwrap(), CSS);
        assert!(!tmp.path().join("backups").exists());
    }

    #[tokio::test]
    async fn test_structural_value_rejected() {
        let (_tmp, css, applier) = setup();

        let err = applier
            .update_property(&css, ".btn-primary", "background-color", "red; display: none")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(std::fs::read_to_string(&css).unwrap(), CSS);
    }

    #[tokio::test]
    async fn test_rollback_restores_bytes() {
        let (_tmp, css, applier) = setup();

        let mut op = applier
            .update_property(&css, ".btn-primary", "background-color", "#2ecc71")
            .await
            .unwrap();
        applier.rollback(&mut op).await.unwrap();

        assert_eq!(std::fs::read(&css).unwrap(), CSS.as_bytes());
        assert_eq!(op.outcome, PatchOutcome::RolledBack);
        assert!(op.backup.is_released());
    }

    #[tokio::test]
    async fn test_restore_backup_by_id() {
        let (_tmp, css, applier) = setup();

        let op = applier
            .update_property(&css, ".btn-primary", "background-color", "#2ecc71")
            .await
            .unwrap();
        let restored = applier.restore_backup(op.backup.id()).await.unwrap();

        assert!(restored.is_released());
        assert_eq!(std::fs::read_to_string(&css).unwrap(), CSS);
        assert!(matches!(
            applier.restore_backup("missing").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_held_lock_serializes_attempts() {
        let (_tmp, css, applier) = setup();

        let guard = applier.lock(&css).await.unwrap();
        let mut op = applier
            .apply_locked(&guard, &css, ".btn-primary", "background-color", "#2ecc71")
            .await
            .unwrap();

        let competing = {
            let applier = applier.clone();
            let css = css.clone();
            tokio::spawn(async move {
                applier
                    .update_property(&css, ".btn-primary", "background-color", "#e74c3c")
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!competing.is_finished());

        applier.rollback_locked(&guard, &mut op).await.unwrap();
        assert_eq!(std::fs::read(&css).unwrap(), CSS.as_bytes());
        drop(guard);

        // The second attempt starts from the restored file
        let other = competing.await.unwrap().unwrap();
        assert_eq!(other.old_value, "#3498db");
        assert_eq!(other.new_value, "#e74c3c");
    }

    #[tokio::test]
    async fn test_guard_for_other_file_rejected() {
        let (tmp, css, applier) = setup();

        let guard = applier.lock(tmp.path().join("other.css")).await.unwrap();
        let err = applier
            .apply_locked(&guard, &css, ".btn-primary", "background-color", "#2ecc71")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(std::fs::read_to_string(&css).unwrap(), CSS);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_patch_and_rollback_keep_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (_tmp, css, applier) = setup();
        std::fs::set_permissions(&css, std::fs::Permissions::from_mode(0o640)).unwrap();

        let mut op = applier
            .update_property(&css, ".btn-primary", "background-color", "#2ecc71")
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&css).unwrap().permissions().mode() & 0o777, 0o640);

        applier.rollback(&mut op).await.unwrap();
        assert_eq!(std::fs::metadata(&css).unwrap().permissions().mode() & 0o777, 0o640);
    }
}
