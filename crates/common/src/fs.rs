//! Filesystem helpers
//!
//! All writes go through a temp file in the destination directory followed by
//! a rename, so readers observe either the old bytes or the new bytes. A
//! rewritten file keeps its permissions. Reads and writes are retried once
//! for transient failures.

use crate::{Error, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Read a file, retrying once on a transient error
pub async fn read(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    retry_once(path, || fs::read(path)).await
}

/// Read a UTF-8 file, retrying once on a transient error
pub async fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    retry_once(path, || fs::read_to_string(path)).await
}

/// Atomically replace `path` with `data`
pub async fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    retry_once(path, || write_atomic_once(path, data)).await?;
    debug!("Wrote {} ({} bytes)", path.display(), data.len());
    Ok(())
}

/// Atomically replace `dst` with a copy of `src`
pub async fn copy_atomic(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if !fs::try_exists(src).await.unwrap_or(false) {
        return Err(Error::not_found("file", src.display().to_string()));
    }
    retry_once(dst, || copy_atomic_once(src, dst)).await?;
    debug!("Copied {} -> {}", src.display(), dst.display());
    Ok(())
}

/// Normalize a path into the identity used for locking and manifests
pub fn identity(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "visfix".to_string());
    let tmp_name = format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple());
    path.with_file_name(tmp_name)
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

async fn write_atomic_once(path: &Path, data: &[u8]) -> std::io::Result<()> {
    ensure_parent(path).await?;
    let tmp = temp_path_for(path);
    let result = async {
        fs::write(&tmp, data).await?;
        // The replacement keeps the mode of the file it replaces
        if let Ok(meta) = fs::metadata(path).await {
            fs::set_permissions(&tmp, meta.permissions()).await?;
        }
        fs::rename(&tmp, path).await
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

async fn copy_atomic_once(src: &Path, dst: &Path) -> std::io::Result<()> {
    ensure_parent(dst).await?;
    let tmp = temp_path_for(dst);
    if let Err(e) = fs::copy(src, &tmp).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, dst).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

async fn retry_once<T, F, Fut>(path: &Path, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) => {
            let err = Error::io(path, e);
            if !err.is_transient() {
                return Err(err);
            }
            warn!("Transient IO failure, retrying once: {}", err);
            op().await.map_err(|e| Error::io(path, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_creates_parents_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/file.json");

        write_atomic(&path, b"{}").await.unwrap();
        write_atomic(&path, b"{\"a\":1}").await.unwrap();

        assert_eq!(read_to_string(&path).await.unwrap(), "{\"a\":1}");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_atomic_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("site.css");
        std::fs::write(&path, "a { color: red; }").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        write_atomic(&path, b"a { color: blue; }").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(read_to_string(&path).await.unwrap(), "a { color: blue; }");
    }

    #[tokio::test]
    async fn test_copy_missing_source_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = copy_atomic(tmp.path().join("missing.png"), tmp.path().join("out.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_read_missing_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nope.css");
        match read(&path).await {
            Err(Error::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
