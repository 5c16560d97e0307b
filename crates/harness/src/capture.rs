//! Screenshot capture through an external command

use crate::error::{HarnessError, HarnessResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use visfix_common::{ArtifactKey, ArtifactRef, ArtifactStore};
use visfix_engine::Capture;

/// Runs a screenshot command such as
/// `["npx", "playwright", "screenshot", "http://localhost:3000/{page}", "{output}"]`.
/// The command writes a temporary file that is renamed into the artifact
/// store only once the command succeeded.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    command: Vec<String>,
    artifacts: ArtifactStore,
}

impl CommandCapture {
    pub fn new(command: &[String], artifacts: ArtifactStore) -> Self {
        Self {
            command: command.to_vec(),
            artifacts,
        }
    }

    /// Capture `page` into the artifact store, under `runs/<run_id>/current/`
    /// when a run is given
    pub async fn capture_page(&self, page: &str, run_id: Option<&str>) -> HarnessResult<ArtifactRef> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(HarnessError::NotConfigured("capture"))?;

        let mut key = ArtifactKey::current(page);
        if let Some(run) = run_id {
            key = key.with_run(run);
        }
        let artifact = self.artifacts.resolve(&key)?;
        let output = self.artifacts.path_of(&artifact);
        let staging = staging_path(&output);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let args: Vec<String> = args.iter().map(|a| render(a, page, &staging)).collect();
        debug!("Capturing {}: {} {}", page, program, args.join(" "));

        let result = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(HarnessError::CommandFailed {
                program: program.clone(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            return Err(HarnessError::MissingOutput {
                program: program.clone(),
                path: staging,
            });
        }

        tokio::fs::rename(&staging, &output).await?;
        info!("Captured {} to {}", page, artifact);
        Ok(artifact)
    }
}

#[async_trait]
impl Capture for CommandCapture {
    async fn capture(&self, page: &str, run_id: Option<&str>) -> visfix_common::Result<ArtifactRef> {
        self.capture_page(page, run_id)
            .await
            .map_err(|e| e.into_engine("capture"))
    }
}

fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    output.with_file_name(format!(".{}.{}.png", name, uuid::Uuid::new_v4().simple()))
}

fn render(arg: &str, page: &str, output: &Path) -> String {
    arg.replace("{page}", page)
        .replace("{output}", &output.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn command(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_render_placeholders() {
        let out = render("http://host/{page}?o={output}", "form", Path::new("/tmp/x.png"));
        assert_eq!(out, "http://host/form?o=/tmp/x.png");
    }

    #[tokio::test]
    async fn test_unconfigured() {
        let tmp = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(tmp.path()).await.unwrap();
        let capture = CommandCapture::new(&[], artifacts);

        let err = capture.capture("form", None).await.unwrap_err();
        assert!(matches!(err, visfix_common::Error::ExternalService { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_moves_output_into_store() {
        let tmp = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(tmp.path().join("artifacts")).await.unwrap();
        let capture = CommandCapture::new(&command("printf '{page}' > '{output}'"), artifacts.clone());

        let artifact = capture.capture("form", Some("r1")).await.unwrap();
        assert_eq!(artifact.path(), Path::new("runs/r1/current/form.png"));
        assert_eq!(artifacts.get(&artifact).await.unwrap(), b"form");

        // A run capture leaves the shared slot alone
        let shared = artifacts.resolve(&ArtifactKey::current("form")).unwrap();
        assert!(!artifacts.exists(&shared).await);
        let artifact = capture.capture("form", None).await.unwrap();
        assert_eq!(artifact, shared);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let tmp = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(tmp.path()).await.unwrap();
        let capture = CommandCapture::new(&command("echo 'browser crashed' >&2; exit 3"), artifacts.clone());

        let err = capture.capture_page("form", None).await.unwrap_err();
        match err {
            HarnessError::CommandFailed { stderr, .. } => assert_eq!(stderr, "browser crashed"),
            other => panic!("unexpected: {:?}", other),
        }
        let current = artifacts.resolve(&ArtifactKey::current("form")).unwrap();
        assert!(!artifacts.exists(&current).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output() {
        let tmp = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(tmp.path()).await.unwrap();
        let capture = CommandCapture::new(&command("true"), artifacts);

        let err = capture.capture_page("form", None).await.unwrap_err();
        assert!(matches!(err, HarnessError::MissingOutput { .. }));
    }
}
