//! Shared command context

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use visfix_common::ArtifactStore;
use visfix_engine::{EngineConfig, Orchestrator};

use crate::output::OutputFormat;

pub struct Context {
    pub config: EngineConfig,
    pub format: OutputFormat,
}

impl Context {
    pub fn load(config_path: Option<PathBuf>, format: OutputFormat) -> Result<Self> {
        let path = config_path.unwrap_or_else(visfix_common::default_config_path);
        let config = EngineConfig::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        tracing::debug!("Using configuration {}", path.display());
        Ok(Self { config, format })
    }

    /// Open every store, wired to the command-backed collaborators
    pub async fn orchestrator(&self) -> Result<Orchestrator> {
        let artifacts = ArtifactStore::new(self.config.artifacts_path()).await?;
        let collaborators = visfix_harness::collaborators(&self.config, artifacts);
        Ok(Orchestrator::new(self.config.clone(), collaborators).await?)
    }
}

/// Token cancelled on Ctrl-C
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing the current step");
            child.cancel();
        }
    });
    token
}
