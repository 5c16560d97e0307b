//! Backup Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use visfix_engine::Backup;

use crate::context::Context;
use crate::output::{print_list, print_success, timestamp, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum BackupCommands {
    /// List backups
    List,

    /// Delete released backups beyond the newest N
    Prune {
        /// Released backups to keep (defaults to the configured retention)
        #[arg(long)]
        keep: Option<usize>,
    },
}

/// Backup display wrapper for serialization
#[derive(Serialize)]
pub struct BackupDisplay {
    pub id: String,
    pub files: Vec<String>,
    pub released: bool,
    pub created_at: String,
}

impl From<&Backup> for BackupDisplay {
    fn from(backup: &Backup) -> Self {
        Self {
            id: backup.id().to_string(),
            files: backup
                .manifest
                .entries
                .iter()
                .map(|e| e.original.display().to_string())
                .collect(),
            released: backup.is_released(),
            created_at: timestamp(Some(backup.manifest.created_at)),
        }
    }
}

impl TableDisplay for BackupDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Files", "Released", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.files.join("\n"),
            if self.released { "yes" } else { "no" }.to_string(),
            self.created_at.clone(),
        ]
    }
}

pub async fn execute(cmd: BackupCommands, ctx: &Context) -> Result<()> {
    let orch = ctx.orchestrator().await?;
    let backups = orch.applier().backups();

    match cmd {
        BackupCommands::List => {
            let list = backups.list().await?;
            let displays: Vec<BackupDisplay> = list.iter().map(BackupDisplay::from).collect();
            print_list(&displays, ctx.format);
        }

        BackupCommands::Prune { keep } => {
            let keep = keep.unwrap_or(ctx.config.backups.keep);
            let stats = backups.prune(keep).await?;
            match ctx.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                _ => print_success(&format!(
                    "Deleted {}/{} backups ({} bytes freed)",
                    stats.deleted_backups, stats.total_backups, stats.deleted_bytes
                )),
            }
        }
    }

    Ok(())
}
