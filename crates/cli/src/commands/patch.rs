//! Patch Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;
use visfix_engine::PatchOperation;

use crate::context::Context;
use crate::output::{print_item, print_success, TableDisplay};

#[derive(Subcommand)]
pub enum PatchCommands {
    /// Set a declaration value in a stylesheet
    Patch {
        /// Stylesheet path
        file: PathBuf,

        /// Rule selector
        selector: String,

        /// Property name
        property: String,

        /// New value
        value: String,
    },

    /// Restore the files of a backup
    Rollback {
        /// Backup ID
        backup_id: String,
    },
}

/// Patch display wrapper for serialization
#[derive(Serialize)]
pub struct PatchDisplay {
    pub file: String,
    pub line: usize,
    pub selector: String,
    pub property: String,
    pub old_value: String,
    pub new_value: String,
    pub backup: String,
}

impl From<&PatchOperation> for PatchDisplay {
    fn from(op: &PatchOperation) -> Self {
        Self {
            file: op.file().display().to_string(),
            line: op.line(),
            selector: op.target.rule.selector.clone(),
            property: op.target.property.clone(),
            old_value: op.old_value.clone(),
            new_value: op.new_value.clone(),
            backup: op.backup.id().to_string(),
        }
    }
}

impl TableDisplay for PatchDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["File", "Line", "Selector", "Property", "Old", "New", "Backup"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.file.clone(),
            self.line.to_string(),
            self.selector.clone(),
            self.property.clone(),
            self.old_value.clone(),
            self.new_value.clone(),
            self.backup.clone(),
        ]
    }
}

pub async fn execute(cmd: PatchCommands, ctx: &Context) -> Result<()> {
    let orch = ctx.orchestrator().await?;
    let applier = orch.applier();

    match cmd {
        PatchCommands::Patch {
            file,
            selector,
            property,
            value,
        } => {
            let mut op = applier.update_property(&file, &selector, &property, &value).await?;
            // Manual patches are not verified; the backup stays until pruned
            applier.release(&mut op).await?;
            print_success(&format!("Patched {}:{}", file.display(), op.line()));
            print_item(&PatchDisplay::from(&op), ctx.format);
        }

        PatchCommands::Rollback { backup_id } => {
            let backup = applier.restore_backup(&backup_id).await?;
            print_success(&format!(
                "Restored {} file(s) from backup '{}'",
                backup.manifest.entries.len(),
                backup.id()
            ));
        }
    }

    Ok(())
}
