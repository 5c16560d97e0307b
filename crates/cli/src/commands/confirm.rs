//! Confirmation Commands

use anyhow::Result;
use clap::{ArgGroup, Subcommand};
use serde::Serialize;
use visfix_common::ConfirmationRecord;

use crate::context::Context;
use crate::output::{print_item, print_list, print_success, print_warning, timestamp, TableDisplay};

#[derive(Subcommand)]
pub enum ConfirmCommands {
    /// List records awaiting processing
    Pending,

    /// List processed records
    Processed,

    /// Record a decision without processing it
    #[command(group(ArgGroup::new("decision").required(true).args(["intended", "regression"])))]
    Decide {
        /// Record ID
        id: String,

        /// The change was intended
        #[arg(long)]
        intended: bool,

        /// The change is a regression
        #[arg(long)]
        regression: bool,
    },

    /// Process a record as an intended change
    Approve {
        /// Record ID
        id: String,
    },

    /// Process a record as a regression
    Reject {
        /// Record ID
        id: String,
    },

    /// Copy a record's current screenshot over its baseline
    UpdateBaseline {
        /// Record ID
        id: String,
    },

    /// Update baselines for every processed, intended record
    ApplyBaselines,
}

/// Record display wrapper for serialization
#[derive(Serialize)]
pub struct RecordDisplay {
    pub id: String,
    pub page: String,
    pub status: String,
    pub decision: String,
    pub diff_percentage: f64,
    pub created_at: String,
    pub processed_at: String,
    pub baseline_updated_at: String,
}

impl From<&ConfirmationRecord> for RecordDisplay {
    fn from(record: &ConfirmationRecord) -> Self {
        Self {
            id: record.id.clone(),
            page: record.name.clone(),
            status: record.status().to_string(),
            decision: match record.is_intended() {
                Some(true) => "intended".to_string(),
                Some(false) => "regression".to_string(),
                None => "-".to_string(),
            },
            diff_percentage: record.diff_percentage,
            created_at: timestamp(Some(record.created_at)),
            processed_at: timestamp(record.processed_at()),
            baseline_updated_at: timestamp(record.baseline_updated_at()),
        }
    }
}

impl TableDisplay for RecordDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Page", "Status", "Decision", "Diff", "Created", "Processed", "Baseline"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.page.clone(),
            self.status.clone(),
            self.decision.clone(),
            format!("{:.2}%", self.diff_percentage),
            self.created_at.clone(),
            self.processed_at.clone(),
            self.baseline_updated_at.clone(),
        ]
    }
}

fn displays(records: &[ConfirmationRecord]) -> Vec<RecordDisplay> {
    records.iter().map(RecordDisplay::from).collect()
}

pub async fn execute(cmd: ConfirmCommands, ctx: &Context) -> Result<()> {
    let orch = ctx.orchestrator().await?;
    let store = orch.store();

    match cmd {
        ConfirmCommands::Pending => {
            print_list(&displays(&store.pending().await), ctx.format);
        }

        ConfirmCommands::Processed => {
            print_list(&displays(&store.processed().await), ctx.format);
        }

        ConfirmCommands::Decide { id, intended, .. } => {
            let record = store.record_decision(&id, intended).await?;
            print_success(&format!("Decision recorded for '{}'", id));
            print_item(&RecordDisplay::from(&record), ctx.format);
        }

        ConfirmCommands::Approve { id } => process(store, &id, true, ctx).await?,

        ConfirmCommands::Reject { id } => process(store, &id, false, ctx).await?,

        ConfirmCommands::UpdateBaseline { id } => {
            let record = store.update_baseline(&id).await?;
            print_success(&format!("Baseline updated for page '{}'", record.name));
            print_item(&RecordDisplay::from(&record), ctx.format);
        }

        ConfirmCommands::ApplyBaselines => {
            let summary = store.apply_processed().await;
            if let crate::output::OutputFormat::Json = ctx.format {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_success(&format!(
                    "{} baseline(s) updated, {} skipped",
                    summary.updated, summary.skipped
                ));
                for failure in &summary.failed {
                    print_warning(&format!("{}: {}", failure.id, failure.error));
                }
            }
            if !summary.failed.is_empty() {
                anyhow::bail!("{} baseline update(s) failed", summary.failed.len());
            }
        }
    }

    Ok(())
}

async fn process(
    store: &visfix_engine::ConfirmationStore,
    id: &str,
    is_intended: bool,
    ctx: &Context,
) -> Result<()> {
    let outcome = store.process_confirmation(id, is_intended).await?;
    if outcome.newly_processed {
        print_success(&format!("Record '{}' processed", id));
    } else {
        print_warning(&format!("Record '{}' was already processed", id));
    }
    print_item(&RecordDisplay::from(&outcome.record), ctx.format);
    Ok(())
}
