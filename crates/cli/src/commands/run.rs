//! Pipeline Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use visfix_engine::{RunOutcome, RunReport};

use crate::context::{cancel_on_ctrl_c, Context};
use crate::output::{print_item, print_list, print_success, print_warning, TableDisplay};

#[derive(Subcommand)]
pub enum RunCommands {
    /// Capture a page and record a pending diff if it changed
    Check {
        /// Page name
        page: String,
    },

    /// Run the pipeline for one record
    Run {
        /// Record ID
        id: String,

        /// Classify an undecided record as intended
        #[arg(long, conflicts_with = "regression")]
        intended: bool,

        /// Classify an undecided record as a regression
        #[arg(long)]
        regression: bool,
    },

    /// Run the pipeline for every decided record
    RunAll,
}

/// Run report display wrapper for serialization
#[derive(Serialize)]
pub struct ReportDisplay {
    pub id: String,
    pub page: String,
    pub states: String,
    pub outcome: String,
    pub detail: String,
}

impl From<&RunReport> for ReportDisplay {
    fn from(report: &RunReport) -> Self {
        let detail = match &report.outcome {
            RunOutcome::AwaitingDecision => "decide with --intended or --regression".to_string(),
            RunOutcome::BaselineUpdated { record } => format!("{} -> {}", record.current_ref, record.baseline_ref),
            RunOutcome::Fixed {
                patch,
                verification,
                source,
            } => format!(
                "{}:{} {} -> {} ({:?}, {:.2}%)",
                patch.file().display(),
                patch.line(),
                patch.old_value,
                patch.new_value,
                source,
                verification.diff_percentage
            ),
            RunOutcome::Escalated(escalation) => escalation.to_string(),
            RunOutcome::Cancelled { rolled_back } => {
                if *rolled_back {
                    "patch rolled back".to_string()
                } else {
                    "nothing changed".to_string()
                }
            }
        };

        Self {
            id: report.id.clone(),
            page: report.page.clone(),
            states: report
                .states
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" → "),
            outcome: report.outcome.label().to_string(),
            detail,
        }
    }
}

impl TableDisplay for ReportDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Page", "States", "Outcome", "Detail"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.page.clone(),
            self.states.clone(),
            self.outcome.clone(),
            self.detail.clone(),
        ]
    }
}

pub async fn execute(cmd: RunCommands, ctx: &Context) -> Result<()> {
    let orch = ctx.orchestrator().await?;
    let cancel = cancel_on_ctrl_c();

    match cmd {
        RunCommands::Check { page } => match orch.check_page(&page, &cancel).await? {
            Some(record) => {
                print_warning(&format!(
                    "Page '{}' differs by {:.2}%, recorded as '{}'",
                    page, record.diff_percentage, record.id
                ));
                print_item(&super::confirm::RecordDisplay::from(&record), ctx.format);
            }
            None => print_success(&format!("Page '{}' matches its baseline", page)),
        },

        RunCommands::Run {
            id,
            intended,
            regression,
        } => {
            let decision = match (intended, regression) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let report = orch.run(&id, decision, &cancel).await?;
            print_item(&ReportDisplay::from(&report), ctx.format);
            if matches!(report.outcome, RunOutcome::Escalated(_)) {
                anyhow::bail!("record '{}' needs manual review", id);
            }
        }

        RunCommands::RunAll => {
            let reports = orch.run_decided(&cancel).await?;
            let displays: Vec<ReportDisplay> = reports.iter().map(ReportDisplay::from).collect();
            print_list(&displays, ctx.format);

            let escalated = reports
                .iter()
                .filter(|r| matches!(r.outcome, RunOutcome::Escalated(_)))
                .count();
            if escalated > 0 {
                anyhow::bail!("{} record(s) need manual review", escalated);
            }
        }
    }

    Ok(())
}
