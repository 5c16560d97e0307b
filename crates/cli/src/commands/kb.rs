//! Knowledge Base Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use visfix_engine::{Fingerprint, FixRecord};

use crate::context::Context;
use crate::output::{print_item, print_list, print_warning, timestamp, TableDisplay};

#[derive(Subcommand)]
pub enum KbCommands {
    /// List verified fixes
    List,

    /// Look up the fix for an erroneous declaration
    Lookup {
        /// Rule selector
        selector: String,

        /// Property name
        property: String,

        /// The erroneous value
        value: String,
    },
}

/// Fix display wrapper for serialization
#[derive(Serialize)]
pub struct FixDisplay {
    pub fingerprint: String,
    pub selector: String,
    pub property: String,
    pub erroneous_value: String,
    pub value: String,
    pub success_count: u64,
    pub applied_at: String,
}

impl From<&FixRecord> for FixDisplay {
    fn from(record: &FixRecord) -> Self {
        Self {
            fingerprint: record
                .fingerprint
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default(),
            selector: record.selector.clone(),
            property: record.property.clone(),
            erroneous_value: record.erroneous_value.clone(),
            value: record.value.clone(),
            success_count: record.success_count,
            applied_at: timestamp(Some(record.applied_at)),
        }
    }
}

impl TableDisplay for FixDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Fingerprint", "Selector", "Property", "From", "To", "Successes", "Last Applied"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.fingerprint.chars().take(12).collect(),
            self.selector.clone(),
            self.property.clone(),
            self.erroneous_value.clone(),
            self.value.clone(),
            self.success_count.to_string(),
            self.applied_at.clone(),
        ]
    }
}

pub async fn execute(cmd: KbCommands, ctx: &Context) -> Result<()> {
    let orch = ctx.orchestrator().await?;
    let kb = orch.knowledge();

    match cmd {
        KbCommands::List => {
            let entries = kb.entries().await;
            let displays: Vec<FixDisplay> = entries.iter().map(FixDisplay::from).collect();
            print_list(&displays, ctx.format);
        }

        KbCommands::Lookup {
            selector,
            property,
            value,
        } => {
            let fingerprint = Fingerprint::compute(&selector, &property, &value);
            match kb.lookup(&fingerprint).await {
                Some(record) => print_item(&FixDisplay::from(&record), ctx.format),
                None => print_warning(&format!("No known fix (fingerprint {})", fingerprint)),
            }
        }
    }

    Ok(())
}
