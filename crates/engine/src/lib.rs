//! visfix engine
//!
//! Turns detected visual diffs into either a baseline update (the change was
//! intended) or a verified stylesheet repair (it was a regression):
//!
//! - [`ConfirmationStore`]: durable human decisions
//! - [`Stylesheet`]: rule and declaration lookup
//! - [`PatchApplier`]: backed-up, atomic declaration edits with rollback
//! - [`FixVerifier`]: re-capture and compare after a patch
//! - [`KnowledgeBase`]: fixes that verified before
//! - [`Orchestrator`]: the pipeline tying them together

pub mod backup;
pub mod collaborators;
pub mod config;
pub mod confirmation;
pub mod knowledge;
pub mod locator;
pub mod orchestrator;
pub mod patch;
pub mod verify;

pub use backup::{Backup, BackupStore, PruneStats};
pub use collaborators::{Capture, Compare, Comparison, FixContext, FixGenerator, FixSuggestion, StyleTarget};
pub use config::EngineConfig;
pub use confirmation::{BaselineUpdateSummary, ConfirmationStore, ProcessOutcome};
pub use knowledge::{Fingerprint, FixRecord, KnowledgeBase, StyleFix};
pub use locator::{PropertyLocation, StyleRule, Stylesheet};
pub use orchestrator::{Collaborators, Escalation, FixSource, Orchestrator, RunOutcome, RunReport, RunState};
pub use patch::{PatchApplier, PatchOperation, PatchOutcome};
pub use verify::{FixVerifier, VerificationOutcome, VerificationResult};
pub use visfix_common::{Error, Result};
