//! Pipeline orchestration
//!
//! Drives a confirmation record through
//! `Detected → Classifying → {IntendedPath | RegressionPath} → {Done | Escalated}`.
//! Only one run per record id may be in flight.

use crate::backup::BackupStore;
use crate::collaborators::{call, Capture, Compare, Comparison, FixContext, FixGenerator, StyleTarget};
use crate::confirmation::ConfirmationStore;
use crate::config::EngineConfig;
use crate::knowledge::{Fingerprint, FixRecord, KnowledgeBase, StyleFix};
use crate::locator::Stylesheet;
use crate::patch::{PatchApplier, PatchOperation};
use crate::verify::{FixVerifier, VerificationResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use visfix_common::{
    ArtifactKey, ArtifactRef, ArtifactStore, ConfirmationRecord, ConfirmationState, Error, FileGuard, FileLocks,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Detected,
    Classifying,
    IntendedPath,
    RegressionPath,
    Done,
    Escalated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Detected => "detected",
            RunState::Classifying => "classifying",
            RunState::IntendedPath => "intended",
            RunState::RegressionPath => "regression",
            RunState::Done => "done",
            RunState::Escalated => "escalated",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixSource {
    KnowledgeBase,
    Generated,
}

/// Why a record needs a human, and where to look
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub record_id: String,
    pub page: String,
    pub selector: Option<String>,
    pub property: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
    pub reason: String,
}

impl Escalation {
    fn new(record: &ConfirmationRecord, reason: impl ToString) -> Self {
        Self {
            record_id: record.id.clone(),
            page: record.name.clone(),
            selector: None,
            property: None,
            file: None,
            line: None,
            reason: reason.to_string(),
        }
    }

    fn at_target(mut self, target: &StyleTarget) -> Self {
        self.selector = Some(target.selector.clone());
        self.property = Some(target.property.clone());
        self
    }

    fn in_file(mut self, file: impl Into<PathBuf>, line: Option<usize>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {} (page {}): {}", self.record_id, self.page, self.reason)?;
        if let (Some(selector), Some(property)) = (&self.selector, &self.property) {
            write!(f, " [{} {{ {} }}", selector, property)?;
            if let Some(file) = &self.file {
                write!(f, " in {}", file.display())?;
                if let Some(line) = self.line {
                    write!(f, ":{}", line)?;
                }
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    AwaitingDecision,
    BaselineUpdated {
        record: ConfirmationRecord,
    },
    Fixed {
        patch: Box<PatchOperation>,
        verification: VerificationResult,
        source: FixSource,
    },
    Escalated(Escalation),
    Cancelled {
        rolled_back: bool,
    },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::AwaitingDecision => "awaiting decision",
            RunOutcome::BaselineUpdated { .. } => "baseline updated",
            RunOutcome::Fixed { .. } => "fixed",
            RunOutcome::Escalated(_) => "escalated",
            RunOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

/// One pipeline run of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub id: String,
    pub page: String,
    /// States traversed, in order
    pub states: Vec<RunState>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn final_state(&self) -> Option<RunState> {
        self.states.last().copied()
    }
}

/// External services the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn Capture>,
    pub compare: Arc<dyn Compare>,
    pub fix_generator: Option<Arc<dyn FixGenerator>>,
}

/// Removes the record id from the in-flight set on every exit path
struct InFlightGuard {
    runs: Arc<DashMap<String, ()>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.runs.remove(&self.id);
    }
}

/// Decision-and-repair pipeline
pub struct Orchestrator {
    config: EngineConfig,
    artifacts: ArtifactStore,
    store: ConfirmationStore,
    knowledge: KnowledgeBase,
    applier: PatchApplier,
    verifier: FixVerifier,
    fix_generator: Option<Arc<dyn FixGenerator>>,
    runs: Arc<DashMap<String, ()>>,
}

impl Orchestrator {
    /// Open every store named by `config`. The stores share one lock table
    /// backed by the store's lock directory, so separate `visfix` processes
    /// on the same store serialize their writes.
    pub async fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let locks = FileLocks::with_lock_dir(config.lock_path());

        let artifacts = ArtifactStore::new(config.artifacts_path()).await?;
        let store = ConfirmationStore::open(
            config.pending_path(),
            config.processed_path(),
            artifacts.clone(),
            locks.clone(),
        )
        .await?;
        let knowledge = KnowledgeBase::open(config.kb_path(), locks.clone()).await;
        let applier = PatchApplier::new(BackupStore::new(config.backup_path()), locks);
        let verifier = FixVerifier::new(
            collaborators.capture,
            collaborators.compare,
            artifacts.clone(),
            config.timeouts.clone(),
        );

        Ok(Self {
            config,
            artifacts,
            store,
            knowledge,
            applier,
            verifier,
            fix_generator: collaborators.fix_generator,
            runs: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn store(&self) -> &ConfirmationStore {
        &self.store
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    pub fn applier(&self) -> &PatchApplier {
        &self.applier
    }

    pub fn verifier(&self) -> &FixVerifier {
        &self.verifier
    }

    /// Create a pending record when a comparison exceeds the threshold. The
    /// record gets its own copy of `current` under `runs/<record id>/`, which
    /// is what a later baseline update promotes.
    pub async fn detect(
        &self,
        page: &str,
        comparison: &Comparison,
        baseline: ArtifactRef,
        current: ArtifactRef,
    ) -> Result<Option<ConfirmationRecord>> {
        if comparison.diff_percentage.is_nan() || comparison.diff_percentage <= self.config.threshold {
            info!(page, "No significant diff ({:.2}%)", comparison.diff_percentage);
            return Ok(None);
        }

        let mut record = ConfirmationRecord::new("", page, comparison.diff_percentage, baseline, current);
        record.current_ref = self
            .artifacts
            .copy_to(&record.current_ref, &ArtifactKey::current(page).with_run(&record.id))
            .await?;
        let record = self.store.add_pending(record).await?;
        info!(
            id = %record.id,
            page,
            "Detected visual diff: {:.2}% ({} pixels)",
            comparison.diff_percentage,
            comparison.diff_pixel_count
        );
        Ok(Some(record))
    }

    /// Capture a page, compare it against its baseline and detect
    pub async fn check_page(&self, page: &str, cancel: &CancellationToken) -> Result<Option<ConfirmationRecord>> {
        let baseline = self.artifacts.locate(&ArtifactKey::baseline(page)).await?;
        let (current, comparison) = self.verifier.measure(page, &baseline, None, cancel).await?;
        self.detect(page, &comparison, baseline, current).await
    }

    /// Run one record's pipeline. `decision` classifies a record that has
    /// not been processed yet; processed records keep their decision.
    pub async fn run(&self, id: &str, decision: Option<bool>, cancel: &CancellationToken) -> Result<RunReport> {
        let _flight = self.begin(id)?;

        let record = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::not_found("confirmation", id))?;
        let mut report = RunReport {
            id: record.id.clone(),
            page: record.name.clone(),
            states: vec![RunState::Detected, RunState::Classifying],
            outcome: RunOutcome::AwaitingDecision,
        };

        if cancel.is_cancelled() {
            report.states.push(RunState::Escalated);
            report.outcome = RunOutcome::Cancelled { rolled_back: false };
            return Ok(report);
        }

        let is_intended = match (&record.state, decision) {
            (ConfirmationState::Processed { is_intended, .. }, _) => *is_intended,
            (ConfirmationState::Confirmed { is_intended }, None) => *is_intended,
            (_, Some(decision)) => decision,
            (ConfirmationState::Pending, None) if self.config.auto_approve => true,
            (ConfirmationState::Pending, None) => {
                info!(id, "Awaiting a decision");
                return Ok(report);
            }
        };
        let record = self.store.process_confirmation(id, is_intended).await?.record;

        if record.is_intended() == Some(true) {
            report.states.push(RunState::IntendedPath);
            report.outcome = match self.store.update_baseline(id).await {
                Ok(record) => RunOutcome::BaselineUpdated { record },
                Err(e) => RunOutcome::Escalated(Escalation::new(&record, format!("baseline update failed: {}", e))),
            };
        } else {
            report.states.push(RunState::RegressionPath);
            report.outcome = self.repair(&record, cancel).await;
        }

        report.states.push(match report.outcome {
            RunOutcome::BaselineUpdated { .. } | RunOutcome::Fixed { .. } => RunState::Done,
            _ => RunState::Escalated,
        });

        match &report.outcome {
            RunOutcome::Escalated(escalation) => warn!("Escalated {}", escalation),
            outcome => info!(id, "Run finished: {}", outcome.label()),
        }
        Ok(report)
    }

    /// Run every record that already carries a decision; with `auto_approve`
    /// undecided records run as intended
    pub async fn run_decided(&self, cancel: &CancellationToken) -> Result<Vec<RunReport>> {
        let mut ids: Vec<String> = self
            .store
            .pending()
            .await
            .into_iter()
            .filter(|r| r.is_intended().is_some() || self.config.auto_approve)
            .map(|r| r.id)
            .collect();
        ids.extend(
            self.store
                .processed()
                .await
                .into_iter()
                .filter(|r| r.is_intended() == Some(true) && r.baseline_updated_at().is_none())
                .map(|r| r.id),
        );
        // A record processed elsewhere between the two reads shows up in both
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));

        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            if cancel.is_cancelled() {
                break;
            }
            match self.run(&id, None, cancel).await {
                Ok(report) => reports.push(report),
                Err(Error::InFlight { id }) => warn!(id, "Skipping record with a run in flight"),
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }

    fn begin(&self, id: &str) -> Result<InFlightGuard> {
        match self.runs.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::InFlight { id: id.to_string() }),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightGuard {
                    runs: Arc::clone(&self.runs),
                    id: id.to_string(),
                })
            }
        }
    }

    /// Regression path: find or generate a fix, apply it and verify it
    async fn repair(&self, record: &ConfirmationRecord, cancel: &CancellationToken) -> RunOutcome {
        let page = record.name.as_str();

        let stylesheet = match self.config.stylesheet_for(page) {
            Ok(path) => path,
            Err(e) => return RunOutcome::Escalated(Escalation::new(record, e)),
        };
        let sheet = match Stylesheet::load(&stylesheet).await {
            Ok(sheet) => sheet,
            Err(e) => return RunOutcome::Escalated(Escalation::new(record, e).in_file(&stylesheet, None)),
        };
        let suspect = self.config.suspect_for(page);

        let (target, value, source) = match self.cached_fix(&sheet, suspect.as_ref()).await {
            Some(cached) => {
                info!(
                    id = %record.id,
                    selector = %cached.selector,
                    property = %cached.property,
                    "Knowledge base hit, reusing {}",
                    cached.value
                );
                let target = StyleTarget {
                    selector: cached.selector,
                    property: cached.property,
                };
                (target, cached.value, FixSource::KnowledgeBase)
            }
            None => {
                let Some(generator) = &self.fix_generator else {
                    let escalation = Escalation::new(record, "no known fix and no fix generator configured");
                    let escalation = match &suspect {
                        Some(t) => escalation.at_target(t).in_file(&stylesheet, None),
                        None => escalation.in_file(&stylesheet, None),
                    };
                    return RunOutcome::Escalated(escalation);
                };

                let context = FixContext {
                    record_id: record.id.clone(),
                    page: page.to_string(),
                    diff_percentage: record.diff_percentage,
                    threshold: self.config.verify_threshold(),
                    baseline_ref: record.baseline_ref.clone(),
                    current_ref: record.current_ref.clone(),
                    stylesheet: stylesheet.clone(),
                    stylesheet_text: sheet.text().to_string(),
                    suspect: suspect.clone(),
                };
                match call(
                    "fix generator",
                    self.config.timeouts.generate(),
                    cancel,
                    generator.generate_fix(&context),
                )
                .await
                {
                    Ok(suggestion) => {
                        info!(id = %record.id, "Fix generated: {}", suggestion.rationale);
                        let target = StyleTarget {
                            selector: suggestion.selector,
                            property: suggestion.property,
                        };
                        (target, suggestion.suggested_value, FixSource::Generated)
                    }
                    Err(Error::Cancelled) => return RunOutcome::Cancelled { rolled_back: false },
                    Err(e) => {
                        let escalation = Escalation::new(record, e).in_file(&stylesheet, None);
                        let escalation = match &suspect {
                            Some(t) => escalation.at_target(t),
                            None => escalation,
                        };
                        return RunOutcome::Escalated(escalation);
                    }
                }
            }
        };

        if cancel.is_cancelled() {
            return RunOutcome::Cancelled { rolled_back: false };
        }

        // Held until verification and any rollback are over, so another run
        // cannot patch or restore this stylesheet in between
        let sheet_guard = match self.applier.lock(&stylesheet).await {
            Ok(guard) => guard,
            Err(e) => {
                return RunOutcome::Escalated(
                    Escalation::new(record, format!("could not lock stylesheet: {}", e))
                        .at_target(&target)
                        .in_file(&stylesheet, None),
                )
            }
        };

        let mut op = match self
            .applier
            .apply_locked(&sheet_guard, &stylesheet, &target.selector, &target.property, &value)
            .await
        {
            Ok(op) => op,
            Err(e) => {
                return RunOutcome::Escalated(
                    Escalation::new(record, format!("patch failed: {}", e))
                        .at_target(&target)
                        .in_file(&stylesheet, None),
                )
            }
        };

        let fix = StyleFix {
            selector: target.selector.clone(),
            property: target.property.clone(),
            erroneous_value: op.old_value.clone(),
            value: op.new_value.clone(),
        };
        let escalation = Escalation::new(record, "")
            .at_target(&target)
            .in_file(op.file(), Some(op.line()));

        let verification = self
            .verifier
            .verify_against(page, &record.baseline_ref, self.config.verify_threshold(), cancel)
            .await;

        match verification {
            Ok(result) if result.passed() => {
                if let Err(e) = self.knowledge.record(&fix.fingerprint(), &fix, true).await {
                    error!(id = %record.id, "Failed to record fix in knowledge base: {}", e);
                }
                if let Err(e) = self.applier.release(&mut op).await {
                    warn!(id = %record.id, "Failed to release backup {}: {}", op.backup.id(), e);
                }
                RunOutcome::Fixed {
                    patch: Box::new(op),
                    verification: result,
                    source,
                }
            }
            Ok(result) => {
                let reason = result.to_error().to_string();
                let reason = self.undo(&sheet_guard, &mut op, reason).await;
                RunOutcome::Escalated(Escalation { reason, ..escalation })
            }
            Err(Error::Cancelled) => {
                let rolled_back = match self.applier.rollback_locked(&sheet_guard, &mut op).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(id = %record.id, "Rollback after cancellation failed: {}", e);
                        false
                    }
                };
                RunOutcome::Cancelled { rolled_back }
            }
            Err(e) => {
                let reason = self.undo(&sheet_guard, &mut op, format!("verification error: {}", e)).await;
                RunOutcome::Escalated(Escalation { reason, ..escalation })
            }
        }
    }

    /// Roll back a rejected patch; the returned reason notes a failed rollback
    async fn undo(&self, guard: &FileGuard, op: &mut PatchOperation, reason: String) -> String {
        match self.applier.rollback_locked(guard, op).await {
            Ok(()) => reason,
            Err(e) => format!(
                "{}; rollback failed ({}), backup kept at {}",
                reason,
                e,
                op.backup_path().display()
            ),
        }
    }

    async fn cached_fix(&self, sheet: &Stylesheet, suspect: Option<&StyleTarget>) -> Option<FixRecord> {
        match suspect {
            Some(target) => {
                let location = sheet.locate(&target.selector, &target.property).ok()?;
                let fingerprint = Fingerprint::compute(&target.selector, &target.property, &location.value);
                self.knowledge.lookup(&fingerprint).await
            }
            None => self.knowledge.match_stylesheet(sheet).await.map(|(record, _)| record),
        }
    }
}
