//! Confirmation store
//!
//! Human decisions about detected diffs live in two JSON files:
//! `pending.json` (Pending and Confirmed records) and `processed.json`.
//! A record moves from pending to processed exactly once.
//!
//! Several stores may share the files (a manual `approve` next to a CI
//! `run-all`). Every mutation takes the file locks first, which exclude other
//! processes when the registry has a lock directory, then re-reads both files,
//! works on a copy, writes `processed.json` before `pending.json`, and only
//! then commits the copy. A crash between the two writes leaves the id in
//! both files; the processed copy wins on the next load.

use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use visfix_common::{
    ArtifactStore, ConfirmationRecord, ConfirmationState, ConfirmationStatus, Error, FileLocks, Result,
};

type RecordMap = IndexMap<String, ConfirmationRecord>;

#[derive(Debug, Default, Clone)]
struct Maps {
    pending: RecordMap,
    processed: RecordMap,
}

/// Result of `process_confirmation`
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub record: ConfirmationRecord,
    /// False when the record was already processed
    pub newly_processed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaselineFailure {
    pub id: String,
    pub error: String,
}

/// Tally of a batch baseline update
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BaselineUpdateSummary {
    pub updated: usize,
    pub skipped: usize,
    pub failed: Vec<BaselineFailure>,
}

/// Durable store of confirmation records
#[derive(Debug, Clone)]
pub struct ConfirmationStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pending_path: PathBuf,
    processed_path: PathBuf,
    artifacts: ArtifactStore,
    locks: FileLocks,
    state: Mutex<Maps>,
}

impl ConfirmationStore {
    /// Open the store and load both files
    pub async fn open(
        pending_path: impl Into<PathBuf>,
        processed_path: impl Into<PathBuf>,
        artifacts: ArtifactStore,
        locks: FileLocks,
    ) -> Result<Self> {
        let store = Self {
            inner: Arc::new(Inner {
                pending_path: pending_path.into(),
                processed_path: processed_path.into(),
                artifacts,
                locks,
                state: Mutex::new(Maps::default()),
            }),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// (Re)load both files. Missing or corrupt files load as empty.
    pub async fn initialize(&self) -> Result<()> {
        for path in [&self.inner.pending_path, &self.inner.processed_path] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::io(parent, e))?;
            }
        }

        let _guards = self.lock_files().await?;
        let mut state = self.inner.state.lock().await;
        self.refresh(&mut state).await;

        info!(
            "Loaded confirmation store: {} pending, {} processed",
            state.pending.len(),
            state.processed.len()
        );
        Ok(())
    }

    pub fn pending_path(&self) -> &Path {
        &self.inner.pending_path
    }

    pub fn processed_path(&self) -> &Path {
        &self.inner.processed_path
    }

    /// Add a new pending record
    pub async fn add_pending(&self, record: ConfirmationRecord) -> Result<ConfirmationRecord> {
        if record.status() != ConfirmationStatus::Pending {
            return Err(Error::InvalidState {
                id: record.id.clone(),
                expected: ConfirmationStatus::Pending.to_string(),
                actual: record.status().to_string(),
            });
        }

        let _guards = self.lock_files().await?;
        let mut state = self.inner.state.lock().await;
        self.refresh(&mut state).await;

        if state.pending.contains_key(&record.id) || state.processed.contains_key(&record.id) {
            return Err(Error::AlreadyExists {
                kind: "confirmation".to_string(),
                id: record.id.clone(),
            });
        }

        let mut next = state.clone();
        next.pending.insert(record.id.clone(), record.clone());
        self.persist(&next, false).await?;
        *state = next;

        info!(id = %record.id, page = %record.name, "Added pending record ({:.2}% diff)", record.diff_percentage);
        Ok(record)
    }

    /// Record a human decision without processing it yet
    pub async fn record_decision(&self, id: &str, is_intended: bool) -> Result<ConfirmationRecord> {
        let _guards = self.lock_files().await?;
        let mut state = self.inner.state.lock().await;
        self.refresh(&mut state).await;

        if let Some(record) = state.processed.get(id) {
            return Err(Error::InvalidState {
                id: id.to_string(),
                expected: "pending or confirmed".to_string(),
                actual: record.status().to_string(),
            });
        }
        if !state.pending.contains_key(id) {
            return Err(Error::not_found("confirmation", id));
        }

        let mut next = state.clone();
        let record = match next.pending.get_mut(id) {
            Some(record) => {
                record.state = ConfirmationState::Confirmed { is_intended };
                record.clone()
            }
            None => return Err(Error::not_found("confirmation", id)),
        };
        self.persist(&next, false).await?;
        *state = next;

        info!(id, "Recorded decision: {}", decision_label(is_intended));
        Ok(record)
    }

    /// Move a record to processed with a final decision. Processing an
    /// already-processed id returns the stored record unchanged.
    pub async fn process_confirmation(&self, id: &str, is_intended: bool) -> Result<ProcessOutcome> {
        let _guards = self.lock_files().await?;
        let mut state = self.inner.state.lock().await;
        self.refresh(&mut state).await;

        if let Some(existing) = state.processed.get(id) {
            if existing.is_intended() != Some(is_intended) {
                warn!(
                    id,
                    "Already processed as {}, ignoring {}",
                    existing.is_intended().map(decision_label).unwrap_or("undecided"),
                    decision_label(is_intended)
                );
            }
            return Ok(ProcessOutcome {
                record: existing.clone(),
                newly_processed: false,
            });
        }

        let mut next = state.clone();
        let Some(mut record) = next.pending.shift_remove(id) else {
            return Err(Error::not_found("confirmation", id));
        };
        record.state = ConfirmationState::Processed {
            is_intended,
            processed_at: Utc::now(),
            baseline_updated_at: None,
        };
        next.processed.insert(record.id.clone(), record.clone());

        self.persist(&next, true).await?;
        *state = next;

        info!(id, page = %record.name, "Processed record as {}", decision_label(is_intended));
        Ok(ProcessOutcome {
            record,
            newly_processed: true,
        })
    }

    pub async fn get(&self, id: &str) -> Option<ConfirmationRecord> {
        let state = self.snapshot().await;
        state.processed.get(id).or_else(|| state.pending.get(id)).cloned()
    }

    /// Pending and Confirmed records in insertion order
    pub async fn pending(&self) -> Vec<ConfirmationRecord> {
        self.snapshot().await.pending.into_values().collect()
    }

    /// Processed records in insertion order
    pub async fn processed(&self) -> Vec<ConfirmationRecord> {
        self.snapshot().await.processed.into_values().collect()
    }

    /// Copy a processed, intended record's current screenshot over its baseline
    pub async fn update_baseline(&self, id: &str) -> Result<ConfirmationRecord> {
        let record = self.intended_record(id).await?;
        let baseline_path = self.inner.artifacts.path_of(&record.baseline_ref);

        let _guards = self
            .inner
            .locks
            .lock_all(&[
                self.inner.pending_path.as_path(),
                self.inner.processed_path.as_path(),
                baseline_path.as_path(),
            ])
            .await?;
        let mut state = self.inner.state.lock().await;
        self.refresh(&mut state).await;
        if !state.processed.contains_key(id) {
            return Err(Error::not_found("confirmation", id));
        }

        let digest = self
            .inner
            .artifacts
            .promote(&record.current_ref, &record.baseline_ref)
            .await?;

        let mut next = state.clone();
        let updated = match next.processed.get_mut(id) {
            Some(stored) => {
                if let ConfirmationState::Processed {
                    baseline_updated_at, ..
                } = &mut stored.state
                {
                    *baseline_updated_at = Some(Utc::now());
                }
                stored.clone()
            }
            None => return Err(Error::not_found("confirmation", id)),
        };
        self.persist(&next, true).await?;
        *state = next;

        info!(id, page = %updated.name, "Baseline updated (digest: {})", digest);
        Ok(updated)
    }

    /// Update the baseline of every processed, intended record
    pub async fn apply_processed(&self) -> BaselineUpdateSummary {
        let mut summary = BaselineUpdateSummary::default();

        for record in self.processed().await {
            if record.is_intended() != Some(true) {
                summary.skipped += 1;
                continue;
            }
            match self.update_baseline(&record.id).await {
                Ok(_) => summary.updated += 1,
                Err(e) => {
                    warn!(id = %record.id, "Baseline update failed: {}", e);
                    summary.failed.push(BaselineFailure {
                        id: record.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Baseline pass complete: {} updated, {} skipped, {} failed",
            summary.updated,
            summary.skipped,
            summary.failed.len()
        );
        summary
    }

    /// Process every pending record. Confirmed records keep their decision,
    /// undecided ones are treated as intended.
    pub async fn auto_approve_pending(&self) -> Result<Vec<ConfirmationRecord>> {
        let mut processed = Vec::new();
        for record in self.pending().await {
            let decision = record.is_intended().unwrap_or(true);
            let outcome = self.process_confirmation(&record.id, decision).await?;
            if outcome.newly_processed {
                processed.push(outcome.record);
            }
        }
        info!("Auto-approved {} record(s)", processed.len());
        Ok(processed)
    }

    async fn intended_record(&self, id: &str) -> Result<ConfirmationRecord> {
        let state = self.snapshot().await;
        match state.processed.get(id) {
            Some(record) if record.is_intended() == Some(true) => Ok(record.clone()),
            Some(record) => Err(Error::InvalidState {
                id: id.to_string(),
                expected: "processed and intended".to_string(),
                actual: format!("{} (not intended)", record.status()),
            }),
            None => match state.pending.get(id) {
                Some(record) => Err(Error::InvalidState {
                    id: id.to_string(),
                    expected: "processed and intended".to_string(),
                    actual: record.status().to_string(),
                }),
                None => Err(Error::not_found("confirmation", id)),
            },
        }
    }

    async fn lock_files(&self) -> Result<Vec<visfix_common::FileGuard>> {
        self.inner
            .locks
            .lock_all(&[&self.inner.pending_path, &self.inner.processed_path])
            .await
    }

    /// Replace the cached maps with what is on disk
    async fn refresh(&self, state: &mut Maps) {
        *state = load_maps(&self.inner.pending_path, &self.inner.processed_path).await;
    }

    /// Current contents without taking the file locks. Writers replace
    /// processed before pending, so reading pending first never misses a
    /// record that is moving between the two.
    async fn snapshot(&self) -> Maps {
        let mut state = self.inner.state.lock().await;
        self.refresh(&mut state).await;
        state.clone()
    }

    /// Write the maps; processed first so a crash never loses a decision
    async fn persist(&self, maps: &Maps, processed_changed: bool) -> Result<()> {
        if processed_changed {
            let json = serde_json::to_vec_pretty(&maps.processed)?;
            visfix_common::fs::write_atomic(&self.inner.processed_path, &json).await?;
        }
        let json = serde_json::to_vec_pretty(&maps.pending)?;
        visfix_common::fs::write_atomic(&self.inner.pending_path, &json).await?;
        debug!(
            "Persisted confirmation store ({} pending, {} processed)",
            maps.pending.len(),
            maps.processed.len()
        );
        Ok(())
    }
}

fn decision_label(is_intended: bool) -> &'static str {
    if is_intended {
        "intended"
    } else {
        "regression"
    }
}

async fn load_maps(pending_path: &Path, processed_path: &Path) -> Maps {
    let mut pending = load_map(pending_path).await;
    let mut processed = load_map(processed_path).await;

    // Records filed under the wrong map move to the one their state belongs to
    let misfiled: Vec<String> = pending
        .values()
        .filter(|r| r.status() == ConfirmationStatus::Processed)
        .map(|r| r.id.clone())
        .collect();
    for id in misfiled {
        if let Some(record) = pending.shift_remove(&id) {
            warn!("Record {} in pending file is already processed", id);
            processed.entry(id).or_insert(record);
        }
    }
    let misfiled: Vec<String> = processed
        .values()
        .filter(|r| r.status() != ConfirmationStatus::Processed)
        .map(|r| r.id.clone())
        .collect();
    for id in misfiled {
        if let Some(record) = processed.shift_remove(&id) {
            warn!("Record {} in processed file is not processed", id);
            pending.entry(id).or_insert(record);
        }
    }

    pending.retain(|id, _| {
        let duplicate = processed.contains_key(id);
        if duplicate {
            debug!("Record {} found in both files, keeping the processed copy", id);
        }
        !duplicate
    });

    Maps { pending, processed }
}

async fn load_map(path: &Path) -> RecordMap {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return RecordMap::new();
    }

    let parsed = match visfix_common::fs::read(path).await {
        Ok(data) => serde_json::from_slice::<RecordMap>(&data).map_err(|e| {
            Error::CorruptState {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }),
        Err(e) => Err(e),
    };

    match parsed {
        // Key by the record's own id
        Ok(map) => map.into_values().map(|r| (r.id.clone(), r)).collect(),
        Err(e) => {
            warn!("{}; starting with an empty map", e);
            RecordMap::new()
        }
    }
}
