//! Knowledge base of verified fixes
//!
//! Maps a fingerprint of an erroneous declaration to the value that fixed it.
//! Only verified successes create or update entries.
//!
//! The file is shared with other processes. Writes re-read it under the file
//! lock and reads go to disk, so the cached map only serves this process.

use crate::locator::{normalize_selector, PropertyLocation, Stylesheet};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use visfix_common::{FileLocks, Result};

/// SHA-256 over the normalized (selector, property, erroneous value)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(selector: &str, property: &str, erroneous_value: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            normalize_selector(selector),
            property.trim().to_ascii_lowercase(),
            erroneous_value.split_whitespace().collect::<Vec<_>>().join(" "),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept a full hex digest typed by a user
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        (s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())).then_some(Self(s))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A property change as it was applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleFix {
    pub selector: String,
    pub property: String,
    pub erroneous_value: String,
    pub value: String,
}

impl StyleFix {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.selector, &self.property, &self.erroneous_value)
    }
}

/// A verified fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRecord {
    #[serde(skip)]
    pub fingerprint: Option<Fingerprint>,
    pub selector: String,
    pub property: String,
    pub value: String,
    #[serde(default)]
    pub erroneous_value: String,
    pub applied_at: DateTime<Utc>,
    pub success_count: u64,
}

type Entries = IndexMap<Fingerprint, FixRecord>;

/// File-backed fingerprint → fix map
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    path: PathBuf,
    locks: FileLocks,
    entries: Arc<Mutex<Entries>>,
}

impl KnowledgeBase {
    /// Load the knowledge base. A missing or corrupt file starts empty.
    pub async fn open(path: impl AsRef<Path>, locks: FileLocks) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = load_entries(&path).await;
        debug!("Loaded {} knowledge base entries from {}", entries.len(), path.display());
        Self {
            path,
            locks,
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<FixRecord> {
        self.snapshot().await.get(fingerprint).cloned()
    }

    async fn snapshot(&self) -> Entries {
        let mut entries = self.entries.lock().await;
        *entries = load_entries(&self.path).await;
        entries.clone()
    }

    /// Record the outcome of an applied fix. Failures leave the knowledge
    /// base untouched; successes create the entry or bump its count.
    pub async fn record(&self, fingerprint: &Fingerprint, fix: &StyleFix, success: bool) -> Result<Option<FixRecord>> {
        if !success {
            debug!("Not recording failed fix {}", fingerprint);
            return Ok(None);
        }

        let _guard = self.locks.lock(&self.path).await?;
        let mut entries = self.entries.lock().await;
        *entries = load_entries(&self.path).await;

        let mut next = entries.clone();
        let now = Utc::now();
        let record = next
            .entry(fingerprint.clone())
            .and_modify(|r| {
                r.value = fix.value.clone();
                r.applied_at = now;
                r.success_count += 1;
            })
            .or_insert_with(|| FixRecord {
                fingerprint: Some(fingerprint.clone()),
                selector: fix.selector.clone(),
                property: fix.property.clone(),
                value: fix.value.clone(),
                erroneous_value: fix.erroneous_value.clone(),
                applied_at: now,
                success_count: 1,
            })
            .clone();

        let json = serde_json::to_vec_pretty(&next)?;
        visfix_common::fs::write_atomic(&self.path, &json).await?;
        *entries = next;

        info!(
            fingerprint = %fingerprint,
            selector = %record.selector,
            property = %record.property,
            "Recorded fix {} (successes: {})",
            record.value,
            record.success_count
        );
        Ok(Some(record))
    }

    /// Entries, most successful first
    pub async fn entries(&self) -> Vec<FixRecord> {
        let mut records: Vec<FixRecord> = self.snapshot().await.into_values().collect();
        records.sort_by(|a, b| b.success_count.cmp(&a.success_count));
        records
    }

    /// Find a stored fix whose erroneous declaration is present in `sheet`
    pub async fn match_stylesheet(&self, sheet: &Stylesheet) -> Option<(FixRecord, PropertyLocation)> {
        for record in self.entries().await {
            let Ok(location) = sheet.locate(&record.selector, &record.property) else {
                continue;
            };
            let observed = Fingerprint::compute(&record.selector, &record.property, &location.value);
            if record.fingerprint.as_ref() == Some(&observed) && location.value != record.value {
                debug!("Stylesheet {} matches stored fix {}", sheet.path().display(), observed);
                return Some((record, location));
            }
        }
        None
    }
}

async fn load_entries(path: &Path) -> Entries {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Entries::new();
    }

    let parsed = match visfix_common::fs::read(path).await {
        Ok(data) => serde_json::from_slice::<Entries>(&data).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match parsed {
        Ok(mut entries) => {
            for (fingerprint, record) in entries.iter_mut() {
                record.fingerprint = Some(fingerprint.clone());
            }
            entries
        }
        Err(reason) => {
            warn!("Knowledge base {} is unreadable, starting empty: {}", path.display(), reason);
            Entries::new()
        }
    }
}
