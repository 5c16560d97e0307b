//! Core types for visfix

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Reference to a stored screenshot artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(PathBuf);

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Artifact kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Baseline,
    Current,
    Diff,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Baseline => "baseline",
            ArtifactKind::Current => "current",
            ArtifactKind::Diff => "diff",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookup key for an artifact: (kind, page name, optional run id)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub kind: ArtifactKind,
    pub name: String,
    pub run_id: Option<String>,
}

impl ArtifactKey {
    pub fn new(kind: ArtifactKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            run_id: None,
        }
    }

    pub fn baseline(name: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Baseline, name)
    }

    pub fn current(name: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Current, name)
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Decision state of a confirmation record.
///
/// Serialized flat into the record as `status` plus the fields the state
/// carries, so a processed record without a decision cannot be expressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationState {
    Pending,
    Confirmed {
        #[serde(rename = "isIntended")]
        is_intended: bool,
    },
    Processed {
        #[serde(rename = "isIntended")]
        is_intended: bool,
        #[serde(rename = "processedAt")]
        processed_at: DateTime<Utc>,
        #[serde(
            rename = "baselineUpdatedAt",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        baseline_updated_at: Option<DateTime<Utc>>,
    },
}

/// Status without payload, for display and error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Processed,
}

impl fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationStatus::Pending => write!(f, "pending"),
            ConfirmationStatus::Confirmed => write!(f, "confirmed"),
            ConfirmationStatus::Processed => write!(f, "processed"),
        }
    }
}

/// A recorded decision about whether a detected visual diff was intended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRecord {
    pub id: String,
    /// Page name the diff was detected on
    pub name: String,
    #[serde(flatten)]
    pub state: ConfirmationState,
    pub diff_percentage: f64,
    pub baseline_ref: ArtifactRef,
    pub current_ref: ArtifactRef,
    pub created_at: DateTime<Utc>,
}

impl ConfirmationRecord {
    /// New pending record. An empty id is replaced by a generated one.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        diff_percentage: f64,
        baseline_ref: ArtifactRef,
        current_ref: ArtifactRef,
    ) -> Self {
        let mut id = id.into();
        if id.is_empty() {
            id = uuid::Uuid::new_v4().to_string();
        }
        Self {
            id,
            name: name.into(),
            state: ConfirmationState::Pending,
            diff_percentage,
            baseline_ref,
            current_ref,
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> ConfirmationStatus {
        match self.state {
            ConfirmationState::Pending => ConfirmationStatus::Pending,
            ConfirmationState::Confirmed { .. } => ConfirmationStatus::Confirmed,
            ConfirmationState::Processed { .. } => ConfirmationStatus::Processed,
        }
    }

    /// The recorded decision; `None` while pending
    pub fn is_intended(&self) -> Option<bool> {
        match self.state {
            ConfirmationState::Pending => None,
            ConfirmationState::Confirmed { is_intended }
            | ConfirmationState::Processed { is_intended, .. } => Some(is_intended),
        }
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            ConfirmationState::Processed { processed_at, .. } => Some(processed_at),
            _ => None,
        }
    }

    pub fn baseline_updated_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            ConfirmationState::Processed {
                baseline_updated_at,
                ..
            } => baseline_updated_at,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConfirmationRecord {
        ConfirmationRecord::new(
            "c1",
            "form",
            3.5,
            ArtifactRef::new("baseline/form.png"),
            ArtifactRef::new("current/form.png"),
        )
    }

    #[test]
    fn test_generated_id_when_empty() {
        let rec = ConfirmationRecord::new(
            "",
            "form",
            1.0,
            ArtifactRef::new("b.png"),
            ArtifactRef::new("c.png"),
        );
        assert!(uuid::Uuid::parse_str(&rec.id).is_ok());
    }

    #[test]
    fn test_pending_has_no_decision() {
        let rec = record();
        assert_eq!(rec.status(), ConfirmationStatus::Pending);
        assert_eq!(rec.is_intended(), None);
        assert!(rec.processed_at().is_none());
    }

    #[test]
    fn test_record_json_layout() {
        let mut rec = record();
        rec.state = ConfirmationState::Processed {
            is_intended: true,
            processed_at: Utc::now(),
            baseline_updated_at: None,
        };

        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["status"], "processed");
        assert_eq!(value["isIntended"], true);
        assert_eq!(value["baselineRef"], "baseline/form.png");
        assert!(value.get("processedAt").is_some());
        assert!(value.get("baselineUpdatedAt").is_none());

        let back: ConfirmationRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_processed_without_decision_is_rejected() {
        let json = serde_json::json!({
            "id": "c1",
            "name": "form",
            "status": "processed",
            "processedAt": "2024-01-01T00:00:00Z",
            "diffPercentage": 2.0,
            "baselineRef": "b.png",
            "currentRef": "c.png",
            "createdAt": "2024-01-01T00:00:00Z"
        });
        assert!(serde_json::from_value::<ConfirmationRecord>(json).is_err());
    }
}
