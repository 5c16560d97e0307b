//! Engine configuration

use crate::collaborators::StyleTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use visfix_common::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding pending.json, processed.json and knowledge.json
    pub store_path: PathBuf,

    /// Screenshot artifact root
    pub artifacts_path: Option<PathBuf>,

    /// Backup root
    pub backup_path: Option<PathBuf>,

    /// Diff percentage above which a comparison becomes a pending record
    pub threshold: f64,

    /// Diff percentage a patched page must stay within; defaults to `threshold`
    pub verify_threshold: Option<f64>,

    /// Process undecided records as intended (CI)
    pub auto_approve: bool,

    /// Stylesheet used for pages without their own entry
    pub default_stylesheet: Option<PathBuf>,

    /// Per-page stylesheet and suspect declaration
    pub pages: BTreeMap<String, PageConfig>,

    pub timeouts: TimeoutConfig,

    pub backups: BackupConfig,

    pub harness: HarnessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: visfix_common::default_store_path(),
            artifacts_path: None,
            backup_path: None,
            threshold: 0.5,
            verify_threshold: None,
            auto_approve: false,
            default_stylesheet: None,
            pages: BTreeMap::new(),
            timeouts: TimeoutConfig::default(),
            backups: BackupConfig::default(),
            harness: HarnessConfig::default(),
        }
    }
}

/// Page-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub stylesheet: Option<PathBuf>,
    /// Selector of the declaration most likely to regress on this page
    pub selector: Option<String>,
    pub property: Option<String>,
}

/// Collaborator call timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub capture_secs: u64,
    pub compare_secs: u64,
    pub generate_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture_secs: 60,
            compare_secs: 30,
            generate_secs: 120,
        }
    }
}

impl TimeoutConfig {
    pub fn capture(&self) -> Duration {
        Duration::from_secs(self.capture_secs)
    }

    pub fn compare(&self) -> Duration {
        Duration::from_secs(self.compare_secs)
    }

    pub fn generate(&self) -> Duration {
        Duration::from_secs(self.generate_secs)
    }
}

/// Backup retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Released backups kept by `prune`
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { keep: 20 }
    }
}

/// Commands and tolerances for the bundled collaborator adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Screenshot command; `{page}` and `{output}` are substituted
    pub capture_command: Vec<String>,

    /// Fix generator command; reads a JSON context on stdin
    pub fix_command: Vec<String>,

    /// Per-channel difference below which pixels count as equal
    pub tolerance: u8,

    /// Write a diff image for every comparison
    pub save_diffs: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            capture_command: Vec::new(),
            fix_command: Vec::new(),
            tolerance: 5,
            save_diffs: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(path, content).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("threshold", Some(self.threshold)), ("verify_threshold", self.verify_threshold)] {
            if let Some(v) = value {
                if !(0.0..=100.0).contains(&v) {
                    return Err(Error::InvalidConfig(format!(
                        "{} must be within 0..=100, got {}",
                        name, v
                    )));
                }
            }
        }
        for (page, cfg) in &self.pages {
            if cfg.selector.is_some() != cfg.property.is_some() {
                return Err(Error::InvalidConfig(format!(
                    "page {}: selector and property must be set together",
                    page
                )));
            }
        }
        Ok(())
    }

    pub fn pending_path(&self) -> PathBuf {
        self.store_path.join("pending.json")
    }

    pub fn processed_path(&self) -> PathBuf {
        self.store_path.join("processed.json")
    }

    pub fn kb_path(&self) -> PathBuf {
        self.store_path.join("knowledge.json")
    }

    /// Advisory lock files shared by every process using this store
    pub fn lock_path(&self) -> PathBuf {
        self.store_path.join("locks")
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.artifacts_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("artifacts"))
    }

    pub fn backup_path(&self) -> PathBuf {
        self.backup_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("backups"))
    }

    pub fn verify_threshold(&self) -> f64 {
        self.verify_threshold.unwrap_or(self.threshold)
    }

    /// Stylesheet for a page, falling back to `default_stylesheet`
    pub fn stylesheet_for(&self, page: &str) -> Result<PathBuf> {
        self.pages
            .get(page)
            .and_then(|p| p.stylesheet.clone())
            .or_else(|| self.default_stylesheet.clone())
            .ok_or_else(|| Error::InvalidConfig(format!("no stylesheet configured for page {}", page)))
    }

    pub fn suspect_for(&self, page: &str) -> Option<StyleTarget> {
        let page = self.pages.get(page)?;
        Some(StyleTarget {
            selector: page.selector.clone()?,
            property: page.property.clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_default() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.threshold, 0.5);
        assert_eq!(config.verify_threshold(), 0.5);
        assert_eq!(config.harness.tolerance, 5);
    }

    #[test]
    fn test_load_pages_and_derived_paths() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
store_path = "/var/lib/visfix"
threshold = 1.0
default_stylesheet = "site.css"

[pages.form]
stylesheet = "form.css"
selector = ".btn-primary"
property = "background-color"

[timeouts]
capture_secs = 5
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.pending_path(), PathBuf::from("/var/lib/visfix/pending.json"));
        assert_eq!(config.backup_path(), PathBuf::from("/var/lib/visfix/backups"));
        assert_eq!(config.lock_path(), PathBuf::from("/var/lib/visfix/locks"));
        assert_eq!(config.stylesheet_for("form").unwrap(), PathBuf::from("form.css"));
        assert_eq!(config.stylesheet_for("home").unwrap(), PathBuf::from("site.css"));
        assert_eq!(config.suspect_for("form").unwrap().property, "background-color");
        assert!(config.suspect_for("home").is_none());
        assert_eq!(config.timeouts.capture(), Duration::from_secs(5));
        assert_eq!(config.timeouts.generate_secs, 120);
    }

    #[test]
    fn test_rejects_half_suspect() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[pages.form]\nselector = \".a\"\n").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_save_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let mut config = EngineConfig::default();
        config.auto_approve = true;
        config.save(&path).unwrap();
        assert!(EngineConfig::load(&path).unwrap().auto_approve);
    }
}
