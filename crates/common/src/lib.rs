//! visfix Common Library
//!
//! Shared types, errors and filesystem infrastructure for the visfix
//! decision-and-repair engine.

pub mod artifact;
pub mod error;
pub mod fs;
pub mod lock;
pub mod types;

// Re-export commonly used types
pub use artifact::ArtifactStore;
pub use error::{Error, Result};
pub use lock::{FileGuard, FileLocks};
pub use types::*;

/// visfix version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".visfix")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
