//! visfix collaborator adapters
//!
//! Implementations of the engine's `Capture`, `Compare` and `FixGenerator`
//! contracts:
//!
//! - [`PixelComparator`]: per-pixel comparison with a channel tolerance,
//!   writing a diff image next to the screenshots
//! - [`CommandCapture`]: runs an external screenshot command
//!   (Playwright, a headless browser script, ...)
//! - [`CommandFixGenerator`]: hands a JSON fix context to an external
//!   command and reads back a JSON suggestion

pub mod capture;
pub mod comparator;
pub mod error;
pub mod fixgen;

pub use capture::CommandCapture;
pub use comparator::{PixelComparator, VisualDiff};
pub use error::{HarnessError, HarnessResult};
pub use fixgen::CommandFixGenerator;

use std::sync::Arc;
use visfix_common::ArtifactStore;
use visfix_engine::{Collaborators, EngineConfig, FixGenerator};

/// Build the command-backed collaborators described by `config`
pub fn collaborators(config: &EngineConfig, artifacts: ArtifactStore) -> Collaborators {
    let capture = CommandCapture::new(&config.harness.capture_command, artifacts.clone());
    let compare = PixelComparator::new(artifacts, config.harness.tolerance).with_diffs(config.harness.save_diffs);
    let fix_generator = if config.harness.fix_command.is_empty() {
        None
    } else {
        Some(Arc::new(CommandFixGenerator::new(&config.harness.fix_command)) as Arc<dyn FixGenerator>)
    };

    Collaborators {
        capture: Arc::new(capture),
        compare: Arc::new(compare),
        fix_generator,
    }
}
