use std::path::Path;
use log::{error, info, warn};
use crate::converter::ConversionOutcome;
use crate::orchestrator::AlbumOutcome;
use crate::session::{AlbumStatus, ProcessingStage};

/// Receives progress events from the orchestrator.
///
/// Every method has an empty default so an observer only implements what it
/// cares about.
pub trait PipelineObserver: Send + Sync {
    fn album_started(&self, _index: usize, _total: usize, _album: &Path) {}

    fn stage_started(&self, _album: &str, _stage: ProcessingStage) {}

    fn file_converted(&self, _relative: &Path, _outcome: &ConversionOutcome) {}

    /// A single attempt failed; `attempt == max_attempts` means the file is given up
    fn file_failed(&self, _relative: &Path, _attempt: u32, _max_attempts: u32, _message: &str) {}

    fn album_finished(&self, _outcome: &AlbumOutcome) {}

    fn warning(&self, _message: &str) {}
}

/// Forwards pipeline events to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl PipelineObserver for LogObserver {
    fn album_started(&self, index: usize, total: usize, album: &Path) {
        info!("💿 [{}/{}] {}", index, total, album.display());
    }

    fn stage_started(&self, album: &str, stage: ProcessingStage) {
        info!("  [{}] {}", stage.as_str().to_uppercase(), album);
    }

    fn file_converted(&self, relative: &Path, outcome: &ConversionOutcome) {
        if outcome.skipped {
            info!("  ↻ {} (already converted)", relative.display());
        } else {
            info!("  ✓ {} ({:.1}s)", relative.display(), outcome.duration_secs);
        }
    }

    fn file_failed(&self, relative: &Path, attempt: u32, max_attempts: u32, message: &str) {
        if attempt >= max_attempts {
            error!("  ✗ {} failed after {} attempt(s): {}", relative.display(), attempt, message);
        } else {
            warn!("  Attempt {}/{} failed for {}: {}", attempt, max_attempts, relative.display(), message);
        }
    }

    fn album_finished(&self, outcome: &AlbumOutcome) {
        match outcome.status {
            AlbumStatus::Completed => info!(
                "✅ {} completed: {} converted, {} already present",
                outcome.name, outcome.files_converted, outcome.files_skipped
            ),
            AlbumStatus::Skipped => info!(
                "⏭️  {} skipped: {}",
                outcome.name,
                outcome.message.as_deref().unwrap_or("already processed")
            ),
            _ => error!(
                "❌ {} failed at {}: {}",
                outcome.name,
                outcome.stage.map(|s| s.as_str()).unwrap_or("unknown stage"),
                outcome.message.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    fn warning(&self, message: &str) {
        warn!("⚠️  {}", message);
    }
}
