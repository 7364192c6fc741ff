//! Scoped cleanup for report requests.
//!
//! A [`CleanupGuard`] owns the admitted temp file and the job handle for
//! the lifetime of one request. Dropping it cancels the job, deletes the
//! temp file and emits the request completion event. Because axum drops
//! the handler future when the client disconnects, guard drop is the single
//! mechanism covering success, error, timeout and disconnect alike.

use crate::coordinator::{GenerationStats, JobHandle};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Guard ensuring cancellation, temp-file deletion and telemetry on every
/// request exit path
pub struct CleanupGuard {
    path: Option<PathBuf>,
    display_name: String,
    started: Instant,
    job: Option<JobHandle>,
    stats: Option<GenerationStats>,
}

impl CleanupGuard {
    /// Guard a freshly written upload
    pub fn new(path: PathBuf, display_name: String, started: Instant) -> Self {
        Self {
            path: Some(path),
            display_name,
            started,
            job: None,
            stats: None,
        }
    }

    /// Track a replacement temp file (after decompression). The previous
    /// file has already been deleted by admission.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// Register the job handle so cancellation fires on drop
    pub fn attach_job(&mut self, job: JobHandle) {
        self.job = Some(job);
    }

    /// Record generation statistics for the completion event
    pub fn record_stats(&mut self, stats: GenerationStats) {
        self.stats = Some(stats);
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            job.cancel();
        }

        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "Deleted temp recording"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Admission already removed a rejected replacement
                    debug!(path = %path.display(), "Temp recording already removed");
                }
                Err(e) => {
                    // Deletion failure never fails the request
                    warn!(path = %path.display(), error = %e, "Failed to delete temp recording");
                    metrics::counter!("reports.cleanup.delete_failed").increment(1);
                }
            }
        }

        let elapsed = self.started.elapsed();
        metrics::histogram!("reports.request.duration_seconds").record(elapsed.as_secs_f64());
        metrics::counter!("reports.requests.completed").increment(1);
        match self.stats {
            Some(stats) => info!(
                file = %self.display_name,
                elapsed_ms = elapsed.as_millis() as u64,
                recording_size_bytes = stats.recording_size_bytes,
                rules_evaluated = stats.rules_evaluated,
                rules_applicable = stats.rules_applicable,
                "Completed report request"
            ),
            None => info!(
                file = %self.display_name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Completed report request"
            ),
        }
    }
}
