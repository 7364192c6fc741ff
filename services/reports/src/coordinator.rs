//! Interruptible generation coordinator.
//!
//! Analysis work is CPU-bound and must never occupy the request-handling
//! tasks, so every submission runs on the blocking pool behind a bounded
//! semaphore sized to available parallelism. A submission immediately
//! yields a cancellable job handle; the caller then performs a single
//! bounded wait that returns the result together with its statistics.

use crate::engine::{AnalysisEngine, EngineError, EngineReport};
use crate::error::ReportError;
use crate::filter::RulePredicate;
use anyhow::anyhow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of one generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued behind the worker pool
    Submitted,
    /// Executing on a worker
    Running,
    /// Finished with a result
    Completed,
    /// Bounded wait expired before completion
    TimedOut,
    /// Cancellation landed before completion
    Cancelled,
    /// Engine error or worker panic
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Submitted | Self::Running)
    }
}

/// Statistics attached to a completed generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationStats {
    pub recording_size_bytes: u64,
    pub rules_evaluated: u64,
    pub rules_applicable: u64,
}

/// Result of a completed generation: the report plus its statistics
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub report: EngineReport,
    pub stats: GenerationStats,
}

/// State shared between the job, its handle and the worker task
struct JobShared {
    cancel: CancellationToken,
    state: Mutex<JobState>,
}

impl JobShared {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            state: Mutex::new(JobState::Submitted),
        }
    }

    fn mark_running(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == JobState::Submitted {
            *state = JobState::Running;
        }
    }

    /// Move to a terminal state. The first terminal state wins; later
    /// attempts are no-ops. Returns whether this call landed the state.
    fn try_finish(&self, terminal: JobState) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            false
        } else {
            *state = terminal;
            true
        }
    }

    fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }
}

/// Cancellable reference to an in-flight generation
///
/// Cheap to clone; held by the cleanup guard so cancellation fires on every
/// request exit path.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    /// Request best-effort cancellation. Idempotent; a no-op once the job
    /// reached a terminal state.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        if self.shared.try_finish(JobState::Cancelled) {
            debug!("Generation job cancelled");
            metrics::counter!("reports.jobs.cancelled").increment(1);
        }
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }
}

/// An in-flight generation owned by a single request
pub struct GenerationJob {
    shared: Arc<JobShared>,
    rx: oneshot::Receiver<Result<GenerationOutput, EngineError>>,
}

impl GenerationJob {
    /// Handle for cancellation and state inspection
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Wait for completion, bounded by the remaining request budget.
    ///
    /// A single wait yields both the report and its statistics; on timeout
    /// the job is left for the cleanup guard to cancel.
    pub async fn wait(self, budget: Duration) -> Result<GenerationOutput, ReportError> {
        match tokio::time::timeout(budget, self.rx).await {
            Err(_) => {
                self.shared.try_finish(JobState::TimedOut);
                Err(ReportError::GenerationTimedOut)
            }
            Ok(Err(_)) => {
                self.shared.try_finish(JobState::Failed);
                Err(ReportError::GenerationExecutionFailed(anyhow!(
                    "generation worker dropped without producing a result"
                )))
            }
            Ok(Ok(Ok(output))) => {
                // Completion races with cancellation; whichever terminal
                // state landed first stands.
                self.shared.try_finish(JobState::Completed);
                Ok(output)
            }
            Ok(Ok(Err(EngineError::Cancelled))) => {
                self.shared.try_finish(JobState::Cancelled);
                Err(ReportError::GenerationExecutionFailed(anyhow!(
                    EngineError::Cancelled
                )))
            }
            Ok(Ok(Err(e))) => {
                self.shared.try_finish(JobState::Failed);
                Err(ReportError::GenerationExecutionFailed(e.into()))
            }
        }
    }
}

/// Submits recordings to the analysis engine on a shared bounded pool
pub struct GenerationCoordinator {
    engine: Arc<dyn AnalysisEngine>,
    permits: Arc<Semaphore>,
}

impl GenerationCoordinator {
    /// Coordinator with `workers` concurrent analysis slots
    pub fn new(engine: Arc<dyn AnalysisEngine>, workers: usize) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Submit a recording for analysis. Returns immediately with a
    /// cancellable job; the work itself queues behind the worker pool.
    pub fn submit(&self, recording_path: PathBuf, predicate: RulePredicate) -> GenerationJob {
        let shared = Arc::new(JobShared::new());
        let (tx, rx) = oneshot::channel();

        let engine = Arc::clone(&self.engine);
        let permits = Arc::clone(&self.permits);
        let worker_shared = Arc::clone(&shared);

        tokio::spawn(async move {
            // A cancel that lands while still queued skips the engine
            // entirely.
            let permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = tx.send(Err(EngineError::Evaluation(
                            "worker pool is closed".to_string(),
                        )));
                        return;
                    }
                },
                () = worker_shared.cancel.cancelled() => {
                    let _ = tx.send(Err(EngineError::Cancelled));
                    return;
                }
            };

            worker_shared.mark_running();
            let cancel = worker_shared.cancel.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let data = std::fs::read(&recording_path).map_err(|e| {
                    EngineError::Evaluation(format!(
                        "failed to read recording {}: {e}",
                        recording_path.display()
                    ))
                })?;
                let recording_size_bytes = data.len() as u64;
                let report = engine.evaluate(&data, &predicate, &cancel)?;
                Ok(GenerationOutput {
                    stats: GenerationStats {
                        recording_size_bytes,
                        rules_evaluated: report.rules_evaluated,
                        rules_applicable: report.rules_applicable,
                    },
                    report,
                })
            })
            .await;
            drop(permit);

            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Generation worker panicked");
                    Err(EngineError::Evaluation(format!("worker panicked: {e}")))
                }
            };
            let _ = tx.send(result);
        });

        GenerationJob { shared, rx }
    }
}
