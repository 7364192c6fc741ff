//! Reports Service
//!
//! HTTP service generating automated analysis reports for uploaded
//! profiling recordings. A request flows through a single pipeline:
//! the upload is streamed to a temp file, transparently decompressed,
//! admitted against a memory budget and the request deadline, matched
//! against an optional rule filter, and submitted to the analysis engine
//! on a bounded worker pool under the remaining time budget. A cleanup
//! guard cancels the job and deletes the temp file on every exit path,
//! including client disconnect.
//!
//! ```text
//! POST /report
//!      │
//!      ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Upload       │───▶│ Filter       │───▶│ Generation   │
//! │ Admission    │    │ Predicate    │    │ Coordinator  │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!   decompress,          rule catalog       bounded pool,
//!   memory budget,       token match        cancellable job,
//!   deadline check                          single bounded wait
//!      │                                        │
//!      └────────────────┬───────────────────────┘
//!                       ▼
//!                ┌──────────────┐
//!                │ Cleanup      │  cancel + delete + telemetry
//!                │ Guard        │  on every exit path
//!                └──────────────┘
//! ```

pub mod admission;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod filter;
pub mod report_api;

pub use admission::{TimeBudget, UploadAdmission, UploadedRecording};
pub use cleanup::CleanupGuard;
pub use config::Config;
pub use coordinator::{
    GenerationCoordinator, GenerationJob, GenerationOutput, GenerationStats, JobHandle, JobState,
};
pub use engine::{AnalysisEngine, EngineError, EngineReport, RuleBasedEngine, RuleEvaluation};
pub use error::{ErrorResponse, ReportError};
pub use filter::{RuleCatalog, RuleMetadata, RulePredicate};
pub use report_api::{create_router, start_api_server, AppState};
