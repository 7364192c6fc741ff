//! HTTP surface for the report service.
//!
//! `POST /report` drives the whole pipeline: the multipart upload is
//! streamed to a temp file, admitted against the memory and time budgets,
//! matched against the rule filter and submitted for interruptible
//! generation. A [`CleanupGuard`] created as soon as the upload hits disk
//! covers every exit path, including the client disconnecting (axum drops
//! the handler future, which drops the guard).

use crate::admission::{TimeBudget, UploadAdmission, UploadedRecording};
use crate::cleanup::CleanupGuard;
use crate::config::{ApiConfig, Config};
use crate::coordinator::GenerationCoordinator;
use crate::engine::{render_html, RuleBasedEngine};
use crate::error::ReportError;
use crate::filter::{RuleCatalog, RulePredicate};
use anyhow::{Context, Result};
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Upper bound for the raw request body; the real size gate is the
/// memory-budget admission check after decompression.
const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<UploadAdmission>,
    pub coordinator: Arc<GenerationCoordinator>,
    pub catalog: &'static RuleCatalog,
    pub request_timeout: Duration,
    /// Directory receiving uploaded recordings
    pub temp_dir: PathBuf,
}

impl AppState {
    /// Wire the default pipeline from configuration
    pub fn from_config(config: &Config) -> Self {
        let catalog = RuleCatalog::global();
        let engine = Arc::new(RuleBasedEngine::new(catalog));
        Self {
            admission: Arc::new(UploadAdmission::new(config.limits.memory_factor)),
            coordinator: Arc::new(GenerationCoordinator::new(engine, config.worker_threads())),
            catalog,
            request_timeout: config.request_timeout(),
            temp_dir: std::env::temp_dir(),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/report", post(generate_report))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Generate a report for an uploaded recording
#[instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn generate_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ReportError> {
    let budget = TimeBudget::start(state.request_timeout);
    metrics::counter!("reports.requests.received").increment(1);

    let mut upload: Option<(UploadedRecording, CleanupGuard)> = None;
    let mut filter: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ReportError::InvalidRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let display_name = field
                    .file_name()
                    .unwrap_or("recording")
                    .to_string();
                let path = write_upload_to_temp(field, &state.temp_dir).await?;
                // Guard the file before anything else can fail
                let guard =
                    CleanupGuard::new(path.clone(), display_name.clone(), budget.started_at());
                let recording = UploadedRecording::examine(path, display_name)?;
                info!(
                    file = %recording.display_name,
                    size_bytes = recording.size_bytes,
                    compressed = recording.is_compressed,
                    "Received report request"
                );
                upload = Some((recording, guard));
            }
            Some("filter") => {
                filter = Some(field.text().await.map_err(|e| {
                    ReportError::InvalidRequest(format!("unreadable filter field: {e}"))
                })?);
            }
            _ => {}
        }
    }

    let (recording, mut guard) = upload.ok_or_else(|| {
        ReportError::InvalidRequest("missing required form field `file`".to_string())
    })?;

    let (admitted, remaining) = state.admission.admit(recording, &budget).await?;
    guard.set_path(admitted.path.clone());

    let predicate = RulePredicate::parse(state.catalog, filter.as_deref());
    debug!(
        selected_rules = predicate.selected_count(state.catalog),
        "Parsed rule filter"
    );

    let job = state.coordinator.submit(admitted.path.clone(), predicate);
    guard.attach_job(job.handle());

    let output = job.wait(remaining).await?;
    guard.record_stats(output.stats);

    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));
    if wants_html {
        Ok(Html(render_html(&output.report)).into_response())
    } else {
        Ok(Json(output.report.evaluations).into_response())
    }
}

/// Stream a multipart file field to a fresh temp file
async fn write_upload_to_temp(
    mut field: Field<'_>,
    dir: &std::path::Path,
) -> Result<PathBuf, ReportError> {
    let tmp = tempfile::Builder::new()
        .prefix("reports-")
        .suffix(".upload")
        .tempfile_in(dir)?;
    let (file, path) = tmp.keep().map_err(|e| ReportError::Io(e.error))?;
    let mut file = tokio::fs::File::from_std(file);

    let written = async {
        while let Some(chunk) = field.chunk().await.map_err(|e| {
            ReportError::InvalidRequest(format!("failed to read upload: {e}"))
        })? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok::<(), ReportError>(())
    }
    .await;

    match written {
        Ok(()) => Ok(path),
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            Err(e)
        }
    }
}

/// Start the report API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting report API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AnalysisEngine, EngineError, EngineReport, RuleEvaluation};
    use axum::body::Body;
    use axum::http::Request;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    const BOUNDARY: &str = "reports-test-boundary";

    /// Engine that spins for its busy period, polling cancellation
    struct SlowEngine {
        busy: Duration,
    }

    impl AnalysisEngine for SlowEngine {
        fn evaluate(
            &self,
            _recording: &[u8],
            _predicate: &RulePredicate,
            cancel: &CancellationToken,
        ) -> Result<EngineReport, EngineError> {
            let started = Instant::now();
            while started.elapsed() < self.busy {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(EngineReport {
                evaluations: BTreeMap::new(),
                rules_evaluated: 0,
                rules_applicable: 0,
            })
        }
    }

    /// State writing all temp files into a fresh scoped directory, so
    /// tests can assert nothing is left behind
    fn test_state(timeout: Duration, available_bytes: u64) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = RuleCatalog::global();
        let state = AppState {
            admission: Arc::new(
                UploadAdmission::with_probe(10, Box::new(move || available_bytes))
                    .in_temp_dir(dir.path()),
            ),
            coordinator: Arc::new(GenerationCoordinator::new(
                Arc::new(RuleBasedEngine::new(catalog)),
                2,
            )),
            catalog,
            request_timeout: timeout,
            temp_dir: dir.path().to_path_buf(),
        };
        (state, dir)
    }

    fn residual_files(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn multipart_request(
        accept: &str,
        file: Option<(&str, &[u8])>,
        filter: Option<&str>,
    ) -> Request<Body> {
        let mut body = Vec::new();
        if let Some((name, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
                     filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        if let Some(filter) = filter {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"filter\"\r\n\r\n\
                     {filter}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/report")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::ACCEPT, accept)
            .body(Body::from(body))
            .unwrap()
    }

    fn gzip(content: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    async fn json_body(response: Response) -> BTreeMap<String, RuleEvaluation> {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let evaluations: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(&bytes).unwrap();
        evaluations
            .into_iter()
            .map(|(id, v)| {
                (
                    id,
                    RuleEvaluation {
                        score: v["score"].as_f64().unwrap(),
                        name: v["name"].as_str().unwrap().to_string(),
                        topic: v["topic"].as_str().unwrap().to_string(),
                        explanation: v["explanation"].as_str().unwrap().to_string(),
                    },
                )
            })
            .collect()
    }

    const SAMPLE_RECORDING: &[u8] =
        b"synthetic profiling recording payload with enough bytes to evaluate";

    #[tokio::test]
    async fn test_health_returns_204() {
        let (state, _dir) = test_state(Duration::from_secs(30), 1 << 30);
        let router = create_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_json_report_is_non_empty() {
        let (state, dir) = test_state(Duration::from_secs(30), 1 << 30);
        let response = create_router(state)
            .oneshot(multipart_request(
                "application/json",
                Some(("sample.jfr", SAMPLE_RECORDING)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(residual_files(dir.path()), Vec::<String>::new());

        let evaluations = json_body(response).await;
        assert!(!evaluations.is_empty());
        for eval in evaluations.values() {
            assert!((0.0..=100.0).contains(&eval.score) || eval.score < 0.0);
            assert!(!eval.name.is_empty());
            assert!(!eval.topic.is_empty());
        }
    }

    #[tokio::test]
    async fn test_html_report_has_title() {
        let (state, _dir) = test_state(Duration::from_secs(30), 1 << 30);
        let router = create_router(state);
        let response = router
            .oneshot(multipart_request(
                "text/html",
                Some(("sample.jfr", SAMPLE_RECORDING)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("<title>Automated Analysis Result Overview</title>"));
    }

    #[tokio::test]
    async fn test_compressed_and_plain_uploads_are_equivalent() {
        let (state, dir) = test_state(Duration::from_secs(30), 1 << 30);

        let plain = create_router(state.clone())
            .oneshot(multipart_request(
                "application/json",
                Some(("sample.jfr", SAMPLE_RECORDING)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(plain.status(), StatusCode::OK);

        let compressed = create_router(state)
            .oneshot(multipart_request(
                "application/json",
                Some(("sample.jfr.gz", &gzip(SAMPLE_RECORDING))),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(compressed.status(), StatusCode::OK);
        assert_eq!(residual_files(dir.path()), Vec::<String>::new());

        assert_eq!(json_body(plain).await, json_body(compressed).await);
    }

    #[tokio::test]
    async fn test_unknown_filter_tokens_yield_empty_result() {
        let (state, _dir) = test_state(Duration::from_secs(30), 1 << 30);
        let router = create_router(state);
        let response = router
            .oneshot(multipart_request(
                "application/json",
                Some(("sample.jfr", SAMPLE_RECORDING)),
                Some("NoSuchRule,bogus_topic"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_filter_tokens_select_union_of_valid_matches() {
        let (state, _dir) = test_state(Duration::from_secs(30), 1 << 30);
        let catalog = state.catalog;
        let router = create_router(state);
        let response = router
            .oneshot(multipart_request(
                "application/json",
                Some(("sample.jfr", SAMPLE_RECORDING)),
                Some("LongGcPause,NoSuchRule,heap"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let evaluations = json_body(response).await;
        let mut expected: Vec<String> = catalog
            .rules()
            .iter()
            .filter(|r| r.id == "LongGcPause" || r.topic == "heap")
            .map(|r| r.id.clone())
            .collect();
        expected.sort();
        let got: Vec<String> = evaluations.keys().cloned().collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_oversized_upload_returns_413() {
        // 1000 / 10 => 100 byte ceiling
        let (state, dir) = test_state(Duration::from_secs(30), 1000);
        let payload = vec![0u8; 4096];
        let response = create_router(state)
            .oneshot(multipart_request(
                "application/json",
                Some(("big.jfr", &payload)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(residual_files(dir.path()), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_oversized_gzip_upload_returns_413_without_residue() {
        let (state, dir) = test_state(Duration::from_secs(30), 1000);
        let payload = gzip(&vec![0u8; 4096]);
        let response = create_router(state)
            .oneshot(multipart_request(
                "application/json",
                Some(("big.jfr.gz", &payload)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(residual_files(dir.path()), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_missing_file_field_returns_400() {
        let (state, _dir) = test_state(Duration::from_secs(30), 1 << 30);
        let router = create_router(state);
        let response = router
            .oneshot(multipart_request("application/json", None, Some("heap")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_exhausted_deadline_before_generation_returns_504() {
        let (state, dir) = test_state(Duration::ZERO, 1 << 30);
        let response = create_router(state)
            .oneshot(multipart_request(
                "application/json",
                Some(("sample.jfr", SAMPLE_RECORDING)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(residual_files(dir.path()), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_slow_generation_returns_504() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = RuleCatalog::global();
        let state = AppState {
            admission: Arc::new(
                UploadAdmission::with_probe(10, Box::new(|| 1 << 30))
                    .in_temp_dir(dir.path()),
            ),
            coordinator: Arc::new(GenerationCoordinator::new(
                Arc::new(SlowEngine {
                    busy: Duration::from_secs(10),
                }),
                1,
            )),
            catalog,
            request_timeout: Duration::from_millis(200),
            temp_dir: dir.path().to_path_buf(),
        };
        let router = create_router(state);
        let response = router
            .oneshot(multipart_request(
                "application/json",
                Some(("sample.jfr", SAMPLE_RECORDING)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(residual_files(dir.path()), Vec::<String>::new());
    }
}
