use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use clap::Parser;
use sc2_test_lab_core::{
    map_breakdown_view, match_list_view, MapBreakdownView, MatchFilter, MatchListView,
};
use sc2_test_lab_runner::{
    init_tracing, load_config, ArtifactLocator, JobLauncher, LabConfig, LaunchError,
    LaunchReport, OsProcessSpawner, ProcessSpawner, ReplayViewer,
};
use sc2_test_lab_store_sqlite::SqliteMatchStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

const SERVICE_CONTRACT_VERSION: &str = "dashboard.v1";

#[derive(Clone)]
struct ServiceState {
    db_path: PathBuf,
    config: Arc<LabConfig>,
    spawner: Arc<dyn ProcessSpawner>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
    /// Serializes batch id allocation and launch so concurrent triggers never
    /// share a batch.
    launch_lock: Arc<tokio::sync::Mutex<()>>,
    /// Process-wide notice queue. The dashboard is a single-user local tool, so
    /// notices are not scoped to a session and whichever reader comes next
    /// drains them.
    flash: Arc<Mutex<Vec<FlashMessage>>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
enum FlashLevel {
    Success,
    Error,
}

/// One-shot notice shown on the next dashboard read.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
struct FlashMessage {
    level: FlashLevel,
    text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DifficultyQuery {
    difficulty: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct MatchListPage {
    selected_difficulty: Option<String>,
    #[serde(flatten)]
    view: MatchListView,
    messages: Vec<FlashMessage>,
}

#[derive(Debug, Clone, Serialize)]
struct MapBreakdownPage {
    selected_difficulty: Option<String>,
    #[serde(flatten)]
    view: MapBreakdownView,
    messages: Vec<FlashMessage>,
}

#[derive(Debug, Clone, Serialize)]
struct ReplayOpened {
    match_id: i64,
    replay: String,
    pid: u32,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    not_found_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
    batches_launched_total: AtomicU64,
    launch_failure_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    not_found_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
    batches_launched_total: u64,
    launch_failure_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "sc2-test-lab-service")]
#[command(about = "Local HTTP dashboard for the SC2 bot test lab")]
struct Args {
    #[arg(long, default_value = "./sc2_test_lab.sqlite3")]
    db: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn not_found_with_telemetry(&self, code: &'static str, message: String) -> ServiceFailure {
        self.telemetry.record_failure(code, false);
        Self::failure(StatusCode::NOT_FOUND, code, message, None)
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let diagnostic = format!("{err:#}");
        let normalized = diagnostic.to_ascii_lowercase();

        if normalized.contains("sqlite") || normalized.contains("database") {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    /// Runs `op` on the blocking pool, bounded by the operation timeout.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::task::spawn_blocking(op);
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                warn!(
                    event = "operation_failed",
                    operation = operation_label,
                    code = failure.code,
                    error = %format!("{err:#}")
                );
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    fn push_flash(&self, level: FlashLevel, text: String) {
        match self.flash.lock() {
            Ok(mut messages) => messages.push(FlashMessage { level, text }),
            Err(_) => warn!(event = "flash_lock_poisoned", text = %text),
        }
    }

    fn drain_flash(&self) -> Vec<FlashMessage> {
        self.flash.lock().map(|mut messages| std::mem::take(&mut *messages)).unwrap_or_default()
    }

    fn artifact_locator(&self) -> ArtifactLocator {
        ArtifactLocator::new(self.config.artifacts.clone())
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "artifact_not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "store_unavailable" => {
                self.store_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "launch_failed" => {
                self.launch_failure_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
            batches_launched_total: self.batches_launched_total.load(Ordering::Relaxed),
            launch_failure_total: self.launch_failure_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(match_list))
        .route("/trigger-tests/", post(trigger_tests))
        .route("/replay/:match_id/", get(open_replay))
        .route("/log/:match_id/", get(view_log))
        .route("/maps/", get(map_breakdown))
        .route("/health", get(health))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = init_tracing("info") {
        eprintln!("{err:#}");
    }
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    SqliteMatchStore::open(&args.db)?.migrate()?;

    let state = ServiceState {
        db_path: args.db.clone(),
        config: Arc::new(config),
        spawner: Arc::new(OsProcessSpawner),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
        launch_lock: Arc::default(),
        flash: Arc::default(),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(event = "service_started", bind = %args.bind, db = %args.db.display());
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!(event = "shutdown_signal_unavailable");
            }
        })
        .await?;
    Ok(())
}

fn open_store(db_path: &std::path::Path) -> Result<SqliteMatchStore> {
    SqliteMatchStore::open(db_path).context("database unavailable")
}

fn normalize_difficulty(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

async fn match_list(
    State(state): State<ServiceState>,
    Query(query): Query<DifficultyQuery>,
) -> Result<Json<ServiceEnvelope<MatchListPage>>, ServiceFailure> {
    let selected_difficulty = normalize_difficulty(query.difficulty);
    let filter = MatchFilter::dashboard(selected_difficulty.as_deref());
    let db_path = state.db_path.clone();

    let view = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "match_list_failed",
            "match_list",
            move || {
                let matches = open_store(&db_path)?.list_matches(&filter)?;
                Ok(match_list_view(&matches))
            },
        )
        .await?;

    Ok(Json(envelope(MatchListPage {
        selected_difficulty,
        view,
        messages: state.drain_flash(),
    })))
}

async fn map_breakdown(
    State(state): State<ServiceState>,
    Query(query): Query<DifficultyQuery>,
) -> Result<Json<ServiceEnvelope<MapBreakdownPage>>, ServiceFailure> {
    let selected_difficulty = normalize_difficulty(query.difficulty);
    let filter = MatchFilter::dashboard(selected_difficulty.as_deref());
    let db_path = state.db_path.clone();

    let view = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "map_breakdown_failed",
            "map_breakdown",
            move || {
                let matches = open_store(&db_path)?.list_matches(&filter)?;
                Ok(map_breakdown_view(&matches))
            },
        )
        .await?;

    Ok(Json(envelope(MapBreakdownPage {
        selected_difficulty,
        view,
        messages: state.drain_flash(),
    })))
}

/// Launches a batch and redirects back to the list. Failures end up as flash
/// messages, never as error responses.
/// The launch is not bounded by the operation timeout.
async fn trigger_tests(
    State(state): State<ServiceState>,
    Form(form): Form<DifficultyQuery>,
) -> Redirect {
    let difficulty = normalize_difficulty(form.difficulty);
    let launcher = JobLauncher::new(state.config.launcher.clone(), Arc::clone(&state.spawner));
    let db_path = state.db_path.clone();
    let requested = difficulty.clone();

    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    let outcome = {
        let _launch_guard = state.launch_lock.lock().await;
        tokio::task::spawn_blocking(move || {
            let mut store = open_store(&db_path).map_err(LaunchError::Failed)?;
            let batch_id = store.next_test_group_id().map_err(LaunchError::Failed)?;
            launcher.launch_batch(&mut store, batch_id, requested.as_deref())
        })
        .await
        .unwrap_or_else(|err| {
            Err(LaunchError::Failed(anyhow::anyhow!("launch task join failure: {err}")))
        })
    };

    match outcome {
        Ok(report) => {
            state.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
            state.telemetry.batches_launched_total.fetch_add(1, Ordering::Relaxed);
            state.push_flash(FlashLevel::Success, launch_summary(&report, difficulty.as_deref()));
        }
        Err(err) => {
            state.telemetry.record_failure("launch_failed", false);
            warn!(event = "batch_launch_failed", error = %err);
            state.push_flash(FlashLevel::Error, launch_failure_text(&err));
        }
    }

    Redirect::to(&list_location(difficulty.as_deref()))
}

fn launch_summary(report: &LaunchReport, difficulty: Option<&str>) -> String {
    let suffix = difficulty.map(|value| format!(" with difficulty {value}")).unwrap_or_default();
    format!(
        "Test suite started successfully{suffix}: {} job(s) in batch {}. \
         Check the match results page for updates.",
        report.launched(),
        report.batch_id
    )
}

fn launch_failure_text(err: &LaunchError) -> String {
    match err {
        LaunchError::Precondition(message) => message.clone(),
        LaunchError::Failed(source) => format!("Failed to start test suite: {source:#}"),
    }
}

fn list_location(difficulty: Option<&str>) -> String {
    match difficulty {
        Some(value) => format!("/?difficulty={}", encode_query_value(value)),
        None => "/".to_string(),
    }
}

fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

async fn open_replay(
    State(state): State<ServiceState>,
    Path(match_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<ReplayOpened>>, ServiceFailure> {
    let locator = state.artifact_locator();
    let replay = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "artifact_lookup_failed",
            "find_replay",
            move || locator.find_replay(match_id),
        )
        .await?;
    let Some(replay) = replay else {
        return Err(state.not_found_with_telemetry(
            "artifact_not_found",
            format!("no replay found for match {match_id}"),
        ));
    };

    let viewer = ReplayViewer::new(state.config.viewer.clone(), Arc::clone(&state.spawner));
    let opened_path = replay.clone();
    let pid = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "replay_open_failed",
            "open_replay",
            move || viewer.open(&opened_path),
        )
        .await?;

    Ok(Json(envelope(ReplayOpened {
        match_id,
        replay: replay.display().to_string(),
        pid,
    })))
}

async fn view_log(
    State(state): State<ServiceState>,
    Path(match_id): Path<i64>,
) -> Result<Response, ServiceFailure> {
    let locator = state.artifact_locator();
    let log_path = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "artifact_lookup_failed",
            "find_log",
            move || locator.find_log(match_id),
        )
        .await?;
    let Some(log_path) = log_path else {
        return Err(state.not_found_with_telemetry(
            "artifact_not_found",
            format!("no log found for match {match_id}"),
        ));
    };

    let file = tokio::fs::File::open(&log_path).await.map_err(|err| {
        state.telemetry.record_failure("internal_error", false);
        ServiceState::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("failed to open {}: {err}", log_path.display()),
            None,
        )
    })?;

    // Bot logs may not be UTF-8.
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use sc2_test_lab_core::{MatchCompletion, MatchResult, NewMatch};
    use sc2_test_lab_runner::{CommandSpec, RecordingSpawner};
    use std::fs;
    use tower::ServiceExt;

    fn must<T>(result: anyhow::Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn unique_temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sc2-test-lab-service-{}", ulid::Ulid::new()));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create temp dir: {err}");
        }
        dir
    }

    fn migrated_db(dir: &std::path::Path) -> PathBuf {
        let db_path = dir.join("lab.sqlite3");
        must(must(SqliteMatchStore::open(&db_path)).migrate());
        db_path
    }

    fn write_fixture(path: &std::path::Path, contents: &str) {
        if let Err(err) = fs::write(path, contents) {
            panic!("failed to write {}: {err}", path.display());
        }
    }

    /// Sleeps before every spawn, like a slow `docker compose run`.
    struct SlowSpawner {
        inner: RecordingSpawner,
        delay: Duration,
    }

    impl ProcessSpawner for SlowSpawner {
        fn spawn(&self, command: &CommandSpec) -> anyhow::Result<u32> {
            std::thread::sleep(self.delay);
            self.inner.spawn(command)
        }
    }

    fn test_state(
        db_path: PathBuf,
        config: LabConfig,
        spawner: &RecordingSpawner,
        timeout_ms: u64,
    ) -> ServiceState {
        test_state_with(db_path, config, Arc::new(spawner.clone()), timeout_ms)
    }

    fn test_state_with(
        db_path: PathBuf,
        config: LabConfig,
        spawner: Arc<dyn ProcessSpawner>,
        timeout_ms: u64,
    ) -> ServiceState {
        ServiceState {
            db_path,
            config: Arc::new(config),
            spawner,
            operation_timeout: Duration::from_millis(timeout_ms),
            telemetry: Arc::new(ServiceTelemetry::default()),
            launch_lock: Arc::default(),
            flash: Arc::default(),
        }
    }

    fn compose_config(dir: &std::path::Path) -> LabConfig {
        let compose_file = dir.join("docker-compose.yml");
        write_fixture(&compose_file, "services: {}\n");
        let mut config = LabConfig::default();
        config.launcher.compose_file = Some(compose_file);
        config
    }

    fn slow_state(
        dir: &std::path::Path,
        spawner: &RecordingSpawner,
        timeout_ms: u64,
    ) -> ServiceState {
        let slow = SlowSpawner {
            inner: spawner.clone(),
            delay: Duration::from_millis(20),
        };
        test_state_with(migrated_db(dir), compose_config(dir), Arc::new(slow), timeout_ms)
    }

    fn group_ids(list: &serde_json::Value) -> Vec<i64> {
        list["data"]["rows"]
            .as_array()
            .map(|rows| rows.iter().filter_map(|row| row["test_group_id"].as_i64()).collect())
            .unwrap_or_default()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn trigger_request(form_body: &'static str) -> Request<Body> {
        Request::builder()
            .uri("/trigger-tests/")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form_body))
            .unwrap_or_else(|err| panic!("failed to build trigger request: {err}"))
    }

    async fn send(state: &ServiceState, request: Request<Body>) -> Response {
        match app(state.clone()).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn location(response: &Response) -> Option<String> {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    }

    fn error_code(value: &serde_json::Value) -> Option<&str> {
        value
            .get("error")
            .and_then(|error| error.get("code"))
            .and_then(serde_json::Value::as_str)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let dir = unique_temp_dir();
        let state =
            test_state(migrated_db(&dir), LabConfig::default(), &RecordingSpawner::new(), 2500);

        let response = send(&state, get_request("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], "ok");
        assert_eq!(value["data"]["timeout_ms"], 2500);
    }

    #[tokio::test]
    async fn empty_store_renders_empty_views() {
        let dir = unique_temp_dir();
        let state =
            test_state(migrated_db(&dir), LabConfig::default(), &RecordingSpawner::new(), 2500);

        let list = response_json(send(&state, get_request("/?difficulty=")).await).await;
        assert_eq!(list["data"]["selected_difficulty"], serde_json::Value::Null);
        assert_eq!(list["data"]["rows"], json!([]));
        assert_eq!(list["data"]["header"], json!([]));
        assert_eq!(list["data"]["messages"], json!([]));

        let maps = response_json(send(&state, get_request("/maps/")).await).await;
        assert_eq!(maps["data"]["rows"], json!([]));
    }

    #[tokio::test]
    async fn trigger_tests_launches_batch_and_flashes_success_once() {
        let dir = unique_temp_dir();
        let compose_file = dir.join("docker-compose.yml");
        write_fixture(&compose_file, "services: {}\n");
        let mut config = LabConfig::default();
        config.launcher.compose_file = Some(compose_file);
        let spawner = RecordingSpawner::new();
        let state = test_state(migrated_db(&dir), config, &spawner, 2500);

        let response = send(&state, trigger_request("difficulty=Hard")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response).as_deref(), Some("/?difficulty=Hard"));
        assert_eq!(spawner.commands().len(), 15);

        let list = response_json(send(&state, get_request("/?difficulty=Hard")).await).await;
        let data = &list["data"];
        assert_eq!(data["selected_difficulty"], "Hard");
        assert_eq!(data["rows"].as_array().map(Vec::len), Some(1));
        assert_eq!(data["rows"][0]["test_group_id"], 1);
        assert_eq!(data["rows"][0]["win_percentage"], "-");
        assert_eq!(data["rows"][0]["cells"][0]["result"], "Pending");
        assert_eq!(data["opponents"][0], "Protoss-Hard-Air");
        assert_eq!(data["messages"][0]["level"], "success");
        assert!(data["messages"][0]["text"]
            .as_str()
            .is_some_and(|text| text.contains("with difficulty Hard")));

        let again = response_json(send(&state, get_request("/")).await).await;
        assert_eq!(again["data"]["messages"], json!([]));

        let second = send(&state, trigger_request("difficulty=Hard")).await;
        assert_eq!(second.status(), StatusCode::SEE_OTHER);
        let list = response_json(send(&state, get_request("/")).await).await;
        assert_eq!(group_ids(&list), vec![2, 1]);
        assert_eq!(list["data"]["rows"][1]["cells"][0]["result"], "Aborted");
    }

    #[tokio::test]
    async fn slow_launch_outlasting_operation_timeout_still_reports_success() {
        let dir = unique_temp_dir();
        let spawner = RecordingSpawner::new();
        let state = slow_state(&dir, &spawner, 100);

        let response = send(&state, trigger_request("difficulty=Hard")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(spawner.commands().len(), 15);

        let list = response_json(send(&state, get_request("/?difficulty=Hard")).await).await;
        let data = &list["data"];
        assert_eq!(data["messages"][0]["level"], "success");
        let cells = data["rows"][0]["cells"].as_array().cloned().unwrap_or_default();
        assert_eq!(cells.len(), 15);
        assert!(cells.iter().all(|cell| cell["result"] == "Pending"));

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.timeout_total, 0);
        assert_eq!(snapshot.batches_launched_total, 1);
        assert_eq!(snapshot.launch_failure_total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_get_distinct_batches() {
        let dir = unique_temp_dir();
        let spawner = RecordingSpawner::new();
        let state = slow_state(&dir, &spawner, 2500);

        let (first, second) = tokio::join!(
            send(&state, trigger_request("difficulty=Hard")),
            send(&state, trigger_request("difficulty=Hard")),
        );
        assert_eq!(first.status(), StatusCode::SEE_OTHER);
        assert_eq!(second.status(), StatusCode::SEE_OTHER);
        assert_eq!(spawner.commands().len(), 30);

        let list = response_json(send(&state, get_request("/?difficulty=Hard")).await).await;
        assert_eq!(group_ids(&list), vec![2, 1]);
        let rows = list["data"]["rows"].as_array().cloned().unwrap_or_default();
        assert!(rows.iter().all(|row| row["cells"].as_array().map(Vec::len) == Some(15)));
        assert_eq!(list["data"]["messages"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn trigger_tests_without_configuration_flashes_error_and_redirects() {
        let dir = unique_temp_dir();
        let spawner = RecordingSpawner::new();
        let state = test_state(migrated_db(&dir), LabConfig::default(), &spawner, 2500);

        let response = send(&state, trigger_request("difficulty=")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response).as_deref(), Some("/"));
        assert!(spawner.commands().is_empty());

        let list = response_json(send(&state, get_request("/")).await).await;
        assert_eq!(list["data"]["rows"], json!([]));
        assert_eq!(list["data"]["messages"][0]["level"], "error");
        assert_eq!(
            list["data"]["messages"][0]["text"],
            "launch configuration missing: no compose file configured"
        );
        assert_eq!(state.telemetry.snapshot().launch_failure_total, 1);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_failed_start() {
        let dir = unique_temp_dir();
        let compose_file = dir.join("docker-compose.yml");
        write_fixture(&compose_file, "services: {}\n");
        let mut config = LabConfig::default();
        config.launcher.compose_file = Some(compose_file);
        let state =
            test_state(migrated_db(&dir), config, &RecordingSpawner::failing_after(0), 2500);

        let response = send(&state, trigger_request("")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let list = response_json(send(&state, get_request("/")).await).await;
        assert!(list["data"]["messages"][0]["text"]
            .as_str()
            .is_some_and(|text| text.starts_with("Failed to start test suite:")));
    }

    #[tokio::test]
    async fn map_view_filters_by_difficulty_and_rolls_up_all_matches() {
        let dir = unique_temp_dir();
        let db_path = migrated_db(&dir);
        let store = must(SqliteMatchStore::open(&db_path));
        for (difficulty, result, duration) in [
            ("Easy", MatchResult::Victory, 300.0),
            ("Easy", MatchResult::Defeat, 200.0),
            ("Hard", MatchResult::Victory, 100.0),
        ] {
            let id = must(store.insert_pending(&NewMatch {
                test_group_id: 1,
                opponent_race: "Terran".to_string(),
                opponent_difficulty: difficulty.to_string(),
                opponent_build: "Rush".to_string(),
            }));
            must(store.complete_match(
                id,
                &MatchCompletion {
                    result,
                    map_name: Some("Ephemeron LE".to_string()),
                    end_timestamp: sc2_test_lab_core::now_utc(),
                    duration_in_game_time: Some(duration),
                },
            ));
        }
        let state = test_state(db_path, LabConfig::default(), &RecordingSpawner::new(), 2500);

        let maps = response_json(send(&state, get_request("/maps/?difficulty=Easy")).await).await;
        let row = &maps["data"]["rows"][0];
        assert_eq!(row["map_name"], "Ephemeron LE");
        assert_eq!(row["cells"][0]["victories"], 1);
        assert_eq!(row["cells"][0]["games"], 2);
        assert_eq!(row["cells"][0]["win_percentage"], "50%");
        assert_eq!(row["cells"][0]["avg_duration"], 250);
        assert_eq!(maps["data"]["opponents"], json!(["Terran-Easy-Rush"]));
    }

    #[tokio::test]
    async fn missing_artifacts_return_not_found_machine_error() {
        let dir = unique_temp_dir();
        let mut config = LabConfig::default();
        config.artifacts.replay_dir = Some(dir.clone());
        config.artifacts.log_dir = Some(dir.clone());
        let state = test_state(migrated_db(&dir), config, &RecordingSpawner::new(), 2500);

        let replay = send(&state, get_request("/replay/77/")).await;
        assert_eq!(replay.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(&response_json(replay).await), Some("artifact_not_found"));

        let log = send(&state, get_request("/log/77/")).await;
        assert_eq!(log.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(&response_json(log).await), Some("artifact_not_found"));

        assert_eq!(state.telemetry.snapshot().not_found_total, 2);
    }

    #[tokio::test]
    async fn log_is_served_as_plain_text() {
        let dir = unique_temp_dir();
        write_fixture(&dir.join("5_Zerg_Hard_Macro.log"), "game loop 1\ngame loop 2\n");
        let mut config = LabConfig::default();
        config.artifacts.log_dir = Some(dir.clone());
        let state = test_state(migrated_db(&dir), config, &RecordingSpawner::new(), 2500);

        let response = send(&state, get_request("/log/5/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("text/plain")
        );
        assert_eq!(response_text(response).await, "game loop 1\ngame loop 2\n");
    }

    #[tokio::test]
    async fn replay_is_handed_to_configured_viewer() {
        let dir = unique_temp_dir();
        let replay = dir.join("8_Protoss_Easy_Air.SC2Replay");
        write_fixture(&replay, "replay");
        let mut config = LabConfig::default();
        config.artifacts.replay_dir = Some(dir.clone());
        config.viewer.program = Some(PathBuf::from("/opt/sc2/Switcher"));
        let spawner = RecordingSpawner::new();
        let state = test_state(migrated_db(&dir), config, &spawner, 2500);

        let response = send(&state, get_request("/replay/8/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"]["match_id"], 8);
        assert_eq!(value["data"]["replay"], replay.display().to_string());

        let commands = spawner.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].args, vec![replay.display().to_string()]);
    }

    #[tokio::test]
    async fn run_blocking_times_out_with_mapped_error_status() {
        let dir = unique_temp_dir();
        let state =
            test_state(migrated_db(&dir), LabConfig::default(), &RecordingSpawner::new(), 1);

        let result = state
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "match_list_failed",
                "unit_timeout_operation",
                || {
                    std::thread::sleep(Duration::from_millis(25));
                    Ok::<_, anyhow::Error>(())
                },
            )
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(err.code, "match_list_failed");
                assert!(err.message.contains("timed out"), "message={}", err.message);
                assert!(err.details.is_some());
            }
        }
        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.timeout_total, 1);
        assert_eq!(snapshot.requests_failure_total, 1);
    }

    #[test]
    fn only_store_outages_escape_the_default_code() {
        let locked = anyhow::anyhow!("database is locked");
        let failure = ServiceState::classify_api_error(
            &locked,
            StatusCode::INTERNAL_SERVER_ERROR,
            "match_list_failed",
        );
        assert_eq!(
            (failure.status, failure.code),
            (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
        );

        // A corrupt stored timestamp is a server-side fault, not a bad request.
        let corrupt = anyhow::anyhow!("invalid RFC3339 timestamp: yesterday")
            .context("Conversion error from type Text at index: 6");
        let failure = ServiceState::classify_api_error(
            &corrupt,
            StatusCode::INTERNAL_SERVER_ERROR,
            "match_list_failed",
        );
        assert_eq!(
            (failure.status, failure.code),
            (StatusCode::INTERNAL_SERVER_ERROR, "match_list_failed")
        );
    }

    #[tokio::test]
    async fn corrupt_stored_timestamp_is_a_server_error() {
        let dir = unique_temp_dir();
        let db_path = migrated_db(&dir);
        let store = must(SqliteMatchStore::open(&db_path));
        must(store.insert_pending(&NewMatch {
            test_group_id: 1,
            opponent_race: "Terran".to_string(),
            opponent_difficulty: "Easy".to_string(),
            opponent_build: "Rush".to_string(),
        }));
        drop(store);
        let corrupted = rusqlite::Connection::open(&db_path)
            .and_then(|conn| conn.execute("UPDATE matches SET start_timestamp = 'yesterday'", []));
        assert!(matches!(corrupted, Ok(1)), "failed to corrupt fixture: {corrupted:?}");
        let state = test_state(db_path, LabConfig::default(), &RecordingSpawner::new(), 2500);

        let response = send(&state, get_request("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(&response_json(response).await), Some("match_list_failed"));
        assert_eq!(state.telemetry.snapshot().other_error_total, 1);
    }

    #[test]
    fn redirect_location_preserves_encoded_filter() {
        assert_eq!(list_location(None), "/");
        assert_eq!(list_location(Some("CheatInsane")), "/?difficulty=CheatInsane");
        assert_eq!(list_location(Some("Very Hard&x")), "/?difficulty=Very%20Hard%26x");
    }
}
