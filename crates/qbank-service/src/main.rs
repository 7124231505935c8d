use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use qbank_api::{
    CheckRequest, CorpusStats, ImportResult, MigrateResult, PaperImport, QbankApi, QbankConfig,
    ReindexResult, SimilarQuestions, API_CONTRACT_VERSION,
};
use qbank_core::{
    AssessmentId, BankError, CandidateRef, CheckReport, CommitResult, IndexReport, PaperId,
    QuestionId,
};
use qbank_store_sqlite::{PaperDetail, PaperSummary, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: QbankApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ImportRequest {
    papers: Vec<PaperImport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CommitRequest {
    #[serde(default)]
    approved_refs: Option<Vec<CandidateRef>>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "qbank-service")]
#[command(about = "Local HTTP service for the qbank question bank")]
struct Args {
    #[arg(long, default_value = "./qbank.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Optional YAML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn from_api(err: &anyhow::Error) -> Self {
        let (status, error_kind) = match err.downcast_ref::<BankError>() {
            Some(bank_error) => (status_for(bank_error), bank_error.kind()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %format!("{err:#}"), error_kind, "request failed");
        }
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind,
            error: format!("{err:#}"),
        }
    }
}

fn status_for(err: &BankError) -> StatusCode {
    match err {
        BankError::InvalidInput(_)
        | BankError::ThresholdConfig(_)
        | BankError::CommitRejected(_) => StatusCode::BAD_REQUEST,
        BankError::NotFound(_) => StatusCode::NOT_FOUND,
        BankError::ConcurrentCommitConflict { .. } => StatusCode::CONFLICT,
        BankError::IndexInconsistency(_) => StatusCode::SERVICE_UNAVAILABLE,
        BankError::MatchTimeout { .. } | BankError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run one blocking API call off the async workers and wrap its result.
async fn run_api<T, F>(state: ServiceState, op: F) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&QbankApi) -> Result<T> + Send + 'static,
{
    let api = state.api;
    let joined = tokio::task::spawn_blocking(move || op(&api)).await;
    match joined {
        Ok(Ok(data)) => Ok(Json(envelope(data))),
        Ok(Err(err)) => Err(ServiceError::from_api(&err)),
        Err(err) => Err(ServiceError::from_api(&anyhow::anyhow!("api task failed: {err}"))),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/papers/import", post(papers_import))
        .route("/v1/papers", get(papers_list))
        .route("/v1/papers/:paper_id", get(paper_show))
        .route("/v1/assessments/check", post(assessment_check))
        .route("/v1/assessments/:assessment_id/commit", post(assessment_commit))
        .route("/v1/corpus/stats", get(corpus_stats))
        .route("/v1/corpus/reindex", post(corpus_reindex))
        .route("/v1/corpus/verify", post(corpus_verify))
        .route("/v1/questions/:question_id/similar", get(question_similar))
        .with_state(state)
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init();
}

fn spawn_reindexer(api: QbankApi, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let task_api = api.clone();
            match tokio::task::spawn_blocking(move || task_api.reindex()).await {
                Ok(Ok(result)) => tracing::debug!(
                    corpus_version = result.corpus_version,
                    question_count = result.question_count,
                    "background reindex finished"
                ),
                Ok(Err(err)) => {
                    tracing::warn!(error = %format!("{err:#}"), "background reindex failed");
                }
                Err(err) => tracing::error!(error = %err, "background reindex task panicked"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = QbankConfig::load(args.config.as_deref())?;
    let interval_secs = config.service.reindex_interval_secs;
    let state = ServiceState { api: QbankApi::new(args.db, config)? };

    if interval_secs > 0 {
        spawn_reindexer(state.api.clone(), interval_secs);
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        db = %state.api.db_path().display(),
        "qbank service listening"
    );
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    run_api(state, QbankApi::schema_status).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    run_api(state, move |api| api.migrate(request.dry_run)).await
}

async fn papers_import(
    State(state): State<ServiceState>,
    Json(request): Json<ImportRequest>,
) -> Result<Json<ServiceEnvelope<Vec<ImportResult>>>, ServiceError> {
    run_api(state, move |api| api.import_papers(request.papers)).await
}

async fn papers_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<PaperSummary>>>, ServiceError> {
    run_api(state, QbankApi::list_papers).await
}

async fn paper_show(
    State(state): State<ServiceState>,
    Path(paper_id): Path<String>,
) -> Result<Json<ServiceEnvelope<PaperDetail>>, ServiceError> {
    run_api(state, move |api| api.get_paper(PaperId::parse(&paper_id)?)).await
}

async fn assessment_check(
    State(state): State<ServiceState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<ServiceEnvelope<CheckReport>>, ServiceError> {
    run_api(state, move |api| api.check_assessment(request)).await
}

async fn assessment_commit(
    State(state): State<ServiceState>,
    Path(assessment_id): Path<String>,
    Json(request): Json<CommitRequest>,
) -> Result<Json<ServiceEnvelope<CommitResult>>, ServiceError> {
    run_api(state, move |api| {
        api.commit_assessment(AssessmentId::parse(&assessment_id)?, request.approved_refs)
    })
    .await
}

async fn corpus_stats(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CorpusStats>>, ServiceError> {
    run_api(state, QbankApi::corpus_stats).await
}

async fn corpus_reindex(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReindexResult>>, ServiceError> {
    run_api(state, QbankApi::reindex).await
}

async fn corpus_verify(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IndexReport>>, ServiceError> {
    run_api(state, QbankApi::verify_index).await
}

async fn question_similar(
    State(state): State<ServiceState>,
    Path(question_id): Path<String>,
) -> Result<Json<ServiceEnvelope<SimilarQuestions>>, ServiceError> {
    run_api(state, move |api| api.similar_questions(QuestionId::parse(&question_id)?)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("qbank-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(db_path: PathBuf) -> Router {
        let api = QbankApi::new(db_path, QbankConfig::default())
            .unwrap_or_else(|err| panic!("failed to build api: {err}"));
        app(ServiceState { api })
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build {method} {uri} request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("{method} {uri} request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 4 * 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn data_str<'a>(value: &'a serde_json::Value, field: &str) -> &'a str {
        value
            .get("data")
            .and_then(|data| data.get(field))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.{field} in response: {value}"))
    }

    fn data_i64(value: &serde_json::Value, pointer: &str) -> i64 {
        value
            .pointer(pointer)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_else(|| panic!("missing {pointer} in response: {value}"))
    }

    fn import_payload(subject: &str, texts: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "papers": [{
                "title": "Past paper",
                "term": "2023 S2",
                "subject": subject,
                "questions": texts.iter().map(|text| serde_json::json!({"text": text, "marks": 4}))
                    .collect::<Vec<_>>()
            }]
        })
    }

    fn check_payload(subject: &str, texts: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "metadata": {"title": "Midterm draft", "term": "2024 S1", "subject": subject},
            "candidates": texts.iter().map(|text| serde_json::json!({"text": text}))
                .collect::<Vec<_>>()
        })
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = test_router(unique_temp_db_path());

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(data_str(&value, "status"), "ok");
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = test_router(unique_temp_db_path());

        let response = send(&router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/assessments/{assessment_id}/commit"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn import_check_commit_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let import = send(
            &router,
            "POST",
            "/v1/papers/import",
            Some(import_payload("physics", &["Define momentum.", "Define momentum."])),
        )
        .await;
        assert_eq!(import.status(), StatusCode::OK);
        let import_value = response_json(import).await;
        assert_eq!(data_i64(&import_value, "/data/0/imported_count"), 1);
        assert_eq!(data_i64(&import_value, "/data/0/skipped_exact_duplicates"), 1);

        let check = send(
            &router,
            "POST",
            "/v1/assessments/check",
            Some(check_payload(
                "physics",
                &[
                    "Define momentum.",
                    "State Newton's third law of motion.",
                    "Explain the photoelectric effect.",
                ],
            )),
        )
        .await;
        assert_eq!(check.status(), StatusCode::OK);
        let check_value = response_json(check).await;
        assert_eq!(data_i64(&check_value, "/data/summary/duplicate_count"), 1);
        assert_eq!(data_i64(&check_value, "/data/summary/unique_count"), 2);
        assert_eq!(
            check_value
                .pointer("/data/per_candidate/0/verdict")
                .and_then(serde_json::Value::as_str),
            Some("duplicate")
        );
        let assessment_id = data_str(&check_value, "assessment_id").to_string();

        let commit_uri = format!("/v1/assessments/{assessment_id}/commit");
        let commit = send(&router, "POST", &commit_uri, Some(serde_json::json!({}))).await;
        assert_eq!(commit.status(), StatusCode::OK);
        let commit_value = response_json(commit).await;
        assert_eq!(data_i64(&commit_value, "/data/committed_count"), 2);

        let replay = send(&router, "POST", &commit_uri, Some(serde_json::json!({}))).await;
        assert_eq!(replay.status(), StatusCode::OK);
        let replay_value = response_json(replay).await;
        assert_eq!(replay_value.get("data"), commit_value.get("data"));

        let stats = send(&router, "GET", "/v1/corpus/stats", None).await;
        assert_eq!(stats.status(), StatusCode::OK);
        let stats_value = response_json(stats).await;
        assert_eq!(data_i64(&stats_value, "/data/question_count"), 3);
        assert_eq!(data_i64(&stats_value, "/data/paper_count"), 2);

        let papers = send(&router, "GET", "/v1/papers", None).await;
        assert_eq!(papers.status(), StatusCode::OK);
        let papers_value = response_json(papers).await;
        assert_eq!(
            papers_value.get("data").and_then(serde_json::Value::as_array).map(Vec::len),
            Some(2)
        );

        cleanup(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn stale_commit_maps_to_conflict() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let check = send(
            &router,
            "POST",
            "/v1/assessments/check",
            Some(check_payload("biology", &["Describe the structure of DNA."])),
        )
        .await;
        let check_value = response_json(check).await;
        let assessment_id = data_str(&check_value, "assessment_id").to_string();

        let import = send(
            &router,
            "POST",
            "/v1/papers/import",
            Some(import_payload("biology", &["Explain osmosis across a membrane."])),
        )
        .await;
        assert_eq!(import.status(), StatusCode::OK);

        let commit = send(
            &router,
            "POST",
            &format!("/v1/assessments/{assessment_id}/commit"),
            Some(serde_json::json!({"approved_refs": [1]})),
        )
        .await;
        assert_eq!(commit.status(), StatusCode::CONFLICT);
        let value = response_json(commit).await;
        assert_eq!(
            value.get("error_kind").and_then(serde_json::Value::as_str),
            Some("concurrent_commit_conflict")
        );

        cleanup(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn error_kinds_map_to_status_codes() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let missing = send(&router, "GET", &format!("/v1/papers/{}", PaperId::new()), None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = send(&router, "GET", "/v1/papers/not-a-ulid", None).await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        let malformed_value = response_json(malformed).await;
        assert_eq!(
            malformed_value.get("error_kind").and_then(serde_json::Value::as_str),
            Some("invalid_input")
        );

        let never_checked = send(
            &router,
            "POST",
            &format!("/v1/assessments/{}/commit", AssessmentId::new()),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(never_checked.status(), StatusCode::NOT_FOUND);

        let mut bad_policy = check_payload("physics", &["Define inertia."]);
        bad_policy["policy"] = serde_json::json!({
            "duplicate_threshold": 0.2,
            "review_threshold": 0.7
        });
        let rejected = send(&router, "POST", "/v1/assessments/check", Some(bad_policy)).await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        let rejected_value = response_json(rejected).await;
        assert_eq!(
            rejected_value.get("error_kind").and_then(serde_json::Value::as_str),
            Some("threshold_config")
        );

        cleanup(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn corpus_maintenance_routes_round_trip() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let import = send(
            &router,
            "POST",
            "/v1/papers/import",
            Some(import_payload(
                "geography",
                &["What is the capital of France?", "What is the capital city of France?"],
            )),
        )
        .await;
        let import_value = response_json(import).await;
        let question_id = import_value
            .pointer("/data/0/question_ids/0")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing question id in response: {import_value}"))
            .to_string();

        let similar =
            send(&router, "GET", &format!("/v1/questions/{question_id}/similar"), None).await;
        assert_eq!(similar.status(), StatusCode::OK);
        let similar_value = response_json(similar).await;
        assert_eq!(
            similar_value
                .pointer("/data/matches/0/verdict")
                .and_then(serde_json::Value::as_str),
            Some("possible_duplicate")
        );

        let verify = send(&router, "POST", "/v1/corpus/verify", None).await;
        assert_eq!(verify.status(), StatusCode::OK);
        let verify_value = response_json(verify).await;
        assert_eq!(
            verify_value.pointer("/data/consistent").and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let reindex = send(&router, "POST", "/v1/corpus/reindex", None).await;
        assert_eq!(reindex.status(), StatusCode::OK);
        let reindex_value = response_json(reindex).await;
        assert_eq!(data_i64(&reindex_value, "/data/question_count"), 2);

        let schema = send(&router, "POST", "/v1/db/schema-version", None).await;
        assert_eq!(schema.status(), StatusCode::OK);
        let schema_value = response_json(schema).await;
        assert_eq!(data_i64(&schema_value, "/data/current_version"), 1);

        let migrate =
            send(&router, "POST", "/v1/db/migrate", Some(serde_json::json!({"dry_run": true})))
                .await;
        assert_eq!(migrate.status(), StatusCode::OK);

        cleanup(&db_path);
    }
}
