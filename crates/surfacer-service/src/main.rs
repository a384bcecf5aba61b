use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use surfacer_api::{
    fallback_decision_id, EvaluateRequest, FeedbackRequest, SurfacingApi, API_CONTRACT_VERSION,
};
use surfacer_core::{EngineConfig, SurfacingDecision};
use surfacer_store_sqlite::SqliteMemoryStore;
use time::OffsetDateTime;
use tokio::sync::mpsc;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const FEEDBACK_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone)]
struct ServiceState {
    api: SurfacingApi<SqliteMemoryStore>,
    feedback_tx: mpsc::Sender<FeedbackRequest>,
    evaluate_deadline: Duration,
}

#[derive(Debug, Clone, serde::Serialize)]
struct ServiceEnvelope<T>
where
    T: serde::Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, serde::Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, serde::Serialize)]
struct FeedbackQueued {
    queued: bool,
}

#[derive(Debug, Parser)]
#[command(name = "surfacer-service")]
#[command(about = "HTTP service for the memory surfacing engine")]
struct Args {
    #[arg(long, default_value = "./surfacer.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Optional YAML engine configuration; defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Wall-clock budget for one evaluation, store I/O included.
    #[arg(long, default_value_t = 1000)]
    evaluate_deadline_ms: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

fn service_error(message: impl Into<String>) -> ServiceError {
    ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: serde::Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn load_engine_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: EngineConfig =
        serde_yaml::from_str(&raw).context("failed to parse engine config yaml")?;
    Ok(config)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/evaluate", post(evaluate))
        .route("/v1/feedback", post(feedback))
        .route("/v1/decision/:decision_id", get(decision_show))
        .with_state(state)
}

/// Drain the feedback queue one event at a time: arrival order is preserved
/// per submitter, and aggregation happens off the request path.
fn spawn_feedback_worker(
    api: SurfacingApi<SqliteMemoryStore>,
    mut rx: mpsc::Receiver<FeedbackRequest>,
) {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let api = api.clone();
            let memory_id = request.memory_id;
            let result =
                tokio::task::spawn_blocking(move || api.ingest_feedback(request)).await;
            match result {
                Ok(Ok(ack)) => {
                    tracing::debug!(memory_id = %ack.memory_id, status = ?ack.status, "feedback processed");
                }
                Ok(Err(err)) => {
                    tracing::warn!(memory_id = %memory_id, error = %err, "feedback processing failed");
                }
                Err(err) => {
                    tracing::warn!(memory_id = %memory_id, error = %err, "feedback task panicked");
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_engine_config(args.config.as_ref())?;
    let api = SurfacingApi::sqlite(args.db, config)?;

    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_QUEUE_DEPTH);
    spawn_feedback_worker(api.clone(), feedback_rx);

    let state = ServiceState {
        api,
        feedback_tx,
        evaluate_deadline: Duration::from_millis(args.evaluate_deadline_ms),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "surfacer service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn evaluate(
    State(state): State<ServiceState>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<ServiceEnvelope<SurfacingDecision>>, ServiceError> {
    let as_of = request.as_of.unwrap_or_else(OffsetDateTime::now_utc);
    let api = state.api.clone();
    let evaluation =
        tokio::time::timeout(state.evaluate_deadline, tokio::task::spawn_blocking(move || {
            api.evaluate(request)
        }))
        .await;

    let decision = match evaluation {
        Ok(Ok(Ok(decision))) => decision,
        Ok(Ok(Err(err))) => return Err(service_error(err.to_string())),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "evaluation task failed; suppressing");
            suppressed(as_of, "evaluation task failed")
        }
        Err(_) => {
            tracing::warn!("evaluation missed its deadline; suppressing");
            suppressed(as_of, "evaluation deadline exceeded")
        }
    };
    Ok(Json(envelope(decision)))
}

fn suppressed(as_of: OffsetDateTime, reason: &str) -> SurfacingDecision {
    SurfacingDecision::suppressed(fallback_decision_id(as_of), String::new(), as_of, reason)
}

async fn feedback(
    State(state): State<ServiceState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<ServiceEnvelope<FeedbackQueued>>), ServiceError> {
    state
        .feedback_tx
        .send(request)
        .await
        .map_err(|_| service_error("feedback queue is closed"))?;
    Ok((StatusCode::ACCEPTED, Json(envelope(FeedbackQueued { queued: true }))))
}

async fn decision_show(
    State(state): State<ServiceState>,
    Path(decision_id): Path<String>,
) -> Result<Json<ServiceEnvelope<surfacer_core::DecisionRecord>>, ServiceError> {
    let record = state
        .api
        .decision(&decision_id)
        .map_err(|err| service_error(err.to_string()))?
        .ok_or_else(|| service_error(format!("decision not found: {decision_id}")))?;
    Ok(Json(envelope(record)))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use http::Request;
    use surfacer_core::{
        embed_memory_text, AccessRule, Clearance, Expiration, Memory, MemoryId, MemoryStatus,
        UsageStats, UserIdentity,
    };
    use surfacer_store_sqlite::SqliteStore;
    use time::Duration as TimeDuration;
    use tower::ServiceExt;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("surfacer-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + TimeDuration::seconds(1_700_000_000)
    }

    fn seed_store(db_path: &std::path::Path) -> MemoryId {
        let mut store = match SqliteStore::open(db_path) {
            Ok(store) => store,
            Err(err) => panic!("store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("store should migrate: {err}");
        }
        if let Err(err) = store.upsert_identity(&UserIdentity {
            id: "u_1".to_string(),
            role: "analyst".to_string(),
            department: "it".to_string(),
            clearance: Clearance::Internal,
        }) {
            panic!("identity should persist: {err}");
        }
        let memory = Memory {
            id: MemoryId::new(),
            canonical_question: "How do I get budget approval?".to_string(),
            semantic_variants: Vec::new(),
            answer: serde_json::json!({ "markdown": "Submit the request form to finance." }),
            embedding: embed_memory_text("How do I get budget approval?", &[], 256),
            departments: ["it".to_string()].into_iter().collect(),
            tags: ["information_seeking".to_string()].into_iter().collect(),
            workflows: Vec::new(),
            access_rule: AccessRule::min_clearance(Clearance::Internal),
            expiration: Expiration::At { at: fixture_time() + TimeDuration::days(365) },
            authority_score: 0.8,
            usage_stats: UsageStats::default(),
            status: MemoryStatus::Approved,
            created_at: fixture_time() - TimeDuration::days(10),
            updated_at: fixture_time() - TimeDuration::days(10),
        };
        let memory_id = memory.id;
        if let Err(err) = store.write_memory(&memory) {
            panic!("memory should persist: {err}");
        }
        memory_id
    }

    fn test_state(db_path: PathBuf) -> ServiceState {
        let api = match SurfacingApi::sqlite(db_path, EngineConfig::default()) {
            Ok(api) => api,
            Err(err) => panic!("api should build: {err}"),
        };
        let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_QUEUE_DEPTH);
        spawn_feedback_worker(api.clone(), feedback_rx);
        ServiceState { api, feedback_tx, evaluate_deadline: Duration::from_secs(5) }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
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

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
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
        assert!(body.contains("/v1/evaluate"));
        assert!(body.contains("/v1/feedback"));
        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn evaluate_and_decision_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let memory_id = seed_store(&db_path);
        let router = app(test_state(db_path.clone()));

        let evaluate_payload = serde_json::json!({
            "source": "slack",
            "raw_input": "How do I get budget approval?",
            "user_id": "u_1",
            "as_of": "2023-11-14T22:13:20Z"
        });
        let evaluate_response = match router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/evaluate")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(evaluate_payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build evaluate request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("evaluate request failed: {err}"),
        };
        assert_eq!(evaluate_response.status(), StatusCode::OK);

        let value = response_json(evaluate_response).await;
        let data = value.get("data").unwrap_or_else(|| panic!("missing data in {value}"));
        assert_eq!(data.get("should_surface").and_then(serde_json::Value::as_bool), Some(true));
        let surfaced_id = data
            .get("memories")
            .and_then(|memories| memories.get(0))
            .and_then(|memory| memory.get("memory_id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing surfaced memory in {value}"));
        assert_eq!(surfaced_id, memory_id.to_string());

        let decision_id = data
            .get("decision_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing decision_id in {value}"))
            .to_string();
        let decision_response = match router
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/decision/{decision_id}"))
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build decision request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("decision request failed: {err}"),
        };
        assert_eq!(decision_response.status(), StatusCode::OK);
        let decision_value = response_json(decision_response).await;
        assert_eq!(
            decision_value
                .get("data")
                .and_then(|record| record.get("decision_id"))
                .and_then(serde_json::Value::as_str),
            Some(decision_id.as_str())
        );
        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn feedback_is_acknowledged_and_applied_asynchronously() {
        let db_path = unique_temp_db_path();
        let memory_id = seed_store(&db_path);
        let router = app(test_state(db_path.clone()));

        let feedback_payload = serde_json::json!({
            "memory_id": memory_id.to_string(),
            "context_fingerprint": "ctx_service_test",
            "outcome": "accepted",
            "occurred_at": "2023-11-14T22:13:20Z"
        });
        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/feedback")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(feedback_payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build feedback request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("feedback request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let value = response_json(response).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("queued"))
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );

        // The worker applies the event off the request path; poll briefly.
        let mut applied = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let store = match SqliteStore::open(&db_path) {
                Ok(store) => store,
                Err(err) => panic!("store should open: {err}"),
            };
            let memory = match store.get_memory(memory_id) {
                Ok(Some(memory)) => memory,
                Ok(None) => panic!("memory should exist"),
                Err(err) => panic!("memory should load: {err}"),
            };
            if memory.usage_stats.access_count == 1 {
                applied = true;
                break;
            }
        }
        assert!(applied, "feedback should be folded into usage stats");
        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn unknown_decision_returns_an_error_envelope() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/decision/dcn_missing")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build decision request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("decision request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|message| message.contains("decision not found")));
        let _ = std::fs::remove_file(&db_path);
    }
}
