use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use engagement_api::{
    ApiError, EngagementApi, EngagementConfig, FailoverFastStore, MigrateResult, RankOutcome,
    RecordEventRequest, RequestMetadata, ViewDecision, API_CONTRACT_VERSION,
};
use engagement_core::{ActorId, EntityId, EventId, RankStrategy};
use engagement_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const MAX_RANK_CANDIDATES: usize = 2_000;

#[derive(Clone)]
struct ServiceState {
    api: Arc<EngagementApi>,
    /// Read the client address from forwarding headers instead of the socket peer.
    trust_forwarded_headers: bool,
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
    error: String,
    code: &'static str,
    retryable: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RankRequest {
    candidates: Vec<EntityId>,
    #[serde(flatten)]
    strategy: RankStrategy,
}

#[derive(Debug, Clone, Deserialize)]
struct ViewRequest {
    entity_id: EntityId,
    actor_id: ActorId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnerRecord {
    entity_id: EntityId,
    owner_id: ActorId,
}

#[derive(Debug, Clone, Serialize)]
struct EventAccepted {
    event_id: EventId,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "engagement-service")]
#[command(about = "HTTP service for engagement ranking and view dedupe")]
struct Args {
    #[arg(long, default_value = "./engagement.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// YAML tunables; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Shared fast store for dedupe locks and rate counters.
    #[arg(long)]
    redis_url: Option<String>,
    /// Apply pending schema migrations before serving.
    #[arg(long)]
    migrate: bool,
    /// Take the client address from X-Forwarded-For / X-Real-IP. Only enable behind a
    /// proxy that overwrites those headers.
    #[arg(long)]
    trust_forwarded_headers: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let status = if err.is_retryable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else if matches!(err, ApiError::Validation(_)) {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.to_string(),
            code: err.code(),
            retryable: err.is_retryable(),
        }
    }
}

impl ServiceState {
    fn invalid(message: impl Into<String>) -> ServiceError {
        ServiceError::from(ApiError::Validation(message.into()))
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

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/rank", post(rank))
        .route("/v1/views", post(record_view))
        .route("/v1/events", post(record_event))
        .route("/v1/entities/owner", post(set_owner))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngagementConfig::load(path)?,
        None => EngagementConfig::default(),
    };

    let fast_store = Arc::new(FailoverFastStore::connect(args.redis_url.as_deref()).await);
    let shared_fast_store = fast_store.is_shared();
    let api = EngagementApi::open(&args.db, config, fast_store)?;

    let status = api.schema_status().await?;
    if args.migrate {
        api.migrate(false).await?;
    } else if !status.pending_versions.is_empty() {
        warn!(pending = ?status.pending_versions, "schema migrations pending; run with --migrate");
    }

    let state = ServiceState {
        api: Arc::new(api),
        trust_forwarded_headers: args.trust_forwarded_headers,
    };
    let listener = TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), shared_fast_store, "engagement service listening");

    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("engagement service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                warn!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn request_metadata(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_headers: bool,
) -> RequestMetadata {
    let user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let forwarded = if trust_forwarded_headers { forwarded_client_ip(headers) } else { None };
    let client_ip = forwarded.or_else(|| peer.map(|addr| addr.ip().to_string()));
    RequestMetadata { user_agent, client_ip, content_owner: None }
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| headers.get("x-real-ip").and_then(|value| value.to_str().ok()))
        .map(str::to_string)
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
    let status = state.api.schema_status().await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).await?;
    Ok(Json(envelope(result)))
}

async fn rank(
    State(state): State<ServiceState>,
    Json(request): Json<RankRequest>,
) -> Result<Json<ServiceEnvelope<RankOutcome>>, ServiceError> {
    if request.candidates.len() > MAX_RANK_CANDIDATES {
        return Err(ServiceState::invalid(format!(
            "candidates MUST contain at most {MAX_RANK_CANDIDATES} ids"
        )));
    }
    if let RankStrategy::Trending { window_secs: 0 } = request.strategy {
        return Err(ServiceState::invalid("window_secs MUST be > 0"));
    }

    let outcome = state.api.rank_or_fallback(&request.candidates, request.strategy).await;
    Ok(Json(envelope(outcome)))
}

async fn record_view(
    State(state): State<ServiceState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<ViewRequest>,
) -> Result<Json<ServiceEnvelope<ViewDecision>>, ServiceError> {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    let metadata = request_metadata(&headers, peer, state.trust_forwarded_headers);
    let decision = state.api.record_view(&request.entity_id, &request.actor_id, &metadata).await?;
    Ok(Json(envelope(decision)))
}

async fn record_event(
    State(state): State<ServiceState>,
    Json(request): Json<RecordEventRequest>,
) -> Result<Json<ServiceEnvelope<EventAccepted>>, ServiceError> {
    let event_id = state.api.record_event(request).await?;
    Ok(Json(envelope(EventAccepted { event_id })))
}

async fn set_owner(
    State(state): State<ServiceState>,
    Json(request): Json<OwnerRecord>,
) -> Result<Json<ServiceEnvelope<OwnerRecord>>, ServiceError> {
    state.api.set_owner(request.entity_id.clone(), request.owner_id.clone()).await?;
    Ok(Json(envelope(request)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    const BROWSER_UA: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("engagement-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    async fn migrated_state(db_path: &std::path::Path) -> ServiceState {
        let api = match EngagementApi::open(
            db_path,
            EngagementConfig::default(),
            Arc::new(FailoverFastStore::local_only()),
        ) {
            Ok(api) => api,
            Err(err) => panic!("failed to open api: {err}"),
        };
        if let Err(err) = api.migrate(false).await {
            panic!("failed to migrate test database: {err}");
        }
        ServiceState { api: Arc::new(api), trust_forwarded_headers: false }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        payload: Option<serde_json::Value>,
        user_agent: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(agent) = user_agent {
            builder = builder.header("user-agent", agent);
        }
        let body = match payload {
            Some(payload) => {
                builder = builder.header("content-type", "application/json");
                Body::from(payload.to_string())
            }
            None => Body::empty(),
        };
        let request = builder.body(body).unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn send_view(router: &Router, payload: serde_json::Value, forwarded_for: &str) -> Response {
        let request = Request::builder()
            .uri("/v1/views")
            .method("POST")
            .header("user-agent", BROWSER_UA)
            .header("x-forwarded-for", forwarded_for)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
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

    fn data_str<'a>(value: &'a serde_json::Value, field: &str) -> Option<&'a str> {
        value.get("data").and_then(|data| data.get(field)).and_then(serde_json::Value::as_str)
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = app(migrated_state(&db_path).await);

        let response = send(&router, "GET", "/v1/health", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(data_str(&value, "status"), Some("ok"));
        cleanup(&db_path);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn view_endpoint_counts_once_and_skips_bots() {
        let db_path = unique_temp_db_path();
        let router = app(migrated_state(&db_path).await);
        let payload = serde_json::json!({ "entity_id": "chapter-1", "actor_id": "reader-1" });

        let first = send(&router, "POST", "/v1/views", Some(payload.clone()), Some(BROWSER_UA)).await;
        assert_eq!(first.status(), StatusCode::OK);
        let first = response_json(first).await;
        assert_eq!(data_str(&first, "reason"), Some("ok"));
        assert_eq!(
            first.get("data").and_then(|data| data.get("accepted")).and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let repeat = response_json(
            send(&router, "POST", "/v1/views", Some(payload.clone()), Some(BROWSER_UA)).await,
        )
        .await;
        assert_eq!(data_str(&repeat, "reason"), Some("duplicate"));

        let headless = response_json(send(&router, "POST", "/v1/views", Some(payload), None).await).await;
        assert_eq!(data_str(&headless, "reason"), Some("bot"));
        cleanup(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn owner_registration_blocks_self_views() {
        let db_path = unique_temp_db_path();
        let router = app(migrated_state(&db_path).await);

        let owner = serde_json::json!({ "entity_id": "chapter-1", "owner_id": "author-1" });
        let response = send(&router, "POST", "/v1/entities/owner", Some(owner), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let view = serde_json::json!({ "entity_id": "chapter-1", "actor_id": "author-1" });
        let value =
            response_json(send(&router, "POST", "/v1/views", Some(view), Some(BROWSER_UA)).await).await;
        assert_eq!(data_str(&value, "reason"), Some("self"));

        let hinted = serde_json::json!({
            "entity_id": "chapter-1",
            "actor_id": "author-1",
            "content_owner": "someone-else"
        });
        let value =
            response_json(send(&router, "POST", "/v1/views", Some(hinted), Some(BROWSER_UA)).await).await;
        assert_eq!(data_str(&value, "reason"), Some("self"));
        cleanup(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn events_feed_the_all_time_rank() {
        let db_path = unique_temp_db_path();
        let router = app(migrated_state(&db_path).await);

        for (entity, score) in [("chapter-1", 2.0), ("chapter-2", 5.0)] {
            let event = serde_json::json!({
                "entity_id": entity,
                "actor_id": "reader-1",
                "kind": "rating",
                "value": score
            });
            let response = send(&router, "POST", "/v1/events", Some(event), None).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let rank = serde_json::json!({
            "candidates": ["chapter-1", "chapter-2", "chapter-3"],
            "strategy": "all_time_rating"
        });
        let response = send(&router, "POST", "/v1/rank", Some(rank), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(data_str(&value, "source"), Some("computed"));

        let order = value
            .get("data")
            .and_then(|data| data.get("entities"))
            .and_then(serde_json::Value::as_array)
            .map(|entities| {
                entities
                    .iter()
                    .filter_map(|entity| entity.get("entity_id").and_then(serde_json::Value::as_str))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| panic!("missing data.entities in response: {value}"));
        assert_eq!(order, vec!["chapter-2", "chapter-3", "chapter-1"]);
        cleanup(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn invalid_requests_map_to_bad_request() {
        let db_path = unique_temp_db_path();
        let router = app(migrated_state(&db_path).await);

        let view_event = serde_json::json!({
            "entity_id": "chapter-1",
            "actor_id": "reader-1",
            "kind": "view"
        });
        let response = send(&router, "POST", "/v1/events", Some(view_event), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value.get("retryable").and_then(serde_json::Value::as_bool), Some(false));
        assert_eq!(
            value.get("code").and_then(serde_json::Value::as_str),
            Some("VALIDATION_INVALID_INPUT")
        );

        let rank = serde_json::json!({
            "candidates": ["chapter-1"],
            "strategy": "trending",
            "window_secs": 0
        });
        let response = send(&router, "POST", "/v1/rank", Some(rank), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        cleanup(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn schema_and_openapi_endpoints_respond() {
        let db_path = unique_temp_db_path();
        let router = app(migrated_state(&db_path).await);

        let response = send(&router, "POST", "/v1/db/schema-version", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("current_version"))
                .and_then(serde_json::Value::as_i64),
            Some(1)
        );

        let response = send(&router, "GET", "/v1/openapi", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/views"));
        assert!(body.contains("/v1/rank"));
        cleanup(&db_path);
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn spoofed_forwarding_headers_do_not_bypass_rate_limit() {
        let db_path = unique_temp_db_path();
        let mut state = migrated_state(&db_path).await;
        state.trust_forwarded_headers = true;
        let router = app(state);

        let mut reasons = Vec::new();
        for octet in 0..12 {
            let payload = serde_json::json!({
                "entity_id": format!("chapter-{octet}"),
                "actor_id": "reader-1"
            });
            let value = response_json(send_view(&router, payload, &format!("10.0.0.{octet}")).await).await;
            reasons.push(data_str(&value, "reason").map(str::to_string));
        }

        let accepted = reasons.iter().filter(|reason| reason.as_deref() == Some("ok")).count();
        assert_eq!(accepted, 10);
        assert_eq!(reasons[10].as_deref(), Some("rate-limited"));
        assert_eq!(reasons[11].as_deref(), Some("rate-limited"));
        cleanup(&db_path);
    }

    fn forwarding_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", http::HeaderValue::from_static("198.51.100.4, 10.0.0.1"));
        headers.insert("x-real-ip", http::HeaderValue::from_static("10.0.0.1"));
        headers
    }

    #[test]
    fn trusted_forwarded_address_wins_over_real_ip() {
        let peer = SocketAddr::from(([127, 0, 0, 1], 50_000));
        let metadata = request_metadata(&forwarding_headers(), Some(peer), true);
        assert_eq!(metadata.client_ip.as_deref(), Some("198.51.100.4"));
        assert_eq!(metadata.user_agent, None);
        assert_eq!(metadata.content_owner, None);
    }

    #[test]
    fn untrusted_forwarding_headers_fall_back_to_peer() {
        let peer = SocketAddr::from(([192, 0, 2, 10], 50_000));
        let metadata = request_metadata(&forwarding_headers(), Some(peer), false);
        assert_eq!(metadata.client_ip.as_deref(), Some("192.0.2.10"));

        let without_peer = request_metadata(&forwarding_headers(), None, false);
        assert_eq!(without_peer.client_ip, None);
    }
}
