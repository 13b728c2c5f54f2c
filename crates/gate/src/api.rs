//! HTTP API: ingestion, delivery verification, admin, health and metrics

use crate::config::{ALTERNATE_ROUTE, PRIMARY_ROUTE, VERIFY_ROUTE};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, MatchedPath, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::PipelineMetrics,
    server::{
        AdminService, AdmissionDecision, ApplyRequest, ClientIdentity, IngestRequest,
        IngestResponse, IngestionGate,
    },
    EventBatch, PipelineError, RateLimitedBody, VerifyRequest, VerifyResponse,
};
use tracing::{info, warn};

/// Shared application state
pub struct AppState {
    pub gate: Arc<IngestionGate>,
    pub admin: AdminService,
    pub health_registry: HealthRegistry,
    pub metrics: PipelineMetrics,
}

impl AppState {
    pub fn new(gate: Arc<IngestionGate>, admin: AdminService, health_registry: HealthRegistry) -> Self {
        Self {
            gate,
            admin,
            health_registry,
            metrics: PipelineMetrics::new(),
        }
    }
}

/// Library errors as HTTP responses
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PipelineError::CleanupForbidden => StatusCode::FORBIDDEN,
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

/// `RateLimit-*` headers plus the legacy `X-RateLimit-*` set
fn rate_limit_headers(decision: &AdmissionDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let values = [
        ("limit", u64::from(decision.limit)),
        ("remaining", u64::from(decision.remaining)),
        ("reset", decision.reset_after_secs),
    ];
    for (suffix, value) in values {
        for prefix in ["ratelimit", "x-ratelimit"] {
            if let Ok(name) = HeaderName::try_from(format!("{}-{}", prefix, suffix)) {
                headers.insert(name, HeaderValue::from(value));
            }
        }
    }
    headers
}

fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientIdentity {
    let mut client =
        ClientIdentity::from_headers(|name| headers.get(name).and_then(|v| v.to_str().ok()));
    if client.addr.is_none() {
        client.addr = peer.map(|addr| addr.ip().to_string());
    }
    client
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Event ingestion, mounted on both the primary and the alternate route
async fn ingest(
    State(state): State<Arc<AppState>>,
    path: MatchedPath,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = path.as_str().to_string();
    let client = client_identity(&headers, peer.map(|ConnectInfo(addr)| addr));

    let response = match serde_json::from_slice::<EventBatch>(&body) {
        Ok(batch) => {
            state
                .gate
                .ingest(IngestRequest {
                    route,
                    client,
                    batch,
                })
                .await
        }
        Err(e) => state.gate.reject_malformed(&route, &client, e.to_string()).await,
    };

    match response {
        IngestResponse::Accepted { ack, decision } => {
            (StatusCode::OK, rate_limit_headers(&decision), Json(ack)).into_response()
        }
        IngestResponse::RateLimited {
            retry_after_secs,
            decision,
        } => {
            let mut headers = rate_limit_headers(&decision);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            let body = RateLimitedBody {
                error: "Too many requests".to_string(),
                retry_after_seconds: retry_after_secs,
            };
            (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
        }
        IngestResponse::Invalid(message) => bad_request(message),
        IngestResponse::StorageFailed(message) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": message })),
        )
            .into_response(),
    }
}

/// Which of the given event ids the gate stored recently
async fn verify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyRequest>,
) -> Response {
    if request.event_ids.len() > state.gate.config().max_events_per_request {
        return bad_request("too many event ids");
    }
    let confirmed = state.gate.verify(&request.event_ids);
    Json(VerifyResponse { confirmed }).into_response()
}

async fn admin_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.admin.authorize(bearer_token(&headers))?;
    Ok(Json(state.admin.report()).into_response())
}

async fn admin_recommendations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.admin.authorize(bearer_token(&headers))?;
    Ok(Json(state.admin.recommendations()).into_response())
}

/// Apply recommendations; an empty body applies every changed route
async fn admin_apply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = if body.is_empty() {
        ApplyRequest::default()
    } else {
        match serde_json::from_slice::<ApplyRequest>(&body) {
            Ok(request) => request,
            Err(e) => return Ok(bad_request(format!("malformed apply request: {}", e))),
        }
    };

    let result = state.admin.apply(bearer_token(&headers), &request)?;
    info!(
        applied = result.applied.len(),
        dry_run = result.dry_run,
        "Admin apply handled"
    );
    Ok(Json(result).into_response())
}

async fn admin_cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let cleared = state.admin.cleanup(bearer_token(&headers))?;
    Ok(Json(json!({
        "cleared": cleared,
        "clearedAt": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response())
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        // Storage outages degrade; clients keep retrying
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(PRIMARY_ROUTE, post(ingest))
        .route(ALTERNATE_ROUTE, post(ingest))
        .route(VERIFY_ROUTE, post(verify))
        .route("/admin/telemetry/report", get(admin_report))
        .route("/admin/telemetry/recommendations", get(admin_recommendations))
        .route("/admin/telemetry/apply", post(admin_apply))
        .route("/admin/telemetry/cleanup", post(admin_cleanup))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server; returns once `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
