//! REST API
//!
//! Exposes loaded entries, their snapshots and sensors, and the VM action
//! services:
//!
//! - `GET  /health`
//! - `GET  /api/v1/entries`
//! - `GET  /api/v1/entries/:id/snapshot`
//! - `GET  /api/v1/entries/:id/sensors`
//! - `POST /api/v1/entries/:id/refresh`
//! - `GET  /api/v1/entries/:id/services`
//! - `POST /api/v1/entries/:id/services/:service`
//! - `PUT  /api/v1/entries/:id/options`

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use proxmoxve_client::ProxmoxError;

use crate::config::EntryOptions;
use crate::coordinator::{RefreshCoordinator, RefreshOutcome};
use crate::entity;
use crate::entry::{EntryRegistry, SetupError};
use crate::services::ServiceError;

/// Shared state for HTTP handlers
pub struct AppState {
    pub registry: Arc<EntryRegistry>,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Serialize)]
pub struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, error: &str, message: &str) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError::new(error, message)))
}

fn entry_not_found(id: &str) -> (StatusCode, Json<ApiError>) {
    api_error(
        StatusCode::NOT_FOUND,
        "entry_not_found",
        &format!("Entry not loaded: {}", id),
    )
}

impl From<ServiceError> for (StatusCode, Json<ApiError>) {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match &err {
            ServiceError::InvalidRequest(_) => {
                api_error(StatusCode::BAD_REQUEST, "invalid_request", &message)
            }
            ServiceError::UnknownService(_) => {
                api_error(StatusCode::NOT_FOUND, "unknown_service", &message)
            }
            ServiceError::UnknownEntry(_) => {
                api_error(StatusCode::NOT_FOUND, "entry_not_found", &message)
            }
            ServiceError::Remote(remote) => {
                let status = match remote {
                    ProxmoxError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
                    ProxmoxError::SessionNotBuilt => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_GATEWAY,
                };
                api_error(status, remote.kind(), &message)
            }
        }
    }
}

impl From<SetupError> for (StatusCode, Json<ApiError>) {
    fn from(err: SetupError) -> Self {
        let message = err.to_string();
        match &err {
            SetupError::InvalidConfig(_) => {
                api_error(StatusCode::BAD_REQUEST, "invalid_config", &message)
            }
            SetupError::AlreadyLoaded(_) => {
                api_error(StatusCode::CONFLICT, "already_loaded", &message)
            }
            SetupError::NotLoaded(_) => {
                api_error(StatusCode::NOT_FOUND, "entry_not_found", &message)
            }
            SetupError::NotReady { .. } => {
                api_error(StatusCode::SERVICE_UNAVAILABLE, "not_ready", &message)
            }
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serve the REST API until `shutdown` resolves.
pub async fn run_http_server<F>(
    addr: SocketAddr,
    registry: Arc<EntryRegistry>,
    cors_allowed_origins: &[String],
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(Arc::new(AppState { registry }), cors_allowed_origins);

    info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Build the application router with all routes.
///
/// Cross-origin requests are only answered for `cors_allowed_origins`.
pub fn build_router(state: Arc<AppState>, cors_allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = cors_allowed_origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/entries", get(list_entries))
        .route("/entries/:id/snapshot", get(get_snapshot))
        .route("/entries/:id/sensors", get(get_sensors))
        .route("/entries/:id/refresh", post(refresh_entry))
        .route("/entries/:id/services", get(list_services))
        .route("/entries/:id/services/:service", post(call_service))
        .route("/entries/:id/options", put(update_options))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn coordinator_for(state: &AppState, id: &str) -> ApiResult<Arc<RefreshCoordinator>> {
    state
        .registry
        .coordinator(id)
        .await
        .ok_or_else(|| entry_not_found(id))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let entries = state.registry.summaries().await;
    let healthy = entries.iter().filter(|e| e.last_update_success).count();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entries": entries.len(),
        "healthy_entries": healthy,
    }))
}

/// GET /api/v1/entries
async fn list_entries(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.summaries().await)
}

/// GET /api/v1/entries/:id/snapshot
async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let coordinator = coordinator_for(&state, &id).await?;

    match coordinator.snapshot() {
        Some(snapshot) => Ok(Json(json!({
            "entry_id": id,
            "available": coordinator.last_update_success(),
            "snapshot": snapshot.as_ref(),
        }))
        .into_response()),
        None => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_snapshot",
            "No snapshot has been published yet",
        )),
    }
}

/// GET /api/v1/entries/:id/sensors
async fn get_sensors(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<entity::SensorReading>>> {
    let coordinator = coordinator_for(&state, &id).await?;
    Ok(Json(entity::sensors(&coordinator)))
}

/// POST /api/v1/entries/:id/refresh - Run a cycle now
async fn refresh_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let coordinator = coordinator_for(&state, &id).await?;
    if !state.registry.is_ready(&id).await {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            &format!("Entry {} is not ready and retries on its own", id),
        ));
    }

    match coordinator.refresh().await {
        Ok(RefreshOutcome::Published(snapshot)) => Ok(Json(json!({
            "status": "published",
            "nodes": snapshot.nodes.len(),
            "refreshed_at": snapshot.refreshed_at,
        }))
        .into_response()),
        Ok(RefreshOutcome::Skipped) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "skipped" })),
        )
            .into_response()),
        Err(e) => {
            warn!(entry_id = %id, error = %e, "Refresh via HTTP API failed");
            Err(api_error(StatusCode::BAD_GATEWAY, "refresh_failed", &e.to_string()))
        }
    }
}

/// GET /api/v1/entries/:id/services
async fn list_services(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<&'static str>>> {
    coordinator_for(&state, &id).await?;
    Ok(Json(state.registry.services().services(&id)))
}

/// POST /api/v1/entries/:id/services/:service - Run a VM action
async fn call_service(
    State(state): State<Arc<AppState>>,
    Path((id, service)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    match state.registry.call_service(&id, &service, &payload).await {
        Ok(result) => {
            info!(entry_id = %id, service = %service, "Service called via HTTP API");
            Ok(Json(json!({
                "entry_id": id,
                "service": service,
                "result": result,
            })))
        }
        Err(e) => {
            error!(entry_id = %id, service = %service, error = %e, "Service call failed");
            Err(e.into())
        }
    }
}

/// PUT /api/v1/entries/:id/options - Change options and reload the entry
async fn update_options(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(options): Json<EntryOptions>,
) -> ApiResult<Json<Value>> {
    let coordinator = state.registry.update_options(&id, options).await?;

    Ok(Json(json!({
        "entry_id": id,
        "update_interval_secs": coordinator.update_interval().as_secs(),
        "last_update_success": coordinator.last_update_success(),
    })))
}
