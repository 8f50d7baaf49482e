use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use log::warn;

use crate::data::{HubHandle, HubStats};
use crate::websocket::WEBSOCKET_PATH;

#[derive(Clone)]
pub struct ApiState {
    pub hub: HubHandle,
    /// Port the WebSocket listener is bound to, handed to browser clients.
    pub websocket_port: u16,
}

impl ApiState {
    pub fn new(hub: HubHandle, websocket_port: u16) -> Self {
        Self { hub, websocket_port }
    }
}

// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tickstream",
        "timestamp": chrono::Utc::now()
    }))
}

// GET /api/stats - Hub delivery counters
pub async fn hub_stats(
    State(state): State<ApiState>,
) -> Result<Json<HubStats>, (StatusCode, Json<serde_json::Value>)> {
    match state.hub.stats().await {
        Some(stats) => Ok(Json(stats)),
        None => {
            warn!("Stats requested but the hub is not running");
            Err((StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({
                "status": "unavailable",
                "message": "Hub is not running"
            }))))
        }
    }
}

// GET /api/config - Where clients should open the price stream
pub async fn client_config(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "websocket_port": state.websocket_port,
        "websocket_path": WEBSOCKET_PATH
    }))
}

/// API routes under `/api`, with everything else served from `static_dir`.
pub fn create_api_router(state: ApiState, static_dir: &str) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(hub_stats))
        .route("/config", get(client_config))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
}
