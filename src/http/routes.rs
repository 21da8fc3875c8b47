//! HTTP route definitions: room management, status, health

use axum::{
    extract::{Path, State},
    http::{header::HOST, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // Room endpoints are called straight from browsers on other origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let room_routes = Router::new()
        .route("/rooms", post(create_room_handler))
        .route("/rooms/:id", get(get_room_handler).delete(delete_room_handler))
        .route("/status", get(status_handler))
        .layer(cors);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/ws", get(ws_handler))
        .merge(room_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Health and status
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    browser_clients: usize,
    game_rooms: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        browser_clients: state.gateway.browser_clients(),
        game_rooms: state.gateway.game_rooms(),
    })
}

async fn ready_handler() -> &'static str {
    "ready"
}

#[derive(Serialize)]
struct StatusResponse {
    browser_clients: usize,
    game_rooms: usize,
    rooms: usize,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        browser_clients: state.gateway.browser_clients(),
        game_rooms: state.gateway.game_rooms(),
        rooms: state.registry.count(),
    })
}

// ============================================================================
// Room management
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomResponse {
    room_id: String,
    join_link: String,
    created_at: u64,
    host_id: String,
}

async fn create_room_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let room = state.registry.create();

    // Derive the shareable link from the caller's view of this host
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| state.config.server_addr.to_string());
    let join_link = format!("{scheme}://{host}/room/{}", room.id);

    (
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            room_id: room.id.clone(),
            join_link,
            created_at: room.created_at,
            host_id: room.host_id(),
        }),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomResponse {
    room_id: String,
    player_count: usize,
    max_players: usize,
    players: Vec<String>,
    created_at: u64,
}

async fn get_room_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RoomResponse>, AppError> {
    let room = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::NotFound("room not found".to_string()))?;

    Ok(Json(RoomResponse {
        room_id: room.id.clone(),
        player_count: room.player_count(),
        max_players: room.max_players(),
        players: room.player_ids(),
        created_at: room.created_at,
    }))
}

#[derive(Serialize)]
struct DeleteRoomResponse {
    status: &'static str,
}

async fn delete_room_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteRoomResponse>, AppError> {
    if state.registry.get(&id).is_none() {
        return Err(AppError::NotFound("room not found".to_string()));
    }

    state.gateway.stop_room(&id).await;
    state.registry.delete(&id);

    Ok(Json(DeleteRoomResponse { status: "deleted" }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
