//! HTTP API integration tests: room management, status, and health over the
//! real router.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use playroom::app::AppState;
use playroom::config::Config;

fn test_state() -> AppState {
    AppState::new(Config {
        server_addr: "127.0.0.1:0".parse().unwrap(),
        log_level: "info".to_string(),
        room_ttl: Duration::from_secs(300),
        cleanup_period: Duration::from_secs(30),
        room_max_players: 8,
        worker_max_players: 100,
        tick_rate: 60,
        broadcast_rate: 20,
        stun_servers: vec![],
    })
}

fn test_router() -> (Router, AppState) {
    let state = test_state();
    (playroom::http::routes::build_router(state.clone()), state)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (router, _state) = test_router();

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["game_rooms"], 0);
}

#[tokio::test]
async fn ready_returns_ok() {
    let (router, _state) = test_router();

    let response = router
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_room_returns_join_link() {
    let (router, _state) = test_router();

    let response = router
        .oneshot(
            Request::post("/rooms")
                .header("host", "game.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;

    let room_id = body["roomId"].as_str().unwrap();
    assert_eq!(room_id.len(), 6);
    assert!(room_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(
        body["joinLink"].as_str().unwrap(),
        format!("http://game.example.com/room/{room_id}")
    );
    assert_eq!(body["hostId"], "");
    assert!(body["createdAt"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn get_room_reflects_membership() {
    let (router, state) = test_router();

    let room = state.registry.create();
    state.registry.join(&room.id, "deadbeef", "Alice").unwrap();

    let response = router
        .oneshot(
            Request::get(format!("/rooms/{}", room.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["roomId"], room.id);
    assert_eq!(body["playerCount"], 1);
    assert_eq!(body["maxPlayers"], 8);
    assert_eq!(body["players"], serde_json::json!(["deadbeef"]));
}

#[tokio::test]
async fn unknown_room_is_404() {
    let (router, _state) = test_router();

    let response = router
        .oneshot(Request::get("/rooms/ffffff").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"], "room not found");
}

#[tokio::test]
async fn delete_room_stops_the_worker() {
    let (router, state) = test_router();

    let room = state.registry.create();
    let worker = state.gateway.spawn_worker(&room.id);
    assert!(worker.is_running());

    let response = router
        .clone()
        .oneshot(
            Request::delete(format!("/rooms/{}", room.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "deleted");
    assert!(!worker.is_running());
    assert!(state.registry.get(&room.id).is_none());

    // Deleting again is a 404
    let response = router
        .oneshot(
            Request::delete(format!("/rooms/{}", room.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_counts_rooms_and_workers() {
    let (router, state) = test_router();

    let room = state.registry.create();
    state.registry.create();
    state.gateway.spawn_worker(&room.id);

    let response = router
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["rooms"], 2);
    assert_eq!(body["game_rooms"], 1);
    assert_eq!(body["browser_clients"], 0);
}

#[tokio::test]
async fn expired_rooms_vanish_and_their_worker_stops() {
    let state = AppState::new(Config {
        server_addr: "127.0.0.1:0".parse().unwrap(),
        log_level: "info".to_string(),
        room_ttl: Duration::from_millis(10),
        cleanup_period: Duration::from_millis(20),
        room_max_players: 8,
        worker_max_players: 100,
        tick_rate: 60,
        broadcast_rate: 20,
        stun_servers: vec![],
    });
    let router = playroom::http::routes::build_router(state.clone());

    let room = state.registry.create();
    let worker = state.gateway.spawn_worker(&room.id);

    // Join and leave so the room is empty but was recently active
    state.registry.join(&room.id, "deadbeef", "Alice").unwrap();
    state.registry.leave(&room.id, "deadbeef");

    // Wait out the TTL plus a sweep period
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = router
        .oneshot(
            Request::get(format!("/rooms/{}", room.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The expiry callback stopped the worker
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while worker.is_running() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!worker.is_running());
}
