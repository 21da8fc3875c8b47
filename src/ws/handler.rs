//! Control-channel upgrade handler and per-session loop

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::util::rate_limit::SessionRateLimiter;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Control-channel upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded control channel
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // The gateway writes to this channel; the writer task drains it to the
    // socket so no gateway path ever blocks on a slow client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMsg>();
    let player_id = state.gateway.register_session(tx.clone());

    if tx.send(ServerMsg::Welcome {
        id: player_id.clone(),
    })
    .is_err()
    {
        error!(player_id = %player_id, "Session channel closed before welcome");
        state.gateway.unregister_session(&player_id).await;
        return;
    }

    let writer_player_id = player_id.clone();
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!(player_id = %writer_player_id, error = %e, "Serialize failed");
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(json)).await {
                debug!(player_id = %writer_player_id, error = %e, "Control channel send failed");
                break;
            }
        }
    });

    let rate_limiter = SessionRateLimiter::new();

    // Reader loop: control frames -> gateway
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(player_id = %player_id, error = %e, "Dropping malformed control frame");
                        continue;
                    }
                };
                dispatch(&state, &player_id, msg, &rate_limiter).await;
            }
            Ok(Message::Binary(_)) => {
                warn!(player_id = %player_id, "Dropping binary control frame");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(player_id = %player_id, "Client closed control channel");
                break;
            }
            Err(e) => {
                debug!(player_id = %player_id, error = %e, "Control channel error");
                break;
            }
        }
    }

    // Cleanup: leave room, drop peer connection, erase session
    state.gateway.unregister_session(&player_id).await;
    writer_handle.abort();
}

async fn dispatch(
    state: &AppState,
    player_id: &str,
    msg: ClientMsg,
    rate_limiter: &SessionRateLimiter,
) {
    let gateway = &state.gateway;

    match msg {
        ClientMsg::Hello { name } => {
            if let Some(name) = name {
                gateway.set_name(player_id, &name);
            }
        }

        ClientMsg::Input { dx, dy } => {
            if !rate_limiter.check_input() {
                debug!(player_id = %player_id, "Rate limited input");
                return;
            }
            gateway.handle_input(player_id, dx, dy);
        }

        ClientMsg::JoinRoom { room_id, name } => {
            if let Err(e) = gateway.join_room(player_id, &room_id, name).await {
                warn!(player_id = %player_id, room_id = %room_id, error = %e, "Join failed");
                gateway.send_to_session(
                    player_id,
                    ServerMsg::Error {
                        error: e.to_string(),
                    },
                );
            }
        }

        ClientMsg::LeaveRoom => {
            gateway.leave_room(player_id).await;
        }

        ClientMsg::WebrtcOffer { sdp, .. } => {
            gateway.handle_webrtc_offer(player_id, sdp).await;
        }

        ClientMsg::WebrtcAnswer { sdp, .. } => {
            gateway.handle_webrtc_answer(player_id, sdp).await;
        }

        ClientMsg::WebrtcIce { candidate, .. } => {
            gateway.handle_webrtc_ice(player_id, candidate).await;
        }
    }
}
