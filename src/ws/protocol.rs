//! Control-channel message definitions.
//! One JSON message per frame, discriminated by `type`.

use serde::{Deserialize, Serialize};

/// Messages sent from browser to gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Set the display name for this session
    Hello { name: Option<String> },

    /// Movement intent for the session's room
    Input { dx: f32, dy: f32 },

    /// Join a registry room, spawning its worker if absent
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        name: Option<String>,
    },

    /// Leave the current room
    LeaveRoom,

    /// Client SDP offer for the room's media fabric
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        room_id: String,
        player_id: String,
        sdp: String,
    },

    /// Client SDP answer to a server-initiated offer
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        room_id: String,
        player_id: String,
        sdp: String,
    },

    /// Trickle-ICE candidate from the client
    #[serde(rename_all = "camelCase")]
    WebrtcIce {
        room_id: String,
        player_id: String,
        candidate: serde_json::Value,
    },
}

/// Messages sent from gateway to browser
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// First message after connect, carries the minted player ID
    Welcome { id: String },

    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        player_id: String,
        is_host: bool,
        player_count: usize,
    },

    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        player_id: String,
        player_name: String,
        player_count: usize,
    },

    #[serde(rename_all = "camelCase")]
    PlayerLeft {
        player_id: String,
        player_name: String,
    },

    /// Room-scoped world state
    #[serde(rename_all = "camelCase")]
    State {
        your_id: String,
        room_id: String,
        players: Vec<PlayerEntry>,
    },

    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        room_id: String,
        player_id: String,
        sdp: String,
    },

    /// Server-initiated renegotiation offer
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        room_id: String,
        player_id: String,
        sdp: String,
    },

    /// Server-side trickle-ICE candidate
    #[serde(rename_all = "camelCase")]
    WebrtcIce {
        room_id: String,
        player_id: String,
        candidate: serde_json::Value,
    },

    WebrtcError { error: String },

    Error { error: String },
}

/// One player in a `state` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub id: String,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub rot: f32,
}
