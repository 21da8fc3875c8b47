//! Binary wire format for the gateway ↔ worker edge.
//!
//! Messages are a tagged sum type serialized with bincode (fixed-width
//! variant tags), one message per datagram.

use serde::{Deserialize, Serialize};

use crate::game::Vec2;

/// Largest encoded message the transport will carry
pub const MAX_DATAGRAM: usize = 1400;

/// Player state as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerWire {
    pub id: String,
    pub name: String,
    pub position: Vec2,
    pub velocity: Vec2,
    pub rotation: f32,
    pub timestamp: u64,
}

/// Every message exchanged between gateway and worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    ClientHello {
        player_id: String,
        player_name: String,
        version: String,
    },
    ServerWelcome {
        player_id: String,
        tick_rate: u32,
        server_time: u64,
    },
    PlayerInput {
        player_id: String,
        sequence: u64,
        timestamp: u64,
        movement: Vec2,
        jump: bool,
        action1: bool,
        action2: bool,
    },
    StateSnapshot {
        tick: u64,
        timestamp: u64,
        players: Vec<PlayerWire>,
    },
    StateDelta {
        tick: u64,
        timestamp: u64,
        changed: Vec<PlayerWire>,
        removed: Vec<String>,
    },
    PlayerJoin {
        player: PlayerWire,
    },
    PlayerLeave {
        player_id: String,
        reason: String,
    },
}

impl WireMessage {
    /// Human-readable message type for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::ClientHello { .. } => "ClientHello",
            WireMessage::ServerWelcome { .. } => "ServerWelcome",
            WireMessage::PlayerInput { .. } => "PlayerInput",
            WireMessage::StateSnapshot { .. } => "StateSnapshot",
            WireMessage::StateDelta { .. } => "StateDelta",
            WireMessage::PlayerJoin { .. } => "PlayerJoin",
            WireMessage::PlayerLeave { .. } => "PlayerLeave",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("encode: {0}")]
    Encode(#[source] bincode::Error),

    #[error("decode: {0}")]
    Decode(#[source] bincode::Error),

    #[error("encoded message is {len} bytes, exceeds {MAX_DATAGRAM}")]
    Oversize { len: usize },
}

/// Serialize a message to bytes, refusing oversize datagrams
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, ProtoError> {
    let data = bincode::serialize(msg).map_err(ProtoError::Encode)?;
    if data.len() > MAX_DATAGRAM {
        return Err(ProtoError::Oversize { len: data.len() });
    }
    Ok(data)
}

/// Deserialize bytes to a message
pub fn decode(data: &[u8]) -> Result<WireMessage, ProtoError> {
    bincode::deserialize(data).map_err(ProtoError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: WireMessage) {
        let data = encode(&msg).unwrap();
        assert!(data.len() <= MAX_DATAGRAM);
        assert_eq!(decode(&data).unwrap(), msg);
    }

    fn sample_player(id: &str) -> PlayerWire {
        PlayerWire {
            id: id.to_string(),
            name: "Alice".to_string(),
            position: Vec2::new(500.0, 250.5),
            velocity: Vec2::new(-100.0, 0.0),
            rotation: 0.0,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn client_hello_roundtrip() {
        roundtrip(WireMessage::ClientHello {
            player_id: "deadbeef".to_string(),
            player_name: "Alice".to_string(),
            version: "1.0".to_string(),
        });
    }

    #[test]
    fn server_welcome_roundtrip() {
        roundtrip(WireMessage::ServerWelcome {
            player_id: "deadbeef".to_string(),
            tick_rate: 60,
            server_time: 1_700_000_000_000,
        });
    }

    #[test]
    fn player_input_roundtrip() {
        roundtrip(WireMessage::PlayerInput {
            player_id: "deadbeef".to_string(),
            sequence: 42,
            timestamp: 1_700_000_000_000,
            movement: Vec2::new(1.0, -0.5),
            jump: true,
            action1: false,
            action2: true,
        });
    }

    #[test]
    fn state_snapshot_roundtrip() {
        roundtrip(WireMessage::StateSnapshot {
            tick: 1234,
            timestamp: 1_700_000_000_000,
            players: vec![sample_player("deadbeef"), sample_player("cafebabe")],
        });
    }

    #[test]
    fn state_delta_roundtrip() {
        roundtrip(WireMessage::StateDelta {
            tick: 1234,
            timestamp: 1_700_000_000_000,
            changed: vec![sample_player("deadbeef")],
            removed: vec!["cafebabe".to_string()],
        });
    }

    #[test]
    fn player_join_and_leave_roundtrip() {
        roundtrip(WireMessage::PlayerJoin {
            player: sample_player("deadbeef"),
        });
        roundtrip(WireMessage::PlayerLeave {
            player_id: "deadbeef".to_string(),
            reason: "disconnect".to_string(),
        });
    }

    #[test]
    fn oversize_messages_are_refused() {
        let players: Vec<PlayerWire> = (0..200)
            .map(|i| sample_player(&format!("{:08x}", i)))
            .collect();
        let msg = WireMessage::StateSnapshot {
            tick: 1,
            timestamp: 0,
            players,
        };
        assert!(matches!(encode(&msg), Err(ProtoError::Oversize { .. })));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode(&[0xff; 16]).is_err());
    }
}
