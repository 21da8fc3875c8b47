//! Authoritative room simulation

pub mod delta;
pub mod state;
pub mod worker;

pub use state::{GameConfig, Player, RoomState};
pub use worker::{Broadcaster, GameWorker};

use serde::{Deserialize, Serialize};

/// 2D vector used for position, velocity, and movement intent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One player command, applied on the next tick
#[derive(Debug, Clone, Default)]
pub struct Input {
    /// Monotonically increasing per player; stale sequences are dropped
    pub sequence: u64,
    /// Wall-clock capture time in milliseconds
    pub timestamp: u64,
    /// Movement intent, each component in [-1, 1]
    pub movement: Vec2,
    pub jump: bool,
    pub action1: bool,
    pub action2: bool,
}
