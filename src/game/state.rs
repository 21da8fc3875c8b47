//! Authoritative room state: player collection, input queues, physics integration

use std::collections::{HashMap, VecDeque};
use parking_lot::RwLock;

use uuid::Uuid;

use crate::util::time::unix_millis;

use super::{Input, Vec2};

/// Inputs queued beyond this are applied by dropping the oldest first
const INPUT_QUEUE_CAP: usize = 16;

/// Simulation configuration, immutable after construction
#[derive(Debug, Clone, Copy)]
pub struct GameConfig {
    /// Ticks per second
    pub tick_rate: u32,
    /// State broadcasts per second
    pub broadcast_rate: u32,
    /// Maximum concurrent players
    pub max_players: usize,
    /// Units per second
    pub player_speed: f32,
    /// World bounds
    pub world_width: f32,
    pub world_height: f32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            broadcast_rate: 20,
            max_players: 100,
            player_speed: 100.0,
            world_width: 1000.0,
            world_height: 1000.0,
        }
    }
}

/// A connected player
#[derive(Debug, Clone)]
pub struct Player {
    pub id: String,
    pub name: String,
    /// Return address: the routing handle the gateway resolves to a session
    pub addr: String,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Last processed input sequence
    pub last_applied_seq: u64,
    pub connected_at: u64,
    pub last_seen: u64,

    /// Pending inputs, drained in arrival order each tick
    pub input_queue: VecDeque<Input>,
}

/// The authoritative game state for one room
pub struct RoomState {
    inner: RwLock<StateInner>,
    config: GameConfig,
}

struct StateInner {
    players: HashMap<String, Player>,
    tick: u64,
}

/// Mint a short printable player ID
pub fn generate_player_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl RoomState {
    pub fn new(config: GameConfig) -> Self {
        Self {
            inner: RwLock::new(StateInner {
                players: HashMap::new(),
                tick: 0,
            }),
            config,
        }
    }

    /// Create and add a new player with a generated ID.
    /// Returns `None` when the room is full or the assigned ID collides.
    pub fn add_player(&self, name: &str, addr: &str) -> Option<Player> {
        self.add_player_with_id(name, &generate_player_id(), addr)
    }

    /// Create and add a new player under a caller-supplied ID.
    /// Returns `None` when the room is full or the ID collides.
    pub fn add_player_with_id(&self, name: &str, player_id: &str, addr: &str) -> Option<Player> {
        let mut inner = self.inner.write();

        if inner.players.contains_key(player_id) {
            return None;
        }
        if inner.players.len() >= self.config.max_players {
            return None;
        }

        let now = unix_millis();
        let player = Player {
            id: player_id.to_string(),
            name: name.to_string(),
            addr: addr.to_string(),
            // Spawn at world centre, at rest
            position: Vec2::new(self.config.world_width / 2.0, self.config.world_height / 2.0),
            velocity: Vec2::default(),
            last_applied_seq: 0,
            connected_at: now,
            last_seen: now,
            input_queue: VecDeque::with_capacity(INPUT_QUEUE_CAP),
        };

        inner.players.insert(player.id.clone(), player.clone());
        Some(player)
    }

    /// Remove a player by ID. Idempotent.
    pub fn remove_player(&self, id: &str) -> Option<Player> {
        let mut inner = self.inner.write();
        inner.players.remove(id)
    }

    pub fn get_player(&self, id: &str) -> Option<Player> {
        let inner = self.inner.read();
        inner.players.get(id).cloned()
    }

    /// Snapshot of all players (for broadcasting)
    pub fn all_players(&self) -> Vec<Player> {
        let inner = self.inner.read();
        inner.players.values().cloned().collect()
    }

    pub fn player_count(&self) -> usize {
        let inner = self.inner.read();
        inner.players.len()
    }

    /// Increment and return the tick counter
    pub fn advance_tick(&self) -> u64 {
        let mut inner = self.inner.write();
        inner.tick += 1;
        inner.tick
    }

    pub fn current_tick(&self) -> u64 {
        let inner = self.inner.read();
        inner.tick
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Queue player input for the next tick.
    /// Returns false when the player is unknown or the sequence is stale.
    pub fn apply_input(&self, player_id: &str, mut input: Input) -> bool {
        let mut inner = self.inner.write();

        let Some(player) = inner.players.get_mut(player_id) else {
            return false;
        };

        // Already processed this or a newer input
        if input.sequence <= player.last_applied_seq {
            return false;
        }

        input.movement.x = input.movement.x.clamp(-1.0, 1.0);
        input.movement.y = input.movement.y.clamp(-1.0, 1.0);

        if player.input_queue.len() >= INPUT_QUEUE_CAP {
            player.input_queue.pop_front();
        }
        player.input_queue.push_back(input);
        player.last_seen = unix_millis();
        true
    }

    /// Apply all queued inputs for all players. Call once per tick.
    pub fn process_inputs(&self) {
        let mut inner = self.inner.write();

        let dt = 1.0 / self.config.tick_rate as f32;
        let speed = self.config.player_speed;
        let (width, height) = (self.config.world_width, self.config.world_height);

        for player in inner.players.values_mut() {
            while let Some(input) = player.input_queue.pop_front() {
                player.velocity.x = input.movement.x * speed;
                player.velocity.y = input.movement.y * speed;

                player.position.x += player.velocity.x * dt;
                player.position.y += player.velocity.y * dt;

                player.position.x = player.position.x.clamp(0.0, width);
                player.position.y = player.position.y.clamp(0.0, height);

                player.last_applied_seq = input.sequence;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(seq: u64, dx: f32, dy: f32) -> Input {
        Input {
            sequence: seq,
            timestamp: seq,
            movement: Vec2::new(dx, dy),
            ..Input::default()
        }
    }

    #[test]
    fn add_player_spawns_at_world_centre() {
        let state = RoomState::new(GameConfig::default());
        let player = state.add_player("Alice", "sess-a").unwrap();

        assert_eq!(player.position, Vec2::new(500.0, 500.0));
        assert_eq!(player.velocity, Vec2::default());
        assert_eq!(player.id.len(), 8);
        assert_eq!(state.player_count(), 1);
    }

    #[test]
    fn add_player_with_id_rejects_collision() {
        let state = RoomState::new(GameConfig::default());
        assert!(state.add_player_with_id("A", "deadbeef", "sess-a").is_some());
        assert!(state.add_player_with_id("B", "deadbeef", "sess-b").is_none());
        assert_eq!(state.player_count(), 1);
    }

    #[test]
    fn admission_cap_is_enforced() {
        let config = GameConfig {
            max_players: 2,
            ..GameConfig::default()
        };
        let state = RoomState::new(config);
        assert!(state.add_player("A", "a").is_some());
        assert!(state.add_player("B", "b").is_some());
        assert!(state.add_player("C", "c").is_none());
        assert_eq!(state.player_count(), 2);
    }

    #[test]
    fn stale_and_duplicate_inputs_are_dropped() {
        let state = RoomState::new(GameConfig::default());
        let player = state.add_player("A", "a").unwrap();

        assert!(state.apply_input(&player.id, input(1, 1.0, 0.0)));
        state.process_inputs();
        assert_eq!(state.get_player(&player.id).unwrap().last_applied_seq, 1);

        // Equal sequence rejected, next sequence accepted
        assert!(!state.apply_input(&player.id, input(1, 1.0, 0.0)));
        assert!(state.apply_input(&player.id, input(2, 1.0, 0.0)));
    }

    #[test]
    fn input_for_unknown_player_is_rejected() {
        let state = RoomState::new(GameConfig::default());
        assert!(!state.apply_input("nobody", input(1, 1.0, 0.0)));
    }

    #[test]
    fn movement_integrates_at_player_speed() {
        // 60 units/sec at 60 Hz moves exactly 1 unit per input
        let config = GameConfig {
            player_speed: 60.0,
            ..GameConfig::default()
        };
        let state = RoomState::new(config);
        let player = state.add_player("A", "a").unwrap();

        state.apply_input(&player.id, input(1, 1.0, 0.0));
        state.apply_input(&player.id, input(2, 1.0, 0.0));
        state.process_inputs();

        let moved = state.get_player(&player.id).unwrap();
        assert_approx_eq::assert_approx_eq!(moved.position.x, 502.0, 0.001);
        assert_approx_eq::assert_approx_eq!(moved.position.y, 500.0, 0.001);
        assert_eq!(moved.last_applied_seq, 2);
    }

    #[test]
    fn movement_intent_is_clamped() {
        let config = GameConfig {
            player_speed: 60.0,
            ..GameConfig::default()
        };
        let state = RoomState::new(config);
        let player = state.add_player("A", "a").unwrap();

        // Intent far outside [-1, 1] moves no faster than full intent
        state.apply_input(&player.id, input(1, 25.0, 0.0));
        state.process_inputs();

        let moved = state.get_player(&player.id).unwrap();
        assert_approx_eq::assert_approx_eq!(moved.position.x, 501.0, 0.001);
    }

    #[test]
    fn position_clamps_to_world_bounds() {
        let state = RoomState::new(GameConfig::default());
        let player = state.add_player("A", "a").unwrap();

        // Push hard toward the upper-left corner for many ticks
        for seq in 1..=2000 {
            state.apply_input(&player.id, input(seq, -1.0, -1.0));
            state.process_inputs();
        }

        let cornered = state.get_player(&player.id).unwrap();
        assert_eq!(cornered.position, Vec2::new(0.0, 0.0));

        // A player pinned at the right edge stays there
        for seq in 2001..=4000 {
            state.apply_input(&player.id, input(seq, 1.0, 0.0));
            state.process_inputs();
        }
        let edge = state.get_player(&player.id).unwrap();
        assert_eq!(edge.position.x, 1000.0);

        state.apply_input(&player.id, input(4001, 1.0, 0.0));
        state.process_inputs();
        assert_eq!(state.get_player(&player.id).unwrap().position.x, 1000.0);
    }

    #[test]
    fn input_queue_drops_oldest_when_full() {
        let config = GameConfig {
            player_speed: 60.0,
            ..GameConfig::default()
        };
        let state = RoomState::new(config);
        let player = state.add_player("A", "a").unwrap();

        // Queue far more than the cap without ticking
        for seq in 1..=40 {
            state.apply_input(&player.id, input(seq, 1.0, 0.0));
        }
        state.process_inputs();

        // Only the newest INPUT_QUEUE_CAP inputs were applied
        let moved = state.get_player(&player.id).unwrap();
        assert_eq!(moved.last_applied_seq, 40);
        assert_approx_eq::assert_approx_eq!(moved.position.x, 500.0 + 16.0, 0.001);
    }

    #[test]
    fn remove_player_is_idempotent() {
        let state = RoomState::new(GameConfig::default());
        let player = state.add_player("A", "a").unwrap();

        assert!(state.remove_player(&player.id).is_some());
        assert!(state.remove_player(&player.id).is_none());
        assert_eq!(state.player_count(), 0);
    }

    #[test]
    fn tick_counter_advances() {
        let state = RoomState::new(GameConfig::default());
        assert_eq!(state.current_tick(), 0);
        assert_eq!(state.advance_tick(), 1);
        assert_eq!(state.advance_tick(), 2);
        assert_eq!(state.current_tick(), 2);
    }
}
