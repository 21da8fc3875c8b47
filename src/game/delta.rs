//! Delta compression for state broadcasts

use std::collections::{HashMap, HashSet};

use crate::proto::PlayerWire;

use super::Player;

/// Movement below this threshold is treated as unchanged
const EPSILON: f32 = 0.1;

/// Tracks the last broadcast state per player to compute minimal deltas
#[derive(Default)]
pub struct DeltaTracker {
    last_states: HashMap<String, TrackedState>,
}

#[derive(Clone, Copy)]
struct TrackedState {
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
    rotation: f32,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return players changed since the last call, and IDs that disappeared.
    /// With `full_sync` every current player is reported as changed.
    pub fn compute_delta(
        &mut self,
        players: &[Player],
        full_sync: bool,
    ) -> (Vec<PlayerWire>, Vec<String>) {
        let current_ids: HashSet<&str> = players.iter().map(|p| p.id.as_str()).collect();

        let mut removed: Vec<String> = self
            .last_states
            .keys()
            .filter(|id| !current_ids.contains(id.as_str()))
            .cloned()
            .collect();
        removed.sort();
        for id in &removed {
            self.last_states.remove(id);
        }

        let mut changed = Vec::new();
        for player in players {
            let snapshot = TrackedState {
                x: player.position.x,
                y: player.position.y,
                vx: player.velocity.x,
                vy: player.velocity.y,
                rotation: 0.0,
            };

            let moved = match self.last_states.get(&player.id) {
                Some(last) => has_changed(last, &snapshot),
                None => true,
            };

            if full_sync || moved {
                changed.push(PlayerWire {
                    id: player.id.clone(),
                    name: player.name.clone(),
                    position: player.position,
                    velocity: player.velocity,
                    rotation: snapshot.rotation,
                    timestamp: player.last_seen,
                });
                self.last_states.insert(player.id.clone(), snapshot);
            }
        }

        (changed, removed)
    }

    /// Reset all tracked state (on worker stop)
    pub fn clear(&mut self) {
        self.last_states.clear();
    }

    pub fn tracked_count(&self) -> usize {
        self.last_states.len()
    }
}

fn has_changed(old: &TrackedState, new: &TrackedState) -> bool {
    (new.x - old.x).abs() > EPSILON
        || (new.y - old.y).abs() > EPSILON
        || (new.vx - old.vx).abs() > EPSILON
        || (new.vy - old.vy).abs() > EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Vec2;
    use std::collections::VecDeque;

    fn player(id: &str, x: f32, y: f32) -> Player {
        Player {
            id: id.to_string(),
            name: id.to_string(),
            addr: id.to_string(),
            position: Vec2::new(x, y),
            velocity: Vec2::default(),
            last_applied_seq: 0,
            connected_at: 0,
            last_seen: 0,
            input_queue: VecDeque::new(),
        }
    }

    #[test]
    fn full_sync_reports_everyone() {
        let mut tracker = DeltaTracker::new();
        let players = vec![player("p1", 100.0, 100.0), player("p2", 200.0, 200.0)];

        let (changed, removed) = tracker.compute_delta(&players, true);
        assert_eq!(changed.len(), 2);
        assert!(removed.is_empty());
    }

    #[test]
    fn stable_state_produces_empty_delta() {
        let mut tracker = DeltaTracker::new();
        let players = vec![player("p1", 100.0, 100.0)];

        let (changed, _) = tracker.compute_delta(&players, false);
        assert_eq!(changed.len(), 1); // first sighting

        let (changed, removed) = tracker.compute_delta(&players, false);
        assert!(changed.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn sub_epsilon_jitter_is_suppressed() {
        let mut tracker = DeltaTracker::new();
        let mut players = vec![player("p1", 100.0, 100.0)];
        tracker.compute_delta(&players, false);

        players[0].position.x = 100.05;
        let (changed, _) = tracker.compute_delta(&players, false);
        assert!(changed.is_empty());

        players[0].position.x = 100.2;
        let (changed, _) = tracker.compute_delta(&players, false);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "p1");
    }

    #[test]
    fn velocity_change_is_reported() {
        let mut tracker = DeltaTracker::new();
        let mut players = vec![player("p1", 100.0, 100.0)];
        tracker.compute_delta(&players, false);

        players[0].velocity = Vec2::new(100.0, 0.0);
        let (changed, _) = tracker.compute_delta(&players, false);
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn departed_player_is_removed_exactly_once() {
        let mut tracker = DeltaTracker::new();
        let players = vec![player("p1", 100.0, 100.0), player("p2", 200.0, 200.0)];
        tracker.compute_delta(&players, false);

        let remaining = vec![player("p1", 100.0, 100.0)];
        let (changed, removed) = tracker.compute_delta(&remaining, false);
        assert!(changed.is_empty());
        assert_eq!(removed, vec!["p2".to_string()]);

        let (_, removed) = tracker.compute_delta(&remaining, false);
        assert!(removed.is_empty());
    }

    #[test]
    fn clear_resets_tracking() {
        let mut tracker = DeltaTracker::new();
        let players = vec![player("p1", 100.0, 100.0)];
        tracker.compute_delta(&players, false);
        assert_eq!(tracker.tracked_count(), 1);

        tracker.clear();
        assert_eq!(tracker.tracked_count(), 0);

        // Re-reporting after a clear counts as a fresh sighting, not a removal
        let (changed, removed) = tracker.compute_delta(&players, false);
        assert_eq!(changed.len(), 1);
        assert!(removed.is_empty());
    }

    #[test]
    fn identical_inputs_produce_identical_deltas() {
        let players = vec![player("p1", 10.0, 20.0), player("p2", 30.0, 40.0)];

        let mut a = DeltaTracker::new();
        let mut b = DeltaTracker::new();
        assert_eq!(a.compute_delta(&players, false), b.compute_delta(&players, false));

        let moved = vec![player("p1", 15.0, 20.0), player("p2", 30.0, 40.0)];
        assert_eq!(a.compute_delta(&moved, false), b.compute_delta(&moved, false));
    }
}
