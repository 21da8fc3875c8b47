//! Per-room simulation worker: owns the authoritative state and the tick loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::proto::{self, PlayerWire, WireMessage};
use crate::util::time::unix_millis;

use super::delta::DeltaTracker;
use super::state::{GameConfig, Player, RoomState};
use super::Input;

/// Delivery failure reported by a [`Broadcaster`]
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct BroadcastError(pub String);

/// Sends worker messages to players. The gateway provides the production
/// implementation; tests use a recording mock.
pub trait Broadcaster: Send + Sync {
    /// Send to every player in the room, optionally excluding one ID
    fn broadcast(&self, msg: &WireMessage, exclude_id: &str) -> Result<(), BroadcastError>;

    /// Send to a single return address
    fn send_to(&self, addr: &str, msg: &WireMessage) -> Result<(), BroadcastError>;
}

/// One room's simulation: tick loop, input queues, delta fan-out
pub struct GameWorker {
    room_id: String,
    state: Arc<RoomState>,
    broadcaster: Arc<dyn Broadcaster>,
    delta: Mutex<DeltaTracker>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GameWorker {
    pub fn new(room_id: &str, config: GameConfig, broadcaster: Arc<dyn Broadcaster>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            room_id: room_id.to_string(),
            state: Arc::new(RoomState::new(config)),
            broadcaster,
            delta: Mutex::new(DeltaTracker::new()),
            running: AtomicBool::new(false),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Begin the tick loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let worker = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let config = *worker.state.config();
            let tick_duration = Duration::from_micros(1_000_000 / config.tick_rate.max(1) as u64);
            let broadcast_interval =
                Duration::from_micros(1_000_000 / config.broadcast_rate.max(1) as u64);

            let mut ticker = interval(tick_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_broadcast = Instant::now();

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        worker.state.advance_tick();
                        worker.state.process_inputs();

                        if last_broadcast.elapsed() >= broadcast_interval {
                            worker.broadcast_state();
                            last_broadcast = Instant::now();
                        }
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);

        info!(
            room_id = %self.room_id,
            tick_rate = self.state.config().tick_rate,
            broadcast_rate = self.state.config().broadcast_rate,
            "Worker started"
        );
    }

    /// Stop the tick loop and wait for it to drain. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.delta.lock().clear();

        info!(room_id = %self.room_id, "Worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &Arc<RoomState> {
        &self.state
    }

    pub fn current_tick(&self) -> u64 {
        self.state.current_tick()
    }

    pub fn player_count(&self) -> usize {
        self.state.player_count()
    }

    /// Add a player with a generated ID; `None` when full or colliding.
    /// Announces the join to everyone else.
    pub fn add_player(&self, name: &str, addr: &str) -> Option<Player> {
        let player = self.state.add_player(name, addr)?;
        self.announce_join(&player);
        Some(player)
    }

    /// Add a player under a caller-minted ID; `None` when full or colliding
    pub fn add_player_with_id(&self, name: &str, player_id: &str, addr: &str) -> Option<Player> {
        let player = self.state.add_player_with_id(name, player_id, addr)?;
        self.announce_join(&player);
        Some(player)
    }

    fn announce_join(&self, player: &Player) {
        let msg = WireMessage::PlayerJoin {
            player: wire_player(player),
        };
        if let Err(e) = self.broadcaster.broadcast(&msg, &player.id) {
            warn!(room_id = %self.room_id, error = %e, "PlayerJoin broadcast failed");
        }

        info!(
            room_id = %self.room_id,
            player_id = %player.id,
            name = %player.name,
            player_count = self.state.player_count(),
            "Player joined"
        );
    }

    /// Remove a player and announce the departure. Idempotent.
    pub fn remove_player(&self, player_id: &str) {
        let Some(player) = self.state.remove_player(player_id) else {
            return;
        };
        // The delta tracker notices the absence on the next broadcast and
        // reports the removal exactly once

        let msg = WireMessage::PlayerLeave {
            player_id: player_id.to_string(),
            reason: "disconnect".to_string(),
        };
        if let Err(e) = self.broadcaster.broadcast(&msg, "") {
            warn!(room_id = %self.room_id, error = %e, "PlayerLeave broadcast failed");
        }

        info!(
            room_id = %self.room_id,
            player_id = %player_id,
            name = %player.name,
            "Player left"
        );
    }

    /// Queue input for the next tick; false when stale or unknown
    pub fn apply_input(&self, player_id: &str, input: Input) -> bool {
        self.state.apply_input(player_id, input)
    }

    /// Send a complete state snapshot to one return address (used on join)
    pub fn send_full_snapshot(&self, addr: &str) {
        let players = self.state.all_players();
        let msg = WireMessage::StateSnapshot {
            tick: self.state.current_tick(),
            timestamp: unix_millis(),
            players: players.iter().map(wire_player).collect(),
        };
        if let Err(e) = self.broadcaster.send_to(addr, &msg) {
            warn!(room_id = %self.room_id, addr = %addr, error = %e, "Snapshot send failed");
        }
    }

    /// Decode and dispatch one inbound frame from the gateway
    pub fn handle_frame(&self, addr: &str, data: &[u8]) {
        let msg = match proto::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(room_id = %self.room_id, addr = %addr, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        match msg {
            WireMessage::ClientHello {
                player_id,
                player_name,
                ..
            } => self.client_hello(&player_name, &player_id, addr),

            WireMessage::PlayerInput {
                player_id,
                sequence,
                timestamp,
                movement,
                jump,
                action1,
                action2,
            } => {
                let accepted = self.apply_input(
                    &player_id,
                    Input {
                        sequence,
                        timestamp,
                        movement,
                        jump,
                        action1,
                        action2,
                    },
                );
                if !accepted {
                    debug!(
                        room_id = %self.room_id,
                        player_id = %player_id,
                        sequence,
                        "Input dropped"
                    );
                }
            }

            other => {
                debug!(
                    room_id = %self.room_id,
                    msg = other.type_name(),
                    "Ignoring unexpected frame"
                );
            }
        }
    }

    fn client_hello(&self, name: &str, player_id: &str, addr: &str) {
        // Duplicate hello from a known player: just refresh their view
        if self.state.get_player(player_id).is_some() {
            self.send_full_snapshot(addr);
            return;
        }

        let Some(player) = self.add_player_with_id(name, player_id, addr) else {
            warn!(
                room_id = %self.room_id,
                player_id = %player_id,
                "Admission refused (room full or ID collision)"
            );
            return;
        };

        let welcome = WireMessage::ServerWelcome {
            player_id: player.id.clone(),
            tick_rate: self.state.config().tick_rate,
            server_time: unix_millis(),
        };
        if let Err(e) = self.broadcaster.send_to(addr, &welcome) {
            warn!(room_id = %self.room_id, error = %e, "Welcome send failed");
        }

        self.send_full_snapshot(addr);
    }

    /// Send state updates to all players using delta compression
    fn broadcast_state(&self) {
        let players = self.state.all_players();
        if players.is_empty() {
            return;
        }

        let (changed, removed) = self.delta.lock().compute_delta(&players, false);
        if changed.is_empty() && removed.is_empty() {
            return;
        }

        let msg = WireMessage::StateDelta {
            tick: self.state.current_tick(),
            timestamp: unix_millis(),
            changed,
            removed,
        };
        if let Err(e) = self.broadcaster.broadcast(&msg, "") {
            warn!(room_id = %self.room_id, error = %e, "State broadcast failed");
        }
    }
}

fn wire_player(player: &Player) -> PlayerWire {
    PlayerWire {
        id: player.id.clone(),
        name: player.name.clone(),
        position: player.position,
        velocity: player.velocity,
        rotation: 0.0,
        timestamp: player.last_seen,
    }
}
