//! Edge gateway: per-browser sessions, worker lifecycle, binary fan-in and
//! fan-out, and media-fabric signalling.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::config::Config;
use crate::game::state::generate_player_id;
use crate::game::worker::{BroadcastError, Broadcaster};
use crate::game::{GameConfig, GameWorker, Vec2};
use crate::proto::{self, PlayerWire, ProtoError, WireMessage};
use crate::room::{Registry, RoomError};
use crate::rtc::{SfuEvent, SfuRoom};
use crate::util::time::unix_millis;
use crate::ws::protocol::{PlayerEntry, ServerMsg};

const PROTOCOL_VERSION: &str = "1.0";

/// Per-browser session bookkeeping. The session's player ID doubles as the
/// worker-side return address.
pub struct Session {
    pub name: String,
    pub room_id: Option<String>,
    pub tx: mpsc::UnboundedSender<ServerMsg>,
    last_input_seq: u64,
}

enum Recipient {
    Broadcast { exclude: String },
    To(String),
}

struct OutboundFrame {
    room_id: String,
    recipient: Recipient,
    data: Vec<u8>,
}

enum FanoutMsg {
    Frame(OutboundFrame),
    DropRoom(String),
}

/// Routes worker messages into the gateway's fan-out task
struct GatewayBroadcaster {
    room_id: String,
    tx: mpsc::UnboundedSender<FanoutMsg>,
}

impl Broadcaster for GatewayBroadcaster {
    fn broadcast(&self, msg: &WireMessage, exclude_id: &str) -> Result<(), BroadcastError> {
        let data = proto::encode(msg).map_err(|e| BroadcastError(e.to_string()))?;
        self.tx
            .send(FanoutMsg::Frame(OutboundFrame {
                room_id: self.room_id.clone(),
                recipient: Recipient::Broadcast {
                    exclude: exclude_id.to_string(),
                },
                data,
            }))
            .map_err(|_| BroadcastError("gateway fan-out closed".to_string()))
    }

    fn send_to(&self, addr: &str, msg: &WireMessage) -> Result<(), BroadcastError> {
        let data = proto::encode(msg).map_err(|e| BroadcastError(e.to_string()))?;
        self.tx
            .send(FanoutMsg::Frame(OutboundFrame {
                room_id: self.room_id.clone(),
                recipient: Recipient::To(addr.to_string()),
                data,
            }))
            .map_err(|_| BroadcastError("gateway fan-out closed".to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Room(#[from] RoomError),

    #[error("failed to start game server")]
    WorkerRejected,

    #[error("unknown session")]
    NoSession,

    #[error("encode: {0}")]
    Proto(#[from] ProtoError),
}

/// The stateful edge node tying sessions, workers, registry, and SFUs together
pub struct Gateway {
    config: Arc<Config>,
    registry: Arc<Registry>,
    sessions: DashMap<String, Session>,
    workers: DashMap<String, Arc<GameWorker>>,
    sfus: DashMap<String, Arc<SfuRoom>>,
    fanout_tx: mpsc::UnboundedSender<FanoutMsg>,
}

impl Gateway {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>) -> Arc<Self> {
        let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();

        let gateway = Arc::new(Self {
            config,
            registry,
            sessions: DashMap::new(),
            workers: DashMap::new(),
            sfus: DashMap::new(),
            fanout_tx,
        });

        tokio::spawn(Arc::clone(&gateway).run_fanout(fanout_rx));
        gateway
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Mint a player ID and record the session. The caller owns the receive
    /// half of `tx`'s channel and writes it to the socket.
    pub fn register_session(&self, tx: mpsc::UnboundedSender<ServerMsg>) -> String {
        let player_id = generate_player_id();
        self.sessions.insert(
            player_id.clone(),
            Session {
                name: "Player".to_string(),
                room_id: None,
                tx,
                last_input_seq: 0,
            },
        );
        info!(player_id = %player_id, clients = self.sessions.len(), "Session connected");
        player_id
    }

    /// Tear down a session on socket close: leave the room, drop the peer
    /// connection, erase the session. The room's worker keeps running; TTL
    /// expiry is the authoritative teardown signal.
    pub async fn unregister_session(&self, player_id: &str) {
        self.leave_room(player_id).await;
        if self.sessions.remove(player_id).is_some() {
            info!(player_id = %player_id, clients = self.sessions.len(), "Session disconnected");
        }
    }

    pub fn set_name(&self, player_id: &str, name: &str) {
        if name.is_empty() {
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(player_id) {
            session.name = name.to_string();
        }
    }

    pub fn browser_clients(&self) -> usize {
        self.sessions.len()
    }

    pub fn game_rooms(&self) -> usize {
        self.workers.len()
    }

    // ------------------------------------------------------------------
    // Room membership
    // ------------------------------------------------------------------

    /// Join the registry room, spawning its worker if this is the first
    /// joiner, and emit `room_joined` + `player_joined`.
    pub async fn join_room(
        &self,
        player_id: &str,
        room_id: &str,
        name: Option<String>,
    ) -> Result<(), GatewayError> {
        let display_name = {
            let mut session = self
                .sessions
                .get_mut(player_id)
                .ok_or(GatewayError::NoSession)?;
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                session.name = name;
            }
            session.name.clone()
        };

        // A session can be in one room at a time
        if let Some(current) = self.session_room(player_id) {
            if current != room_id {
                self.leave_room(player_id).await;
            }
        }

        let (room, member) = self.registry.join(room_id, player_id, &display_name)?;

        let worker = self.spawn_worker(room_id);
        let hello = proto::encode(&WireMessage::ClientHello {
            player_id: player_id.to_string(),
            player_name: display_name.clone(),
            version: PROTOCOL_VERSION.to_string(),
        })?;
        worker.handle_frame(player_id, &hello);

        if worker.state().get_player(player_id).is_none() {
            self.registry.leave(room_id, player_id);
            return Err(GatewayError::WorkerRejected);
        }

        if let Some(mut session) = self.sessions.get_mut(player_id) {
            session.room_id = Some(room_id.to_string());
        }

        let player_count = room.player_count();
        self.send_to_session(
            player_id,
            ServerMsg::RoomJoined {
                room_id: room_id.to_string(),
                player_id: player_id.to_string(),
                is_host: member.is_host,
                player_count,
            },
        );
        self.broadcast_json(
            room_id,
            ServerMsg::PlayerJoined {
                player_id: player_id.to_string(),
                player_name: display_name,
                player_count,
            },
            Some(player_id),
        );

        Ok(())
    }

    /// Leave the current room, if any. Idempotent.
    pub async fn leave_room(&self, player_id: &str) {
        let (room_id, name) = {
            let Some(mut session) = self.sessions.get_mut(player_id) else {
                return;
            };
            let Some(room_id) = session.room_id.take() else {
                return;
            };
            (room_id, session.name.clone())
        };

        self.registry.leave(&room_id, player_id);

        let worker = self.workers.get(&room_id).map(|w| w.value().clone());
        if let Some(worker) = worker {
            worker.remove_player(player_id);
        }

        let sfu = self.sfus.get(&room_id).map(|s| s.value().clone());
        if let Some(sfu) = sfu {
            sfu.remove_peer_connection(player_id).await;
        }

        self.broadcast_json(
            &room_id,
            ServerMsg::PlayerLeft {
                player_id: player_id.to_string(),
                player_name: name,
            },
            Some(player_id),
        );

        info!(room_id = %room_id, player_id = %player_id, "Left room");
    }

    // ------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------

    /// Get or create the room's worker. Idempotent: a second call returns the
    /// same handle.
    pub fn spawn_worker(&self, room_id: &str) -> Arc<GameWorker> {
        let worker = self
            .workers
            .entry(room_id.to_string())
            .or_insert_with(|| {
                let broadcaster = Arc::new(GatewayBroadcaster {
                    room_id: room_id.to_string(),
                    tx: self.fanout_tx.clone(),
                });
                let game_config = GameConfig {
                    tick_rate: self.config.tick_rate,
                    broadcast_rate: self.config.broadcast_rate,
                    max_players: self.config.worker_max_players,
                    ..GameConfig::default()
                };
                Arc::new(GameWorker::new(room_id, game_config, broadcaster))
            })
            .clone();
        worker.start();
        worker
    }

    /// Stop and forget a room's worker and media fabric. Used by the
    /// registry's expiry callback and by `DELETE /rooms/{id}`.
    pub async fn stop_room(&self, room_id: &str) {
        let worker = self.workers.remove(room_id).map(|(_, w)| w);
        if let Some(worker) = worker {
            worker.stop().await;
        }

        let sfu = self.sfus.remove(room_id).map(|(_, s)| s);
        if let Some(sfu) = sfu {
            sfu.close().await;
        }

        let _ = self.fanout_tx.send(FanoutMsg::DropRoom(room_id.to_string()));

        for mut session in self.sessions.iter_mut() {
            if session.room_id.as_deref() == Some(room_id) {
                session.room_id = None;
            }
        }

        info!(room_id = %room_id, "Room stopped");
    }

    /// Graceful shutdown: stop every worker and close every peer connection
    pub async fn shutdown(&self) {
        let mut room_ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        room_ids.extend(self.sfus.iter().map(|e| e.key().clone()));
        room_ids.sort();
        room_ids.dedup();

        for room_id in room_ids {
            self.stop_room(&room_id).await;
        }
    }

    // ------------------------------------------------------------------
    // Fan-in: browser input → binary worker frames
    // ------------------------------------------------------------------

    /// Re-encode a browser input as a binary `PlayerInput` with a
    /// per-session monotonic sequence
    pub fn handle_input(&self, player_id: &str, dx: f32, dy: f32) {
        let (room_id, sequence) = {
            let Some(mut session) = self.sessions.get_mut(player_id) else {
                return;
            };
            let Some(room_id) = session.room_id.clone() else {
                return;
            };
            // unix-millis seed, forced strictly monotonic per session
            let sequence = unix_millis().max(session.last_input_seq + 1);
            session.last_input_seq = sequence;
            (room_id, sequence)
        };

        let Some(worker) = self.workers.get(&room_id).map(|w| w.value().clone()) else {
            return;
        };

        match proto::encode(&WireMessage::PlayerInput {
            player_id: player_id.to_string(),
            sequence,
            timestamp: sequence,
            movement: Vec2::new(dx, dy),
            jump: false,
            action1: false,
            action2: false,
        }) {
            Ok(frame) => worker.handle_frame(player_id, &frame),
            Err(e) => warn!(player_id = %player_id, error = %e, "Input encode failed"),
        }
    }

    // ------------------------------------------------------------------
    // Fan-out: binary worker frames → JSON state messages
    // ------------------------------------------------------------------

    async fn run_fanout(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<FanoutMsg>) {
        // Accumulated world view per room, fed by snapshots and deltas
        let mut room_states: HashMap<String, HashMap<String, PlayerWire>> = HashMap::new();

        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                FanoutMsg::Frame(frame) => frame,
                FanoutMsg::DropRoom(room_id) => {
                    room_states.remove(&room_id);
                    continue;
                }
            };

            let wire = match proto::decode(&frame.data) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(room_id = %frame.room_id, error = %e, "Dropping undecodable worker frame");
                    continue;
                }
            };

            match wire {
                WireMessage::StateSnapshot { players, .. } => {
                    let state = room_states.entry(frame.room_id.clone()).or_default();
                    state.clear();
                    for player in players {
                        state.insert(player.id.clone(), player);
                    }
                    let entries = state_entries(state);
                    self.emit_state(&frame.room_id, entries, &frame.recipient);
                }
                WireMessage::StateDelta {
                    changed, removed, ..
                } => {
                    let state = room_states.entry(frame.room_id.clone()).or_default();
                    for player in changed {
                        state.insert(player.id.clone(), player);
                    }
                    for id in removed {
                        state.remove(&id);
                    }
                    let entries = state_entries(state);
                    self.emit_state(&frame.room_id, entries, &frame.recipient);
                }
                WireMessage::ServerWelcome { player_id, .. } => {
                    debug!(room_id = %frame.room_id, player_id = %player_id, "Worker welcomed player");
                }
                other => {
                    debug!(
                        room_id = %frame.room_id,
                        msg = other.type_name(),
                        "Worker frame not translated"
                    );
                }
            }
        }
    }

    fn emit_state(&self, room_id: &str, players: Vec<PlayerEntry>, recipient: &Recipient) {
        match recipient {
            Recipient::To(addr) => {
                if let Some(session) = self.sessions.get(addr) {
                    let _ = session.tx.send(ServerMsg::State {
                        your_id: addr.clone(),
                        room_id: room_id.to_string(),
                        players,
                    });
                }
            }
            Recipient::Broadcast { exclude } => {
                for session in self.sessions.iter() {
                    if session.value().room_id.as_deref() != Some(room_id) {
                        continue;
                    }
                    if session.key() == exclude {
                        continue;
                    }
                    let _ = session.value().tx.send(ServerMsg::State {
                        your_id: session.key().clone(),
                        room_id: room_id.to_string(),
                        players: players.clone(),
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Media-fabric signalling
    // ------------------------------------------------------------------

    /// Get or create the room's SFU and its event drain
    fn ensure_sfu(self: &Arc<Self>, room_id: &str) -> Result<Arc<SfuRoom>, webrtc::Error> {
        if let Some(sfu) = self.sfus.get(room_id) {
            return Ok(sfu.clone());
        }

        let (sfu, events) = SfuRoom::new(room_id, &self.config.stun_servers)?;
        match self.sfus.entry(room_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Ok(existing.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(sfu.clone());
                tokio::spawn(
                    Arc::clone(self).drain_sfu_events(room_id.to_string(), events),
                );
                Ok(sfu)
            }
        }
    }

    /// Consume SFU events: renegotiations become server-initiated offers on
    /// the target session, server candidates become `webrtc_ice` messages.
    async fn drain_sfu_events(
        self: Arc<Self>,
        room_id: String,
        mut events: mpsc::Receiver<SfuEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SfuEvent::Track { player_id, track } => {
                    debug!(
                        room_id = %room_id,
                        player_id = %player_id,
                        kind = %track.kind(),
                        "Participant publishing"
                    );
                }
                SfuEvent::Renegotiate { player_id, kind, .. } => {
                    let sfu = self.sfus.get(&room_id).map(|s| s.value().clone());
                    let Some(sfu) = sfu else { continue };

                    match sfu.create_offer(&player_id).await {
                        Ok(Some(sdp)) => {
                            debug!(
                                room_id = %room_id,
                                player_id = %player_id,
                                kind = %kind,
                                "Sending renegotiation offer"
                            );
                            self.send_to_session(
                                &player_id,
                                ServerMsg::WebrtcOffer {
                                    room_id: room_id.clone(),
                                    player_id: player_id.clone(),
                                    sdp,
                                },
                            );
                        }
                        // Peer vanished between the event and the offer
                        Ok(None) => {
                            debug!(room_id = %room_id, player_id = %player_id, "Discarding renegotiation for removed peer")
                        }
                        Err(e) => {
                            warn!(room_id = %room_id, player_id = %player_id, error = %e, "Renegotiation offer failed");
                            self.send_to_session(
                                &player_id,
                                ServerMsg::WebrtcError {
                                    error: e.to_string(),
                                },
                            );
                        }
                    }
                }
                SfuEvent::IceCandidate {
                    player_id,
                    candidate,
                } => match serde_json::to_value(&candidate) {
                    Ok(candidate) => self.send_to_session(
                        &player_id,
                        ServerMsg::WebrtcIce {
                            room_id: room_id.clone(),
                            player_id: player_id.clone(),
                            candidate,
                        },
                    ),
                    Err(e) => {
                        warn!(room_id = %room_id, error = %e, "Candidate serialization failed")
                    }
                },
            }
        }
    }

    pub async fn handle_webrtc_offer(self: &Arc<Self>, player_id: &str, sdp: String) {
        let Some(room_id) = self.session_room(player_id) else {
            self.send_to_session(
                player_id,
                ServerMsg::Error {
                    error: "not in a room".to_string(),
                },
            );
            return;
        };

        let sfu = match self.ensure_sfu(&room_id) {
            Ok(sfu) => sfu,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Media fabric init failed");
                self.send_to_session(
                    player_id,
                    ServerMsg::WebrtcError {
                        error: e.to_string(),
                    },
                );
                return;
            }
        };

        match sfu.handle_offer(player_id, sdp).await {
            Ok(answer) => self.send_to_session(
                player_id,
                ServerMsg::WebrtcAnswer {
                    room_id,
                    player_id: player_id.to_string(),
                    sdp: answer,
                },
            ),
            Err(e) => {
                warn!(room_id = %room_id, player_id = %player_id, error = %e, "Offer handling failed");
                self.send_to_session(
                    player_id,
                    ServerMsg::WebrtcError {
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    pub async fn handle_webrtc_answer(&self, player_id: &str, sdp: String) {
        let Some(room_id) = self.session_room(player_id) else {
            return;
        };
        let sfu = self.sfus.get(&room_id).map(|s| s.value().clone());
        let Some(sfu) = sfu else { return };

        if let Err(e) = sfu.handle_answer(player_id, sdp).await {
            warn!(room_id = %room_id, player_id = %player_id, error = %e, "Answer handling failed");
            self.send_to_session(
                player_id,
                ServerMsg::WebrtcError {
                    error: e.to_string(),
                },
            );
        }
    }

    pub async fn handle_webrtc_ice(&self, player_id: &str, candidate: serde_json::Value) {
        let Some(room_id) = self.session_room(player_id) else {
            return;
        };
        let sfu = self.sfus.get(&room_id).map(|s| s.value().clone());
        let Some(sfu) = sfu else { return };

        let candidate: RTCIceCandidateInit = match serde_json::from_value(candidate) {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!(player_id = %player_id, error = %e, "Dropping malformed ICE candidate");
                return;
            }
        };

        if let Err(e) = sfu.handle_ice_candidate(player_id, candidate).await {
            warn!(room_id = %room_id, player_id = %player_id, error = %e, "ICE candidate failed");
            self.send_to_session(
                player_id,
                ServerMsg::WebrtcError {
                    error: e.to_string(),
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn session_room(&self, player_id: &str) -> Option<String> {
        self.sessions
            .get(player_id)
            .and_then(|s| s.room_id.clone())
    }

    pub fn send_to_session(&self, player_id: &str, msg: ServerMsg) {
        if let Some(session) = self.sessions.get(player_id) {
            if session.tx.send(msg).is_err() {
                debug!(player_id = %player_id, "Session channel closed");
            }
        }
    }

    fn broadcast_json(&self, room_id: &str, msg: ServerMsg, exclude: Option<&str>) {
        for session in self.sessions.iter() {
            if session.value().room_id.as_deref() != Some(room_id) {
                continue;
            }
            if Some(session.key().as_str()) == exclude {
                continue;
            }
            let _ = session.value().tx.send(msg.clone());
        }
    }
}

fn state_entries(state: &HashMap<String, PlayerWire>) -> Vec<PlayerEntry> {
    state
        .values()
        .map(|p| PlayerEntry {
            id: p.id.clone(),
            name: p.name.clone(),
            x: p.position.x,
            y: p.position.y,
            vx: p.velocity.x,
            vy: p.velocity.y,
            rot: p.rotation,
        })
        .collect()
}
