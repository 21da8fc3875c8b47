//! Per-room media fabric (SFU).
//!
//! Terminates one peer connection per participant, republishes each incoming
//! audio/video track as a local track on every other participant's
//! connection, and emits renegotiation events when a peer's sender set
//! changes. RTP forwarding runs outside the room lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Event channel capacity; events beyond this are dropped with a warning
const EVENT_CHANNEL_CAP: usize = 100;

/// Signals surfaced to the gateway
pub enum SfuEvent {
    /// A participant started publishing a track
    Track {
        player_id: String,
        track: Arc<TrackRemote>,
    },
    /// A peer's sender set changed; the gateway should send it a fresh offer
    Renegotiate {
        player_id: String,
        kind: RTPCodecType,
        track: Arc<TrackLocalStaticRTP>,
    },
    /// Server-side trickle-ICE candidate for a peer
    IceCandidate {
        player_id: String,
        candidate: RTCIceCandidateInit,
    },
}

/// One room's SFU: peer connections and republished tracks
pub struct SfuRoom {
    room_id: String,
    api: API,
    ice_servers: Vec<String>,
    state: Mutex<SfuState>,
    events_tx: mpsc::Sender<SfuEvent>,
}

#[derive(Default)]
struct SfuState {
    peers: HashMap<String, Arc<RTCPeerConnection>>,
    /// Incoming tracks by (player, track ID)
    incoming_tracks: HashMap<String, HashMap<String, Arc<TrackRemote>>>,
    /// Republished local tracks, at most one per player per kind
    audio_tracks: HashMap<String, Arc<TrackLocalStaticRTP>>,
    video_tracks: HashMap<String, Arc<TrackLocalStaticRTP>>,
    /// Running forward loops, one per player per kind; a re-publish aborts
    /// the loop it supersedes
    audio_forwards: HashMap<String, AbortHandle>,
    video_forwards: HashMap<String, AbortHandle>,
}

impl SfuRoom {
    pub fn new(
        room_id: &str,
        stun_servers: &[String],
    ) -> Result<(Arc<Self>, mpsc::Receiver<SfuEvent>), webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAP);

        let room = Arc::new(Self {
            room_id: room_id.to_string(),
            api,
            ice_servers: stun_servers.to_vec(),
            state: Mutex::new(SfuState::default()),
            events_tx,
        });

        Ok((room, events_rx))
    }

    /// Get or create the peer connection for a player
    pub async fn create_peer_connection(
        self: &Arc<Self>,
        player_id: &str,
    ) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        // Held for the whole creation so concurrent offers for the same
        // player resolve to a single peer connection
        let mut state = self.state.lock().await;
        if let Some(pc) = state.peers.get(player_id) {
            return Ok(pc.clone());
        }

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let sfu = Arc::downgrade(self);
        let pid = player_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sfu = sfu.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let Some(sfu) = sfu.upgrade() else { return };

                debug!(
                    room_id = %sfu.room_id,
                    player_id = %pid,
                    kind = %track.kind(),
                    mime = %track.codec().capability.mime_type,
                    "Incoming track"
                );

                {
                    let mut state = sfu.state.lock().await;
                    state
                        .incoming_tracks
                        .entry(pid.clone())
                        .or_default()
                        .insert(track.id(), track.clone());
                }

                if sfu
                    .events_tx
                    .try_send(SfuEvent::Track {
                        player_id: pid.clone(),
                        track: track.clone(),
                    })
                    .is_err()
                {
                    warn!(room_id = %sfu.room_id, "Track event channel full, dropping");
                }

                let kind = track.kind();
                let handle = tokio::spawn(sfu.clone().forward_track(pid.clone(), track));

                // A re-publish of this kind supersedes the previous loop
                let mut state = sfu.state.lock().await;
                let forwards = if kind == RTPCodecType::Audio {
                    &mut state.audio_forwards
                } else {
                    &mut state.video_forwards
                };
                if let Some(old) = forwards.insert(pid, handle.abort_handle()) {
                    old.abort();
                }
            })
        }));

        let sfu = Arc::downgrade(self);
        let pid = player_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |conn_state: RTCPeerConnectionState| {
            let sfu = sfu.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let Some(sfu) = sfu.upgrade() else { return };
                info!(
                    room_id = %sfu.room_id,
                    player_id = %pid,
                    state = %conn_state,
                    "Peer connection state"
                );
                if matches!(
                    conn_state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    sfu.remove_peer_connection(&pid).await;
                }
            })
        }));

        let sfu = Arc::downgrade(self);
        let pid = player_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sfu = sfu.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Some(sfu) = sfu.upgrade() else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = sfu.events_tx.try_send(SfuEvent::IceCandidate {
                            player_id: pid,
                            candidate: init,
                        });
                    }
                    Err(e) => {
                        warn!(room_id = %sfu.room_id, error = %e, "ICE candidate serialization failed")
                    }
                }
            })
        }));

        state.peers.insert(player_id.to_string(), pc.clone());
        info!(
            room_id = %self.room_id,
            player_id = %player_id,
            peers = state.peers.len(),
            "Peer connection created"
        );
        Ok(pc)
    }

    /// Republish one incoming track to every other peer, then pump RTP until
    /// the track ends. Runs as its own task; the room lock is never held
    /// while reading.
    async fn forward_track(self: Arc<Self>, from: String, track: Arc<TrackRemote>) {
        let kind = track.kind();
        let kind_str = if kind == RTPCodecType::Audio {
            "audio"
        } else {
            "video"
        };

        let local = Arc::new(TrackLocalStaticRTP::new(
            track.codec().capability,
            format!("track-{from}-{kind_str}"),
            format!("stream-{from}"),
        ));

        // Store (replacing any previous publish of this kind) and snapshot
        // the peers that need the new sender
        let targets: Vec<(String, Arc<RTCPeerConnection>)> = {
            let mut state = self.state.lock().await;
            match kind {
                RTPCodecType::Audio => state.audio_tracks.insert(from.clone(), local.clone()),
                _ => state.video_tracks.insert(from.clone(), local.clone()),
            };
            state
                .peers
                .iter()
                .filter(|(id, _)| id.as_str() != from)
                .map(|(id, pc)| (id.clone(), pc.clone()))
                .collect()
        };

        let mut to_renegotiate = Vec::new();
        for (peer_id, pc) in targets {
            // A re-publish of the same kind swaps the track on the existing
            // sender; the sender set is unchanged so no renegotiation fires
            let mut replaced = false;
            for sender in pc.get_senders().await {
                let Some(current) = sender.track().await else {
                    continue;
                };
                if current.id() == local.id() {
                    match sender
                        .replace_track(Some(local.clone() as Arc<dyn TrackLocal + Send + Sync>))
                        .await
                    {
                        Ok(()) => replaced = true,
                        Err(e) => warn!(
                            room_id = %self.room_id,
                            from = %from,
                            to = %peer_id,
                            error = %e,
                            "Failed to replace forwarded track"
                        ),
                    }
                    break;
                }
            }
            if replaced {
                continue;
            }

            match pc
                .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(_) => to_renegotiate.push(peer_id),
                Err(e) => warn!(
                    room_id = %self.room_id,
                    from = %from,
                    to = %peer_id,
                    error = %e,
                    "Failed to add forwarded track"
                ),
            }
        }

        // Track addition precedes the renegotiation it causes
        for peer_id in to_renegotiate {
            if self
                .events_tx
                .try_send(SfuEvent::Renegotiate {
                    player_id: peer_id.clone(),
                    kind,
                    track: local.clone(),
                })
                .is_err()
            {
                warn!(
                    room_id = %self.room_id,
                    player_id = %peer_id,
                    "Renegotiate channel full, dropping event"
                );
            }
        }

        loop {
            let packet = match track.read_rtp().await {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!(
                        room_id = %self.room_id,
                        player_id = %from,
                        kind = %kind,
                        error = %e,
                        "Track ended"
                    );
                    return;
                }
            };

            if let Err(e) = local.write_rtp(&packet).await {
                if webrtc::Error::ErrClosedPipe == e {
                    return;
                }
                debug!(room_id = %self.room_id, player_id = %from, error = %e, "RTP write failed");
                return;
            }
        }
    }

    /// Handle a client SDP offer: create (or reuse) the peer connection, pull
    /// every other participant's published tracks into the answer, and return
    /// the answer SDP. The joiner's own tracks are never added back.
    pub async fn handle_offer(
        self: &Arc<Self>,
        player_id: &str,
        sdp: String,
    ) -> Result<String, webrtc::Error> {
        let pc = self.create_peer_connection(player_id).await?;

        let offer = RTCSessionDescription::offer(sdp)?;
        pc.set_remote_description(offer).await?;

        let existing: Vec<(String, Arc<TrackLocalStaticRTP>)> = {
            let state = self.state.lock().await;
            state
                .audio_tracks
                .iter()
                .chain(state.video_tracks.iter())
                .filter(|(owner, _)| owner.as_str() != player_id)
                .map(|(owner, track)| (owner.clone(), track.clone()))
                .collect()
        };

        // On a re-offer the peer may already hold senders for these tracks
        let mut sender_track_ids = std::collections::HashSet::new();
        for sender in pc.get_senders().await {
            if let Some(track) = sender.track().await {
                sender_track_ids.insert(track.id().to_string());
            }
        }

        for (owner, track) in existing {
            if sender_track_ids.contains(track.id()) {
                continue;
            }
            if let Err(e) = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                warn!(
                    room_id = %self.room_id,
                    from = %owner,
                    to = %player_id,
                    error = %e,
                    "Failed to add existing track to joiner"
                );
            }
        }

        let answer = pc.create_answer(None).await?;
        let answer_sdp = answer.sdp.clone();
        pc.set_local_description(answer).await?;

        let sender_count = pc.get_senders().await.len();
        debug!(
            room_id = %self.room_id,
            player_id = %player_id,
            senders = sender_count,
            "Answer created"
        );
        Ok(answer_sdp)
    }

    /// Apply a client answer after a server-initiated offer. Noop when the
    /// peer is gone.
    pub async fn handle_answer(&self, player_id: &str, sdp: String) -> Result<(), webrtc::Error> {
        let pc = {
            let state = self.state.lock().await;
            state.peers.get(player_id).cloned()
        };
        let Some(pc) = pc else { return Ok(()) };

        let answer = RTCSessionDescription::answer(sdp)?;
        pc.set_remote_description(answer).await
    }

    /// Forward a trickle-ICE candidate. Noop when the peer is gone.
    pub async fn handle_ice_candidate(
        &self,
        player_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), webrtc::Error> {
        let pc = {
            let state = self.state.lock().await;
            state.peers.get(player_id).cloned()
        };
        let Some(pc) = pc else { return Ok(()) };

        pc.add_ice_candidate(candidate).await
    }

    /// Produce a server-initiated offer after the peer's sender set changed.
    /// Returns `None` when the peer is gone.
    pub async fn create_offer(&self, player_id: &str) -> Result<Option<String>, webrtc::Error> {
        let pc = {
            let state = self.state.lock().await;
            state.peers.get(player_id).cloned()
        };
        let Some(pc) = pc else { return Ok(None) };

        let offer = pc.create_offer(None).await?;
        let offer_sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        Ok(Some(offer_sdp))
    }

    /// Close and forget a player's peer connection and all tracks derived
    /// from it. Idempotent.
    pub async fn remove_peer_connection(&self, player_id: &str) {
        let pc = {
            let mut state = self.state.lock().await;
            state.incoming_tracks.remove(player_id);
            state.audio_tracks.remove(player_id);
            state.video_tracks.remove(player_id);
            if let Some(handle) = state.audio_forwards.remove(player_id) {
                handle.abort();
            }
            if let Some(handle) = state.video_forwards.remove(player_id) {
                handle.abort();
            }
            state.peers.remove(player_id)
        };

        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                warn!(room_id = %self.room_id, player_id = %player_id, error = %e, "Peer close failed");
            }
            info!(room_id = %self.room_id, player_id = %player_id, "Peer connection removed");
        }
    }

    /// Close every peer connection in the room
    pub async fn close(&self) {
        let peers: Vec<Arc<RTCPeerConnection>> = {
            let mut state = self.state.lock().await;
            state.incoming_tracks.clear();
            state.audio_tracks.clear();
            state.video_tracks.clear();
            for (_, handle) in state.audio_forwards.drain() {
                handle.abort();
            }
            for (_, handle) in state.video_forwards.drain() {
                handle.abort();
            }
            state.peers.drain().map(|(_, pc)| pc).collect()
        };

        for pc in peers {
            if let Err(e) = pc.close().await {
                warn!(room_id = %self.room_id, error = %e, "Peer close failed");
            }
        }
        info!(room_id = %self.room_id, "Media fabric closed");
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Number of outgoing senders on a player's peer connection
    pub async fn sender_count(&self, player_id: &str) -> usize {
        let pc = {
            let state = self.state.lock().await;
            state.peers.get(player_id).cloned()
        };
        match pc {
            Some(pc) => pc.get_senders().await.len(),
            None => 0,
        }
    }

    /// IDs of players with at least one published track
    pub async fn publisher_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .audio_tracks
            .keys()
            .chain(state.video_tracks.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
