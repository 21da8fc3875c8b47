//! Room registry: short shareable IDs, membership, host election, TTL eviction

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tracing::{debug, info};

use crate::util::time::unix_millis;

/// Registry-level room settings
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Admission cap per room
    pub max_players: usize,
    /// How long an empty room lingers before eviction
    pub room_ttl: Duration,
    /// How often the sweep checks for expired rooms
    pub cleanup_period: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_players: 8,
            room_ttl: Duration::from_secs(300),
            cleanup_period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room not found")]
    RoomNotFound,

    #[error("room is full")]
    RoomFull,

    /// Reserved for host-only operations
    #[error("only host can perform this action")]
    NotHost,

    #[error("player not in room")]
    NotInRoom,
}

/// A room member as the registry sees it
#[derive(Debug, Clone)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub joined_at: u64,
    pub is_host: bool,
    /// Admission order, used for deterministic host re-election
    order: u64,
}

/// One registry room
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub created_at: u64,
    max_players: usize,
    ttl: Duration,
    inner: Mutex<RoomInner>,
}

#[derive(Debug)]
struct RoomInner {
    members: HashMap<String, Member>,
    host_id: String,
    last_activity: Instant,
    next_order: u64,
}

impl Room {
    fn new(id: String, max_players: usize, ttl: Duration) -> Self {
        Self {
            id,
            created_at: unix_millis(),
            max_players,
            ttl,
            inner: Mutex::new(RoomInner {
                members: HashMap::new(),
                host_id: String::new(),
                last_activity: Instant::now(),
                next_order: 0,
            }),
        }
    }

    /// Add a player. Re-joining returns the existing membership unchanged.
    /// The first member becomes host.
    pub fn join(&self, player_id: &str, player_name: &str) -> Result<Member, RoomError> {
        let mut inner = self.inner.lock();

        if let Some(member) = inner.members.get(player_id) {
            return Ok(member.clone());
        }

        if inner.members.len() >= self.max_players {
            return Err(RoomError::RoomFull);
        }

        let is_host = inner.members.is_empty();
        if is_host {
            inner.host_id = player_id.to_string();
        }

        let member = Member {
            id: player_id.to_string(),
            name: player_name.to_string(),
            joined_at: unix_millis(),
            is_host,
            order: inner.next_order,
        };
        inner.next_order += 1;
        inner.members.insert(player_id.to_string(), member.clone());
        inner.last_activity = Instant::now();

        Ok(member)
    }

    /// Remove a player. Idempotent. Re-elects the earliest-joined remaining
    /// member when the host departs; an empty room has no host.
    pub fn leave(&self, player_id: &str) {
        let mut inner = self.inner.lock();

        inner.members.remove(player_id);
        inner.last_activity = Instant::now();

        if inner.host_id == player_id {
            match inner
                .members
                .values()
                .min_by_key(|m| m.order)
                .map(|m| m.id.clone())
            {
                Some(new_host) => {
                    inner.host_id = new_host.clone();
                    if let Some(member) = inner.members.get_mut(&new_host) {
                        member.is_host = true;
                    }
                }
                None => inner.host_id.clear(),
            }
        }
    }

    pub fn player_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn player_ids(&self) -> Vec<String> {
        self.inner.lock().members.keys().cloned().collect()
    }

    pub fn member(&self, player_id: &str) -> Option<Member> {
        self.inner.lock().members.get(player_id).cloned()
    }

    pub fn host_id(&self) -> String {
        self.inner.lock().host_id.clone()
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    pub fn is_empty(&self) -> bool {
        self.player_count() == 0
    }

    /// True when the room has sat empty longer than its TTL
    pub fn is_expired(&self) -> bool {
        let inner = self.inner.lock();
        inner.members.is_empty() && inner.last_activity.elapsed() > self.ttl
    }
}

type ExpiredCallback = Arc<dyn Fn(Arc<Room>) + Send + Sync>;

/// Manages all rooms
pub struct Registry {
    rooms: DashMap<String, Arc<Room>>,
    config: RegistryConfig,
    on_expired: RwLock<Option<ExpiredCallback>>,
}

/// Generate a short, shareable room ID (6 hex chars, crypto-random)
fn generate_id() -> String {
    let mut bytes = [0u8; 3];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            config,
            on_expired: RwLock::new(None),
        }
    }

    /// Create a new empty room under a fresh ID
    pub fn create(&self) -> Arc<Room> {
        loop {
            let id = generate_id();
            if self.rooms.contains_key(&id) {
                continue;
            }
            let room = Arc::new(Room::new(
                id.clone(),
                self.config.max_players,
                self.config.room_ttl,
            ));
            self.rooms.insert(id.clone(), room.clone());
            info!(room_id = %id, "Room created");
            return room;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    /// Remove a room. Noop on unknown IDs.
    pub fn delete(&self, id: &str) {
        if self.rooms.remove(id).is_some() {
            info!(room_id = %id, "Room deleted");
        }
    }

    /// Add a player to a room
    pub fn join(
        &self,
        room_id: &str,
        player_id: &str,
        player_name: &str,
    ) -> Result<(Arc<Room>, Member), RoomError> {
        let room = self.get(room_id).ok_or(RoomError::RoomNotFound)?;
        let member = room.join(player_id, player_name)?;
        Ok((room, member))
    }

    /// Remove a player from a room. Noop on unknown rooms or members.
    pub fn leave(&self, room_id: &str, player_id: &str) {
        if let Some(room) = self.get(room_id) {
            room.leave(player_id);
        }
    }

    pub fn count(&self) -> usize {
        self.rooms.len()
    }

    pub fn all_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| r.value().clone()).collect()
    }

    /// Register a callback invoked (before removal) for every expired room
    pub fn on_room_expired<F>(&self, callback: F)
    where
        F: Fn(Arc<Room>) + Send + Sync + 'static,
    {
        *self.on_expired.write() = Some(Arc::new(callback));
    }

    /// Start the background eviction sweep
    pub fn start_sweeper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.cleanup_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        });
    }

    /// Evict every expired room, invoking the expiry callback first
    pub fn sweep_expired(&self) {
        let expired: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .filter(|r| r.value().is_expired())
            .map(|r| r.value().clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        let callback = self.on_expired.read().clone();
        for room in expired {
            debug!(room_id = %room.id, "Room expired");
            if let Some(callback) = &callback {
                callback(room.clone());
            }
            self.rooms.remove(&room.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(ttl: Duration) -> RegistryConfig {
        RegistryConfig {
            max_players: 3,
            room_ttl: ttl,
            cleanup_period: Duration::from_millis(10),
        }
    }

    #[test]
    fn create_allocates_six_hex_ids() {
        let registry = Registry::new(RegistryConfig::default());
        let room = registry.create();

        assert_eq!(room.id.len(), 6);
        assert!(room.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&room.id).is_some());
        assert_eq!(room.host_id(), "");
    }

    #[test]
    fn join_unknown_room_fails() {
        let registry = Registry::new(RegistryConfig::default());
        assert_eq!(
            registry.join("ffffff", "p1", "Alice").unwrap_err(),
            RoomError::RoomNotFound
        );
    }

    #[test]
    fn first_joiner_becomes_host() {
        let registry = Registry::new(RegistryConfig::default());
        let room = registry.create();

        let (_, alice) = registry.join(&room.id, "p1", "Alice").unwrap();
        assert!(alice.is_host);
        assert_eq!(room.host_id(), "p1");

        let (_, bob) = registry.join(&room.id, "p2", "Bob").unwrap();
        assert!(!bob.is_host);
        assert_eq!(room.host_id(), "p1");
    }

    #[test]
    fn rejoin_is_idempotent() {
        let registry = Registry::new(RegistryConfig::default());
        let room = registry.create();

        let (_, first) = registry.join(&room.id, "p1", "Alice").unwrap();
        let (_, again) = registry.join(&room.id, "p1", "Alice2").unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.name, again.name); // original entry survives
        assert_eq!(room.player_count(), 1);
    }

    #[test]
    fn full_room_rejects_joins() {
        let registry = Registry::new(test_config(Duration::from_secs(300)));
        let room = registry.create();

        for i in 0..3 {
            registry.join(&room.id, &format!("p{i}"), "x").unwrap();
        }
        assert_eq!(
            registry.join(&room.id, "p9", "x").unwrap_err(),
            RoomError::RoomFull
        );
        assert_eq!(room.player_count(), 3);
    }

    #[test]
    fn host_departure_elects_earliest_joined_member() {
        let registry = Registry::new(RegistryConfig::default());
        let room = registry.create();

        registry.join(&room.id, "p1", "Alice").unwrap();
        registry.join(&room.id, "p2", "Bob").unwrap();
        registry.join(&room.id, "p3", "Carol").unwrap();

        registry.leave(&room.id, "p1");

        assert_eq!(room.host_id(), "p2");
        assert!(room.member("p2").unwrap().is_host);
        assert!(!room.member("p3").unwrap().is_host);
        assert_eq!(room.player_count(), 2);
    }

    #[test]
    fn last_member_leaving_clears_host() {
        let registry = Registry::new(RegistryConfig::default());
        let room = registry.create();

        registry.join(&room.id, "p1", "Alice").unwrap();
        registry.leave(&room.id, "p1");

        assert!(room.is_empty());
        assert_eq!(room.host_id(), "");
    }

    #[test]
    fn leave_is_idempotent_and_delete_noops_on_unknown() {
        let registry = Registry::new(RegistryConfig::default());
        let room = registry.create();

        registry.leave(&room.id, "nobody");
        registry.leave("ffffff", "nobody");
        registry.delete("ffffff");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn occupied_rooms_never_expire() {
        let registry = Registry::new(test_config(Duration::ZERO));
        let room = registry.create();
        registry.join(&room.id, "p1", "Alice").unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(!room.is_expired());

        registry.sweep_expired();
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn empty_rooms_expire_and_fire_callback() {
        let registry = Arc::new(Registry::new(test_config(Duration::from_millis(1))));
        let room = registry.create();

        let expired_ids = Arc::new(Mutex::new(Vec::new()));
        let seen = expired_ids.clone();
        registry.on_room_expired(move |room| seen.lock().push(room.id.clone()));

        std::thread::sleep(Duration::from_millis(10));
        registry.sweep_expired();

        assert_eq!(registry.count(), 0);
        assert!(registry.get(&room.id).is_none());
        assert_eq!(expired_ids.lock().clone(), vec![room.id.clone()]);
    }

    #[test]
    fn activity_resets_the_ttl_clock() {
        let registry = Registry::new(test_config(Duration::from_millis(50)));
        let room = registry.create();

        registry.join(&room.id, "p1", "Alice").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        registry.leave(&room.id, "p1"); // refreshes last_activity

        assert!(!room.is_expired());
        registry.sweep_expired();
        assert_eq!(registry.count(), 1);
    }
}
