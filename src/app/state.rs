//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::room::{Registry, RegistryConfig};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        let registry = Arc::new(Registry::new(RegistryConfig {
            max_players: config.room_max_players,
            room_ttl: config.room_ttl,
            cleanup_period: config.cleanup_period,
        }));

        let gateway = Gateway::new(config.clone(), registry.clone());

        // Expired rooms take their worker and media fabric with them
        let expiry_gateway = gateway.clone();
        registry.on_room_expired(move |room| {
            let gateway = expiry_gateway.clone();
            tokio::spawn(async move {
                gateway.stop_room(&room.id).await;
            });
        });
        registry.start_sweeper();

        Self {
            config,
            registry,
            gateway,
        }
    }
}
