//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address (HTTP + control channel)
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Idle-room eviction window
    pub room_ttl: Duration,
    /// How often the registry sweeps for expired rooms
    pub cleanup_period: Duration,
    /// Admission cap per registry room
    pub room_max_players: usize,

    /// Admission cap per simulation worker
    pub worker_max_players: usize,
    /// Simulation rate in Hz
    pub tick_rate: u32,
    /// State broadcast rate in Hz
    pub broadcast_rate: u32,

    /// STUN server URLs for the media fabric
    pub stun_servers: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            room_ttl: Duration::from_secs(parse_var("ROOM_TTL", 300)?),
            cleanup_period: Duration::from_secs(parse_var("CLEANUP_PERIOD", 30)?),
            room_max_players: parse_var("MAX_PLAYERS", 8)?,

            worker_max_players: parse_var("WORKER_MAX_PLAYERS", 100)?,
            tick_rate: parse_var("TICK_RATE", 60)?,
            broadcast_rate: parse_var("BROADCAST_RATE", 20)?,

            stun_servers: env::var("STUN_SERVERS")
                .map(|s| s.split(',').map(|u| u.trim().to_string()).collect())
                .unwrap_or_else(|_| {
                    vec![
                        "stun:stun.l.google.com:19302".to_string(),
                        "stun:stun1.l.google.com:19302".to_string(),
                    ]
                }),
        })
    }
}

/// Parse an env var into any FromStr type, falling back to a default when unset
fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Only assert fields no test environment is expected to override
        let config = Config::from_env().unwrap();
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.broadcast_rate, 20);
        assert_eq!(config.room_max_players, 8);
        assert_eq!(config.worker_max_players, 100);
        assert_eq!(config.stun_servers.len(), 2);
    }
}
