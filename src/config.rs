// src/config.rs
use crate::error::ConfigError;
use log::LevelFilter;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Scylla,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub storage: StorageBackend,
    pub scylla_node: String,
    pub scylla_keyspace: String,
    pub alpha_vantage_api_key: Option<String>,
    pub price_poll: Duration,
    pub log_level: LevelFilter,
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl Config {
    /// Reads the process environment after loading `.env`, if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str, default: &str| {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let listen = var("LISTEN_ADDR", "127.0.0.1:3030");
        let listen_addr = listen
            .parse::<SocketAddr>()
            .map_err(|_| invalid("LISTEN_ADDR", &listen))?;

        let storage = match var("STORAGE_BACKEND", "memory").to_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            "scylla" => StorageBackend::Scylla,
            other => return Err(invalid("STORAGE_BACKEND", other)),
        };

        let poll = var("PRICE_POLL_SECS", "15");
        let price_poll = match poll.parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => return Err(invalid("PRICE_POLL_SECS", &poll)),
        };

        let level = var("LOG_LEVEL", "info");
        let log_level = LevelFilter::from_str(&level).map_err(|_| invalid("LOG_LEVEL", &level))?;

        Ok(Config {
            listen_addr,
            storage,
            scylla_node: var("SCYLLA_NODE", "127.0.0.1:9042"),
            scylla_keyspace: var("SCYLLA_KEYSPACE", "portfolio_tracker"),
            alpha_vantage_api_key: get("ALPHA_VANTAGE_API_KEY").filter(|k| !k.trim().is_empty()),
            price_poll,
            log_level,
        })
    }
}
