//! Runtime configuration, read once from the environment at startup.
//!
//! Every key has a default except `DATABASE_URL`, whose absence means the
//! store lives in memory only. Unparseable values fall back to the default.

use tracing::info;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 250;
const DEFAULT_PALETTE_SEED: u64 = 0x6d61_7073_796e_63;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// How often dirty room documents are written to Postgres.
    pub flush_interval_ms: u64,
    /// Seed for color/glyph assignment.
    pub palette_seed: u64,
    /// Outbound frame buffer per websocket connection.
    pub client_channel_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            palette_seed: DEFAULT_PALETTE_SEED,
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
        }
    }
}

impl AppConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let config = Self {
            port: parse_or(&lookup, "PORT", DEFAULT_PORT),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS).max(1),
            flush_interval_ms: parse_or(&lookup, "FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS).max(1),
            palette_seed: parse_or(&lookup, "PALETTE_SEED", DEFAULT_PALETTE_SEED),
            client_channel_capacity: parse_or(&lookup, "CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY)
                .max(1),
        };
        info!(
            port = config.port,
            persistent = config.database_url.is_some(),
            db_max_connections = config.db_max_connections,
            flush_interval_ms = config.flush_interval_ms,
            client_channel_capacity = config.client_channel_capacity,
            "configuration loaded"
        );
        config
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(config(&[]), AppConfig::default());
    }

    #[test]
    fn values_are_parsed() {
        let c = config(&[
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://localhost/mapsync"),
            ("DB_MAX_CONNECTIONS", "12"),
            ("FLUSH_INTERVAL_MS", " 500 "),
            ("PALETTE_SEED", "42"),
            ("CLIENT_CHANNEL_CAPACITY", "16"),
        ]);
        assert_eq!(c.port, 8080);
        assert_eq!(c.database_url.as_deref(), Some("postgres://localhost/mapsync"));
        assert_eq!(c.db_max_connections, 12);
        assert_eq!(c.flush_interval_ms, 500);
        assert_eq!(c.palette_seed, 42);
        assert_eq!(c.client_channel_capacity, 16);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let c = config(&[("PORT", "eighty"), ("FLUSH_INTERVAL_MS", "-1"), ("DATABASE_URL", "  ")]);
        assert_eq!(c.port, DEFAULT_PORT);
        assert_eq!(c.flush_interval_ms, DEFAULT_FLUSH_INTERVAL_MS);
        assert!(c.database_url.is_none());
    }

    #[test]
    fn zero_capacities_are_clamped() {
        let c = config(&[("CLIENT_CHANNEL_CAPACITY", "0"), ("FLUSH_INTERVAL_MS", "0")]);
        assert_eq!(c.client_channel_capacity, 1);
        assert_eq!(c.flush_interval_ms, 1);
    }
}
