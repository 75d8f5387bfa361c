use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

pub const ENV_DB_PATH: &str = "THREAD_STORE_DB";
pub const ENV_BUSY_TIMEOUT_MS: &str = "THREAD_STORE_BUSY_TIMEOUT_MS";
pub const ENV_ENFORCE_ACYCLIC: &str = "THREAD_STORE_ENFORCE_ACYCLIC";
pub const ENV_STREAM_TTL_MS: &str = "THREAD_STORE_STREAM_TTL_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. `None` opens a private in-memory database.
    pub db_path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    /// Reject dependency edges that would close a cycle.
    pub enforce_acyclic_edges: bool,
    /// Expiry applied by `Streams::start` when the caller does not pass one.
    pub default_stream_ttl_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            enforce_acyclic_edges: false,
            default_stream_ttl_ms: None,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `THREAD_STORE_*` environment variables. Unparseable numbers fall
    /// back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup(ENV_DB_PATH).filter(|value| !value.trim().is_empty()) {
            config.db_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(timeout) = lookup(ENV_BUSY_TIMEOUT_MS).and_then(|value| parse_u64(&value)) {
            config.busy_timeout_ms = timeout;
        }
        if let Some(value) = lookup(ENV_ENFORCE_ACYCLIC) {
            config.enforce_acyclic_edges = is_truthy(&value);
        }
        config.default_stream_ttl_ms =
            lookup(ENV_STREAM_TTL_MS).and_then(|value| parse_u64(&value));
        config
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_u64(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}
