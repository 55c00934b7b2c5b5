//! Runtime configuration for sessions, persistence and the authority.

use std::time::Duration;

use crate::storage::StoreConfig;

/// Reconnect backoff tuning.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn for_testing() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: 0.2,
        }
    }
}

/// Sync session timing.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on opening the transport
    pub connect_timeout: Duration,
    /// Bound on the Hello / SyncStep exchange
    pub handshake_timeout: Duration,
    /// Bound on the final push during teardown
    pub final_flush_timeout: Duration,
    /// Ping interval while connected; a missed pong window drops the link
    pub heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            final_flush_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            final_flush_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            backoff: BackoffConfig::for_testing(),
        }
    }
}

/// Background persistence tuning.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Fold the log into a fresh snapshot once this many records pile up
    pub compact_after_records: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            compact_after_records: 256,
        }
    }
}

impl PersistConfig {
    pub fn for_testing() -> Self {
        Self {
            compact_after_records: 8,
        }
    }
}

/// Top-level configuration for a [`SessionManager`](crate::manager::SessionManager).
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Authority URL; sessions connect to `{server_url}/{canvas_id}`
    pub server_url: String,
    /// Local store (None = in-memory sessions only)
    pub store: Option<StoreConfig>,
    pub sync: SyncConfig,
    pub persist: PersistConfig,
    /// Buffered change batches per subscriber before lagging
    pub change_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            store: Some(StoreConfig::default()),
            sync: SyncConfig::default(),
            persist: PersistConfig::default(),
            change_capacity: 256,
        }
    }
}

impl CollabConfig {
    /// Test configuration: short timeouts, no store unless one is set.
    pub fn for_testing() -> Self {
        Self {
            server_url: "ws://127.0.0.1:0".to_string(),
            store: None,
            sync: SyncConfig::for_testing(),
            persist: PersistConfig::for_testing(),
            change_capacity: 64,
        }
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = Some(store);
        self
    }
}

/// Reference authority configuration.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistent store for rooms (None = in-memory only)
    pub store: Option<StoreConfig>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 1024,
            store: None,
        }
    }
}
