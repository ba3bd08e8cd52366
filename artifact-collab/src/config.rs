//! Engine configuration.
//!
//! Every timer and bound the engine uses lives here so that tests can run
//! with short windows (see [`EngineConfig::for_testing`]) and deployments
//! can override values through `COLLAB_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Collaboration engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the gateway binds to
    pub bind_addr: String,
    /// Close a connection when no inbound frame arrives within this window
    pub heartbeat_timeout: Duration,
    /// Interval between server-initiated protocol pings
    pub ping_interval: Duration,
    /// Bounded outbound queue length per connection
    pub outbound_capacity: usize,
    /// Lifetime of a typing entry without a refreshing `typing_start`
    pub typing_ttl: Duration,
    /// Inactivity after which an `active` user is demoted to `away`
    pub idle_threshold: Duration,
    /// Presence sweep period (typing expiry, idle demotion, room eviction)
    pub sweep_interval: Duration,
    /// Minimum spacing of cursor/selection broadcasts per connection
    pub debounce_interval: Duration,
    /// How long an empty room is retained before eviction
    pub room_grace_period: Duration,
    /// Protocol errors tolerated before a connection is dropped
    pub max_protocol_errors: u32,
    /// Window in which repeated low-priority notifications are coalesced
    pub coalesce_window: Duration,
    /// Attempts per delivery channel before giving up
    pub delivery_attempts: u32,
    /// First retry delay; doubles on every further attempt
    pub delivery_backoff: Duration,
    /// Activities included in the `room_state` snapshot
    pub recent_activity_limit: usize,
    /// RocksDB path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            outbound_capacity: 256,
            typing_ttl: Duration::from_secs(3),
            idle_threshold: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            debounce_interval: Duration::from_millis(100),
            room_grace_period: Duration::from_secs(30),
            max_protocol_errors: 5,
            coalesce_window: Duration::from_secs(60),
            delivery_attempts: 3,
            delivery_backoff: Duration::from_millis(200),
            recent_activity_limit: 20,
            storage_path: None,
        }
    }
}

impl EngineConfig {
    /// Short timers and small queues for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
            outbound_capacity: 64,
            typing_ttl: Duration::from_millis(300),
            idle_threshold: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(50),
            debounce_interval: Duration::from_millis(40),
            room_grace_period: Duration::from_millis(200),
            max_protocol_errors: 3,
            coalesce_window: Duration::from_secs(5),
            delivery_attempts: 3,
            delivery_backoff: Duration::from_millis(5),
            recent_activity_limit: 10,
            storage_path: None,
        }
    }

    /// Defaults overridden by `COLLAB_*` environment variables.
    ///
    /// Durations are given in milliseconds. Unparseable values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("COLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        }
        env_millis("COLLAB_HEARTBEAT_TIMEOUT_MS", &mut config.heartbeat_timeout);
        env_millis("COLLAB_PING_INTERVAL_MS", &mut config.ping_interval);
        env_millis("COLLAB_TYPING_TTL_MS", &mut config.typing_ttl);
        env_millis("COLLAB_IDLE_THRESHOLD_MS", &mut config.idle_threshold);
        env_millis("COLLAB_SWEEP_INTERVAL_MS", &mut config.sweep_interval);
        env_millis("COLLAB_DEBOUNCE_MS", &mut config.debounce_interval);
        env_millis("COLLAB_ROOM_GRACE_MS", &mut config.room_grace_period);
        env_millis("COLLAB_COALESCE_WINDOW_MS", &mut config.coalesce_window);
        env_millis("COLLAB_DELIVERY_BACKOFF_MS", &mut config.delivery_backoff);
        env_parse("COLLAB_OUTBOUND_CAPACITY", &mut config.outbound_capacity);
        env_parse("COLLAB_MAX_PROTOCOL_ERRORS", &mut config.max_protocol_errors);
        env_parse("COLLAB_DELIVERY_ATTEMPTS", &mut config.delivery_attempts);
        env_parse("COLLAB_RECENT_ACTIVITY", &mut config.recent_activity_limit);
        if let Ok(path) = std::env::var("COLLAB_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("Ignoring invalid {key}={raw}"),
        }
    }
}

fn env_millis(key: &str, slot: &mut Duration) {
    let mut millis = slot.as_millis() as u64;
    env_parse(key, &mut millis);
    *slot = Duration::from_millis(millis);
}
