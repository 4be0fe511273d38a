use std::time::Duration;

/// Environment override for the store connection timeout, in seconds.
pub const CONNECTION_TIMEOUT_ENV: &str = "VIP_SATURN_ZK_CLIENT_CONNECTION_TIMEOUT_IN_SECONDS";

/// Environment override for the store session timeout, in seconds.
pub const SESSION_TIMEOUT_ENV: &str = "VIP_SATURN_ZK_CLIENT_SESSION_TIMEOUT_IN_SECONDS";

const MIN_CONNECTION_TIMEOUT_SECS: u64 = 20;
const MAX_CONNECTION_TIMEOUT_SECS: u64 = 60;
const MIN_SESSION_TIMEOUT_SECS: u64 = 20;
const MAX_SESSION_TIMEOUT_SECS: u64 = 40;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Configuration for one namespace coordinator instance.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Tenant namespace this coordinator is responsible for.
    pub namespace: String,
    /// Identity written into the leader node while this instance leads.
    pub host_id: String,
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
    /// Base delay for exponential retry backoff on store operations.
    pub retry_base: Duration,
    /// Upper bound for retry backoff.
    pub retry_max: Duration,
    /// Capacity of the sharding event queue; overflow degrades to a resync.
    pub event_queue_capacity: usize,
}

impl CoordinatorConfig {
    /// Build a config for `namespace`, identifying as `host_id`. Timeouts are
    /// taken from the process environment and clamped to their allowed ranges.
    pub fn new(namespace: impl Into<String>, host_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            host_id: host_id.into(),
            session_timeout: Duration::from_secs(session_timeout_secs_from_env()),
            connection_timeout: Duration::from_secs(connection_timeout_secs_from_env()),
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(3),
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Session timeout from the environment, clamped to [20, 40] seconds.
pub fn session_timeout_secs_from_env() -> u64 {
    clamp_secs(
        env_seconds(SESSION_TIMEOUT_ENV),
        MIN_SESSION_TIMEOUT_SECS,
        MAX_SESSION_TIMEOUT_SECS,
    )
}

/// Connection timeout from the environment, clamped to [20, 60] seconds.
pub fn connection_timeout_secs_from_env() -> u64 {
    clamp_secs(
        env_seconds(CONNECTION_TIMEOUT_ENV),
        MIN_CONNECTION_TIMEOUT_SECS,
        MAX_CONNECTION_TIMEOUT_SECS,
    )
}

fn env_seconds(name: &str) -> Option<i64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Unset or unparsable values take the minimum, matching the store client's
/// conservative defaults.
fn clamp_secs(value: Option<i64>, min: u64, max: u64) -> u64 {
    match value {
        Some(v) if v > min as i64 => (v as u64).min(max),
        _ => min,
    }
}
