use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FeedConfig {
    pub socket: SocketConfig,
    pub polling: PollingConfig,
    pub reconciler: ReconcilerConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub mainnet_url: String,
    pub testnet_url: String,
    /// The backend closes the socket after a short period of inactivity, so
    /// a keepalive ping is sent at this interval while connected.
    pub ping_interval_ms: u64,
    pub open_timeout_ms: u64,
    /// A stream that stays silent for this long is treated as stale and
    /// reconnected.
    pub idle_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Trailing-edge window for collapsing bursts of watcher set changes
    /// into one subscription actualization.
    pub actualize_delay_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            mainnet_url: "wss://api.mainnet.example.com/streaming/v1/ws".to_string(),
            testnet_url: "wss://api.testnet.example.com/streaming/v1/ws".to_string(),
            ping_interval_ms: 20_000,
            open_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 8_000,
            actualize_delay_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Floor spacing between consecutive polls, split by foreground state.
    pub min_poll_delay_focused_ms: u64,
    pub min_poll_delay_not_focused_ms: u64,
    /// Grace period after a socket disconnect before fallback polling begins.
    pub polling_start_delay_ms: u64,
    /// Fallback cadence while the socket is down.
    pub polling_period_focused_ms: u64,
    pub polling_period_not_focused_ms: u64,
    /// Verification cadence while the socket is up.
    pub forced_polling_period_focused_ms: u64,
    pub forced_polling_period_not_focused_ms: u64,
    /// Trigger one poll immediately when a wallet starts being watched.
    pub poll_on_start: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_poll_delay_focused_ms: 1_000,
            min_poll_delay_not_focused_ms: 3_000,
            polling_start_delay_ms: 3_000,
            polling_period_focused_ms: 1_100,
            polling_period_not_focused_ms: 10_000,
            forced_polling_period_focused_ms: 60_000,
            forced_polling_period_not_focused_ms: 120_000,
            poll_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Per-hash coalescing delay applied to socket updates before they reach
    /// the reconciler.
    pub socket_throttle_delay_ms: u64,
    /// Capacity of the finished-hash memory; oldest entries are evicted
    /// first. Races older than the eviction horizon are assumed resolved.
    pub finished_hash_capacity: usize,
    /// Page size for confirmed-activity fetches.
    pub first_fetch_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            socket_throttle_delay_ms: 250,
            finished_hash_capacity: 100,
            first_fetch_limit: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mainnet_http_url: String,
    pub testnet_http_url: String,
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mainnet_http_url: "https://api.mainnet.example.com/v1".to_string(),
            testnet_http_url: "https://api.testnet.example.com/v1".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}
