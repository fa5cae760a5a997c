use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::FeedConfig;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<FeedConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: FeedConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

pub fn load_from_env_or_default(default_path: &Path) -> Result<(FeedConfig, PathBuf)> {
    let configured = env::var("WALLETFEED_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_path.to_path_buf());
    let mut config = load_from_path(&configured)?;

    if let Ok(url) = env::var("WALLETFEED_SOCKET_MAINNET_URL") {
        config.socket.mainnet_url = url;
    }
    if let Ok(url) = env::var("WALLETFEED_SOCKET_TESTNET_URL") {
        config.socket.testnet_url = url;
    }
    if let Some(ping_interval_ms) = env::var("WALLETFEED_SOCKET_PING_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.socket.ping_interval_ms = ping_interval_ms;
    }
    if let Some(open_timeout_ms) = env::var("WALLETFEED_SOCKET_OPEN_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.socket.open_timeout_ms = open_timeout_ms;
    }
    if let Some(idle_timeout_ms) = env::var("WALLETFEED_SOCKET_IDLE_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.socket.idle_timeout_ms = idle_timeout_ms;
    }
    if let Some(base_delay_ms) = env::var("WALLETFEED_SOCKET_RECONNECT_BASE_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.socket.reconnect_base_delay_ms = base_delay_ms;
    }
    if let Some(max_delay_ms) = env::var("WALLETFEED_SOCKET_RECONNECT_MAX_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.socket.reconnect_max_delay_ms = max_delay_ms;
    }
    if let Some(start_delay_ms) = env::var("WALLETFEED_POLLING_START_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.polling.polling_start_delay_ms = start_delay_ms;
    }
    if let Some(period_ms) = env::var("WALLETFEED_POLLING_PERIOD_FOCUSED_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.polling.polling_period_focused_ms = period_ms;
    }
    if let Some(period_ms) = env::var("WALLETFEED_POLLING_PERIOD_NOT_FOCUSED_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.polling.polling_period_not_focused_ms = period_ms;
    }
    if let Some(period_ms) = env::var("WALLETFEED_FORCED_POLLING_PERIOD_FOCUSED_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.polling.forced_polling_period_focused_ms = period_ms;
    }
    if let Some(period_ms) = env::var("WALLETFEED_FORCED_POLLING_PERIOD_NOT_FOCUSED_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.polling.forced_polling_period_not_focused_ms = period_ms;
    }
    if let Some(throttle_delay_ms) = env::var("WALLETFEED_SOCKET_THROTTLE_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.reconciler.socket_throttle_delay_ms = throttle_delay_ms;
    }
    if let Some(capacity) = env::var("WALLETFEED_FINISHED_HASH_CAPACITY")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        config.reconciler.finished_hash_capacity = capacity;
    }
    if let Ok(url) = env::var("WALLETFEED_GATEWAY_MAINNET_HTTP_URL") {
        config.gateway.mainnet_http_url = url;
    }
    if let Ok(url) = env::var("WALLETFEED_GATEWAY_TESTNET_HTTP_URL") {
        config.gateway.testnet_http_url = url;
    }
    if let Some(timeout_ms) = env::var("WALLETFEED_GATEWAY_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.gateway.request_timeout_ms = timeout_ms;
    }

    Ok((config, configured))
}
