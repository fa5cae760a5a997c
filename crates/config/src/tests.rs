use super::*;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

static ENV_LOCK: Mutex<()> = Mutex::new(());
static TEMP_CONFIG_COUNTER: AtomicU64 = AtomicU64::new(0);

fn write_temp_config(contents: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .subsec_nanos();
    let counter = TEMP_CONFIG_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = env::temp_dir().join(format!(
        "walletfeed-config-{}-{nanos}-{counter}.toml",
        std::process::id()
    ));
    fs::write(&path, contents).expect("temp config written");
    path
}

#[test]
fn socket_defaults_are_applied() {
    let socket = SocketConfig::default();
    assert_eq!(socket.ping_interval_ms, 20_000);
    assert_eq!(socket.open_timeout_ms, 10_000);
    assert_eq!(socket.idle_timeout_ms, 60_000);
    assert_eq!(socket.reconnect_base_delay_ms, 500);
    assert_eq!(socket.reconnect_max_delay_ms, 8_000);
    assert_eq!(socket.actualize_delay_ms, 10);
}

#[test]
fn polling_defaults_are_split_by_focus() {
    let polling = PollingConfig::default();
    assert_eq!(polling.min_poll_delay_focused_ms, 1_000);
    assert_eq!(polling.min_poll_delay_not_focused_ms, 3_000);
    assert_eq!(polling.polling_start_delay_ms, 3_000);
    assert_eq!(polling.polling_period_focused_ms, 1_100);
    assert_eq!(polling.polling_period_not_focused_ms, 10_000);
    assert_eq!(polling.forced_polling_period_focused_ms, 60_000);
    assert_eq!(polling.forced_polling_period_not_focused_ms, 120_000);
    assert!(polling.poll_on_start);
}

#[test]
fn reconciler_defaults_are_applied() {
    let reconciler = ReconcilerConfig::default();
    assert_eq!(reconciler.socket_throttle_delay_ms, 250);
    assert_eq!(reconciler.finished_hash_capacity, 100);
    assert_eq!(reconciler.first_fetch_limit, 60);
}

#[test]
fn partial_toml_falls_back_to_defaults() {
    let path = write_temp_config(
        r#"
[polling]
polling_start_delay_ms = 500

[reconciler]
finished_hash_capacity = 16
"#,
    );

    let config = load_from_path(&path).expect("config loads");
    fs::remove_file(&path).ok();

    assert_eq!(config.polling.polling_start_delay_ms, 500);
    assert_eq!(config.polling.polling_period_focused_ms, 1_100);
    assert_eq!(config.reconciler.finished_hash_capacity, 16);
    assert_eq!(config.reconciler.socket_throttle_delay_ms, 250);
    assert_eq!(config.socket.ping_interval_ms, 20_000);
}

#[test]
fn missing_config_file_is_an_error() {
    let path = env::temp_dir().join("walletfeed-config-does-not-exist.toml");
    let error = load_from_path(&path).expect_err("missing file should fail");
    assert!(error.to_string().contains("failed to read config"));
}

#[test]
fn env_overrides_take_precedence_over_file_values() {
    let _guard = ENV_LOCK.lock().expect("env lock");

    let path = write_temp_config(
        r#"
[socket]
ping_interval_ms = 15000
"#,
    );

    env::set_var("WALLETFEED_SOCKET_PING_INTERVAL_MS", "25000");
    env::set_var("WALLETFEED_POLLING_START_DELAY_MS", "100");
    env::set_var("WALLETFEED_FINISHED_HASH_CAPACITY", "42");
    env::remove_var("WALLETFEED_CONFIG");

    let result = load_from_env_or_default(&path);

    env::remove_var("WALLETFEED_SOCKET_PING_INTERVAL_MS");
    env::remove_var("WALLETFEED_POLLING_START_DELAY_MS");
    env::remove_var("WALLETFEED_FINISHED_HASH_CAPACITY");
    fs::remove_file(&path).ok();

    let (config, used_path) = result.expect("config loads");
    assert_eq!(used_path, path);
    assert_eq!(config.socket.ping_interval_ms, 25_000);
    assert_eq!(config.polling.polling_start_delay_ms, 100);
    assert_eq!(config.reconciler.finished_hash_capacity, 42);
}

#[test]
fn malformed_env_override_is_ignored() {
    let _guard = ENV_LOCK.lock().expect("env lock");

    let path = write_temp_config("");

    env::set_var("WALLETFEED_SOCKET_PING_INTERVAL_MS", "not-a-number");
    env::remove_var("WALLETFEED_CONFIG");

    let result = load_from_env_or_default(&path);

    env::remove_var("WALLETFEED_SOCKET_PING_INTERVAL_MS");
    fs::remove_file(&path).ok();

    let (config, _) = result.expect("config loads");
    assert_eq!(config.socket.ping_interval_ms, 20_000);
}
