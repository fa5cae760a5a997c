//! One socket per network, shared by every watched wallet. Watchers come
//! and go; the multiplexer keeps the server's subscription set in sync with
//! the union of watched addresses, demultiplexes incoming action batches by
//! address, and tracks which watchers are actually live on the wire.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use walletfeed_config::SocketConfig;
use walletfeed_core_types::{ActivitiesUpdate, ClientSocketMessage, ServerSocketMessage};

use crate::bounded::HashAddressMemory;
use crate::connection::{DisconnectReason, ReconnectingSocket, SocketHandlers};
use crate::single_flight::TrailingThrottle;
use crate::transport::SocketTransport;

const SUBSCRIPTION_TYPES: &[&str] = &["actions", "pending_actions"];

/// How many pending hashes worth of routing memory to keep per socket.
const HASH_MEMORY_CAPACITY: usize = 1_000;

#[derive(Default)]
pub struct WatcherCallbacks {
    pub on_new_activities: Option<Arc<dyn Fn(ActivitiesUpdate) + Send + Sync>>,
    /// The watcher's subscription has been acknowledged by the server.
    pub on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Any inbound traffic, regardless of addressee. Used as a liveness
    /// signal by the polling scheduler.
    pub on_socket_message: Option<Arc<dyn Fn() + Send + Sync>>,
}

#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MuxInner>,
}

/// Handle to one watcher registration. Destroying it (explicitly or by
/// dropping) removes the watcher; the socket is torn down once no watched
/// addresses remain.
pub struct WalletWatcher {
    id: u64,
    inner: Weak<MuxInner>,
}

struct MuxInner {
    url: String,
    config: SocketConfig,
    transport: Arc<dyn SocketTransport>,
    state: Mutex<MuxState>,
    actualize: OnceLock<TrailingThrottle>,
}

struct MuxState {
    socket: Option<ReconnectingSocket>,
    watchers: Vec<WatcherEntry>,
    /// Addresses the server currently knows about for this socket.
    subscribed: HashSet<String>,
    /// Shared counter for watcher ids and subscribe-request ids, so a
    /// subscription ack at id R proves every watcher with id <= R is live.
    next_unique_id: u64,
    hash_memory: HashAddressMemory,
    ping: Option<JoinHandle<()>>,
}

struct WatcherEntry {
    id: u64,
    addresses: HashSet<String>,
    is_connected: bool,
    callbacks: WatcherCallbacks,
}

impl SubscriptionMultiplexer {
    pub fn new(url: String, config: SocketConfig, transport: Arc<dyn SocketTransport>) -> Self {
        let actualize_delay = Duration::from_millis(config.actualize_delay_ms);
        let inner = Arc::new(MuxInner {
            url,
            config,
            transport,
            state: Mutex::new(MuxState {
                socket: None,
                watchers: Vec::new(),
                subscribed: HashSet::new(),
                next_unique_id: 1,
                hash_memory: HashAddressMemory::new(HASH_MEMORY_CAPACITY),
                ping: None,
            }),
            actualize: OnceLock::new(),
        });
        let weak = Arc::downgrade(&inner);
        let _ = inner.actualize.set(TrailingThrottle::new(actualize_delay, move || {
            if let Some(inner) = weak.upgrade() {
                actualize_now(&inner);
            }
        }));
        Self { inner }
    }

    pub fn watch(&self, addresses: Vec<String>, callbacks: WatcherCallbacks) -> WalletWatcher {
        let id = {
            let Ok(mut state) = self.inner.state.lock() else {
                return WalletWatcher {
                    id: 0,
                    inner: Weak::new(),
                };
            };
            let id = state.next_unique_id;
            state.next_unique_id += 1;
            state.watchers.push(WatcherEntry {
                id,
                addresses: addresses.into_iter().collect(),
                is_connected: false,
                callbacks,
            });
            id
        };
        trigger_actualize(&self.inner);
        WalletWatcher {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Closes the socket and drops all watcher registrations.
    pub fn destroy(&self) {
        destroy_mux(&self.inner);
    }
}

impl WalletWatcher {
    /// True once the server has acknowledged this watcher's subscription.
    pub fn is_connected(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let Ok(state) = inner.state.lock() else {
            return false;
        };
        state
            .watchers
            .iter()
            .any(|w| w.id == self.id && w.is_connected)
    }

    pub fn destroy(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let removed = {
            let Ok(mut state) = inner.state.lock() else {
                return;
            };
            let before = state.watchers.len();
            state.watchers.retain(|w| w.id != self.id);
            state.watchers.len() != before
        };
        if removed {
            trigger_actualize(&inner);
        }
    }
}

impl Drop for WalletWatcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        if let Some(actualize) = self.actualize.get() {
            actualize.destroy();
        }
        if let Ok(mut state) = self.state.lock() {
            if let Some(ping) = state.ping.take() {
                ping.abort();
            }
            if let Some(socket) = state.socket.take() {
                socket.close();
            }
        }
    }
}

fn trigger_actualize(inner: &Arc<MuxInner>) {
    if let Some(actualize) = inner.actualize.get() {
        actualize.trigger();
    }
}

/// Brings the socket's existence and subscription set in line with the
/// current watcher set.
fn actualize_now(inner: &Arc<MuxInner>) {
    let to_close = {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        let has_addresses = state.watchers.iter().any(|w| !w.addresses.is_empty());
        if has_addresses {
            match state.socket.as_ref().map(ReconnectingSocket::is_open) {
                None => {
                    info!(url = %inner.url, "opening activity socket");
                    state.socket = Some(spawn_socket(inner));
                }
                Some(true) => send_watched_wallets(&mut state),
                // Not open yet: the pending subscription set is sent on open.
                Some(false) => {}
            }
            None
        } else {
            state.subscribed.clear();
            if let Some(ping) = state.ping.take() {
                ping.abort();
            }
            state.socket.take()
        }
    };
    // Closing fires handlers that re-lock the state, so it happens outside.
    if let Some(socket) = to_close {
        info!(url = %inner.url, "no watched addresses left, closing activity socket");
        socket.close();
    }
}

fn spawn_socket(inner: &Arc<MuxInner>) -> ReconnectingSocket {
    let on_open = {
        let weak = Arc::downgrade(inner);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                handle_socket_open(&inner);
            }
        })
    };
    let on_message = {
        let weak = Arc::downgrade(inner);
        Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                handle_socket_message(&inner, message);
            }
        })
    };
    let on_close = {
        let weak = Arc::downgrade(inner);
        Arc::new(move |_reason: DisconnectReason| {
            if let Some(inner) = weak.upgrade() {
                handle_socket_close(&inner);
            }
        })
    };
    ReconnectingSocket::spawn(
        inner.url.clone(),
        &inner.config,
        Arc::clone(&inner.transport),
        SocketHandlers {
            on_open,
            on_message,
            on_close,
        },
    )
}

fn handle_socket_open(inner: &Arc<MuxInner>) {
    let Ok(mut state) = inner.state.lock() else {
        return;
    };
    let Some(socket) = state.socket.clone() else {
        return;
    };
    socket.send(ClientSocketMessage::Configure {
        include_payload: true,
    });
    // Nothing is subscribed on a fresh connection, whatever we sent before.
    state.subscribed.clear();
    send_watched_wallets(&mut state);

    if let Some(ping) = state.ping.take() {
        ping.abort();
    }
    let interval = Duration::from_millis(inner.config.ping_interval_ms);
    let weak = Arc::downgrade(inner);
    state.ping = Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let socket = inner
                .state
                .lock()
                .ok()
                .and_then(|state| state.socket.clone());
            match socket {
                Some(socket) => socket.send(ClientSocketMessage::Ping),
                None => return,
            }
        }
    }));
}

/// Diffs the union of watched addresses against what the server knows and
/// sends the delta. The subscribe request carries a fresh id from the shared
/// counter; its ack flips every watcher registered up to that point.
fn send_watched_wallets(state: &mut MuxState) {
    let Some(socket) = state.socket.clone() else {
        return;
    };
    let watched: HashSet<String> = state
        .watchers
        .iter()
        .flat_map(|w| w.addresses.iter().cloned())
        .collect();
    let removed: Vec<String> = state.subscribed.difference(&watched).cloned().collect();
    let added: Vec<String> = watched.difference(&state.subscribed).cloned().collect();
    // A watcher whose addresses are already subscribed still needs an ack of
    // its own before it counts as live.
    let awaiting_ack: Vec<String> = state
        .watchers
        .iter()
        .filter(|w| !w.is_connected)
        .flat_map(|w| w.addresses.iter().cloned())
        .collect();

    if !removed.is_empty() {
        socket.send(ClientSocketMessage::Unsubscribe { addresses: removed });
    }
    if !added.is_empty() || !awaiting_ack.is_empty() {
        let request_id = state.next_unique_id;
        state.next_unique_id += 1;
        let addresses = if added.is_empty() { awaiting_ack } else { added };
        socket.send(ClientSocketMessage::Subscribe {
            id: request_id,
            addresses,
            types: SUBSCRIPTION_TYPES.iter().map(|t| t.to_string()).collect(),
        });
    }
    state.subscribed = watched;
}

fn handle_socket_close(inner: &Arc<MuxInner>) {
    let to_notify = {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        state.subscribed.clear();
        if let Some(ping) = state.ping.take() {
            ping.abort();
        }
        let mut to_notify = Vec::new();
        for watcher in &mut state.watchers {
            if watcher.is_connected {
                watcher.is_connected = false;
                if let Some(on_disconnect) = &watcher.callbacks.on_disconnect {
                    to_notify.push(Arc::clone(on_disconnect));
                }
            }
        }
        to_notify
    };
    for on_disconnect in to_notify {
        on_disconnect();
    }
}

fn handle_socket_message(inner: &Arc<MuxInner>, message: ServerSocketMessage) {
    let liveness = {
        let Ok(state) = inner.state.lock() else {
            return;
        };
        state
            .watchers
            .iter()
            .filter_map(|w| w.callbacks.on_socket_message.clone())
            .collect::<Vec<_>>()
    };
    for on_socket_message in liveness {
        on_socket_message();
    }

    match message {
        ServerSocketMessage::Subscribed { id } => handle_subscribed(inner, id),
        ServerSocketMessage::Actions {
            message_hash,
            are_pending,
            activities,
        } => {
            let grouped: HashMap<String, Vec<_>> =
                activities.into_iter().fold(HashMap::new(), |mut map, a| {
                    map.entry(a.address.clone()).or_default().push(a);
                    map
                });
            handle_new_actions(inner, message_hash, are_pending, grouped);
        }
        // An invalidation is a pending update with nothing in it; routing
        // relies on the remembered addresses for the hash.
        ServerSocketMessage::Invalidated { message_hash } => {
            handle_new_actions(inner, message_hash, true, HashMap::new());
        }
        ServerSocketMessage::Pong => {}
    }
}

fn handle_subscribed(inner: &Arc<MuxInner>, ack_id: u64) {
    let to_notify = {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        let mut to_notify = Vec::new();
        for watcher in &mut state.watchers {
            // Watchers registered after the request went out are not covered
            // by this ack; their own subscribe is still in flight.
            if watcher.id > ack_id || watcher.is_connected {
                continue;
            }
            watcher.is_connected = true;
            if let Some(on_connect) = &watcher.callbacks.on_connect {
                to_notify.push(Arc::clone(on_connect));
            }
        }
        to_notify
    };
    debug!(ack_id, watchers = to_notify.len(), "subscription acknowledged");
    for on_connect in to_notify {
        on_connect();
    }
}

fn handle_new_actions(
    inner: &Arc<MuxInner>,
    message_hash: String,
    are_pending: bool,
    by_address: HashMap<String, Vec<walletfeed_core_types::Activity>>,
) {
    let deliveries = {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };

        let mut notify: HashSet<String> = state
            .hash_memory
            .addresses(&message_hash)
            .map(|addresses| addresses.iter().cloned().collect())
            .unwrap_or_default();
        notify.extend(by_address.keys().cloned());

        // Pending deliveries refresh the routing memory for the hash; a
        // confirmation or invalidation ends its lifecycle.
        if are_pending && !by_address.is_empty() {
            state.hash_memory
                .remember(&message_hash, by_address.keys().cloned().collect());
        } else {
            state.hash_memory.forget(&message_hash);
        }

        let mut deliveries = Vec::new();
        for watcher in &state.watchers {
            if !watcher.is_connected {
                continue;
            }
            let Some(on_new_activities) = &watcher.callbacks.on_new_activities else {
                continue;
            };
            for address in &watcher.addresses {
                if !notify.contains(address) {
                    continue;
                }
                deliveries.push((
                    Arc::clone(on_new_activities),
                    ActivitiesUpdate {
                        address: address.clone(),
                        message_hash: message_hash.clone(),
                        are_pending,
                        activities: by_address.get(address).cloned().unwrap_or_default(),
                    },
                ));
            }
        }
        deliveries
    };
    for (on_new_activities, update) in deliveries {
        on_new_activities(update);
    }
}

fn destroy_mux(inner: &Arc<MuxInner>) {
    if let Some(actualize) = inner.actualize.get() {
        actualize.destroy();
    }
    let to_close = {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        state.watchers.clear();
        state.subscribed.clear();
        if let Some(ping) = state.ping.take() {
            ping.abort();
        }
        state.socket.take()
    };
    if let Some(socket) = to_close {
        socket.close();
    }
}
