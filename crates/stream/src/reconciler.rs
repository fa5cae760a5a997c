//! Per-wallet reconciliation between socket deliveries and polled state.
//! The socket is fast but lossy across reconnects; the poller is slow but
//! complete. This module merges both into one deduplicated, ordered feed.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{debug, warn};

use walletfeed_config::{PollingConfig, ReconcilerConfig};
use walletfeed_core_types::{
    sort_activities, ActivitiesUpdate, Activity, FocusState, Network,
};

use crate::gateway::{ActivityGateway, ConfirmedActivitiesFilter};
use crate::multiplexer::{SubscriptionMultiplexer, WalletWatcher, WatcherCallbacks};
use crate::pending::{PendingActivitySet, PendingInput};
use crate::scheduler::{FallbackPollingScheduler, PollFn};
use crate::throttle::UpdateThrottler;

pub type UpdateListener = Arc<dyn Fn(Vec<Activity>, Vec<Activity>) + Send + Sync>;
pub type LoadingListener = Arc<dyn Fn(bool) + Send + Sync>;

pub struct ActivityReconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    network: Network,
    address: String,
    gateway: Arc<dyn ActivityGateway>,
    polling: PollingConfig,
    fetch_limit: usize,
    focus: FocusState,
    state: Mutex<ReconcilerState>,
    update_listeners: Mutex<Vec<UpdateListener>>,
    loading_listeners: Mutex<Vec<LoadingListener>>,
    destroyed: AtomicBool,
    watcher: OnceLock<WalletWatcher>,
    throttler: OnceLock<UpdateThrottler>,
    scheduler: OnceLock<FallbackPollingScheduler>,
}

struct ReconcilerState {
    /// Frontier for incremental confirmed fetches.
    newest_confirmed_timestamp: Option<i64>,
    /// Set while the poll that covers a socket (re)connect gap is pending.
    /// Confirmed socket deliveries are stashed, not reported, until it runs.
    needs_history_restore: bool,
    stash: Vec<Activity>,
    pending: PendingActivitySet,
    /// Last pending sequence handed to listeners, for suppressing updates
    /// that would not change anything on display.
    last_reported_pending: Vec<Activity>,
}

impl ActivityReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        multiplexer: &SubscriptionMultiplexer,
        gateway: Arc<dyn ActivityGateway>,
        polling: PollingConfig,
        reconciler_config: &ReconcilerConfig,
        focus: FocusState,
        network: Network,
        address: String,
        newest_confirmed_timestamp: Option<i64>,
    ) -> Self {
        let inner = Arc::new(ReconcilerInner {
            network,
            address: address.clone(),
            gateway,
            polling: polling.clone(),
            fetch_limit: reconciler_config.first_fetch_limit,
            focus: focus.clone(),
            state: Mutex::new(ReconcilerState {
                newest_confirmed_timestamp,
                needs_history_restore: false,
                stash: Vec::new(),
                pending: PendingActivitySet::new(reconciler_config.finished_hash_capacity),
                last_reported_pending: Vec::new(),
            }),
            update_listeners: Mutex::new(Vec::new()),
            loading_listeners: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            watcher: OnceLock::new(),
            throttler: OnceLock::new(),
            scheduler: OnceLock::new(),
        });

        let throttler = {
            let weak = Arc::downgrade(&inner);
            UpdateThrottler::new(
                Duration::from_millis(reconciler_config.socket_throttle_delay_ms),
                move |update| {
                    if let Some(inner) = weak.upgrade() {
                        handle_socket_update(&inner, update);
                    }
                },
            )
        };
        let _ = inner.throttler.set(throttler);

        let watcher = multiplexer.watch(
            vec![address],
            WatcherCallbacks {
                on_new_activities: Some({
                    let weak = Arc::downgrade(&inner);
                    Arc::new(move |update| {
                        if let Some(inner) = weak.upgrade() {
                            if let Some(throttler) = inner.throttler.get() {
                                throttler.push(update);
                            }
                        }
                    })
                }),
                on_connect: Some({
                    let weak = Arc::downgrade(&inner);
                    Arc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            handle_socket_connect(&inner);
                        }
                    })
                }),
                on_disconnect: Some({
                    let weak = Arc::downgrade(&inner);
                    Arc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            handle_socket_disconnect(&inner);
                        }
                    })
                }),
                on_socket_message: Some({
                    let weak = Arc::downgrade(&inner);
                    Arc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            if let Some(scheduler) = inner.scheduler.get() {
                                scheduler.on_socket_message();
                            }
                        }
                    })
                }),
            },
        );
        let connected = watcher.is_connected();
        if connected {
            if let Ok(mut state) = inner.state.lock() {
                state.needs_history_restore = true;
            }
        }
        let _ = inner.watcher.set(watcher);

        let poll: PollFn = {
            let weak = Arc::downgrade(&inner);
            Arc::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        run_poll(&inner).await;
                    }
                }
                .boxed()
            })
        };
        let _ = inner
            .scheduler
            .set(FallbackPollingScheduler::new(connected, polling, focus, poll));

        Self { inner }
    }

    pub fn on_update(&self, listener: UpdateListener) {
        if let Ok(mut listeners) = self.inner.update_listeners.lock() {
            listeners.push(listener);
        }
    }

    pub fn on_loading_change(&self, listener: LoadingListener) {
        if let Ok(mut listeners) = self.inner.loading_listeners.lock() {
            listeners.push(listener);
        }
    }

    pub fn request_poll(&self) {
        if let Some(scheduler) = self.inner.scheduler.get() {
            scheduler.request_poll();
        }
    }

    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.inner.watcher.get() {
            watcher.destroy();
        }
        if let Some(throttler) = self.inner.throttler.get() {
            throttler.destroy();
        }
        if let Some(scheduler) = self.inner.scheduler.get() {
            scheduler.destroy();
        }
    }
}

fn handle_socket_connect(inner: &Arc<ReconcilerInner>) {
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }
    debug!(address = %inner.address, "socket live, scheduling history restore");
    if let Ok(mut state) = inner.state.lock() {
        state.needs_history_restore = true;
    }
    if let Some(scheduler) = inner.scheduler.get() {
        scheduler.on_socket_connect();
    }
}

fn handle_socket_disconnect(inner: &Arc<ReconcilerInner>) {
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }
    if let Ok(mut state) = inner.state.lock() {
        state.needs_history_restore = false;
        state.stash.clear();
    }
    if let Some(scheduler) = inner.scheduler.get() {
        scheduler.on_socket_disconnect();
    }
}

/// A throttled socket update. Pending data always flows straight through;
/// confirmed data is stashed while a history restore is outstanding, because
/// the poll may surface older confirmed activities that must come first. A
/// stashed confirmation does not finish its hash yet, so the pending
/// counterpart stays on display until the stash is reported.
fn handle_socket_update(inner: &Arc<ReconcilerInner>, update: ActivitiesUpdate) {
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }
    if update.are_pending {
        handle_new_activities(inner, Vec::new(), PendingInput::Merge(vec![update]));
        return;
    }

    let mut confirmed = update.activities.clone();
    sort_activities(&mut confirmed);
    {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        if state.needs_history_restore && !confirmed.is_empty() {
            // Newest-first within the stash, oldest batches last.
            let mut stash = confirmed;
            stash.extend(mem::take(&mut state.stash));
            state.stash = stash;
            return;
        }
    }

    handle_new_activities(
        inner,
        confirmed,
        PendingInput::Merge(vec![update_without_activities(update)]),
    );
}

/// The reported confirmed activities finish their own hash; this empty final
/// update covers deliveries whose activities all belong to other addresses
/// sharing the hash.
fn update_without_activities(update: ActivitiesUpdate) -> ActivitiesUpdate {
    ActivitiesUpdate {
        activities: Vec::new(),
        are_pending: false,
        ..update
    }
}

async fn run_poll(inner: &Arc<ReconcilerInner>) {
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }
    notify_loading(inner, true);

    let (pending, confirmed) = tokio::join!(load_pending(inner), load_new_confirmed(inner));

    if !inner.destroyed.load(Ordering::SeqCst) {
        let stashed = {
            let Ok(mut state) = inner.state.lock() else {
                return;
            };
            mem::take(&mut state.stash)
        };
        let merged = merge_stash_with_polled(confirmed, stashed);
        let pending_input = match pending {
            Some(pending) => PendingInput::Replace(pending),
            None => PendingInput::Keep,
        };
        handle_new_activities(inner, merged, pending_input);
        if let Ok(mut state) = inner.state.lock() {
            state.needs_history_restore = false;
        }
    }

    if !inner.destroyed.load(Ordering::SeqCst) {
        notify_loading(inner, false);
    }
}

async fn load_pending(inner: &Arc<ReconcilerInner>) -> Option<Vec<Activity>> {
    match inner
        .gateway
        .fetch_pending_activities(inner.network, &inner.address)
        .await
    {
        Ok(mut pending) => {
            sort_activities(&mut pending);
            Some(pending)
        }
        Err(error) => {
            warn!(error = %error, address = %inner.address, "pending fetch failed, keeping current list");
            None
        }
    }
}

/// Fetches confirmed activities newer than the frontier. While a history
/// restore is outstanding this must not silently fail, so it retries at the
/// minimum poll spacing until it succeeds or the restore is called off.
async fn load_new_confirmed(inner: &Arc<ReconcilerInner>) -> Vec<Activity> {
    loop {
        if inner.destroyed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let from_timestamp = inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.newest_confirmed_timestamp);
        let filter = ConfirmedActivitiesFilter {
            address: inner.address.clone(),
            from_timestamp,
        };
        match inner
            .gateway
            .fetch_confirmed_activities(inner.network, &filter, inner.fetch_limit)
            .await
        {
            Ok(mut confirmed) => {
                sort_activities(&mut confirmed);
                return confirmed;
            }
            Err(error) => {
                let restoring = inner
                    .state
                    .lock()
                    .map(|state| state.needs_history_restore)
                    .unwrap_or(false);
                if inner.destroyed.load(Ordering::SeqCst) || !restoring {
                    warn!(error = %error, address = %inner.address, "confirmed fetch failed");
                    return Vec::new();
                }
                warn!(error = %error, address = %inner.address, "confirmed fetch failed during restore, retrying");
                let delay = if inner.focus.is_focused() {
                    inner.polling.min_poll_delay_focused_ms
                } else {
                    inner.polling.min_poll_delay_not_focused_ms
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

/// Stashed socket activities strictly newer than the newest polled activity
/// are kept in front of the polled batch; the rest are already covered by
/// the poll (or older than its frontier) and dropped.
fn merge_stash_with_polled(polled: Vec<Activity>, stashed: Vec<Activity>) -> Vec<Activity> {
    if stashed.is_empty() {
        return polled;
    }
    let newest_polled = polled.first().map(|a| a.timestamp);
    let mut merged: Vec<Activity> = stashed
        .into_iter()
        .filter(|a| newest_polled.map_or(true, |newest| a.timestamp > newest))
        .collect();
    merged.extend(polled);
    merged
}

fn handle_new_activities(
    inner: &Arc<ReconcilerInner>,
    confirmed: Vec<Activity>,
    input: PendingInput,
) {
    let has_pending_input = match &input {
        PendingInput::Replace(_) => true,
        PendingInput::Merge(updates) => !updates.is_empty(),
        PendingInput::Keep => false,
    };
    if confirmed.is_empty() && !has_pending_input {
        return;
    }

    let to_report = {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        if let Some(newest) = confirmed.first() {
            debug!(address = %inner.address, at = ?newest.occurred_at(), "advancing confirmed frontier");
            state.newest_confirmed_timestamp = Some(newest.timestamp);
        }
        state.pending.update(&confirmed, input);
        let pending_now = state.pending.all().to_vec();
        if confirmed.is_empty() && pending_now == state.last_reported_pending {
            None
        } else {
            state.last_reported_pending = pending_now.clone();
            Some((confirmed, pending_now))
        }
    };

    if let Some((confirmed, pending)) = to_report {
        let listeners = inner
            .update_listeners
            .lock()
            .map(|listeners| listeners.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener(confirmed.clone(), pending.clone());
        }
    }
}

fn notify_loading(inner: &Arc<ReconcilerInner>, is_loading: bool) {
    let listeners = inner
        .loading_listeners
        .lock()
        .map(|listeners| listeners.clone())
        .unwrap_or_default();
    for listener in listeners {
        listener(is_loading);
    }
}
