//! Payload enrichment for confirmed activities. Raw confirmations can be
//! skeletal; a batched gateway call resolves full payloads before anything
//! reaches the subscriber. Pending activities skip enrichment entirely.

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use walletfeed_core_types::{sort_activities, Activity, Network};

use crate::gateway::ActivityGateway;
use crate::reconciler::{ActivityReconciler, LoadingListener, UpdateListener};
use crate::single_flight::SingleFlight;

pub struct EnrichmentPipeline {
    inner: Arc<EnrichInner>,
}

struct EnrichInner {
    network: Network,
    gateway: Arc<dyn ActivityGateway>,
    state: Mutex<EnrichState>,
    flight: SingleFlight,
    update_listeners: Mutex<Vec<UpdateListener>>,
    loading_listeners: Mutex<Vec<LoadingListener>>,
    destroyed: AtomicBool,
}

struct EnrichState {
    /// Confirmed activities waiting for the next enrichment pass.
    queue: Vec<Activity>,
    /// Former pending activities whose confirmation is being enriched. They
    /// stay on display so the feed never flickers between the pending entry
    /// vanishing and its enriched confirmation appearing.
    zombies: Vec<Activity>,
    live_pending: Vec<Activity>,
}

impl EnrichmentPipeline {
    pub fn new(
        reconciler: &ActivityReconciler,
        network: Network,
        gateway: Arc<dyn ActivityGateway>,
    ) -> Self {
        let inner = Arc::new(EnrichInner {
            network,
            gateway,
            state: Mutex::new(EnrichState {
                queue: Vec::new(),
                zombies: Vec::new(),
                live_pending: Vec::new(),
            }),
            flight: SingleFlight::new(),
            update_listeners: Mutex::new(Vec::new()),
            loading_listeners: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });

        reconciler.on_update({
            let weak = Arc::downgrade(&inner);
            Arc::new(move |confirmed, pending| {
                if let Some(inner) = weak.upgrade() {
                    handle_update(&inner, confirmed, pending);
                }
            })
        });
        reconciler.on_loading_change({
            let weak = Arc::downgrade(&inner);
            Arc::new(move |is_loading| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.destroyed.load(Ordering::SeqCst) {
                    return;
                }
                let listeners = inner
                    .loading_listeners
                    .lock()
                    .map(|listeners| listeners.clone())
                    .unwrap_or_default();
                for listener in listeners {
                    listener(is_loading);
                }
            })
        });

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

    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
    }
}

fn handle_update(inner: &Arc<EnrichInner>, confirmed: Vec<Activity>, pending: Vec<Activity>) {
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }
    let passthrough = {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };

        // Pending entries that just got confirmed linger as zombies until
        // their enriched confirmation goes out.
        let confirmed_hashes: HashSet<&str> =
            confirmed.iter().filter_map(|a| a.message_hash.as_deref()).collect();
        let departing: Vec<Activity> = state
            .live_pending
            .iter()
            .filter(|p| {
                p.message_hash
                    .as_deref()
                    .is_some_and(|h| confirmed_hashes.contains(h))
            })
            .cloned()
            .collect();
        for zombie in departing {
            let already_there = state.zombies.iter().any(|z| z.id == zombie.id);
            if !already_there {
                state.zombies.push(zombie);
            }
        }
        state.live_pending = pending;

        if confirmed.is_empty() {
            Some(displayed_pending(&state))
        } else {
            state.queue.extend(confirmed);
            None
        }
    };

    match passthrough {
        // Pending-only change: nothing to enrich, report right away.
        Some(pending) => emit(inner, Vec::new(), pending),
        None => trigger_pass(inner),
    }
}

/// Live pending plus zombies, as one sorted sequence.
fn displayed_pending(state: &EnrichState) -> Vec<Activity> {
    let mut pending = state.live_pending.clone();
    pending.extend(state.zombies.iter().cloned());
    sort_activities(&mut pending);
    pending
}

fn trigger_pass(inner: &Arc<EnrichInner>) {
    if !inner.flight.begin() {
        return;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        run_pass(&inner).await;
    });
}

async fn run_pass(inner: &Arc<EnrichInner>) {
    loop {
        // Let same-tick updates land in the queue before batching.
        tokio::task::yield_now().await;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let batch = {
            let Ok(mut state) = inner.state.lock() else {
                return;
            };
            mem::take(&mut state.queue)
        };
        if batch.is_empty() {
            if !inner.flight.finish() {
                return;
            }
            continue;
        }

        let enriched = match inner.gateway.enrich(inner.network, batch.clone()).await {
            Ok(enriched) => enriched,
            // The raw activities are correct, just thin. They go out as-is.
            Err(error) => {
                warn!(error = %error, count = batch.len(), "enrichment failed, reporting raw activities");
                batch
            }
        };
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let (confirmed, pending) = {
            let Ok(mut state) = inner.state.lock() else {
                return;
            };
            let finished: HashSet<&str> = enriched
                .iter()
                .filter_map(|a| a.message_hash.as_deref())
                .collect();
            state.zombies.retain(|z| {
                z.message_hash
                    .as_deref()
                    .map_or(true, |h| !finished.contains(h))
            });
            let mut confirmed = enriched;
            sort_activities(&mut confirmed);
            (confirmed, displayed_pending(&state))
        };
        emit(inner, confirmed, pending);

        if !inner.flight.finish() {
            return;
        }
    }
}

fn emit(inner: &Arc<EnrichInner>, confirmed: Vec<Activity>, pending: Vec<Activity>) {
    let listeners = inner
        .update_listeners
        .lock()
        .map(|listeners| listeners.clone())
        .unwrap_or_default();
    for listener in listeners {
        listener(confirmed.clone(), pending.clone());
    }
}
