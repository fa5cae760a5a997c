//! Per-hash coalescing of socket updates. A pending activity can be
//! re-delivered many times in quick succession while it propagates; only the
//! first version, the latest version per window, and the final version
//! matter downstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use walletfeed_core_types::ActivitiesUpdate;

pub struct UpdateThrottler {
    inner: Arc<ThrottlerInner>,
}

struct ThrottlerInner {
    delay: Duration,
    output: Box<dyn Fn(ActivitiesUpdate) + Send + Sync>,
    state: Mutex<HashMap<String, TrackedHash>>,
    destroyed: AtomicBool,
}

struct TrackedHash {
    /// The newest update absorbed since the last delivery for this hash.
    latest: Option<ActivitiesUpdate>,
    flush: Option<JoinHandle<()>>,
}

impl UpdateThrottler {
    pub fn new(delay: Duration, output: impl Fn(ActivitiesUpdate) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ThrottlerInner {
                delay,
                output: Box::new(output),
                state: Mutex::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// First and final updates for a hash pass through immediately; anything
    /// in between is held back and flushed as the latest version once the
    /// delay elapses. A final update cancels a pending flush.
    pub fn push(&self, update: ActivitiesUpdate) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let deliver_now = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            let hash = update.message_hash.clone();
            if update.is_final() {
                if let Some(tracked) = state.remove(&hash) {
                    if let Some(flush) = tracked.flush {
                        flush.abort();
                    }
                }
                Some(update)
            } else if let Some(tracked) = state.get_mut(&hash) {
                tracked.latest = Some(update);
                None
            } else {
                state.insert(
                    hash.clone(),
                    TrackedHash {
                        latest: None,
                        flush: Some(spawn_flush(Arc::clone(&self.inner), hash)),
                    },
                );
                Some(update)
            }
        };
        if let Some(update) = deliver_now {
            (self.inner.output)(update);
        }
    }

    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        if let Ok(mut state) = self.inner.state.lock() {
            for (_, tracked) in state.drain() {
                if let Some(flush) = tracked.flush {
                    flush.abort();
                }
            }
        }
    }
}

fn spawn_flush(inner: Arc<ThrottlerInner>, hash: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(inner.delay).await;
        let latest = match inner.state.lock() {
            Ok(mut state) => state.remove(&hash).and_then(|tracked| tracked.latest),
            Err(_) => None,
        };
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(update) = latest {
            (inner.output)(update);
        }
    })
}
