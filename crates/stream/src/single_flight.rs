//! Small concurrency disciplines shared by the socket multiplexer, the
//! polling scheduler and the enrichment pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Collapses bursts of triggers into one run of `task` at the trailing edge
/// of a window. The first trigger arms a timer; triggers that land while the
/// timer is pending are absorbed.
pub struct TrailingThrottle {
    inner: Arc<ThrottleInner>,
}

struct ThrottleInner {
    window: Duration,
    task: Box<dyn Fn() + Send + Sync>,
    state: Mutex<ThrottleState>,
    destroyed: AtomicBool,
}

#[derive(Default)]
struct ThrottleState {
    armed: bool,
    timer: Option<JoinHandle<()>>,
}

impl TrailingThrottle {
    pub fn new(window: Duration, task: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                window,
                task: Box::new(task),
                state: Mutex::new(ThrottleState::default()),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn trigger(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        if state.armed {
            return;
        }
        state.armed = true;
        let inner = Arc::clone(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            if let Ok(mut state) = inner.state.lock() {
                state.armed = false;
                state.timer = None;
            }
            if !inner.destroyed.load(Ordering::SeqCst) {
                (inner.task)();
            }
        }));
    }

    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        if let Ok(mut state) = self.inner.state.lock() {
            state.armed = false;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }
}

/// Guards an operation so at most one run is in flight. A request arriving
/// mid-run is folded into one follow-up run instead of overlapping.
#[derive(Default)]
pub struct SingleFlight {
    state: Mutex<SingleFlightState>,
}

#[derive(Default)]
struct SingleFlightState {
    running: bool,
    rerun_requested: bool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the caller owns the run. On false the in-flight run
    /// picks the request up via [`SingleFlight::finish`].
    pub fn begin(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.running {
            state.rerun_requested = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Ends the caller's run. Returns true when another run was requested in
    /// the meantime; the caller must then run again (ownership is retained).
    pub fn finish(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.rerun_requested {
            state.rerun_requested = false;
            true
        } else {
            state.running = false;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn trailing_throttle_collapses_a_burst_into_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let throttle = TrailingThrottle::new(Duration::from_millis(10), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        throttle.trigger();
        throttle.trigger();
        throttle.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // A trigger after the window runs again.
        throttle.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_throttle_never_fires() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let throttle = TrailingThrottle::new(Duration::from_millis(10), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        throttle.trigger();
        throttle.destroy();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn single_flight_folds_requests_made_mid_run() {
        let flight = SingleFlight::new();

        assert!(flight.begin());
        assert!(!flight.begin());
        assert!(!flight.begin());

        // One follow-up run was requested; after it, the flight is idle.
        assert!(flight.finish());
        assert!(!flight.finish());
        assert!(flight.begin());
    }
}
