//! Decides when a wallet feed polls. While the socket is down the poller is
//! the only source of truth and runs on a tight fallback cadence; while the
//! socket is up it only runs occasionally to verify nothing slipped past.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use walletfeed_config::PollingConfig;
use walletfeed_core_types::FocusState;

pub type PollFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Idle,
    /// Socket down: polling is the feed's only source.
    Fallback,
    /// Socket up: occasional verification polls.
    Forced,
}

pub struct FallbackPollingScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    polling: PollingConfig,
    focus: FocusState,
    poll: PollFn,
    state: Mutex<SchedState>,
    destroyed: AtomicBool,
}

struct SchedState {
    mode: SchedulerMode,
    schedule: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    poll_running: bool,
    poll_requested: bool,
    last_poll_started: Option<Instant>,
}

impl FallbackPollingScheduler {
    pub fn new(connected: bool, polling: PollingConfig, focus: FocusState, poll: PollFn) -> Self {
        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                polling,
                focus,
                poll,
                state: Mutex::new(SchedState {
                    mode: SchedulerMode::Idle,
                    schedule: None,
                    poll_task: None,
                    poll_running: false,
                    poll_requested: false,
                    last_poll_started: None,
                }),
                destroyed: AtomicBool::new(false),
            }),
        };
        if connected {
            enter_forced(&scheduler.inner);
        } else {
            enter_fallback(&scheduler.inner);
        }
        if scheduler.inner.polling.poll_on_start {
            request_poll(&scheduler.inner);
        }
        scheduler
    }

    /// Immediate catch-up poll, then the forced verification cadence.
    pub fn on_socket_connect(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        enter_forced(&self.inner);
        request_poll(&self.inner);
    }

    /// Fallback cadence after a grace period; a quick reconnect cancels it
    /// before the first fallback poll fires.
    pub fn on_socket_disconnect(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        enter_fallback(&self.inner);
    }

    /// Socket traffic proves liveness, so the forced-poll countdown restarts.
    pub fn on_socket_message(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        if state.mode != SchedulerMode::Forced {
            return;
        }
        if let Some(schedule) = state.schedule.take() {
            schedule.abort();
        }
        state.schedule = Some(spawn_forced_loop(Arc::clone(&self.inner)));
    }

    pub fn request_poll(&self) {
        request_poll(&self.inner);
    }

    #[cfg(test)]
    pub fn mode(&self) -> SchedulerMode {
        self.inner
            .state
            .lock()
            .map(|state| state.mode)
            .unwrap_or(SchedulerMode::Idle)
    }

    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        if let Ok(mut state) = self.inner.state.lock() {
            state.mode = SchedulerMode::Idle;
            if let Some(schedule) = state.schedule.take() {
                schedule.abort();
            }
            if let Some(poll_task) = state.poll_task.take() {
                poll_task.abort();
            }
        }
    }
}

fn enter_forced(inner: &Arc<SchedulerInner>) {
    let Ok(mut state) = inner.state.lock() else {
        return;
    };
    if let Some(schedule) = state.schedule.take() {
        schedule.abort();
    }
    state.mode = SchedulerMode::Forced;
    state.schedule = Some(spawn_forced_loop(Arc::clone(inner)));
}

fn enter_fallback(inner: &Arc<SchedulerInner>) {
    let Ok(mut state) = inner.state.lock() else {
        return;
    };
    if let Some(schedule) = state.schedule.take() {
        schedule.abort();
    }
    state.mode = SchedulerMode::Fallback;
    state.schedule = Some(spawn_fallback_loop(Arc::clone(inner)));
}

fn spawn_forced_loop(inner: Arc<SchedulerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let period = if inner.focus.is_focused() {
                inner.polling.forced_polling_period_focused_ms
            } else {
                inner.polling.forced_polling_period_not_focused_ms
            };
            tokio::time::sleep(Duration::from_millis(period)).await;
            debug!("forced verification poll");
            request_poll(&inner);
        }
    })
}

fn spawn_fallback_loop(inner: Arc<SchedulerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(inner.polling.polling_start_delay_ms)).await;
        loop {
            request_poll(&inner);
            let period = if inner.focus.is_focused() {
                inner.polling.polling_period_focused_ms
            } else {
                inner.polling.polling_period_not_focused_ms
            };
            tokio::time::sleep(Duration::from_millis(period)).await;
        }
    })
}

/// Single-flight entry point. A request landing while a poll is running is
/// folded into exactly one follow-up poll; consecutive polls keep the
/// focus-dependent minimum spacing.
fn request_poll(inner: &Arc<SchedulerInner>) {
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }
    let Ok(mut state) = inner.state.lock() else {
        return;
    };
    if state.poll_running {
        state.poll_requested = true;
        return;
    }
    state.poll_running = true;
    let wait = floor_wait(inner, &state);
    state.poll_task = Some(tokio::spawn(run_poll(Arc::clone(inner), wait)));
}

fn floor_wait(inner: &SchedulerInner, state: &SchedState) -> Duration {
    let min_delay = Duration::from_millis(if inner.focus.is_focused() {
        inner.polling.min_poll_delay_focused_ms
    } else {
        inner.polling.min_poll_delay_not_focused_ms
    });
    match state.last_poll_started {
        Some(started) => min_delay.saturating_sub(started.elapsed()),
        None => Duration::ZERO,
    }
}

async fn run_poll(inner: Arc<SchedulerInner>, mut wait: Duration) {
    loop {
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = inner.state.lock() {
            state.last_poll_started = Some(Instant::now());
        }

        (inner.poll)().await;

        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        if state.poll_requested {
            state.poll_requested = false;
            wait = floor_wait(&inner, &state);
        } else {
            state.poll_running = false;
            state.poll_task = None;
            return;
        }
    }
}
