//! A self-healing socket connection. One driver task owns the whole
//! lifecycle: connect, drain the outbox, read until the stream dies, back
//! off, reconnect. Callers interact only through the handler callbacks and
//! the non-blocking [`ReconnectingSocket::send`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use walletfeed_config::SocketConfig;
use walletfeed_core_types::{ClientSocketMessage, ServerSocketMessage};

use crate::transport::SocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The owner closed the socket; no reconnect follows.
    Requested,
    /// The stream failed or went silent; a reconnect is already scheduled.
    Unexpected,
}

pub struct SocketHandlers {
    pub on_open: Arc<dyn Fn() + Send + Sync>,
    pub on_message: Arc<dyn Fn(ServerSocketMessage) + Send + Sync>,
    pub on_close: Arc<dyn Fn(DisconnectReason) + Send + Sync>,
}

#[derive(Clone)]
pub struct ReconnectingSocket {
    shared: Arc<SocketShared>,
}

struct SocketShared {
    out_tx: mpsc::UnboundedSender<ClientSocketMessage>,
    is_open: AtomicBool,
    destroyed: AtomicBool,
    handlers: SocketHandlers,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct DriverContext {
    url: String,
    open_timeout: Duration,
    idle_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    transport: Arc<dyn SocketTransport>,
}

impl ReconnectingSocket {
    pub fn spawn(
        url: String,
        config: &SocketConfig,
        transport: Arc<dyn SocketTransport>,
        handlers: SocketHandlers,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared {
            out_tx,
            is_open: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            handlers,
            driver: Mutex::new(None),
        });
        let context = DriverContext {
            url,
            open_timeout: Duration::from_millis(config.open_timeout_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            backoff_base: Duration::from_millis(config.reconnect_base_delay_ms),
            backoff_max: Duration::from_millis(config.reconnect_max_delay_ms),
            transport,
        };
        let driver = tokio::spawn(drive(Arc::clone(&shared), context, out_rx));
        if let Ok(mut slot) = shared.driver.lock() {
            *slot = Some(driver);
        }
        Self { shared }
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open.load(Ordering::SeqCst)
    }

    /// Queues a message. Messages sent while the socket is down are flushed
    /// in order once a connection is (re)established.
    pub fn send(&self, message: ClientSocketMessage) {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.out_tx.send(message);
    }

    /// Stops the driver for good. Idempotent. Fires `on_close(Requested)`
    /// when the socket was open.
    pub fn close(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.shared.driver.lock() {
            if let Some(driver) = slot.take() {
                driver.abort();
            }
        }
        if self.shared.is_open.swap(false, Ordering::SeqCst) {
            (self.shared.handlers.on_close)(DisconnectReason::Requested);
        }
    }
}

async fn drive(
    shared: Arc<SocketShared>,
    context: DriverContext,
    mut out_rx: mpsc::UnboundedReceiver<ClientSocketMessage>,
) {
    let mut attempts: u32 = 0;
    loop {
        if shared.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let connected =
            match tokio::time::timeout(context.open_timeout, context.transport.connect(&context.url))
                .await
            {
                Ok(Ok(halves)) => halves,
                Ok(Err(error)) => {
                    warn!(error = %error, url = %context.url, "socket connect failed");
                    attempts += 1;
                    backoff(&context, attempts).await;
                    continue;
                }
                Err(_) => {
                    warn!(url = %context.url, "socket open timed out");
                    attempts += 1;
                    backoff(&context, attempts).await;
                    continue;
                }
            };

        attempts = 0;
        shared.is_open.store(true, Ordering::SeqCst);
        (shared.handlers.on_open)();

        let (mut sink, mut source) = connected;
        loop {
            tokio::select! {
                outgoing = out_rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(error) = sink.send(message).await {
                            warn!(error = %error, "socket send failed");
                            break;
                        }
                    }
                    // All senders dropped; the socket has no owner left.
                    None => return,
                },
                incoming = tokio::time::timeout(context.idle_timeout, source.next_message()) => {
                    match incoming {
                        Ok(Ok(Some(message))) => (shared.handlers.on_message)(message),
                        Ok(Ok(None)) => {
                            debug!("socket stream ended");
                            break;
                        }
                        Ok(Err(error)) => {
                            warn!(error = %error, "socket stream error");
                            break;
                        }
                        Err(_) => {
                            warn!("socket idle for too long, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        shared.is_open.store(false, Ordering::SeqCst);
        if shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        (shared.handlers.on_close)(DisconnectReason::Unexpected);
        attempts += 1;
        backoff(&context, attempts).await;
    }
}

async fn backoff(context: &DriverContext, attempts: u32) {
    let delay = context
        .backoff_base
        .saturating_mul(attempts)
        .min(context.backoff_max);
    debug!(attempts, delay_ms = delay.as_millis() as u64, "socket reconnect backoff");
    tokio::time::sleep(delay).await;
}
