//! Wallet activity feeds with push-first delivery and polling fallback.
//!
//! A [`FeedRegistry`] owns one shared socket per network. Each watched
//! wallet gets an [`ActivityReconciler`] that merges throttled socket
//! deliveries with polled state, and an [`EnrichmentPipeline`] that resolves
//! full payloads for confirmed activities before they reach the subscriber.

mod bounded;
mod connection;
mod enrich;
mod gateway;
mod multiplexer;
mod pending;
mod reconciler;
mod registry;
mod scheduler;
mod single_flight;
mod throttle;
mod transport;

#[cfg(test)]
mod testing;

pub use self::connection::{DisconnectReason, ReconnectingSocket, SocketHandlers};
pub use self::enrich::EnrichmentPipeline;
pub use self::gateway::{ActivityGateway, ConfirmedActivitiesFilter, HttpActivityGateway};
pub use self::multiplexer::{SubscriptionMultiplexer, WalletWatcher, WatcherCallbacks};
pub use self::reconciler::{ActivityReconciler, LoadingListener, UpdateListener};
pub use self::registry::{FeedRegistry, WalletFeed};
pub use self::scheduler::{FallbackPollingScheduler, SchedulerMode};
pub use self::throttle::UpdateThrottler;
pub use self::transport::{SocketSink, SocketSource, SocketTransport, WsTransport};
