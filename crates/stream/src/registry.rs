//! Entry point tying the stack together: one multiplexer per network, and a
//! [`WalletFeed`] per watched wallet wiring reconciliation and enrichment to
//! the shared socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use walletfeed_config::FeedConfig;
use walletfeed_core_types::{FocusState, Network};

use crate::enrich::EnrichmentPipeline;
use crate::gateway::{ActivityGateway, HttpActivityGateway};
use crate::multiplexer::SubscriptionMultiplexer;
use crate::reconciler::{ActivityReconciler, LoadingListener, UpdateListener};
use crate::transport::{SocketTransport, WsTransport};

pub struct FeedRegistry {
    config: FeedConfig,
    transport: Arc<dyn SocketTransport>,
    gateway: Arc<dyn ActivityGateway>,
    focus: FocusState,
    multiplexers: Mutex<HashMap<Network, SubscriptionMultiplexer>>,
}

impl FeedRegistry {
    pub fn new(
        config: FeedConfig,
        transport: Arc<dyn SocketTransport>,
        gateway: Arc<dyn ActivityGateway>,
        focus: FocusState,
    ) -> Self {
        Self {
            config,
            transport,
            gateway,
            focus,
            multiplexers: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: websocket transport and HTTP gateway.
    pub fn with_defaults(config: FeedConfig) -> Result<Self> {
        let gateway = HttpActivityGateway::new(config.gateway.clone())?;
        Ok(Self::new(
            config,
            Arc::new(WsTransport),
            Arc::new(gateway),
            FocusState::default(),
        ))
    }

    pub fn focus(&self) -> &FocusState {
        &self.focus
    }

    /// The shared socket multiplexer for a network, created on first use.
    pub fn multiplexer(&self, network: Network) -> SubscriptionMultiplexer {
        let Ok(mut multiplexers) = self.multiplexers.lock() else {
            // Poisoned registry: fall back to a fresh, unshared multiplexer.
            return self.build_multiplexer(network);
        };
        multiplexers
            .entry(network)
            .or_insert_with(|| self.build_multiplexer(network))
            .clone()
    }

    fn build_multiplexer(&self, network: Network) -> SubscriptionMultiplexer {
        let url = match network {
            Network::Mainnet => self.config.socket.mainnet_url.clone(),
            Network::Testnet => self.config.socket.testnet_url.clone(),
        };
        SubscriptionMultiplexer::new(url, self.config.socket.clone(), Arc::clone(&self.transport))
    }

    /// Starts a full feed for one wallet. `newest_confirmed_timestamp` seeds
    /// the fetch frontier when the caller already holds history for the
    /// wallet; `None` starts from the newest page.
    pub fn watch_wallet(
        &self,
        network: Network,
        address: impl Into<String>,
        newest_confirmed_timestamp: Option<i64>,
    ) -> WalletFeed {
        let multiplexer = self.multiplexer(network);
        let reconciler = ActivityReconciler::new(
            &multiplexer,
            Arc::clone(&self.gateway),
            self.config.polling.clone(),
            &self.config.reconciler,
            self.focus.clone(),
            network,
            address.into(),
            newest_confirmed_timestamp,
        );
        let pipeline = EnrichmentPipeline::new(&reconciler, network, Arc::clone(&self.gateway));
        WalletFeed {
            reconciler,
            pipeline,
        }
    }

    /// Tears down every shared socket. Feeds created from this registry stop
    /// receiving socket updates and fall back to polling until destroyed.
    pub fn destroy(&self) {
        let Ok(mut multiplexers) = self.multiplexers.lock() else {
            return;
        };
        for (_, multiplexer) in multiplexers.drain() {
            multiplexer.destroy();
        }
    }
}

/// One wallet's reconciled, enriched activity feed.
pub struct WalletFeed {
    reconciler: ActivityReconciler,
    pipeline: EnrichmentPipeline,
}

impl WalletFeed {
    /// `(confirmed, pending)` batches: confirmed activities are new since
    /// the previous report; pending is the full current pending sequence.
    pub fn on_update(&self, listener: UpdateListener) {
        self.pipeline.on_update(listener);
    }

    pub fn on_loading_change(&self, listener: LoadingListener) {
        self.pipeline.on_loading_change(listener);
    }

    pub fn request_poll(&self) {
        self.reconciler.request_poll();
    }

    pub fn destroy(&self) {
        self.pipeline.destroy();
        self.reconciler.destroy();
    }
}

impl Drop for WalletFeed {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pending_activity, ChannelTransport, FakeGateway, TestConnection};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use walletfeed_core_types::{Activity, ClientSocketMessage, ServerSocketMessage};

    fn registry() -> (FeedRegistry, mpsc::UnboundedReceiver<TestConnection>, Arc<FakeGateway>) {
        let (transport, connections) = ChannelTransport::new();
        let gateway = FakeGateway::new();
        let mut config = FeedConfig::default();
        config.polling.poll_on_start = false;
        let registry = FeedRegistry::new(
            config,
            transport,
            Arc::clone(&gateway) as Arc<dyn ActivityGateway>,
            FocusState::default(),
        );
        (registry, connections, gateway)
    }

    #[tokio::test(start_paused = true)]
    async fn one_multiplexer_per_network_is_shared() {
        let (registry, _connections, _gateway) = registry();
        let _feed_a = registry.watch_wallet(Network::Mainnet, "wallet-a", None);
        let _feed_b = registry.watch_wallet(Network::Mainnet, "wallet-b", None);
        let _feed_c = registry.watch_wallet(Network::Testnet, "wallet-c", None);

        let multiplexers = registry.multiplexers.lock().unwrap();
        assert_eq!(multiplexers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn two_feeds_share_one_socket_and_split_traffic() {
        let (registry, mut connections, _gateway) = registry();
        let feed_a = registry.watch_wallet(Network::Mainnet, "wallet-a", None);
        let feed_b = registry.watch_wallet(Network::Mainnet, "wallet-b", None);

        type Reports = Arc<StdMutex<Vec<Vec<Activity>>>>;
        let seen_a: Reports = Arc::new(StdMutex::new(Vec::new()));
        let seen_b: Reports = Arc::new(StdMutex::new(Vec::new()));
        {
            let sink = Arc::clone(&seen_a);
            feed_a.on_update(Arc::new(move |_confirmed, pending| {
                sink.lock().unwrap().push(pending);
            }));
            let sink = Arc::clone(&seen_b);
            feed_b.on_update(Arc::new(move |_confirmed, pending| {
                sink.lock().unwrap().push(pending);
            }));
        }

        let mut connection = connections.recv().await.expect("single connection");
        let _configure = connection.sent.recv().await.expect("configure");
        let subscribe = connection.sent.recv().await.expect("subscribe");
        let ClientSocketMessage::Subscribe { id, addresses, .. } = subscribe else {
            panic!("expected subscribe, got {subscribe:?}");
        };
        assert_eq!(addresses.len(), 2);
        connection
            .server_tx
            .send(ServerSocketMessage::Subscribed { id })
            .expect("ack");
        tokio::time::sleep(Duration::from_millis(200)).await;

        connection
            .server_tx
            .send(ServerSocketMessage::Actions {
                message_hash: "h1".to_string(),
                are_pending: true,
                activities: vec![pending_activity("p1", "wallet-b", "h1", 10)],
            })
            .expect("actions sent");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(seen_a.lock().unwrap().is_empty());
        let seen_b = seen_b.lock().unwrap();
        assert_eq!(seen_b.len(), 1);
        assert_eq!(seen_b[0][0].id, "p1");

        // No second connection was ever opened.
        assert!(connections.try_recv().is_err());
    }
}
