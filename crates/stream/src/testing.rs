//! In-memory stand-ins for the transport and gateway seams, used by the
//! tests across this crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use walletfeed_core_types::{Activity, ClientSocketMessage, Network, ServerSocketMessage};

use crate::gateway::{ActivityGateway, ConfirmedActivitiesFilter};
use crate::transport::{SocketSink, SocketSource, SocketTransport};

/// One accepted connection, seen from the test's side: everything the client
/// sends lands in `sent`, and `server_tx` injects server messages. Dropping
/// `server_tx` ends the stream, which the client sees as an unexpected close.
pub struct TestConnection {
    pub sent: mpsc::UnboundedReceiver<ClientSocketMessage>,
    pub server_tx: mpsc::UnboundedSender<ServerSocketMessage>,
}

/// A transport whose connections are in-memory channel pairs. Each accepted
/// connect emits a [`TestConnection`] on the receiver returned by `new`.
pub struct ChannelTransport {
    connections_tx: mpsc::UnboundedSender<TestConnection>,
    failures_left: AtomicUsize,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TestConnection>) {
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connections_tx,
                failures_left: AtomicUsize::new(0),
            }),
            connections_rx,
        )
    }

    /// The next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketTransport for ChannelTransport {
    async fn connect(&self, _url: &str) -> Result<(Box<dyn SocketSink>, Box<dyn SocketSource>)> {
        let failures = self.failures_left.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures_left.store(failures - 1, Ordering::SeqCst);
            return Err(anyhow!("scripted connect failure"));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let _ = self.connections_tx.send(TestConnection {
            sent: sent_rx,
            server_tx,
        });
        Ok((
            Box::new(ChannelSink { sent_tx }),
            Box::new(ChannelSource { server_rx }),
        ))
    }
}

struct ChannelSink {
    sent_tx: mpsc::UnboundedSender<ClientSocketMessage>,
}

#[async_trait]
impl SocketSink for ChannelSink {
    async fn send(&mut self, message: ClientSocketMessage) -> Result<()> {
        self.sent_tx
            .send(message)
            .map_err(|_| anyhow!("test connection dropped"))
    }
}

struct ChannelSource {
    server_rx: mpsc::UnboundedReceiver<ServerSocketMessage>,
}

#[async_trait]
impl SocketSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<ServerSocketMessage>> {
        Ok(self.server_rx.recv().await)
    }
}

/// A gateway with scripted responses and call counters. Responses for the
/// confirmed fetch are consumed front-to-back; the last one repeats.
pub struct FakeGateway {
    confirmed_responses: Mutex<VecDeque<Result<Vec<Activity>>>>,
    pending_response: Mutex<Result<Vec<Activity>>>,
    enrich_fails: AtomicUsize,
    enrich_gate: Notify,
    enrich_gated: AtomicUsize,
    pub confirmed_calls: AtomicUsize,
    pub pending_calls: AtomicUsize,
    pub enrich_calls: AtomicUsize,
    pub enrich_batches: Mutex<Vec<Vec<Activity>>>,
    pub confirmed_filters: Mutex<Vec<ConfirmedActivitiesFilter>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            confirmed_responses: Mutex::new(VecDeque::new()),
            pending_response: Mutex::new(Ok(Vec::new())),
            enrich_fails: AtomicUsize::new(0),
            enrich_gate: Notify::new(),
            enrich_gated: AtomicUsize::new(0),
            confirmed_calls: AtomicUsize::new(0),
            pending_calls: AtomicUsize::new(0),
            enrich_calls: AtomicUsize::new(0),
            enrich_batches: Mutex::new(Vec::new()),
            confirmed_filters: Mutex::new(Vec::new()),
        })
    }

    pub fn push_confirmed(&self, response: Result<Vec<Activity>>) {
        self.confirmed_responses.lock().unwrap().push_back(response);
    }

    pub fn set_pending(&self, response: Result<Vec<Activity>>) {
        *self.pending_response.lock().unwrap() = response;
    }

    pub fn fail_next_enriches(&self, count: usize) {
        self.enrich_fails.store(count, Ordering::SeqCst);
    }

    /// The next `count` enrich calls block until [`FakeGateway::release_enrich`].
    pub fn gate_next_enriches(&self, count: usize) {
        self.enrich_gated.store(count, Ordering::SeqCst);
    }

    pub fn release_enrich(&self) {
        self.enrich_gate.notify_one();
    }
}

fn clone_response(response: &Result<Vec<Activity>>) -> Result<Vec<Activity>> {
    match response {
        Ok(activities) => Ok(activities.clone()),
        Err(error) => Err(anyhow!("{error}")),
    }
}

#[async_trait]
impl ActivityGateway for FakeGateway {
    async fn fetch_confirmed_activities(
        &self,
        _network: Network,
        filter: &ConfirmedActivitiesFilter,
        _limit: usize,
    ) -> Result<Vec<Activity>> {
        self.confirmed_calls.fetch_add(1, Ordering::SeqCst);
        self.confirmed_filters.lock().unwrap().push(filter.clone());
        let mut responses = self.confirmed_responses.lock().unwrap();
        if responses.len() > 1 {
            responses.pop_front().unwrap_or(Ok(Vec::new()))
        } else {
            responses.front().map(clone_response).unwrap_or(Ok(Vec::new()))
        }
    }

    async fn fetch_pending_activities(
        &self,
        _network: Network,
        _address: &str,
    ) -> Result<Vec<Activity>> {
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
        clone_response(&self.pending_response.lock().unwrap())
    }

    async fn enrich(&self, _network: Network, activities: Vec<Activity>) -> Result<Vec<Activity>> {
        self.enrich_calls.fetch_add(1, Ordering::SeqCst);
        self.enrich_batches.lock().unwrap().push(activities.clone());

        let gated = self.enrich_gated.load(Ordering::SeqCst);
        if gated > 0 {
            self.enrich_gated.store(gated - 1, Ordering::SeqCst);
            self.enrich_gate.notified().await;
        }

        let fails = self.enrich_fails.load(Ordering::SeqCst);
        if fails > 0 {
            self.enrich_fails.store(fails - 1, Ordering::SeqCst);
            return Err(anyhow!("scripted enrich failure"));
        }

        Ok(activities
            .into_iter()
            .map(|mut activity| {
                activity.payload = serde_json::json!({ "enriched": true });
                activity
            })
            .collect())
    }
}

/// Builders shared by tests in several modules.
pub fn pending_activity(id: &str, address: &str, hash: &str, timestamp: i64) -> Activity {
    Activity {
        id: id.to_string(),
        address: address.to_string(),
        timestamp,
        message_hash: Some(hash.to_string()),
        is_pending: true,
        payload: serde_json::Value::Null,
    }
}

pub fn confirmed_activity(id: &str, address: &str, hash: &str, timestamp: i64) -> Activity {
    Activity {
        is_pending: false,
        ..pending_activity(id, address, hash, timestamp)
    }
}
