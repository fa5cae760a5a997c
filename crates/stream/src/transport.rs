//! Socket transport seam. The connection layer talks to these traits so the
//! whole stack can run against an in-memory transport in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use walletfeed_core_types::{ClientSocketMessage, ServerSocketMessage};

#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(Box<dyn SocketSink>, Box<dyn SocketSource>)>;
}

#[async_trait]
pub trait SocketSink: Send {
    async fn send(&mut self, message: ClientSocketMessage) -> Result<()>;
}

#[async_trait]
pub trait SocketSource: Send {
    /// `Ok(None)` means the peer closed the stream cleanly.
    async fn next_message(&mut self) -> Result<Option<ServerSocketMessage>>;
}

/// JSON text frames over a websocket.
pub struct WsTransport;

#[async_trait]
impl SocketTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<(Box<dyn SocketSink>, Box<dyn SocketSource>)> {
        let (stream, _response) = connect_async(url)
            .await
            .with_context(|| format!("websocket connect failed: {url}"))?;
        let (sink, source) = stream.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsSource { source })))
    }
}

struct WsSink {
    sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&mut self, message: ClientSocketMessage) -> Result<()> {
        let text = serde_json::to_string(&message).context("serialize socket message")?;
        self.sink
            .send(Message::Text(text))
            .await
            .context("websocket send failed")
    }
}

struct WsSource {
    source: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl SocketSource for WsSource {
    async fn next_message(&mut self) -> Result<Option<ServerSocketMessage>> {
        loop {
            match self.source.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(message) => return Ok(Some(message)),
                    // Unknown or malformed frames are dropped, not fatal.
                    Err(error) => {
                        debug!(error = %error, "ignoring unparseable socket frame");
                    }
                },
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(error).context("websocket read failed"),
            }
        }
    }
}
