//! Transport seam between relay actors and the network.
//!
//! A [`Connector`] opens a [`Connection`] to one relay URL. The production
//! implementation is [`WebSocketConnector`]; tests swap in an in-memory connector.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

/// One open connection to one relay, carrying text frames.
#[async_trait]
pub trait Connection: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receive the next text frame. `None` once the connection is closed.
    ///
    /// Must be cancel-safe: relay actors call it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Opens connections to relays.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// Connects to relays over WebSocket.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Connection>> {
        info!("Connecting to relay: {}", url);
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        info!("Connected to relay: {}", url);
        Ok(Box::new(WebSocketConnection {
            url: url.to_string(),
            stream,
        }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WebSocketConnection {
    url: String,
    stream: WsStream,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        debug!("Sending to {}: {}", self.url, text);
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    debug!("Received from {}: {}", self.url, text);
                    return Some(Ok(text.as_str().to_string()));
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(ClientError::WebSocket(e.to_string())));
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Relay {} closed connection", self.url);
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error from {}: {}", self.url, e);
                    return Some(Err(ClientError::WebSocket(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }
}
