/// Tokio-based WebSocket transport implementation for rtcall
///
/// This crate provides the Transport and TransportFactory traits used by the
/// signaling session, plus a concrete implementation over tokio-tungstenite
/// that exchanges UTF-8 text frames.
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the server.
    TextReceived(String),
    /// The connection was lost.
    Disconnected,
}

/// Where to connect and how to authenticate.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub url: String,
    pub credential: Option<String>,
}

impl ConnectTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

impl std::fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("url", &self.url)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame to the server.
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
        target: &ConnectTarget,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Tokio-based WebSocket transport
pub struct TokioWebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        debug!("--> Sending text frame: {} bytes", text.len());
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            if let Err(e) = sink.close().await {
                debug!("WebSocket close error: {e}");
            }
        }
    }
}

/// Factory for creating Tokio WebSocket transports
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioWebSocketTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        target: &ConnectTarget,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("Dialing {}", target.url);
        let mut request = target
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Failed to build request: {}", e))?;

        if let Some(credential) = &target.credential {
            let value = HeaderValue::from_str(&format!("Bearer {credential}"))
                .map_err(|e| anyhow::anyhow!("Invalid credential header: {}", e))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (client, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        tokio::task::spawn(read_pump(stream, event_tx.clone()));

        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("<-- Received text frame: {} bytes", text.len());
                if event_tx
                    .send(TransportEvent::TextReceived(text.to_string()))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => {
                trace!("Received close frame");
                break;
            }
            Some(Ok(other)) => {
                trace!("Ignoring non-text websocket message: {other:?}");
            }
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
