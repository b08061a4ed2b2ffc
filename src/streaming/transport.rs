//! Duplex transport to the realtime service
//!
//! A [`Connector`] opens one connection and hands back a pair of channels.
//! The WebSocket itself lives in a pump task owned by the connector; the
//! session never touches the socket directly.
//!
//! ```text
//!  VoiceSession                  pump task                  service
//!  outgoing.try_send ──▶ mpsc ──▶ ws.send(Text) ──────────▶
//!  incoming.recv     ◀── mpsc ◀── ws.next()     ◀──────────
//!  shutdown.cancel   ──────────▶ Close frame, task exits
//! ```

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tokio_util::sync::CancellationToken;

use crate::error::VoiceError;

/// Bound on buffered inbound events before the pump applies backpressure
const INCOMING_QUEUE_DEPTH: usize = 256;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// What the session needs to open a connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    /// Extra HTTP headers for the upgrade request
    pub headers: HashMap<String, String>,
    /// Bound of the outbound message queue
    pub outbound_queue_depth: usize,
}

impl ConnectRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            outbound_queue_depth: 64,
        }
    }

    /// Attach bearer auth as the realtime API expects
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.headers
            .insert("Authorization".to_string(), format!("Bearer {}", api_key));
        self.headers
            .insert("OpenAI-Beta".to_string(), "realtime=v1".to_string());
        self
    }
}

/// Something that happened on the connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A JSON text frame
    Message(String),
    /// The connection closed; `code` is absent if no close frame was received
    Closed { code: Option<u16>, reason: String },
    /// Read or write failure; the connection is gone
    Error(String),
}

/// Session-side ends of an open connection
pub struct TransportChannels {
    /// Outbound JSON text frames
    pub outgoing: mpsc::Sender<String>,
    /// Inbound events, strictly in arrival order
    pub incoming: mpsc::Receiver<TransportEvent>,
    /// Cancel to close the connection
    pub shutdown: CancellationToken,
}

/// Opens duplex connections
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        request: &'a ConnectRequest,
    ) -> BoxFuture<'a, Result<TransportChannels, VoiceError>>;
}

/// WebSocket connector over tokio-tungstenite with rustls
pub struct WebSocketConnector {
    /// HTTP status the service answers with when it rejects a duplicate
    duplicate_status: u16,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            duplicate_status: StatusCode::CONFLICT.as_u16(),
        }
    }

    async fn open(&self, request: &ConnectRequest) -> Result<TransportChannels, VoiceError> {
        // Only one provider is compiled in; a second install is a harmless Err
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::TransportLost(e.to_string()))?;

        for (name, value) in &request.headers {
            let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| VoiceError::Config(format!("invalid header {}: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| VoiceError::Config(format!("invalid header {}: {}", name, e)))?;
            ws_request.headers_mut().insert(header_name, header_value);
        }

        log::info!("Transport: connecting to {}", request.url);

        let (ws_stream, _response) = connect_async_with_config(
            ws_request, None, true, // disable_nagle (we want low latency)
        )
        .await
        .map_err(|e| self.map_connect_error(e))?;

        log::info!("Transport: WebSocket connected");

        let (outgoing_tx, mut outgoing_rx) =
            mpsc::channel::<String>(request.outbound_queue_depth.max(1));
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();

        tokio::spawn(async move {
            let (mut write, mut read) = ws_stream.split();

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            log::debug!("Transport: close frame not sent: {}", e);
                        }
                        break;
                    }

                    outbound = outgoing_rx.recv() => {
                        let Some(text) = outbound else {
                            // Session dropped its sender
                            let _ = write.close().await;
                            break;
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            log::warn!("Transport: send failed: {}", e);
                            let _ = incoming_tx.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }

                    inbound = read.next() => {
                        let event = match inbound {
                            Some(Ok(Message::Text(text))) => TransportEvent::Message(text),
                            Some(Ok(Message::Close(frame))) => {
                                let (code, reason) = match frame {
                                    Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                                    None => (None, String::new()),
                                };
                                log::info!("Transport: closed by server (code {:?}) {}", code, reason);
                                let _ = incoming_tx.send(TransportEvent::Closed { code, reason }).await;
                                break;
                            }
                            Some(Ok(_)) => continue, // Ignore ping/pong/binary
                            Some(Err(e)) => {
                                log::warn!("Transport: read failed: {}", e);
                                let _ = incoming_tx.send(TransportEvent::Error(e.to_string())).await;
                                break;
                            }
                            None => {
                                let _ = incoming_tx
                                    .send(TransportEvent::Closed { code: None, reason: "stream ended".to_string() })
                                    .await;
                                break;
                            }
                        };
                        if incoming_tx.send(event).await.is_err() {
                            log::debug!("Transport: session receiver closed");
                            break;
                        }
                    }
                }
            }

            log::debug!("Transport: pump task exiting");
        });

        Ok(TransportChannels {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            shutdown,
        })
    }

    fn map_connect_error(&self, error: tungstenite::Error) -> VoiceError {
        match error {
            tungstenite::Error::Http(response) if response.status().as_u16() == self.duplicate_status => {
                VoiceError::DuplicateConnection(format!(
                    "service rejected connection with HTTP {}",
                    response.status()
                ))
            }
            other => VoiceError::TransportLost(other.to_string()),
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        request: &'a ConnectRequest,
    ) -> BoxFuture<'a, Result<TransportChannels, VoiceError>> {
        Box::pin(self.open(request))
    }
}

/// Run `connect` with an upper bound on handshake time
pub(crate) async fn connect_with_timeout(
    connector: &dyn Connector,
    request: &ConnectRequest,
    limit: Duration,
) -> Result<TransportChannels, VoiceError> {
    tokio::time::timeout(limit, connector.connect(request))
        .await
        .map_err(|_| VoiceError::TransportLost("Connection timeout".to_string()))?
}
