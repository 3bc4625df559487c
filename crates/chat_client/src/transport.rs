//! Physical streaming connection to the chat server.
//!
//! A [`Transport`] opens one [`TransportLink`]: a pair of channels plus an
//! abort handle for the task doing the socket I/O. The connection manager
//! only ever talks to the channels, so tests can hand it an in-memory link.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use thiserror::Error;
use tokio::{sync::mpsc, task::AbortHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server rejected the connection: {0}")]
    Rejected(String),
    #[error("no handshake from server within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
    #[error("websocket error during handshake: {0}")]
    Socket(String),
}

/// Channels of one open connection. Dropping the inbound sender on the I/O
/// side signals that the transport dropped.
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<ClientRequest>,
    inbound: mpsc::UnboundedReceiver<ServerEvent>,
    io_task: Option<AbortHandle>,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientRequest>,
        inbound: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            io_task: None,
        }
    }

    pub fn with_io_task(mut self, io_task: AbortHandle) -> Self {
        self.io_task = Some(io_task);
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientRequest>,
        mpsc::UnboundedReceiver<ServerEvent>,
        Option<AbortHandle>,
    ) {
        (self.outbound, self.inbound, self.io_task)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and wait for the server's acknowledgement.
    async fn open(&self, auth_token: &str) -> Result<TransportLink>;
}

pub struct WebSocketTransport {
    url: String,
    handshake_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            handshake_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, auth_token: &str) -> Result<TransportLink> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid websocket url: {}", self.url))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {auth_token}"))
                .context("auth token is not a valid header value")?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        let (mut writer, mut reader) = ws_stream.split();

        tokio::time::timeout(self.handshake_timeout, await_handshake(&mut reader))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(self.handshake_timeout))??;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

        let io_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        let Some(request) = outbound else {
                            let _ = writer.close().await;
                            break;
                        };
                        let text = match serde_json::to_string(&request) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "failed to encode client request");
                                continue;
                            }
                        };
                        if let Err(err) = writer.send(Message::Text(text)).await {
                            warn!(error = %err, "websocket send failed");
                            break;
                        }
                    }
                    incoming = reader.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    if inbound_tx.send(event).is_err() {
                                        break;
                                    }
                                }
                                Err(err) => warn!(error = %err, "invalid server event"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "websocket receive failed");
                            break;
                        }
                    }
                }
            }
            debug!("websocket io task finished");
        });

        Ok(TransportLink::new(outbound_tx, inbound_rx).with_io_task(io_task.abort_handle()))
    }
}

async fn await_handshake<S>(reader: &mut S) -> Result<(), TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(ServerEvent::Connect) => return Ok(()),
                Ok(ServerEvent::ConnectError { reason }) => {
                    return Err(TransportError::Rejected(reason))
                }
                Ok(other) => debug!(?other, "ignoring frame received before handshake"),
                Err(err) => warn!(error = %err, "invalid handshake frame"),
            },
            Ok(Message::Close(_)) => return Err(TransportError::ClosedDuringHandshake),
            Ok(_) => {}
            Err(err) => return Err(TransportError::Socket(err.to_string())),
        }
    }
    Err(TransportError::ClosedDuringHandshake)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
