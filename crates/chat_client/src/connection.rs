//! The single streaming connection shared by every chat session.
//!
//! ```text
//! Disconnected --connect--> Connecting --ack--> Connected
//! Connected --drop--> Reconnecting --retry ok--> Connected
//! Reconnecting --retries exhausted--> Failed
//! any --disconnect--> Disconnected
//! ```
//!
//! Every connect, drop and disconnect bumps an epoch. Reader and reconnect
//! tasks carry the epoch they were started under and re-check it before
//! touching state, so work started before a `disconnect()` can never revive
//! the connection.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use futures::future::BoxFuture;
use shared::{
    domain::ChatId,
    error::ApiError,
    protocol::{ClientRequest, ServerEvent, WireMessage},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::{AbortHandle, JoinHandle},
};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    backoff::ReconnectPolicy,
    error::ChatError,
    transport::{Transport, TransportLink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether a connect or reconnect is in flight.
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    ConnectionError(String),
    MessageReceived {
        chat_id: ChatId,
        message: WireMessage,
    },
    /// A reconnect attempt (1-based) will start after `delay`.
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    ServerError(ApiError),
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<ClientRequest>,
    reader: JoinHandle<()>,
    io_task: Option<AbortHandle>,
}

impl ActiveLink {
    fn shutdown(self) {
        self.reader.abort();
        if let Some(io_task) = self.io_task {
            io_task.abort();
        }
    }
}

#[derive(Default)]
struct ConnectionInner {
    epoch: u64,
    token: Option<String>,
    link: Option<ActiveLink>,
    reconnect_task: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    inner: Mutex<ConnectionInner>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        event_buffer: usize,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Arc::new(Self {
            transport,
            policy,
            inner: Mutex::new(ConnectionInner::default()),
            state,
            events,
        })
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. Events missed by a lagging consumer are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = ConnectionEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(Result::ok)
    }

    /// Open the connection. A no-op when already connected; when a connect or
    /// reconnect is in flight this waits for its outcome instead of opening a
    /// second transport.
    pub async fn connect(self: &Arc<Self>, auth_token: &str) -> Result<(), ChatError> {
        if auth_token.trim().is_empty() {
            return Err(ChatError::AuthMissing);
        }

        let epoch = {
            let mut inner = self.inner.lock().await;
            let current = self.state();
            if current == ConnectionState::Connected {
                return Ok(());
            }
            if current.is_transitioning() {
                drop(inner);
                debug!(state = %current, "connect already in flight; waiting");
                return self.wait_until_settled().await;
            }
            inner.epoch += 1;
            inner.token = Some(auth_token.to_string());
            self.set_state(ConnectionState::Connecting);
            inner.epoch
        };

        let opened = self.transport.open(auth_token).await;

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            if let Ok(link) = opened {
                discard_link(link);
            }
            debug!(epoch, "connect superseded before it completed");
            return Err(ChatError::connection("connect cancelled"));
        }

        match opened {
            Ok(link) => {
                self.install_link(&mut inner, link, epoch);
                self.set_state(ConnectionState::Connected);
                self.emit(ConnectionEvent::Connected);
                info!("chat connection established");
                Ok(())
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(error = %reason, "chat connection failed");
                self.set_state(ConnectionState::Failed);
                self.emit(ConnectionEvent::ConnectionError(reason.clone()));
                Err(ChatError::connection(reason))
            }
        }
    }

    /// Tear the connection down unconditionally, cancelling any reconnect.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.epoch += 1;
        inner.token = None;
        if let Some(task) = inner.reconnect_task.take() {
            task.abort();
        }
        if let Some(link) = inner.link.take() {
            link.shutdown();
        }
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(from = %previous, "chat connection closed");
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Push a frame over the open connection.
    pub async fn send(&self, request: ClientRequest) -> Result<(), ChatError> {
        let inner = self.inner.lock().await;
        if self.state() != ConnectionState::Connected {
            return Err(ChatError::NotConnected);
        }
        let link = inner.link.as_ref().ok_or(ChatError::NotConnected)?;
        link.outbound
            .send(request)
            .map_err(|_| ChatError::NotConnected)
    }

    async fn wait_until_settled(&self) -> Result<(), ChatError> {
        let mut state_rx = self.state.subscribe();
        loop {
            let current = *state_rx.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(ChatError::connection("connection attempt failed"))
                }
                ConnectionState::Disconnected => {
                    return Err(ChatError::connection("connect cancelled"))
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(ChatError::connection("connection manager shut down"));
            }
        }
    }

    fn install_link(self: &Arc<Self>, inner: &mut ConnectionInner, link: TransportLink, epoch: u64) {
        let (outbound, mut inbound, io_task) = link.into_parts();
        let manager = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if let ServerEvent::Disconnect { reason } = event {
                    debug!(?reason, "server closed the chat connection");
                    break;
                }
                manager.dispatch(epoch, event).await;
            }
            if let Some(manager) = Weak::upgrade(&manager) {
                manager.handle_drop(epoch).await;
            }
        });
        inner.link = Some(ActiveLink {
            outbound,
            reader,
            io_task,
        });
    }

    async fn dispatch(&self, epoch: u64, event: ServerEvent) {
        if !self.is_current(epoch).await {
            return;
        }
        match event {
            ServerEvent::NewMessage { chat_id, message } => {
                self.emit(ConnectionEvent::MessageReceived { chat_id, message });
            }
            ServerEvent::Error(error) => {
                warn!(code = ?error.code, message = %error.message, "server reported an error");
                self.emit(ConnectionEvent::ServerError(error));
            }
            ServerEvent::Connect | ServerEvent::ConnectError { .. } => {
                debug!(?event, "ignoring handshake frame on an open connection");
            }
            ServerEvent::Disconnect { .. } => {}
        }
    }

    // Boxed so the reader -> reconnect -> reader spawn chain has a nameable,
    // `Send` future type.
    fn handle_drop(self: Arc<Self>, epoch: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || self.state() != ConnectionState::Connected {
                return;
            }
            if let Some(link) = inner.link.take() {
                // The reader is the task running this; only stop the socket side.
                if let Some(io_task) = link.io_task {
                    io_task.abort();
                }
            }
            inner.epoch += 1;
            let epoch = inner.epoch;
            self.set_state(ConnectionState::Reconnecting);
            self.emit(ConnectionEvent::Disconnected);
            warn!("chat connection dropped; reconnecting");

            let Some(token) = inner.token.clone() else {
                self.give_up(&mut inner, "no credentials to reconnect with".to_string());
                return;
            };
            let manager = Arc::clone(&self);
            inner.reconnect_task = Some(tokio::spawn(async move {
                manager.reconnect_loop(epoch, token).await;
            }));
        })
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64, token: String) {
        for attempt in 0..self.policy.max_attempts() {
            if !self.is_current(epoch).await {
                return;
            }
            let delay = self.policy.delay_for_attempt(attempt);
            info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            self.emit(ConnectionEvent::Reconnecting {
                attempt: attempt + 1,
                delay,
            });
            tokio::time::sleep(delay).await;
            if !self.is_current(epoch).await {
                return;
            }

            match self.transport.open(&token).await {
                Ok(link) => {
                    let mut inner = self.inner.lock().await;
                    if inner.epoch != epoch {
                        discard_link(link);
                        return;
                    }
                    inner.reconnect_task = None;
                    self.install_link(&mut inner, link, epoch);
                    self.set_state(ConnectionState::Connected);
                    self.emit(ConnectionEvent::Connected);
                    info!(attempt = attempt + 1, "chat connection restored");
                    return;
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %format!("{err:#}"), "reconnect attempt failed");
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return;
        }
        inner.reconnect_task = None;
        let reason = format!(
            "gave up after {} reconnect attempts",
            self.policy.max_attempts()
        );
        self.give_up(&mut inner, reason);
    }

    fn give_up(&self, inner: &mut ConnectionInner, reason: String) {
        inner.link = None;
        warn!(error = %reason, "chat connection failed");
        self.set_state(ConnectionState::Failed);
        self.emit(ConnectionEvent::ConnectionError(reason));
    }

    async fn is_current(&self, epoch: u64) -> bool {
        self.inner.lock().await.epoch == epoch
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "connection state changed");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

fn discard_link(link: TransportLink) {
    let (_, _, io_task) = link.into_parts();
    if let Some(io_task) = io_task {
        io_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
