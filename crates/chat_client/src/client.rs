//! Entry point for UIs: one connection, one open chat at a time.
//!
//! All log mutations happen under `inner`, which is never held across
//! network I/O. Live events, send completions and history completions are
//! therefore applied one at a time in the order they take the lock.

use std::sync::{Arc, Weak};

use chrono::Utc;
use shared::{
    domain::{ChatId, MessageId, UserId},
    error::{ApiError, ApiException},
    protocol::{SendMessageRequest, WireMessage},
};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    Mutex,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    api::{ChatApi, HttpChatApi},
    auth::{AuthProvider, AuthSession},
    config::ClientSettings,
    connection::{ConnectionEvent, ConnectionManager, ConnectionState},
    error::ChatError,
    history::{HistoryOutcome, HistorySync, HistoryTask, HistoryTicket},
    message::{LocalId, Message},
    reconciliation::{PendingSend, Reconciled, ReconciliationEngine},
    rooms::RoomMultiplexer,
    session::{ChatSession, ChatSessionSnapshot},
    transport::{Transport, WebSocketTransport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    MessagesUpdated {
        chat_id: ChatId,
    },
    HistoryLoaded {
        chat_id: ChatId,
        inserted: usize,
    },
    HistoryFailed {
        chat_id: ChatId,
        reason: String,
    },
    SendConfirmed {
        local_id: LocalId,
        message_id: MessageId,
    },
    SendFailed {
        local_id: LocalId,
        reason: String,
    },
    /// The connection gave up; only an explicit `connect()` retries.
    ConnectionFailed(String),
    ServerError(ApiError),
}

#[derive(Default)]
struct ClientState {
    session: Option<ChatSession>,
    next_session_id: u64,
}

pub struct ChatClient {
    auth: Arc<dyn AuthProvider>,
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    rooms: RoomMultiplexer,
    history: HistorySync,
    settings: ClientSettings,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    /// Must be called inside a Tokio runtime: it spawns the task that reacts
    /// to connection events.
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let connection = ConnectionManager::new(
            transport,
            settings.reconnect_policy(),
            settings.event_buffer,
        );
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let client = Arc::new(Self {
            auth,
            history: HistorySync::new(Arc::clone(&api)),
            api,
            rooms: RoomMultiplexer::new(Arc::clone(&connection)),
            connection,
            settings,
            inner: Mutex::new(ClientState::default()),
            events,
        });
        client.spawn_connection_pump();
        client
    }

    /// Wire the WebSocket transport and HTTP API from settings.
    pub fn from_settings(
        settings: ClientSettings,
        auth: Arc<dyn AuthProvider>,
    ) -> anyhow::Result<Arc<Self>> {
        let transport =
            WebSocketTransport::new(settings.websocket_url()?, settings.handshake_timeout());
        let api = HttpChatApi::new(&settings.api_base_url())?;
        info!(
            server_url = %settings.server_url,
            socket_url = %transport.url(),
            "chat client configured"
        );
        Ok(Self::new(auth, Arc::new(transport), Arc::new(api), settings))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn rooms(&self) -> &RoomMultiplexer {
        &self.rooms
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> Result<(), ChatError> {
        let auth = self.require_auth()?;
        self.connection.connect(&auth.token).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Make `chat_id` the active chat: leave the previous room, start a fresh
    /// log, join the room (now or on the next connect) and fetch history.
    pub async fn open_chat(self: &Arc<Self>, chat_id: ChatId) -> Result<HistoryTask, ChatError> {
        let auth = self.require_auth()?;

        let (previous, ticket) = {
            let mut inner = self.inner.lock().await;
            self.history.cancel();
            let previous = inner.session.take().map(|session| session.chat_id);
            inner.next_session_id += 1;
            let session_id = inner.next_session_id;
            inner.session = Some(ChatSession::new(
                session_id,
                chat_id.clone(),
                ReconciliationEngine::new(auth.user_id.clone(), auth.username.clone()),
            ));
            (previous, self.history.begin(chat_id.clone()))
        };
        info!(chat_id = %chat_id, "opening chat");

        if let Some(previous) = previous.filter(|previous| *previous != chat_id) {
            self.rooms.leave(&previous).await;
        }
        self.rooms.join(chat_id.clone()).await;
        self.emit(ClientEvent::MessagesUpdated {
            chat_id: chat_id.clone(),
        });

        if self.settings.auto_connect
            && matches!(
                self.connection.state(),
                ConnectionState::Disconnected | ConnectionState::Failed
            )
        {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = client.connect().await {
                    debug!(error = %err, "background connect failed");
                }
            });
        }

        let client = Arc::clone(self);
        let handle = tokio::spawn(async move { client.run_history(ticket, auth.token).await });
        Ok(HistoryTask::new(chat_id, handle))
    }

    /// Resolve the direct chat with `user_id` and open it.
    pub async fn open_chat_with_user(
        self: &Arc<Self>,
        user_id: &UserId,
    ) -> Result<HistoryTask, ChatError> {
        let auth = self.require_auth()?;
        let chat_id = self
            .api
            .get_or_create_chat(&auth.token, user_id)
            .await
            .map_err(|err| ChatError::ChatLookup {
                reason: format!("{err:#}"),
            })?;
        self.open_chat(chat_id).await
    }

    /// Leave the active chat. Queued sends are dropped with the session.
    pub async fn close_chat(&self) {
        let closed = {
            let mut inner = self.inner.lock().await;
            self.history.cancel();
            inner.session.take()
        };
        if let Some(session) = closed {
            if !session.outbox.is_empty() {
                debug!(
                    chat_id = %session.chat_id,
                    dropped = session.outbox.len(),
                    "dropping queued sends of closed chat"
                );
            }
            info!(chat_id = %session.chat_id, "closing chat");
            self.rooms.leave(&session.chat_id).await;
        }
    }

    /// Send to the active chat. The optimistic entry appears immediately.
    /// When connected this waits for the server's answer; otherwise the send
    /// is queued and goes out after the next connect.
    pub async fn send_message(&self, content: &str) -> Result<LocalId, ChatError> {
        let auth = self.require_auth()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (session_id, chat_id, pending, connected) = {
            let mut inner = self.inner.lock().await;
            let session = inner.session.as_mut().ok_or(ChatError::NoActiveChat)?;
            let pending = session.engine.begin_send(
                &mut session.log,
                content,
                Uuid::new_v4().to_string(),
                Utc::now(),
            );
            let connected = self.connection.state() == ConnectionState::Connected;
            if !connected {
                session.outbox.push_back(pending.clone());
            }
            self.emit(ClientEvent::MessagesUpdated {
                chat_id: session.chat_id.clone(),
            });
            (session.id, session.chat_id.clone(), pending, connected)
        };

        if !connected {
            info!(chat_id = %chat_id, local_id = %pending.local_id, "queued send until connected");
            return Ok(pending.local_id);
        }
        self.deliver(&auth.token, session_id, chat_id, pending).await
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.log.messages())
            .unwrap_or_default()
    }

    pub async fn session(&self) -> Option<ChatSessionSnapshot> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(ChatSession::snapshot)
    }

    fn require_auth(&self) -> Result<AuthSession, ChatError> {
        self.auth
            .session()
            .filter(|session| !session.token.trim().is_empty())
            .ok_or(ChatError::AuthMissing)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run_history(
        &self,
        ticket: HistoryTicket,
        auth_token: String,
    ) -> Result<HistoryOutcome, ChatError> {
        let chat_id = ticket.chat_id().clone();
        let loaded = self.history.load(&auth_token, &chat_id).await;

        let mut inner = self.inner.lock().await;
        let session = match inner.session.as_mut() {
            Some(session) if self.history.is_current(&ticket) && session.chat_id == chat_id => {
                session
            }
            _ => {
                debug!(chat_id = %chat_id, "discarding history for inactive chat");
                return Ok(HistoryOutcome::Discarded);
            }
        };

        match loaded {
            Ok(batch) => {
                let merged = session.engine.merge_history(&mut session.log, &batch);
                for (local_id, message_id) in merged.promoted {
                    self.emit(ClientEvent::SendConfirmed {
                        local_id,
                        message_id,
                    });
                }
                info!(chat_id = %chat_id, fetched = batch.len(), inserted = merged.inserted, "history merged");
                self.emit(ClientEvent::HistoryLoaded {
                    chat_id: chat_id.clone(),
                    inserted: merged.inserted,
                });
                self.emit(ClientEvent::MessagesUpdated { chat_id });
                Ok(HistoryOutcome::Merged {
                    inserted: merged.inserted,
                })
            }
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "history fetch failed");
                self.emit(ClientEvent::HistoryFailed {
                    chat_id,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn deliver(
        &self,
        auth_token: &str,
        session_id: u64,
        chat_id: ChatId,
        pending: PendingSend,
    ) -> Result<LocalId, ChatError> {
        let local_id = pending.local_id;
        let request = SendMessageRequest {
            content: pending.content,
            client_ref: Some(pending.client_ref),
        };
        let result = self.api.send_message(auth_token, &chat_id, &request).await;

        let mut inner = self.inner.lock().await;
        let session = inner
            .session
            .as_mut()
            .filter(|session| session.id == session_id);

        match (result, session) {
            (Ok(stored), Some(session)) => {
                let outcome =
                    session
                        .engine
                        .confirm_send(&mut session.log, local_id, stored.as_ref());
                if let Reconciled::Promoted { message_id, .. } = outcome {
                    self.emit(ClientEvent::SendConfirmed {
                        local_id,
                        message_id,
                    });
                    self.emit(ClientEvent::MessagesUpdated { chat_id });
                }
                Ok(local_id)
            }
            (Ok(_), None) => {
                debug!(local_id = %local_id, "send completed after its chat was closed");
                Ok(local_id)
            }
            (Err(err), session) => {
                let reason = format!("{err:#}");
                let retryable = err
                    .downcast_ref::<ApiException>()
                    .map(|api| api.code.is_retryable())
                    .unwrap_or(true);
                warn!(chat_id = %chat_id, local_id = %local_id, retryable, error = %reason, "send failed");
                if let Some(session) = session {
                    if session.engine.fail_send(&mut session.log, local_id) {
                        self.emit(ClientEvent::SendFailed {
                            local_id,
                            reason: reason.clone(),
                        });
                        self.emit(ClientEvent::MessagesUpdated { chat_id });
                    }
                }
                Err(ChatError::SendFailure { local_id, reason })
            }
        }
    }

    async fn flush_outbox(&self) {
        let Ok(auth) = self.require_auth() else {
            warn!("signed out; queued sends stay queued");
            return;
        };
        let (session_id, chat_id, queued) = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            if session.outbox.is_empty() {
                return;
            }
            let queued: Vec<PendingSend> = session.outbox.drain(..).collect();
            (session.id, session.chat_id.clone(), queued)
        };
        info!(chat_id = %chat_id, count = queued.len(), "flushing queued sends");
        for pending in queued {
            // Failures are reported through events and the entry's state.
            let _ = self
                .deliver(&auth.token, session_id, chat_id.clone(), pending)
                .await;
        }
    }

    async fn apply_live_message(&self, chat_id: ChatId, message: WireMessage) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner
            .session
            .as_mut()
            .filter(|session| session.chat_id == chat_id)
        else {
            debug!(chat_id = %chat_id, "ignoring message for inactive chat");
            return;
        };
        match session.engine.apply_remote(&mut session.log, &message) {
            Reconciled::Promoted {
                local_id,
                message_id,
            } => {
                self.emit(ClientEvent::SendConfirmed {
                    local_id,
                    message_id,
                });
                self.emit(ClientEvent::MessagesUpdated { chat_id });
            }
            Reconciled::Appended(_) => self.emit(ClientEvent::MessagesUpdated { chat_id }),
            Reconciled::Duplicate(_) | Reconciled::Unchanged => {}
        }
    }

    async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.rooms.on_connected().await;
                let client = Arc::clone(self);
                tokio::spawn(async move { client.flush_outbox().await });
            }
            ConnectionEvent::Disconnected => self.rooms.on_disconnected().await,
            ConnectionEvent::ConnectionError(reason) => {
                self.emit(ClientEvent::ConnectionFailed(reason));
            }
            ConnectionEvent::MessageReceived { chat_id, message } => {
                self.apply_live_message(chat_id, message).await;
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting to reconnect");
            }
            ConnectionEvent::ServerError(error) => self.emit(ClientEvent::ServerError(error)),
        }
    }

    fn spawn_connection_pump(self: &Arc<Self>) {
        let mut events = self.connection.subscribe();
        let mut state = self.connection.watch_state();
        let client: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *state.borrow_and_update();
                        let Some(client) = client.upgrade() else {
                            break;
                        };
                        client.emit(ClientEvent::ConnectionChanged(current));
                    }
                    event = events.recv() => {
                        let event = match event {
                            Ok(event) => event,
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "connection events lagged");
                                continue;
                            }
                            Err(RecvError::Closed) => break,
                        };
                        let Some(client) = client.upgrade() else {
                            break;
                        };
                        client.handle_connection_event(event).await;
                    }
                }
            }
            debug!("connection pump stopped");
        });
    }
}
