#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chat_client::{
    AuthSession, ChatApi, ChatClient, ClientEvent, ClientSettings, SessionStore, Transport,
    TransportLink,
};
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ChatId, MessageId, UserId},
    error::{ApiException, ErrorCode},
    protocol::{ClientRequest, SendMessageRequest, ServerEvent, WireMessage, WireSender},
};
use tokio::sync::{broadcast, mpsc, oneshot};

pub const ME: &str = "u-me";

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + offset_secs, 0)
        .single()
        .expect("timestamp")
}

pub fn wire(id: &str, sender: &str, content: &str, offset_secs: i64) -> WireMessage {
    WireMessage {
        id: MessageId::new(id),
        content: content.to_string(),
        sender: WireSender {
            id: UserId::new(sender),
            name: Some(sender.trim_start_matches("u-").to_string()),
        },
        created_at: at(offset_secs),
        client_ref: None,
    }
}

pub enum OpenStep {
    Accept,
    Reject(&'static str),
}

pub struct ServerSide {
    pub to_client: mpsc::UnboundedSender<ServerEvent>,
    pub from_client: mpsc::UnboundedReceiver<ClientRequest>,
}

impl ServerSide {
    pub async fn next_request(&mut self) -> ClientRequest {
        tokio::time::timeout(Duration::from_secs(30), self.from_client.recv())
            .await
            .expect("request in time")
            .expect("client end open")
    }

    pub fn push(&self, chat_id: &str, message: WireMessage) {
        self.to_client
            .send(ServerEvent::NewMessage {
                chat_id: ChatId::new(chat_id),
                message,
            })
            .expect("client connected");
    }
}

pub struct FakeTransport {
    script: StdMutex<VecDeque<OpenStep>>,
    opens: AtomicUsize,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

impl FakeTransport {
    pub fn new(
        script: impl IntoIterator<Item = OpenStep>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: StdMutex::new(script.into_iter().collect()),
            opens: AtomicUsize::new(0),
            accepted,
        });
        (transport, accepted_rx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _auth_token: &str) -> Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(OpenStep::Accept);
        match step {
            OpenStep::Reject(reason) => Err(anyhow!(reason)),
            OpenStep::Accept => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let _ = self.accepted.send(ServerSide {
                    to_client,
                    from_client,
                });
                Ok(TransportLink::new(outbound, inbound))
            }
        }
    }
}

/// REST backend kept in memory. Sends are stored with ids `S42`, `S43`, ...
pub struct FakeChatApi {
    history: StdMutex<HashMap<ChatId, Vec<WireMessage>>>,
    held: StdMutex<HashMap<ChatId, oneshot::Receiver<Vec<WireMessage>>>>,
    sends: StdMutex<Vec<(ChatId, SendMessageRequest)>>,
    rejected_content: StdMutex<HashSet<String>>,
    failing_history: StdMutex<HashSet<ChatId>>,
    next_id: AtomicU64,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            history: StdMutex::new(HashMap::new()),
            held: StdMutex::new(HashMap::new()),
            sends: StdMutex::new(Vec::new()),
            rejected_content: StdMutex::new(HashSet::new()),
            failing_history: StdMutex::new(HashSet::new()),
            next_id: AtomicU64::new(42),
        })
    }

    pub fn set_history(&self, chat_id: &str, messages: Vec<WireMessage>) {
        self.history
            .lock()
            .expect("history lock")
            .insert(ChatId::new(chat_id), messages);
    }

    /// The next history fetch for `chat_id` blocks until the returned sender
    /// supplies the batch.
    pub fn hold_history(&self, chat_id: &str) -> oneshot::Sender<Vec<WireMessage>> {
        let (tx, rx) = oneshot::channel();
        self.held
            .lock()
            .expect("held lock")
            .insert(ChatId::new(chat_id), rx);
        tx
    }

    /// History fetches for `chat_id` fail with a server error. A held fetch
    /// fails once it is released.
    pub fn fail_history(&self, chat_id: &str) {
        self.failing_history
            .lock()
            .expect("failing lock")
            .insert(ChatId::new(chat_id));
    }

    pub fn reject_content(&self, content: &str) {
        self.rejected_content
            .lock()
            .expect("reject lock")
            .insert(content.to_string());
    }

    pub fn sends(&self) -> Vec<(ChatId, SendMessageRequest)> {
        self.sends.lock().expect("sends lock").clone()
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn fetch_history(&self, _auth_token: &str, chat_id: &ChatId) -> Result<Vec<WireMessage>> {
        let held = self.held.lock().expect("held lock").remove(chat_id);
        let released = match held {
            Some(rx) => Some(rx.await.map_err(|_| anyhow!("history request dropped"))?),
            None => None,
        };
        if self
            .failing_history
            .lock()
            .expect("failing lock")
            .contains(chat_id)
        {
            return Err(ApiException::new(ErrorCode::Internal, "history unavailable").into());
        }
        if let Some(batch) = released {
            return Ok(batch);
        }
        Ok(self
            .history
            .lock()
            .expect("history lock")
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        _auth_token: &str,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> Result<Option<WireMessage>> {
        self.sends
            .lock()
            .expect("sends lock")
            .push((chat_id.clone(), request.clone()));
        if self
            .rejected_content
            .lock()
            .expect("reject lock")
            .contains(&request.content)
        {
            return Err(ApiException::new(ErrorCode::Validation, "message rejected").into());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = wire(&format!("S{id}"), ME, &request.content, 100 + id as i64);
        stored.client_ref = request.client_ref.clone();
        Ok(Some(stored))
    }

    async fn get_or_create_chat(&self, _auth_token: &str, user_id: &UserId) -> Result<ChatId> {
        Ok(ChatId::new(format!("c-with-{user_id}")))
    }
}

pub struct Harness {
    pub client: Arc<ChatClient>,
    pub transport: Arc<FakeTransport>,
    pub servers: mpsc::UnboundedReceiver<ServerSide>,
    pub api: Arc<FakeChatApi>,
    pub events: broadcast::Receiver<ClientEvent>,
}

impl Harness {
    pub fn new(script: impl IntoIterator<Item = OpenStep>) -> Self {
        Self::with_settings(
            script,
            ClientSettings {
                auto_connect: false,
                ..ClientSettings::default()
            },
        )
    }

    pub fn with_settings(
        script: impl IntoIterator<Item = OpenStep>,
        settings: ClientSettings,
    ) -> Self {
        let (transport, servers) = FakeTransport::new(script);
        let api = FakeChatApi::new();
        let auth = Arc::new(SessionStore::signed_in(AuthSession::new(
            "token",
            UserId::new(ME),
            "me",
        )));
        let client = ChatClient::new(auth, transport.clone(), api.clone(), settings);
        let events = client.subscribe_events();
        Self {
            client,
            transport,
            servers,
            api,
            events,
        }
    }

    pub async fn next_server(&mut self) -> ServerSide {
        tokio::time::timeout(Duration::from_secs(60), self.servers.recv())
            .await
            .expect("connection in time")
            .expect("accepted connection")
    }

    /// Skip events until one matches.
    pub async fn wait_for_event(&mut self, matches: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), self.events.recv())
                .await
                .expect("event in time")
                .expect("event");
            if matches(&event) {
                return event;
            }
        }
    }
}

/// Poll until `check` holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
