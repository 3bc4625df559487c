pub mod api;
pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod message;
pub mod message_log;
pub mod reconciliation;
pub mod rooms;
pub mod session;
pub mod transport;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use api::{ChatApi, HttpChatApi};
pub use auth::{AuthProvider, AuthSession, SessionStore, SignedOut};
pub use backoff::ReconnectPolicy;
pub use client::{ChatClient, ClientEvent};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::ChatError;
pub use history::{HistoryOutcome, HistoryTask};
pub use message::{DeliveryState, LocalId, Message, MessageKey, MessageOrigin};
pub use message_log::MessageLog;
pub use session::ChatSessionSnapshot;
pub use transport::{Transport, TransportLink, WebSocketTransport};
