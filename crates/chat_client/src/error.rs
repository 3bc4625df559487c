use shared::domain::ChatId;
use thiserror::Error;

use crate::message::LocalId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// No bearer token is available; nothing was attempted.
    #[error("not signed in: no authentication token available")]
    AuthMissing,
    #[error("chat connection failed: {reason}")]
    Connection { reason: String },
    #[error("not connected to the chat server")]
    NotConnected,
    #[error("no chat is open")]
    NoActiveChat,
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("failed to send message {local_id}: {reason}")]
    SendFailure { local_id: LocalId, reason: String },
    #[error("failed to load history for chat {chat_id}: {reason}")]
    HistoryFetch { chat_id: ChatId, reason: String },
    #[error("failed to resolve chat: {reason}")]
    ChatLookup { reason: String },
}

impl ChatError {
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Whether the caller can reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::NotConnected
                | Self::SendFailure { .. }
                | Self::HistoryFetch { .. }
        )
    }
}
