use std::fmt;

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::WireMessage,
};

const UNKNOWN_SENDER_NAME: &str = "Unknown";

/// Client-assigned identifier for an optimistic message that the server has
/// not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Identity of a log entry. Provisional and canonical ids are separate
/// variants so they never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Provisional(LocalId),
    Canonical(MessageId),
}

impl MessageKey {
    pub fn canonical(&self) -> Option<&MessageId> {
        match self {
            Self::Canonical(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }

    pub fn provisional(&self) -> Option<LocalId> {
        match self {
            Self::Provisional(id) => Some(*id),
            Self::Canonical(_) => None,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(id) => id.fmt(f),
            Self::Canonical(id) => id.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Authored by the signed-in user, from this session or another one.
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageKey,
    pub content: String,
    pub sender_name: String,
    pub sender_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub origin: MessageOrigin,
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Optimistic entry for a message the local user just sent.
    pub fn pending(
        local_id: LocalId,
        content: impl Into<String>,
        sender_id: UserId,
        sender_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageKey::Provisional(local_id),
            content: content.into(),
            sender_name: sender_name.into(),
            sender_id: Some(sender_id),
            created_at,
            origin: MessageOrigin::Local,
            delivery_state: DeliveryState::Pending,
        }
    }

    /// Server-confirmed entry built from a pushed or fetched message.
    pub fn from_wire(wire: &WireMessage, local_user: &UserId) -> Self {
        let origin = if &wire.sender.id == local_user {
            MessageOrigin::Local
        } else {
            MessageOrigin::Remote
        };
        Self {
            id: MessageKey::Canonical(wire.id.clone()),
            content: wire.content.clone(),
            sender_name: wire
                .sender
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_SENDER_NAME.to_string()),
            sender_id: Some(wire.sender.id.clone()),
            created_at: wire.created_at,
            origin,
            delivery_state: DeliveryState::Confirmed,
        }
    }

    pub fn canonical_id(&self) -> Option<&MessageId> {
        self.id.canonical()
    }

    pub fn local_id(&self) -> Option<LocalId> {
        self.id.provisional()
    }

    pub fn sent_by_me(&self) -> bool {
        self.origin == MessageOrigin::Local
    }
}
