//! Room membership over the shared connection.
//!
//! At most one room is pending and at most one is joined. A join requested
//! while the connection is not up replaces whatever was pending and is sent
//! on the next `Connected`. The server forgets membership when the socket
//! drops, so a drop turns the joined room back into the pending one.

use std::sync::Arc;

use shared::{domain::ChatId, protocol::ClientRequest};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connection::{ConnectionManager, ConnectionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The join frame went out.
    Joined,
    /// Recorded as pending until the connection is up.
    Deferred,
}

#[derive(Debug, Default)]
struct RoomState {
    pending: Option<ChatId>,
    joined: Option<ChatId>,
}

pub struct RoomMultiplexer {
    connection: Arc<ConnectionManager>,
    rooms: Mutex<RoomState>,
}

impl RoomMultiplexer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            rooms: Mutex::new(RoomState::default()),
        }
    }

    pub async fn pending_room(&self) -> Option<ChatId> {
        self.rooms.lock().await.pending.clone()
    }

    pub async fn joined_room(&self) -> Option<ChatId> {
        self.rooms.lock().await.joined.clone()
    }

    pub async fn join(&self, chat_id: ChatId) -> JoinOutcome {
        let mut rooms = self.rooms.lock().await;
        if self.connection.state() != ConnectionState::Connected {
            if let Some(replaced) = rooms.pending.replace(chat_id.clone()) {
                if replaced != chat_id {
                    debug!(%replaced, chat_id = %chat_id, "pending join replaced");
                }
            }
            return JoinOutcome::Deferred;
        }

        match self
            .connection
            .send(ClientRequest::JoinChat {
                chat_id: chat_id.clone(),
            })
            .await
        {
            Ok(()) => {
                info!(chat_id = %chat_id, "joined chat room");
                rooms.pending = None;
                rooms.joined = Some(chat_id);
                JoinOutcome::Joined
            }
            Err(err) => {
                debug!(chat_id = %chat_id, error = %err, "join raced a drop; deferring");
                rooms.pending = Some(chat_id);
                JoinOutcome::Deferred
            }
        }
    }

    /// Leave a room. Never touches the connection itself.
    pub async fn leave(&self, chat_id: &ChatId) {
        let mut rooms = self.rooms.lock().await;
        if rooms.pending.as_ref() == Some(chat_id) {
            rooms.pending = None;
        }
        if rooms.joined.as_ref() != Some(chat_id) {
            return;
        }
        rooms.joined = None;
        if let Err(err) = self
            .connection
            .send(ClientRequest::LeaveChat {
                chat_id: chat_id.clone(),
            })
            .await
        {
            debug!(chat_id = %chat_id, error = %err, "leave not delivered");
        }
    }

    /// Send the pending join, if any. Returns the room that is joined
    /// afterwards.
    pub async fn on_connected(&self) -> Option<ChatId> {
        let mut rooms = self.rooms.lock().await;
        let Some(chat_id) = rooms.pending.take() else {
            return rooms.joined.clone();
        };
        match self
            .connection
            .send(ClientRequest::JoinChat {
                chat_id: chat_id.clone(),
            })
            .await
        {
            Ok(()) => {
                info!(chat_id = %chat_id, "joined pending chat room");
                rooms.joined = Some(chat_id.clone());
                Some(chat_id)
            }
            Err(err) => {
                debug!(chat_id = %chat_id, error = %err, "pending join not delivered");
                rooms.pending = Some(chat_id);
                None
            }
        }
    }

    pub async fn on_disconnected(&self) {
        let mut rooms = self.rooms.lock().await;
        if let Some(joined) = rooms.joined.take() {
            if rooms.pending.is_none() {
                rooms.pending = Some(joined);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
