use std::collections::VecDeque;

use shared::domain::ChatId;

use crate::{
    message::Message,
    message_log::MessageLog,
    reconciliation::{PendingSend, ReconciliationEngine},
};

/// State of the chat that is currently open. Replaced wholesale when another
/// chat is opened.
pub(crate) struct ChatSession {
    pub id: u64,
    pub chat_id: ChatId,
    pub log: MessageLog,
    pub engine: ReconciliationEngine,
    /// Sends made while disconnected, flushed in order on the next connect.
    pub outbox: VecDeque<PendingSend>,
}

impl ChatSession {
    pub fn new(id: u64, chat_id: ChatId, engine: ReconciliationEngine) -> Self {
        Self {
            id,
            log: MessageLog::new(chat_id.clone()),
            chat_id,
            engine,
            outbox: VecDeque::new(),
        }
    }

    pub fn snapshot(&self) -> ChatSessionSnapshot {
        ChatSessionSnapshot {
            chat_id: self.chat_id.clone(),
            messages: self.log.messages(),
            pending_sends: self.engine.pending_count(),
            queued_sends: self.outbox.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSessionSnapshot {
    pub chat_id: ChatId,
    pub messages: Vec<Message>,
    /// Sends waiting for a server copy.
    pub pending_sends: usize,
    /// Sends not handed to the server yet.
    pub queued_sends: usize,
}
