//! One-shot transcript fetch per chat open.
//!
//! Each fetch is tied to a ticket. Opening another chat or closing the
//! current one retires the ticket, and a completion holding a retired ticket
//! is dropped instead of merged.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use shared::{domain::ChatId, protocol::WireMessage};
use tokio::task::JoinHandle;

use crate::{api::ChatApi, error::ChatError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    chat_id: ChatId,
    generation: u64,
}

impl HistoryTicket {
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// The batch was merged; `inserted` entries were new.
    Merged { inserted: usize },
    /// The chat was closed or switched before the fetch completed.
    Discarded,
}

pub struct HistorySync {
    api: Arc<dyn ChatApi>,
    generation: AtomicU64,
}

impl HistorySync {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self {
            api,
            generation: AtomicU64::new(0),
        }
    }

    /// Start a new fetch generation, retiring every earlier ticket.
    pub fn begin(&self, chat_id: ChatId) -> HistoryTicket {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        HistoryTicket {
            chat_id,
            generation,
        }
    }

    pub fn is_current(&self, ticket: &HistoryTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.generation
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Fetch the transcript, oldest first.
    pub async fn load(
        &self,
        auth_token: &str,
        chat_id: &ChatId,
    ) -> Result<Vec<WireMessage>, ChatError> {
        let mut messages = self
            .api
            .fetch_history(auth_token, chat_id)
            .await
            .map_err(|err| ChatError::HistoryFetch {
                chat_id: chat_id.clone(),
                reason: format!("{err:#}"),
            })?;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }
}

/// Handle on the history fetch started by opening a chat.
pub struct HistoryTask {
    chat_id: ChatId,
    handle: JoinHandle<Result<HistoryOutcome, ChatError>>,
}

impl HistoryTask {
    pub(crate) fn new(
        chat_id: ChatId,
        handle: JoinHandle<Result<HistoryOutcome, ChatError>>,
    ) -> Self {
        Self { chat_id, handle }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<HistoryOutcome, ChatError> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => Ok(HistoryOutcome::Discarded),
            Err(err) => Err(ChatError::HistoryFetch {
                chat_id: self.chat_id,
                reason: err.to_string(),
            }),
        }
    }
}
