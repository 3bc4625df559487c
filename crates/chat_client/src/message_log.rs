use std::collections::HashSet;

use shared::domain::{ChatId, MessageId};
use thiserror::Error;

use crate::message::{DeliveryState, LocalId, Message, MessageKey};

/// Errors raised when an update targets an entry the log cannot resolve.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("no provisional entry '{0}' in the message log")]
    MissingProvisional(LocalId),
    #[error("canonical id '{0}' is already held by another entry")]
    CanonicalConflict(MessageId),
    #[error("no entry with canonical id '{0}' in the message log")]
    MissingCanonical(MessageId),
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    message: Message,
}

/// Ordered, de-duplicated messages of one chat.
///
/// Entries are kept sorted by `created_at`, ties broken by insertion order.
/// At most one entry exists per canonical server id.
#[derive(Debug, Clone)]
pub struct MessageLog {
    chat_id: ChatId,
    entries: Vec<LogEntry>,
    canonical_ids: HashSet<MessageId>,
    next_seq: u64,
}

impl MessageLog {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            entries: Vec::new(),
            canonical_ids: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// Insert a message in display order. Returns `false` and drops the
    /// message when its canonical id is already present.
    pub fn append(&mut self, message: Message) -> bool {
        if let Some(id) = message.canonical_id() {
            if !self.canonical_ids.insert(id.clone()) {
                return false;
            }
        }

        let seq = self.bump_seq();
        let position = self
            .entries
            .partition_point(|entry| entry.message.created_at <= message.created_at);
        self.entries.insert(position, LogEntry { seq, message });
        true
    }

    /// Promote an optimistic entry in place: its position and local timestamp
    /// are kept, its id becomes canonical and it is marked confirmed.
    pub fn replace_provisional(
        &mut self,
        local_id: LocalId,
        canonical_id: MessageId,
    ) -> Result<(), LogError> {
        if self.canonical_ids.contains(&canonical_id) {
            return Err(LogError::CanonicalConflict(canonical_id));
        }
        let entry = self
            .find_provisional_mut(local_id)
            .ok_or(LogError::MissingProvisional(local_id))?;
        entry.message.id = MessageKey::Canonical(canonical_id.clone());
        entry.message.delivery_state = DeliveryState::Confirmed;
        self.canonical_ids.insert(canonical_id);
        Ok(())
    }

    /// Move a confirmed entry to another canonical id, keeping its position
    /// and timestamp. The old id is released and may be appended again.
    pub fn rekey(&mut self, from: &MessageId, to: MessageId) -> Result<(), LogError> {
        if self.canonical_ids.contains(&to) {
            return Err(LogError::CanonicalConflict(to));
        }
        let key = MessageKey::Canonical(from.clone());
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.message.id == key)
            .ok_or_else(|| LogError::MissingCanonical(from.clone()))?;
        entry.message.id = MessageKey::Canonical(to.clone());
        self.canonical_ids.remove(from);
        self.canonical_ids.insert(to);
        Ok(())
    }

    /// Flag an optimistic entry whose send was rejected. The entry stays in
    /// the log.
    pub fn mark_failed(&mut self, local_id: LocalId) -> Result<(), LogError> {
        let entry = self
            .find_provisional_mut(local_id)
            .ok_or(LogError::MissingProvisional(local_id))?;
        if entry.message.delivery_state == DeliveryState::Pending {
            entry.message.delivery_state = DeliveryState::Failed;
        }
        Ok(())
    }

    /// Insert the messages of a fetched batch that are not already present,
    /// then restore `created_at` order. Returns how many were inserted.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = Message>) -> usize {
        let mut inserted = 0;
        for message in batch {
            if let Some(id) = message.canonical_id() {
                if !self.canonical_ids.insert(id.clone()) {
                    continue;
                }
            }
            let seq = self.bump_seq();
            self.entries.push(LogEntry { seq, message });
            inserted += 1;
        }

        if inserted > 0 {
            self.entries.sort_by(|a, b| {
                a.message
                    .created_at
                    .cmp(&b.message.created_at)
                    .then(a.seq.cmp(&b.seq))
            });
        }
        inserted
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.iter().find(|message| &message.id == key)
    }

    pub fn contains_canonical(&self, id: &MessageId) -> bool {
        self.canonical_ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Snapshot of the log in display order.
    pub fn messages(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.canonical_ids.clear();
    }

    fn find_provisional_mut(&mut self, local_id: LocalId) -> Option<&mut LogEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.message.id == MessageKey::Provisional(local_id))
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
#[path = "tests/message_log_tests.rs"]
mod tests;
