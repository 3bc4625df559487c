//! Matching of optimistic sends against server-confirmed copies.
//!
//! A send produces a provisional entry straight away. The same logical
//! message later comes back through up to three paths (REST ack, live echo,
//! history fetch) and whichever arrives first promotes the provisional entry.
//! The others then find the canonical id already present and do nothing.
//! The ack names the exact send, so it also overrides an earlier match that
//! was made on content alone.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::WireMessage,
};
use tracing::{debug, warn};

use crate::{
    message::{LocalId, Message},
    message_log::{LogError, MessageLog},
};

/// How far a server timestamp may trail the local send time and still be
/// taken for that send's copy when matching history by content.
const HISTORY_CLOCK_SKEW_SECS: i64 = 30;

/// An optimistic send that has not been matched to a server copy yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub local_id: LocalId,
    pub content: String,
    pub client_ref: String,
    pub created_at: DateTime<Utc>,
}

/// What applying a server copy did to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// A pending entry was promoted to the canonical id.
    Promoted {
        local_id: LocalId,
        message_id: MessageId,
    },
    /// The message was new and got appended.
    Appended(MessageId),
    /// The canonical id was already in the log.
    Duplicate(MessageId),
    /// The ack referred to an entry that an echo had already resolved, or the
    /// ack's id was consumed by another pending entry and this one keeps
    /// waiting for its own echo.
    Unchanged,
}

/// Result of merging a history batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryMerge {
    /// Entries that were not in the log before. Promotions are not counted.
    pub inserted: usize,
    pub promoted: Vec<(LocalId, MessageId)>,
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    local_user: UserId,
    local_name: String,
    next_local_id: u64,
    pending: VecDeque<PendingSend>,
    /// Promotions decided by content alone, kept until the send's ack
    /// confirms or corrects them.
    guessed: HashMap<LocalId, WireMessage>,
}

impl ReconciliationEngine {
    pub fn new(local_user: UserId, local_name: impl Into<String>) -> Self {
        Self {
            local_user,
            local_name: local_name.into(),
            next_local_id: 1,
            pending: VecDeque::new(),
            guessed: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSend> {
        self.pending.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Insert the optimistic entry for a new send and start tracking it.
    pub fn begin_send(
        &mut self,
        log: &mut MessageLog,
        content: impl Into<String>,
        client_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> PendingSend {
        let local_id = LocalId(self.next_local_id);
        self.next_local_id += 1;

        let content = content.into();
        log.append(Message::pending(
            local_id,
            content.clone(),
            self.local_user.clone(),
            self.local_name.clone(),
            now,
        ));

        let pending = PendingSend {
            local_id,
            content,
            client_ref: client_ref.into(),
            created_at: now,
        };
        self.pending.push_back(pending.clone());
        pending
    }

    /// Apply a message pushed over the live stream.
    pub fn apply_remote(&mut self, log: &mut MessageLog, wire: &WireMessage) -> Reconciled {
        if log.contains_canonical(&wire.id) {
            return Reconciled::Duplicate(wire.id.clone());
        }

        if let Some(index) = self.match_echo(wire, false) {
            if let Some(pending) = self.pending.remove(index) {
                let by_content = wire.client_ref.is_none();
                return self.promote(log, pending, wire, by_content);
            }
        }

        log.append(Message::from_wire(wire, &self.local_user));
        Reconciled::Appended(wire.id.clone())
    }

    /// Apply the server's acknowledgement of a specific send.
    pub fn confirm_send(
        &mut self,
        log: &mut MessageLog,
        local_id: LocalId,
        stored: Option<&WireMessage>,
    ) -> Reconciled {
        let guess = self.guessed.remove(&local_id);
        let Some(index) = self.position_of(local_id) else {
            return match (guess, stored) {
                (Some(guess), Some(stored)) => self.correct_guess(log, local_id, guess, stored),
                _ => Reconciled::Unchanged,
            };
        };
        let Some(stored) = stored else {
            // Accepted without a body: the live echo will resolve it.
            return Reconciled::Unchanged;
        };
        if log.contains_canonical(&stored.id) {
            debug!(
                local_id = %local_id,
                message_id = %stored.id,
                "ack id already matched to another pending send; keeping entry pending"
            );
            return Reconciled::Unchanged;
        }

        match self.pending.remove(index) {
            Some(pending) => self.promote(log, pending, stored, false),
            None => Reconciled::Unchanged,
        }
    }

    /// Mark a send as rejected. Returns `false` when the entry was already
    /// resolved.
    pub fn fail_send(&mut self, log: &mut MessageLog, local_id: LocalId) -> bool {
        let Some(index) = self.position_of(local_id) else {
            return false;
        };
        self.pending.remove(index);
        self.guessed.remove(&local_id);
        log.mark_failed(local_id).is_ok()
    }

    /// Merge a fetched transcript. Copies of still-pending sends promote them;
    /// everything else goes through the idempotent log merge. A content match
    /// only counts when the copy is not older than the send, so an earlier
    /// message with the same text stays where it belongs.
    pub fn merge_history(&mut self, log: &mut MessageLog, batch: &[WireMessage]) -> HistoryMerge {
        let mut fresh = Vec::with_capacity(batch.len());
        let mut promoted = Vec::new();
        for wire in batch {
            if log.contains_canonical(&wire.id) {
                continue;
            }
            if let Some(index) = self.match_echo(wire, true) {
                if let Some(pending) = self.pending.remove(index) {
                    if let Reconciled::Promoted {
                        local_id,
                        message_id,
                    } = self.promote(log, pending, wire, wire.client_ref.is_none())
                    {
                        promoted.push((local_id, message_id));
                    }
                    continue;
                }
            }
            fresh.push(Message::from_wire(wire, &self.local_user));
        }
        let inserted = log.merge(fresh);
        HistoryMerge { inserted, promoted }
    }

    fn match_echo(&self, wire: &WireMessage, from_history: bool) -> Option<usize> {
        if wire.sender.id != self.local_user {
            return None;
        }
        // A correlation token is authoritative: a token we never issued means
        // the message came from another session.
        if let Some(client_ref) = wire.client_ref.as_deref() {
            return self
                .pending
                .iter()
                .position(|pending| pending.client_ref == client_ref);
        }
        let not_before = |pending: &PendingSend| {
            !from_history
                || wire.created_at
                    >= pending.created_at - Duration::seconds(HISTORY_CLOCK_SKEW_SECS)
        };
        self.pending
            .iter()
            .position(|pending| pending.content == wire.content && not_before(pending))
    }

    /// The ack names a different id than the content match picked. The ack is
    /// exact, so the entry takes the acked id and the copy it had been matched
    /// to becomes an ordinary message again.
    fn correct_guess(
        &mut self,
        log: &mut MessageLog,
        local_id: LocalId,
        guess: WireMessage,
        stored: &WireMessage,
    ) -> Reconciled {
        if guess.id == stored.id || log.contains_canonical(&stored.id) {
            return Reconciled::Unchanged;
        }
        if let Err(err) = log.rekey(&guess.id, stored.id.clone()) {
            debug!(local_id = %local_id, error = %err, "could not correct echo match");
            return Reconciled::Unchanged;
        }
        warn!(
            local_id = %local_id,
            matched = %guess.id,
            acked = %stored.id,
            "send was matched to the wrong server copy; corrected from the ack"
        );
        log.append(Message::from_wire(&guess, &self.local_user));
        Reconciled::Promoted {
            local_id,
            message_id: stored.id.clone(),
        }
    }

    fn position_of(&self, local_id: LocalId) -> Option<usize> {
        self.pending
            .iter()
            .position(|pending| pending.local_id == local_id)
    }

    fn promote(
        &mut self,
        log: &mut MessageLog,
        pending: PendingSend,
        wire: &WireMessage,
        by_content: bool,
    ) -> Reconciled {
        match log.replace_provisional(pending.local_id, wire.id.clone()) {
            Ok(()) => {
                if by_content {
                    self.guessed.insert(pending.local_id, wire.clone());
                }
                Reconciled::Promoted {
                    local_id: pending.local_id,
                    message_id: wire.id.clone(),
                }
            }
            Err(LogError::CanonicalConflict(id)) => Reconciled::Duplicate(id),
            Err(LogError::MissingProvisional(_) | LogError::MissingCanonical(_)) => {
                // The optimistic entry is gone (log cleared); keep the server
                // copy as a regular message.
                log.append(Message::from_wire(wire, &self.local_user));
                Reconciled::Appended(wire.id.clone())
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciliation_tests.rs"]
mod tests;
