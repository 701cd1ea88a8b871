//! Ordered, deduplicated message timeline for one conversation.
//!
//! [`MessageStore`] is the single source of truth the UI reads. Entries are
//! kept in a `BTreeMap` keyed by `(created_at, identity)`, with hash indexes
//! from confirmed and provisional ids to their position, so identity
//! resolution never scans the whole timeline.
//!
//! # Identity resolution
//!
//! An incoming confirmed message is matched, in order, against:
//! 1. an entry with the same confirmed id (replace in place),
//! 2. a local entry named by its `client_ref` (exact echo match),
//! 3. a local entry from the same sender with the same content created
//!    within the echo window (heuristic echo match; skipped when the server
//!    supplies a `client_ref`).
//!
//! The confirmed version always wins over a local placeholder.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use threadsync_proto::conversation::ConversationId;
use threadsync_proto::message::{
    ConfirmedMessage, Message, MessageBody, MessageId, MessageKey, PendingMessage, ProvisionalId,
    Timestamp,
};

/// Default tolerance when matching a channel echo to a local placeholder.
pub const DEFAULT_ECHO_WINDOW_MS: u64 = 10_000;

/// Position of an entry in the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct OrderKey {
    created_at: Timestamp,
    key: MessageKey,
}

impl OrderKey {
    const fn of(message: &Message) -> Self {
        Self {
            created_at: message.created_at(),
            key: message.key(),
        }
    }

    /// Smallest key at `created_at`.
    const fn floor(created_at: Timestamp) -> Self {
        Self {
            created_at,
            key: MessageKey::Confirmed(MessageId::new(0)),
        }
    }
}

/// What an [`MessageStore::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new entry was added.
    Inserted,
    /// An existing entry with the same identity was replaced.
    Updated,
    /// A confirmed message replaced a local placeholder.
    Reconciled {
        /// The placeholder that was replaced.
        provisional_id: ProvisionalId,
        /// The confirmed id it became.
        id: MessageId,
    },
    /// The store already held an identical entry.
    Unchanged,
}

impl UpsertOutcome {
    /// Whether the timeline changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Ordered, deduplicated timeline for a single conversation.
#[derive(Debug)]
pub struct MessageStore {
    conversation: ConversationId,
    echo_window_ms: u64,
    entries: BTreeMap<OrderKey, Message>,
    confirmed: HashMap<MessageId, OrderKey>,
    local: HashMap<ProvisionalId, OrderKey>,
    revision: u64,
}

impl MessageStore {
    /// Creates an empty store with the default echo window.
    #[must_use]
    pub fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            echo_window_ms: DEFAULT_ECHO_WINDOW_MS,
            entries: BTreeMap::new(),
            confirmed: HashMap::new(),
            local: HashMap::new(),
            revision: 0,
        }
    }

    /// Sets the echo-matching tolerance in milliseconds.
    #[must_use]
    pub const fn with_echo_window(mut self, millis: u64) -> Self {
        self.echo_window_ms = millis;
        self
    }

    /// The conversation this store belongs to.
    #[must_use]
    pub const fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// Change counter. Bumped on every mutation that alters the timeline.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces `message` according to identity resolution.
    pub fn upsert(&mut self, message: Message) -> UpsertOutcome {
        let outcome = match message {
            Message::Pending(pending) => self.upsert_local(pending),
            Message::Confirmed(confirmed) => self.upsert_confirmed(confirmed),
        };
        if outcome.changed() {
            self.revision += 1;
        }
        outcome
    }

    /// Returns the ordered timeline.
    #[must_use]
    pub fn list(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }

    /// Iterates over the timeline in order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.values()
    }

    /// Looks up a confirmed message.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&ConfirmedMessage> {
        let key = self.confirmed.get(&id)?;
        match self.entries.get(key) {
            Some(Message::Confirmed(m)) => Some(m),
            _ => None,
        }
    }

    /// Looks up a local (pending or failed) message.
    #[must_use]
    pub fn get_local(&self, provisional_id: ProvisionalId) -> Option<&PendingMessage> {
        let key = self.local.get(&provisional_id)?;
        match self.entries.get(key) {
            Some(Message::Pending(m)) => Some(m),
            _ => None,
        }
    }

    /// The latest confirmed message in timeline order.
    #[must_use]
    pub fn last_confirmed(&self) -> Option<&ConfirmedMessage> {
        self.entries.values().rev().find_map(|m| match m {
            Message::Confirmed(c) => Some(c),
            Message::Pending(_) => None,
        })
    }

    /// Marks a local message as failed, keeping it in place.
    ///
    /// Returns `false` if the placeholder no longer exists (for example,
    /// because a channel echo already confirmed it).
    pub fn mark_failed(&mut self, provisional_id: ProvisionalId, reason: &str) -> bool {
        let Some(key) = self.local.get(&provisional_id) else {
            return false;
        };
        let Some(Message::Pending(pending)) = self.entries.get_mut(key) else {
            return false;
        };
        if pending.failure.as_deref() == Some(reason) {
            return true;
        }
        pending.failure = Some(reason.to_string());
        self.revision += 1;
        true
    }

    /// Removes a local message (discard, or retry under a new id).
    pub fn remove_local(&mut self, provisional_id: ProvisionalId) -> Option<PendingMessage> {
        let key = self.local.remove(&provisional_id)?;
        // `local` only holds provisional keys, which only name pending entries.
        let Some(Message::Pending(pending)) = self.entries.remove(&key) else {
            return None;
        };
        self.revision += 1;
        Some(pending)
    }

    /// Position of a confirmed message, as `(created_at, id)`.
    #[must_use]
    pub fn position_of(&self, id: MessageId) -> Option<(Timestamp, MessageId)> {
        self.confirmed.get(&id).map(|k| (k.created_at, id))
    }

    /// Marks confirmed messages up to and including `through` as read,
    /// limited to those whose body satisfies `include`.
    ///
    /// Returns the number of messages whose flag changed.
    pub fn mark_read_through<F>(&mut self, through: (Timestamp, MessageId), include: F) -> usize
    where
        F: Fn(&MessageBody) -> bool,
    {
        let upper = OrderKey {
            created_at: through.0,
            key: MessageKey::Confirmed(through.1),
        };
        let mut changed = 0;
        for message in self.entries.range_mut(..=upper).map(|(_, m)| m) {
            if let Message::Confirmed(c) = message
                && !c.read
                && include(&c.body)
            {
                c.read = true;
                changed += 1;
            }
        }
        if changed > 0 {
            self.revision += 1;
        }
        changed
    }

    fn upsert_local(&mut self, pending: PendingMessage) -> UpsertOutcome {
        let new_key = OrderKey {
            created_at: pending.body.created_at,
            key: MessageKey::Provisional(pending.provisional_id),
        };
        if let Some(old_key) = self.local.get(&pending.provisional_id).copied() {
            if matches!(self.entries.get(&old_key), Some(Message::Pending(p)) if *p == pending) {
                return UpsertOutcome::Unchanged;
            }
            self.entries.remove(&old_key);
            self.local.insert(pending.provisional_id, new_key);
            self.entries.insert(new_key, Message::Pending(pending));
            return UpsertOutcome::Updated;
        }
        self.local.insert(pending.provisional_id, new_key);
        self.entries.insert(new_key, Message::Pending(pending));
        UpsertOutcome::Inserted
    }

    fn upsert_confirmed(&mut self, mut incoming: ConfirmedMessage) -> UpsertOutcome {
        if let Some(old_key) = self.confirmed.get(&incoming.id).copied() {
            // A placeholder still named by client_ref was skipped by an
            // earlier heuristic match; it is this message too.
            let stale_local = incoming
                .client_ref
                .filter(|r| self.local.contains_key(r));
            if let Some(Message::Confirmed(existing)) = self.entries.get(&old_key) {
                // Read is sticky, and a known client_ref is never forgotten.
                incoming.read |= existing.read;
                incoming.client_ref = incoming.client_ref.or(existing.client_ref);
                if *existing == incoming && stale_local.is_none() {
                    return UpsertOutcome::Unchanged;
                }
            }
            self.entries.remove(&old_key);
            if let Some(provisional_id) = stale_local
                && let Some(key) = self.local.remove(&provisional_id)
            {
                self.entries.remove(&key);
                let id = incoming.id;
                return self.insert_confirmed(
                    incoming,
                    UpsertOutcome::Reconciled { provisional_id, id },
                );
            }
            return self.insert_confirmed(incoming, UpsertOutcome::Updated);
        }

        if let Some(provisional_id) = self.find_local_match(&incoming) {
            if let Some(key) = self.local.remove(&provisional_id) {
                self.entries.remove(&key);
            }
            tracing::debug!(
                conversation = %self.conversation,
                provisional = %provisional_id,
                id = %incoming.id,
                "local placeholder reconciled"
            );
            let id = incoming.id;
            return self.insert_confirmed(
                incoming,
                UpsertOutcome::Reconciled { provisional_id, id },
            );
        }

        self.insert_confirmed(incoming, UpsertOutcome::Inserted)
    }

    fn insert_confirmed(
        &mut self,
        message: ConfirmedMessage,
        outcome: UpsertOutcome,
    ) -> UpsertOutcome {
        let key = OrderKey {
            created_at: message.body.created_at,
            key: MessageKey::Confirmed(message.id),
        };
        self.confirmed.insert(message.id, key);
        self.entries.insert(key, Message::Confirmed(message));
        outcome
    }

    /// Finds the local placeholder a confirmed message stands for.
    fn find_local_match(&self, incoming: &ConfirmedMessage) -> Option<ProvisionalId> {
        if let Some(client_ref) = incoming.client_ref {
            return self.local.contains_key(&client_ref).then_some(client_ref);
        }
        if self.local.is_empty() {
            return None;
        }

        let created = incoming.body.created_at;
        let lower = OrderKey::floor(created.saturating_sub_millis(self.echo_window_ms));
        let upper = OrderKey::floor(
            created
                .saturating_add_millis(self.echo_window_ms)
                .saturating_add_millis(1),
        );

        self.entries
            .range((Bound::Included(lower), Bound::Excluded(upper)))
            .filter_map(|(_, m)| match m {
                Message::Pending(p) if is_echo_of(&p.body, &incoming.body) => Some(p),
                _ => None,
            })
            .min_by_key(|p| p.body.created_at.abs_diff(created))
            .map(|p| p.provisional_id)
    }
}

fn is_echo_of(local: &MessageBody, confirmed: &MessageBody) -> bool {
    local.conversation_id == confirmed.conversation_id
        && local.sender_id == confirmed.sender_id
        && local.content == confirmed.content
}
