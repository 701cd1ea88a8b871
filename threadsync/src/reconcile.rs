//! Merging of history pages, channel events and send responses into a
//! [`MessageStore`].
//!
//! All three sources funnel through [`ReconciliationEngine`], which drops
//! anything addressed to another conversation and relies on the store's
//! identity resolution for deduplication. Because the store orders by
//! `(created_at, id)`, the merge is commutative and idempotent: feeding the
//! same confirmed messages in any order, any number of times, yields the
//! same timeline.

use threadsync_proto::api::WireMessage;
use threadsync_proto::channel::ChannelEvent;
use threadsync_proto::conversation::{ConversationId, UserId};
use threadsync_proto::message::{Message, MessageId, ProvisionalId};

use crate::store::{MessageStore, UpsertOutcome};

/// Where a batch of messages came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Initial or gap-fill history fetch.
    History,
    /// Live push channel.
    Channel,
    /// Response to a local send.
    SendResponse,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::History => write!(f, "history"),
            Self::Channel => write!(f, "channel"),
            Self::SendResponse => write!(f, "send"),
        }
    }
}

/// Summary of one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// New entries.
    pub inserted: usize,
    /// Replaced entries (same confirmed id, different fields).
    pub updated: usize,
    /// Local placeholders that were confirmed by this merge.
    pub reconciled: Vec<(ProvisionalId, MessageId)>,
    /// Entries dropped because they belong to another conversation.
    pub foreign: usize,
    /// Messages whose read flag changed because of a receipt.
    pub marked_read: usize,
}

impl MergeReport {
    /// Whether the timeline changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.updated > 0 || !self.reconciled.is_empty() || self.marked_read > 0
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Reconciled { provisional_id, id } => {
                self.reconciled.push((provisional_id, id));
            }
            UpsertOutcome::Unchanged => {}
        }
    }
}

/// Applies inbound messages for one conversation to its store.
#[derive(Debug, Clone, Copy)]
pub struct ReconciliationEngine {
    conversation: ConversationId,
    local_user: UserId,
}

impl ReconciliationEngine {
    /// Creates an engine for `conversation` as seen by `local_user`.
    #[must_use]
    pub const fn new(conversation: ConversationId, local_user: UserId) -> Self {
        Self {
            conversation,
            local_user,
        }
    }

    /// Merges a batch of server messages.
    pub fn merge<I>(&self, store: &mut MessageStore, source: Source, items: I) -> MergeReport
    where
        I: IntoIterator<Item = WireMessage>,
    {
        let mut report = MergeReport::default();
        for wire in items {
            if wire.conversation_id != self.conversation {
                tracing::debug!(
                    %source,
                    expected = %self.conversation,
                    got = %wire.conversation_id,
                    id = %wire.id,
                    "dropping message for another conversation"
                );
                report.foreign += 1;
                continue;
            }
            report.record(store.upsert(Message::Confirmed(wire.into_confirmed())));
        }
        if report.changed() {
            tracing::trace!(
                %source,
                conversation = %self.conversation,
                inserted = report.inserted,
                updated = report.updated,
                reconciled = report.reconciled.len(),
                "merged"
            );
        }
        report
    }

    /// Applies a decoded push-channel event.
    pub fn apply_event(&self, store: &mut MessageStore, event: ChannelEvent) -> MergeReport {
        if let Some(target) = event.conversation_id()
            && target != self.conversation
        {
            tracing::debug!(
                expected = %self.conversation,
                got = %target,
                "dropping channel event for another conversation"
            );
            return MergeReport {
                foreign: 1,
                ..MergeReport::default()
            };
        }
        match event {
            ChannelEvent::MessageCreated { message } => {
                self.merge(store, Source::Channel, std::iter::once(message))
            }
            ChannelEvent::MessageRead {
                reader_id,
                message_id,
                ..
            } => {
                let mut report = MergeReport::default();
                if reader_id == self.local_user {
                    // Our own receipt echoed back; the local tracker already knows.
                    return report;
                }
                let Some(position) = store.position_of(message_id) else {
                    tracing::debug!(
                        conversation = %self.conversation,
                        id = %message_id,
                        "read receipt for unknown message"
                    );
                    return report;
                };
                let me = self.local_user;
                report.marked_read =
                    store.mark_read_through(position, |body| body.sender_id == me);
                report
            }
            ChannelEvent::Unknown => {
                tracing::trace!(conversation = %self.conversation, "ignoring unknown channel event");
                MergeReport::default()
            }
        }
    }
}
