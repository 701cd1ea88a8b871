//! Local read boundary and debounced read-receipt flushing.
//!
//! [`ReadReceiptTracker`] is a pure state machine: it never performs I/O.
//! The coordinator asks it for a [`flush_deadline`](ReadReceiptTracker::flush_deadline),
//! sleeps until then, calls [`take_flush`](ReadReceiptTracker::take_flush)
//! and reports the API result back. Read state is advisory, so failures are
//! only logged and retried on the next boundary change or the next visit.

use std::time::Duration;

use tokio::time::Instant;

use threadsync_proto::conversation::ConversationId;
use threadsync_proto::message::{ConfirmedMessage, MessageId, Timestamp};

/// Default coalescing window for receipt flushes.
pub const DEFAULT_RECEIPT_DEBOUNCE: Duration = Duration::from_millis(500);

/// High-water mark of what the local user has seen.
///
/// Ordered by `(created_at, message_id)`, the same order as the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadBoundary {
    /// Creation time of the boundary message.
    pub created_at: Timestamp,
    /// Id of the boundary message.
    pub message_id: MessageId,
}

impl ReadBoundary {
    /// Boundary at `message`.
    #[must_use]
    pub const fn of(message: &ConfirmedMessage) -> Self {
        Self {
            created_at: message.body.created_at,
            message_id: message.id,
        }
    }

    /// As a store position.
    #[must_use]
    pub const fn position(self) -> (Timestamp, MessageId) {
        (self.created_at, self.message_id)
    }
}

/// Read boundary of one conversation plus its flush bookkeeping.
#[derive(Debug, Clone)]
pub struct ReadReceiptTracker {
    conversation: ConversationId,
    debounce: Duration,
    boundary: Option<ReadBoundary>,
    acknowledged: Option<ReadBoundary>,
    in_flight: Option<ReadBoundary>,
    flush_at: Option<Instant>,
}

impl ReadReceiptTracker {
    /// Creates a tracker with nothing read yet.
    #[must_use]
    pub const fn new(conversation: ConversationId, debounce: Duration) -> Self {
        Self {
            conversation,
            debounce,
            boundary: None,
            acknowledged: None,
            in_flight: None,
            flush_at: None,
        }
    }

    /// Current local boundary.
    #[must_use]
    pub const fn boundary(&self) -> Option<ReadBoundary> {
        self.boundary
    }

    /// Highest boundary the server acknowledged.
    #[must_use]
    pub const fn acknowledged(&self) -> Option<ReadBoundary> {
        self.acknowledged
    }

    /// Whether the local boundary is ahead of the server's.
    #[must_use]
    pub fn has_unflushed(&self) -> bool {
        self.boundary > self.acknowledged
    }

    /// Advances the boundary to cover `messages`.
    ///
    /// Returns whether the boundary moved. It never moves backwards.
    pub fn mark_visible<'a, I>(&mut self, messages: I) -> bool
    where
        I: IntoIterator<Item = &'a ConfirmedMessage>,
    {
        messages
            .into_iter()
            .map(ReadBoundary::of)
            .max()
            .is_some_and(|highest| self.advance(highest))
    }

    /// Moves the boundary to `candidate` if it is ahead, and schedules a flush.
    pub fn advance(&mut self, candidate: ReadBoundary) -> bool {
        if self.boundary.is_some_and(|current| current >= candidate) {
            return false;
        }
        self.boundary = Some(candidate);
        tracing::trace!(
            conversation = %self.conversation,
            id = %candidate.message_id,
            "read boundary advanced"
        );
        self.schedule_flush();
        true
    }

    /// Arms the debounce timer if there is something to send.
    ///
    /// A timer that is already armed is left alone, so calls inside the
    /// window coalesce into one flush.
    pub fn schedule_flush(&mut self) {
        if self.has_unflushed() && self.in_flight.is_none() && self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.debounce);
        }
    }

    /// When the next flush is due.
    #[must_use]
    pub const fn flush_deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    /// Takes the boundary to send now, marking it in flight.
    pub fn take_flush(&mut self) -> Option<ReadBoundary> {
        self.flush_at = None;
        if self.in_flight.is_some() || !self.has_unflushed() {
            return None;
        }
        self.in_flight = self.boundary;
        self.in_flight
    }

    /// Records that the server stored `flushed`.
    pub fn flush_succeeded(&mut self, flushed: ReadBoundary) {
        self.in_flight = None;
        self.acknowledged = self.acknowledged.max(Some(flushed));
        tracing::debug!(
            conversation = %self.conversation,
            id = %flushed.message_id,
            "read boundary flushed"
        );
        self.schedule_flush();
    }

    /// Records a failed flush of `flushed`.
    ///
    /// Not retried by itself; the next boundary change or visit retries.
    pub fn flush_failed(&mut self, flushed: ReadBoundary, error: &str) {
        self.in_flight = None;
        tracing::debug!(
            conversation = %self.conversation,
            id = %flushed.message_id,
            error,
            "read receipt flush failed"
        );
        if self.boundary > Some(flushed) {
            self.schedule_flush();
        }
    }

    /// Forgets an in-flight flush and any armed timer (conversation closed).
    pub fn cancel_in_flight(&mut self) {
        self.in_flight = None;
        self.flush_at = None;
    }
}
