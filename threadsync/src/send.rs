//! Optimistic send pipeline.
//!
//! [`OptimisticSender::begin`] validates content, inserts a pending
//! placeholder so the UI shows it immediately, and hands back a
//! [`SendFuture`] that drives the send API under a timeout. The caller polls
//! that future wherever it likes (the coordinator spawns it) and feeds the
//! [`SendCompletion`] back through [`OptimisticSender::complete`], which
//! either confirms the placeholder or marks it failed in place.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use threadsync_proto::api::{SendRequest, WireMessage};
use threadsync_proto::conversation::{ConversationId, UserId};
use threadsync_proto::message::{
    Message, MessageBody, MessageId, PendingMessage, ProvisionalId, Timestamp, ValidationError,
    validate_content,
};

use crate::api::ChatApi;
use crate::reconcile::{MergeReport, ReconciliationEngine, Source};
use crate::store::MessageStore;

/// Default time a send may stay pending before it is marked failed.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Why a send did not produce a confirmed message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailedError {
    /// The send API refused or failed the request.
    #[error("send rejected: {0}")]
    Rejected(String),

    /// No response arrived within the send timeout.
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),

    /// The conversation was closed before the send resolved.
    #[error("send cancelled")]
    Cancelled,
}

type Outcome = Result<MessageId, SendFailedError>;

/// Caller's handle on one send.
#[derive(Debug)]
pub struct SendTicket {
    provisional_id: ProvisionalId,
    outcome: oneshot::Receiver<Outcome>,
}

impl SendTicket {
    /// Provisional id of the placeholder shown in the timeline.
    #[must_use]
    pub const fn provisional_id(&self) -> ProvisionalId {
        self.provisional_id
    }

    /// Waits for the send to resolve.
    ///
    /// # Errors
    ///
    /// Returns the [`SendFailedError`] the placeholder was marked with, or
    /// [`SendFailedError::Cancelled`] if the conversation closed first.
    pub async fn outcome(self) -> Outcome {
        self.outcome.await.unwrap_or(Err(SendFailedError::Cancelled))
    }
}

/// Result of driving a [`SendFuture`].
#[derive(Debug)]
pub struct SendCompletion {
    /// Placeholder the send was for.
    pub provisional_id: ProvisionalId,
    /// Confirmed message, or why there is none.
    pub result: Result<WireMessage, SendFailedError>,
}

/// The network half of a send.
pub type SendFuture = Pin<Box<dyn Future<Output = SendCompletion> + Send>>;

/// Sends for one conversation. Owns the callers' outcome channels.
pub struct OptimisticSender<A> {
    api: Arc<A>,
    engine: ReconciliationEngine,
    conversation: ConversationId,
    local_user: UserId,
    timeout: Duration,
    clock: fn() -> Timestamp,
    in_flight: HashMap<ProvisionalId, oneshot::Sender<Outcome>>,
}

impl<A> std::fmt::Debug for OptimisticSender<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticSender")
            .field("conversation", &self.conversation)
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl<A: ChatApi> OptimisticSender<A> {
    /// Creates a sender for `conversation` on behalf of `local_user`.
    #[must_use]
    pub fn new(
        api: Arc<A>,
        conversation: ConversationId,
        local_user: UserId,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            engine: ReconciliationEngine::new(conversation, local_user),
            conversation,
            local_user,
            timeout,
            clock: Timestamp::now,
            in_flight: HashMap::new(),
        }
    }

    /// Replaces the clock used to stamp placeholders.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    /// Number of sends awaiting a result.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Starts a send.
    ///
    /// Validation happens before anything else: on error the store is left
    /// untouched and no request is made.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for empty or over-long content.
    pub fn begin(
        &mut self,
        store: &mut MessageStore,
        content: &str,
    ) -> Result<(SendTicket, SendFuture), ValidationError> {
        let content = validate_content(content)?;
        let provisional_id = ProvisionalId::new();
        store.upsert(Message::Pending(PendingMessage {
            provisional_id,
            body: MessageBody {
                conversation_id: self.conversation,
                sender_id: self.local_user,
                content: content.clone(),
                created_at: (self.clock)(),
            },
            failure: None,
        }));

        let (tx, rx) = oneshot::channel();
        self.in_flight.insert(provisional_id, tx);
        tracing::debug!(
            conversation = %self.conversation,
            provisional = %provisional_id,
            "send started"
        );

        let api = Arc::clone(&self.api);
        let conversation = self.conversation;
        let timeout = self.timeout;
        let request = SendRequest {
            content,
            client_ref: provisional_id,
        };
        let future = Box::pin(async move {
            let result =
                match tokio::time::timeout(timeout, api.send_message(conversation, request)).await {
                    Ok(Ok(wire)) => Ok(wire),
                    Ok(Err(e)) => Err(SendFailedError::Rejected(e.to_string())),
                    Err(_) => Err(SendFailedError::TimedOut(timeout)),
                };
            SendCompletion {
                provisional_id,
                result,
            }
        });

        Ok((
            SendTicket {
                provisional_id,
                outcome: rx,
            },
            future,
        ))
    }

    /// Applies the result of a [`SendFuture`].
    pub fn complete(&mut self, store: &mut MessageStore, completion: SendCompletion) -> MergeReport {
        let SendCompletion {
            provisional_id,
            result,
        } = completion;
        match result {
            Ok(mut wire) => {
                let id = wire.id;
                wire.client_ref.get_or_insert(provisional_id);
                let report = self
                    .engine
                    .merge(store, Source::SendResponse, std::iter::once(wire));
                for &(pid, confirmed) in &report.reconciled {
                    self.resolve(pid, Ok(confirmed));
                }
                // The echo may have reconciled this placeholder already.
                self.resolve(provisional_id, Ok(id));
                report
            }
            Err(e) => {
                let mut report = MergeReport::default();
                if store.mark_failed(provisional_id, &e.to_string()) {
                    report.updated = 1;
                    tracing::warn!(
                        conversation = %self.conversation,
                        provisional = %provisional_id,
                        error = %e,
                        "send failed"
                    );
                } else {
                    tracing::debug!(
                        conversation = %self.conversation,
                        provisional = %provisional_id,
                        error = %e,
                        "send failed after echo confirmed it, ignoring"
                    );
                }
                if self.in_flight.contains_key(&provisional_id) {
                    self.resolve(provisional_id, Err(e));
                }
                report
            }
        }
    }

    /// Resolves tickets for placeholders another source confirmed first.
    pub fn reconciled(&mut self, confirmed: &[(ProvisionalId, MessageId)]) {
        for &(pid, id) in confirmed {
            self.resolve(pid, Ok(id));
        }
    }

    /// Re-sends a failed placeholder with the same content.
    ///
    /// The failed entry is replaced by a fresh pending one. Returns `None`
    /// when `provisional_id` is not a failed placeholder.
    pub fn retry(
        &mut self,
        store: &mut MessageStore,
        provisional_id: ProvisionalId,
    ) -> Option<(SendTicket, SendFuture)> {
        let failed = store
            .get_local(provisional_id)
            .is_some_and(|p| p.failure.is_some());
        if !failed {
            return None;
        }
        let old = store.remove_local(provisional_id)?;
        tracing::info!(
            conversation = %self.conversation,
            provisional = %provisional_id,
            "retrying failed send"
        );
        // Content was validated when first sent.
        self.begin(store, &old.body.content).ok()
    }

    /// Drops a failed placeholder. Returns whether anything was removed.
    pub fn discard(&mut self, store: &mut MessageStore, provisional_id: ProvisionalId) -> bool {
        let failed = store
            .get_local(provisional_id)
            .is_some_and(|p| p.failure.is_some());
        failed && store.remove_local(provisional_id).is_some()
    }

    /// Fails every outstanding ticket with [`SendFailedError::Cancelled`].
    pub fn cancel_all(&mut self) {
        for (_, tx) in self.in_flight.drain() {
            let _ = tx.send(Err(SendFailedError::Cancelled));
        }
    }

    fn resolve(&mut self, provisional_id: ProvisionalId, outcome: Outcome) {
        if let Some(tx) = self.in_flight.remove(&provisional_id) {
            let _ = tx.send(outcome);
        }
    }
}
