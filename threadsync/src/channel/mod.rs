//! Push-channel subscription with an explicit connection state machine.
//!
//! [`ChannelTransport`] is the seam to the push transport. Implementations:
//! - [`ws::WsChannelTransport`]: WebSocket push gateway
//! - [`loopback::LoopbackHub`]: in-process hub for tests and demos
//!
//! [`ChannelConnection`] owns one subscription for one conversation and
//! drives it through the [`ConnectionState`] machine, reconnecting with
//! [`BackoffPolicy`] until it is unsubscribed.

pub mod backoff;
pub mod loopback;
pub mod ws;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use threadsync_proto::channel::ChannelEvent;
use threadsync_proto::codec;
use threadsync_proto::conversation::{ConversationId, topic_for};

pub use backoff::BackoffPolicy;

/// State of a channel subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not subscribed yet.
    #[default]
    Idle,
    /// A subscribe attempt is in progress.
    Connecting,
    /// Subscribed and receiving events.
    Connected,
    /// The transport dropped an established subscription.
    Disconnected,
    /// A subscribe attempt failed.
    Errored,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Disconnected | Self::Errored, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Errored)
                | (Self::Connected, Self::Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Errors that can occur while subscribing or receiving.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The gateway refused the subscription. Not retried.
    #[error("subscription rejected: {0}")]
    Unauthorized(String),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The gateway could not be reached.
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The gateway violated the control protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether retrying cannot help.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// A live subscription to one topic.
///
/// Yields raw event payloads until the transport drops. Dropping the
/// subscription unsubscribes.
pub struct Subscription {
    topic: String,
    payloads: mpsc::Receiver<Vec<u8>>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a payload receiver.
    #[must_use]
    pub fn new(topic: impl Into<String>, payloads: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payloads,
            on_drop: None,
        }
    }

    /// Registers cleanup to run when the subscription is dropped.
    #[must_use]
    pub fn on_drop(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(f));
        self
    }

    /// Topic this subscription listens on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next raw payload, or `None` once the transport dropped.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.payloads.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// Async push transport.
///
/// A transport hands out independent subscriptions per topic. Payloads are
/// opaque bytes; decoding happens in [`ChannelConnection`].
pub trait ChannelTransport: Send + Sync + 'static {
    /// Subscribes to `topic`.
    ///
    /// Returns [`TransportError::Unauthorized`] when the gateway rejects the
    /// subscription; any other error is treated as transient.
    fn subscribe(
        &self,
        topic: &str,
    ) -> impl std::future::Future<Output = Result<Subscription, TransportError>> + Send;
}

/// Ordered output of a [`ChannelConnection`].
///
/// State changes and events share one stream so they are never reordered
/// relative to each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    /// The connection moved to a new state.
    State(ConnectionState),
    /// A decoded inbound event.
    Event(ChannelEvent),
}

/// The single push subscription of an open conversation.
///
/// Dropping the connection (or calling [`unsubscribe`](Self::unsubscribe))
/// stops the reconnect loop and releases the transport subscription.
#[derive(Debug)]
pub struct ChannelConnection {
    conversation: ConversationId,
    task: JoinHandle<()>,
}

impl ChannelConnection {
    /// Starts subscribing to `conversation`'s topic.
    ///
    /// Returns the connection and the receiver of its [`ChannelSignal`]s.
    #[must_use]
    pub fn subscribe<T: ChannelTransport>(
        conversation: ConversationId,
        transport: Arc<T>,
        policy: BackoffPolicy,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ChannelSignal>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run_connection(conversation, transport, policy, tx));
        (Self { conversation, task }, rx)
    }

    /// Conversation this connection serves.
    #[must_use]
    pub const fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// Whether the reconnect loop has stopped (terminal error or unsubscribe).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the connection immediately.
    pub fn unsubscribe(self) {
        tracing::debug!(conversation = %self.conversation, "channel unsubscribed");
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Tracks the current state and publishes legal transitions.
struct StateReporter {
    conversation: ConversationId,
    state: ConnectionState,
    tx: mpsc::Sender<ChannelSignal>,
}

impl StateReporter {
    /// Moves to `next`. Returns `false` when nobody is listening anymore.
    async fn enter(&mut self, next: ConnectionState) -> bool {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal channel transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(
            conversation = %self.conversation,
            from = %self.state,
            to = %next,
            "channel state"
        );
        self.state = next;
        self.tx.send(ChannelSignal::State(next)).await.is_ok()
    }
}

/// Reconnect loop for one conversation.
async fn run_connection<T: ChannelTransport>(
    conversation: ConversationId,
    transport: Arc<T>,
    policy: BackoffPolicy,
    tx: mpsc::Sender<ChannelSignal>,
) {
    let topic = topic_for(conversation);
    let mut reporter = StateReporter {
        conversation,
        state: ConnectionState::Idle,
        tx: tx.clone(),
    };
    let mut attempt: u32 = 0;

    loop {
        if !reporter.enter(ConnectionState::Connecting).await {
            return;
        }

        match transport.subscribe(&topic).await {
            Ok(mut subscription) => {
                attempt = 0;
                if !reporter.enter(ConnectionState::Connected).await {
                    return;
                }
                while let Some(payload) = subscription.next().await {
                    match codec::decode_event(&payload) {
                        Ok(event) => {
                            if tx.send(ChannelSignal::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                conversation = %conversation,
                                error = %e,
                                "malformed channel payload, skipping"
                            );
                        }
                    }
                }
                tracing::info!(conversation = %conversation, "channel dropped by transport");
                if !reporter.enter(ConnectionState::Disconnected).await {
                    return;
                }
            }
            Err(e) if e.is_terminal() => {
                tracing::warn!(
                    conversation = %conversation,
                    error = %e,
                    "channel subscription rejected, not retrying"
                );
                let _ = reporter.enter(ConnectionState::Errored).await;
                return;
            }
            Err(e) => {
                tracing::warn!(
                    conversation = %conversation,
                    error = %e,
                    "channel subscribe failed"
                );
                if !reporter.enter(ConnectionState::Errored).await {
                    return;
                }
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = policy.delay_for(attempt);
        tracing::debug!(
            conversation = %conversation,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "channel retry scheduled"
        );
        tokio::time::sleep(delay).await;
    }
}
