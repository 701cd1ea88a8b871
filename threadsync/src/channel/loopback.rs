//! In-process push hub for testing.
//!
//! [`LoopbackHub`] implements [`ChannelTransport`] over `tokio::sync::mpsc`
//! channels. Tests publish events directly and can simulate outages
//! ([`drop_all`](LoopbackHub::drop_all), [`set_offline`](LoopbackHub::set_offline))
//! and rejections ([`reject_next`](LoopbackHub::reject_next)).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use threadsync_proto::channel::ChannelEvent;
use threadsync_proto::codec;
use threadsync_proto::conversation::{ConversationId, topic_for};

use super::{ChannelTransport, Subscription, TransportError};

/// Per-subscription buffer.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct HubState {
    subscribers: HashMap<String, Vec<(u64, mpsc::Sender<Vec<u8>>)>>,
    next_subscriber: u64,
    offline: bool,
    reject: Option<String>,
    attempts: usize,
}

/// Shared in-process topic hub. Clones share state.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Creates an empty, online hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `payload` to every subscriber of `topic`.
    ///
    /// Returns the number of subscribers reached. Full or closed buffers are
    /// skipped.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> usize {
        let state = self.state.lock();
        let Some(subscribers) = state.subscribers.get(topic) else {
            return 0;
        };
        subscribers
            .iter()
            .filter(|(_, tx)| tx.try_send(payload.clone()).is_ok())
            .count()
    }

    /// Encodes and publishes `event` on `conversation`'s topic.
    pub fn publish_event(&self, conversation: ConversationId, event: &ChannelEvent) -> usize {
        match codec::encode_event(event) {
            Ok(payload) => self.publish(&topic_for(conversation), payload),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode loopback event");
                0
            }
        }
    }

    /// Closes every live subscription, as if the gateway went away.
    pub fn drop_all(&self) {
        let mut state = self.state.lock();
        let dropped: usize = state.subscribers.values().map(Vec::len).sum();
        state.subscribers.clear();
        tracing::debug!(dropped, "loopback hub dropped all subscribers");
    }

    /// While offline, subscribe attempts fail with
    /// [`TransportError::Unreachable`]. Going offline also drops live
    /// subscriptions.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
        if offline {
            self.drop_all();
        }
    }

    /// Rejects the next subscribe attempt with `reason`.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.state.lock().reject = Some(reason.into());
    }

    /// Number of live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.lock().subscribers.get(topic).map_or(0, Vec::len)
    }

    /// Total subscribe attempts seen so far.
    #[must_use]
    pub fn subscribe_attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

impl std::fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackHub")
            .field("topics", &state.subscribers.len())
            .field("offline", &state.offline)
            .finish_non_exhaustive()
    }
}

impl ChannelTransport for LoopbackHub {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (id, rx) = {
            let mut state = self.state.lock();
            state.attempts += 1;
            if let Some(reason) = state.reject.take() {
                return Err(TransportError::Unauthorized(reason));
            }
            if state.offline {
                return Err(TransportError::Unreachable("loopback hub offline".into()));
            }
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
            state
                .subscribers
                .entry(topic.to_string())
                .or_default()
                .push((id, tx));
            (id, rx)
        };

        let state = Arc::clone(&self.state);
        let owned_topic = topic.to_string();
        Ok(Subscription::new(topic, rx).on_drop(move || {
            let mut state = state.lock();
            if let Some(subscribers) = state.subscribers.get_mut(&owned_topic) {
                subscribers.retain(|(sid, _)| *sid != id);
                if subscribers.is_empty() {
                    state.subscribers.remove(&owned_topic);
                }
            }
        }))
    }
}
