//! In-process fake of the collaborator API.
//!
//! [`InMemoryChatApi`] keeps conversations in memory, assigns increasing
//! message ids and publishes `message_created` / `message_read` events on a
//! [`LoopbackHub`], so a sync core wired to both behaves as it would against
//! a real backend. Failure knobs let tests script rejected sends, stalled
//! sends, held fetches and failing fetches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use threadsync_proto::api::{HistoryPage, HistoryQuery, SendRequest, WireMessage};
use threadsync_proto::channel::ChannelEvent;
use threadsync_proto::conversation::{ConversationId, UserId};
use threadsync_proto::message::{MessageId, Timestamp};

use super::{ApiError, ChatApi};
use crate::channel::loopback::LoopbackHub;

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// How [`InMemoryChatApi::send_message`] answers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Store, publish the echo, then return the confirmed message.
    #[default]
    Accept,
    /// Refuse every send with [`ApiError::Rejected`].
    Reject(String),
    /// Never answer.
    Stall,
}

#[derive(Debug)]
struct ServerState {
    messages: HashMap<ConversationId, Vec<WireMessage>>,
    next_id: u64,
    page_size: usize,
    echo_client_ref: bool,
    send_mode: SendMode,
    failing_fetches: usize,
    failing_receipts: usize,
    read_boundaries: HashMap<ConversationId, Vec<MessageId>>,
    sent: Vec<(ConversationId, SendRequest)>,
    fetches: Vec<(ConversationId, HistoryQuery)>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            messages: HashMap::new(),
            next_id: 1,
            page_size: DEFAULT_PAGE_SIZE,
            echo_client_ref: false,
            send_mode: SendMode::Accept,
            failing_fetches: 0,
            failing_receipts: 0,
            read_boundaries: HashMap::new(),
            sent: Vec::new(),
            fetches: Vec::new(),
        }
    }
}

impl ServerState {
    fn store(&mut self, conversation: ConversationId, mut message: WireMessage) -> WireMessage {
        if message.id.get() == 0 {
            message.id = MessageId::new(self.next_id);
        }
        self.next_id = self.next_id.max(message.id.get() + 1);
        self.messages
            .entry(conversation)
            .or_default()
            .push(message.clone());
        message
    }
}

/// Fake server for one authenticated user. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryChatApi {
    state: Arc<Mutex<ServerState>>,
    /// Conversations whose history fetches wait for a release.
    held: Arc<watch::Sender<HashSet<ConversationId>>>,
    hub: LoopbackHub,
    local_user: UserId,
}

impl InMemoryChatApi {
    /// Creates an empty server that publishes on `hub` and authenticates
    /// every request as `local_user`.
    #[must_use]
    pub fn new(hub: LoopbackHub, local_user: UserId) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            held: Arc::new(watch::Sender::new(HashSet::new())),
            hub,
            local_user,
        }
    }

    /// Hub that receives this server's push events.
    #[must_use]
    pub const fn hub(&self) -> &LoopbackHub {
        &self.hub
    }

    /// Sets the history page size (minimum 1).
    pub fn set_page_size(&self, size: usize) {
        self.state.lock().page_size = size.max(1);
    }

    /// Whether confirmed sends carry the request's `client_ref`.
    pub fn set_echo_client_ref(&self, echo: bool) {
        self.state.lock().echo_client_ref = echo;
    }

    /// Changes how sends are answered.
    pub fn set_send_mode(&self, mode: SendMode) {
        self.state.lock().send_mode = mode;
    }

    /// Makes the next `n` history fetches fail with [`ApiError::Unavailable`].
    pub fn fail_next_fetches(&self, n: usize) {
        self.state.lock().failing_fetches = n;
    }

    /// Holds history fetches of `conversation` until
    /// [`release_fetches`](Self::release_fetches). Held queries are still
    /// recorded in [`fetch_queries`](Self::fetch_queries).
    pub fn hold_fetches(&self, conversation: ConversationId) {
        self.held.send_modify(|held| {
            held.insert(conversation);
        });
    }

    /// Lets held fetches of `conversation` answer.
    pub fn release_fetches(&self, conversation: ConversationId) {
        self.held.send_modify(|held| {
            held.remove(&conversation);
        });
    }

    /// Makes the next `n` read-boundary updates fail.
    pub fn fail_next_receipts(&self, n: usize) {
        self.state.lock().failing_receipts = n;
    }

    /// Stores a message from `sender` and publishes it on the hub, as if
    /// another client had sent it.
    pub fn post(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: &str,
        created_at: Timestamp,
    ) -> WireMessage {
        let stored = self.state.lock().store(
            conversation,
            WireMessage {
                id: MessageId::new(0),
                conversation_id: conversation,
                sender_id: sender,
                content: content.to_string(),
                created_at,
                read: false,
                client_ref: None,
            },
        );
        self.hub.publish_event(
            conversation,
            &ChannelEvent::MessageCreated {
                message: stored.clone(),
            },
        );
        stored
    }

    /// Stores messages without publishing them. Ids of `0` are assigned.
    pub fn seed(&self, conversation: ConversationId, messages: impl IntoIterator<Item = WireMessage>) {
        let mut state = self.state.lock();
        for message in messages {
            state.store(conversation, message);
        }
    }

    /// Publishes a read receipt from `reader`.
    pub fn publish_read(&self, conversation: ConversationId, reader: UserId, message_id: MessageId) {
        self.hub.publish_event(
            conversation,
            &ChannelEvent::MessageRead {
                conversation_id: conversation,
                reader_id: reader,
                message_id,
            },
        );
    }

    /// Every read boundary the local user has stored, in call order.
    #[must_use]
    pub fn read_boundaries(&self, conversation: ConversationId) -> Vec<MessageId> {
        self.state
            .lock()
            .read_boundaries
            .get(&conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Every send request received, in call order.
    #[must_use]
    pub fn sent_requests(&self) -> Vec<(ConversationId, SendRequest)> {
        self.state.lock().sent.clone()
    }

    /// Every history query received, in call order.
    #[must_use]
    pub fn fetch_queries(&self) -> Vec<(ConversationId, HistoryQuery)> {
        self.state.lock().fetches.clone()
    }

    /// Stored messages of `conversation`, in id order.
    #[must_use]
    pub fn messages(&self, conversation: ConversationId) -> Vec<WireMessage> {
        let mut messages = self
            .state
            .lock()
            .messages
            .get(&conversation)
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(|m| m.id);
        messages
    }
}

impl ChatApi for InMemoryChatApi {
    async fn fetch_history(
        &self,
        conversation: ConversationId,
        query: HistoryQuery,
    ) -> Result<HistoryPage, ApiError> {
        self.state.lock().fetches.push((conversation, query));
        let mut held = self.held.subscribe();
        // The sender lives in `self`, so this only errors if it is dropped.
        let _ = held.wait_for(|held| !held.contains(&conversation)).await;

        let mut state = self.state.lock();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(ApiError::Unavailable("history temporarily unavailable".into()));
        }

        let mut matching: Vec<WireMessage> = state
            .messages
            .get(&conversation)
            .into_iter()
            .flatten()
            .filter(|m| query.after.is_none_or(|after| m.id > after))
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.id);

        let page_size = state.page_size;
        let start = (query.page as usize).saturating_mul(page_size);
        let items: Vec<WireMessage> = matching.iter().skip(start).take(page_size).cloned().collect();
        let has_more = matching.len() > start.saturating_add(page_size);
        Ok(HistoryPage { items, has_more })
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        request: SendRequest,
    ) -> Result<WireMessage, ApiError> {
        let mode = {
            let mut state = self.state.lock();
            state.sent.push((conversation, request.clone()));
            state.send_mode.clone()
        };
        match mode {
            SendMode::Accept => {}
            SendMode::Reject(reason) => return Err(ApiError::Rejected(reason)),
            SendMode::Stall => std::future::pending::<()>().await,
        }

        let stored = {
            let mut state = self.state.lock();
            let client_ref = state.echo_client_ref.then_some(request.client_ref);
            state.store(
                conversation,
                WireMessage {
                    id: MessageId::new(0),
                    conversation_id: conversation,
                    sender_id: self.local_user,
                    content: request.content,
                    created_at: Timestamp::now(),
                    read: false,
                    client_ref,
                },
            )
        };
        self.hub.publish_event(
            conversation,
            &ChannelEvent::MessageCreated {
                message: stored.clone(),
            },
        );
        Ok(stored)
    }

    async fn put_read_boundary(
        &self,
        conversation: ConversationId,
        message_id: MessageId,
    ) -> Result<(), ApiError> {
        {
            let mut state = self.state.lock();
            if state.failing_receipts > 0 {
                state.failing_receipts -= 1;
                return Err(ApiError::Unavailable("receipts temporarily unavailable".into()));
            }
            state
                .read_boundaries
                .entry(conversation)
                .or_default()
                .push(message_id);
        }
        self.publish_read(conversation, self.local_user, message_id);
        Ok(())
    }
}
