//! Conversation lifecycle: `Closed → Loading → Live → Closed`.
//!
//! [`SyncCoordinator::spawn`] starts a single actor task that owns the open
//! conversation's [`MessageStore`](crate::store::MessageStore), its
//! [`ChannelConnection`](crate::channel::ChannelConnection), its sends and
//! every conversation's read-receipt tracker. Network I/O runs in spawned
//! tasks that report back to the actor, so every store mutation happens on
//! one task. The UI talks to the actor through a cloneable [`SyncHandle`]
//! and observes `tokio::sync::watch` channels.

mod actor;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use threadsync_proto::conversation::{Conversation, ConversationId, UserId};
use threadsync_proto::message::{Message, MessageId, ProvisionalId, ValidationError, validate_content};

use crate::api::ChatApi;
use crate::channel::{BackoffPolicy, ChannelTransport, ConnectionState};
use crate::receipts::DEFAULT_RECEIPT_DEBOUNCE;
use crate::send::{DEFAULT_SEND_TIMEOUT, SendTicket};
use crate::store::DEFAULT_ECHO_WINDOW_MS;

/// Command queue depth between handles and the actor.
const COMMAND_BUFFER: usize = 64;

/// Tunables for the sync core.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// The authenticated user.
    pub local_user: UserId,
    /// How long a send may stay pending.
    pub send_timeout: Duration,
    /// Echo-matching tolerance.
    pub echo_window: Duration,
    /// Page limit for full history fetches.
    pub history_max_pages: u32,
    /// Page limit for gap-fill fetches.
    pub gap_fill_max_pages: u32,
    /// Read-receipt coalescing window.
    pub receipt_debounce: Duration,
    /// Buffer between the channel connection and the actor.
    pub channel_capacity: usize,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
}

impl SyncConfig {
    /// Defaults for `local_user`.
    #[must_use]
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            echo_window: Duration::from_millis(DEFAULT_ECHO_WINDOW_MS),
            history_max_pages: 50,
            gap_fill_max_pages: 10,
            receipt_debounce: DEFAULT_RECEIPT_DEBOUNCE,
            channel_capacity: 256,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Lifecycle phase of the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
    /// No conversation is open.
    #[default]
    Closed,
    /// Initial history or the first channel connect is outstanding.
    Loading,
    /// History resolved and the channel connected at least once.
    Live,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Loading => write!(f, "loading"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// A history fetch failed. Shown as a non-blocking banner; cleared by the
/// next successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("history fetch failed: {0}")]
pub struct FetchError(pub String);

/// Observable coordinator status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Open conversation, if any.
    pub conversation: Option<ConversationId>,
    /// Lifecycle phase.
    pub phase: SyncPhase,
    /// Last history failure, until a fetch succeeds.
    pub fetch_error: Option<FetchError>,
}

/// Errors returned to the UI by [`SyncHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The content failed validation; nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No conversation is open.
    #[error("no conversation is open")]
    NotOpen,

    /// The local user does not take part in the conversation.
    #[error("not a participant of conversation {0}")]
    NotParticipant(ConversationId),

    /// The provisional id does not name a failed local message.
    #[error("no failed message {0}")]
    UnknownMessage(ProvisionalId),

    /// The coordinator has stopped.
    #[error("sync coordinator has shut down")]
    Shutdown,
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

#[derive(Debug)]
enum Command {
    Open {
        conversation: ConversationId,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    Send {
        content: String,
        reply: Reply<SendTicket>,
    },
    Retry {
        provisional_id: ProvisionalId,
        reply: Reply<SendTicket>,
    },
    Discard {
        provisional_id: ProvisionalId,
        reply: Reply<()>,
    },
    MarkRead {
        ids: Vec<MessageId>,
    },
    Refresh,
    Shutdown,
}

/// Entry point of the sync core.
#[derive(Debug)]
pub struct SyncCoordinator;

impl SyncCoordinator {
    /// Spawns the coordinator actor and returns a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn<A, T>(api: Arc<A>, transport: Arc<T>, config: SyncConfig) -> SyncHandle
    where
        A: ChatApi,
        T: ChannelTransport,
    {
        let local_user = config.local_user;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (messages_tx, messages_rx) = watch::channel::<Arc<[Message]>>(Arc::from(Vec::new()));
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Idle);
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());

        let actor = actor::Actor::new(
            api,
            transport,
            config,
            commands_rx,
            actor::Outputs {
                messages: messages_tx,
                connection: connection_tx,
                status: status_tx,
            },
        );
        tokio::spawn(actor.run());

        SyncHandle {
            local_user,
            commands: commands_tx,
            messages: messages_rx,
            connection: connection_rx,
            status: status_rx,
        }
    }
}

/// Cloneable UI-side handle to a running coordinator.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    local_user: UserId,
    commands: mpsc::Sender<Command>,
    messages: watch::Receiver<Arc<[Message]>>,
    connection: watch::Receiver<ConnectionState>,
    status: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    async fn notify(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Shutdown)
    }

    /// Opens `conversation`, closing any other open conversation first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Shutdown`] if the coordinator has stopped.
    pub async fn open_conversation(&self, conversation: ConversationId) -> Result<(), SyncError> {
        self.request(|reply| Command::Open {
            conversation,
            reply,
        })
        .await
    }

    /// Opens a conversation loaded from the collaborator API.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotParticipant`] without contacting the actor
    /// if the local user is not one of its participants, or
    /// [`SyncError::Shutdown`] if the coordinator has stopped.
    pub async fn open(&self, conversation: &Conversation) -> Result<(), SyncError> {
        if !conversation.has_participant(self.local_user) {
            return Err(SyncError::NotParticipant(conversation.id));
        }
        self.open_conversation(conversation.id).await
    }

    /// Closes the open conversation, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Shutdown`] if the coordinator has stopped.
    pub async fn close_conversation(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Sends `content` to the open conversation.
    ///
    /// Content is validated before anything else happens, so a
    /// [`SyncError::Validation`] means the timeline is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`], [`SyncError::NotOpen`] or
    /// [`SyncError::Shutdown`].
    pub async fn send(&self, content: &str) -> Result<SendTicket, SyncError> {
        let content = validate_content(content)?;
        self.request(|reply| Command::Send { content, reply }).await
    }

    /// Re-sends a failed message with its original content.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownMessage`] if `provisional_id` is not a
    /// failed message of the open conversation.
    pub async fn retry(&self, provisional_id: ProvisionalId) -> Result<SendTicket, SyncError> {
        self.request(|reply| Command::Retry {
            provisional_id,
            reply,
        })
        .await
    }

    /// Removes a failed message from the timeline.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownMessage`] if `provisional_id` is not a
    /// failed message of the open conversation.
    pub async fn discard(&self, provisional_id: ProvisionalId) -> Result<(), SyncError> {
        self.request(|reply| Command::Discard {
            provisional_id,
            reply,
        })
        .await
    }

    /// Reports messages as visible to the user. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Shutdown`] if the coordinator has stopped.
    pub async fn mark_read(
        &self,
        ids: impl IntoIterator<Item = MessageId>,
    ) -> Result<(), SyncError> {
        self.notify(Command::MarkRead {
            ids: ids.into_iter().collect(),
        })
        .await
    }

    /// Re-fetches history (visibility event, or recovery from a
    /// [`FetchError`]).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Shutdown`] if the coordinator has stopped.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.notify(Command::Refresh).await
    }

    /// Stops the coordinator and waits for it to exit.
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).await.is_ok() {
            self.commands.closed().await;
        }
    }

    /// Receiver of ordered timeline snapshots.
    #[must_use]
    pub fn messages(&self) -> watch::Receiver<Arc<[Message]>> {
        self.messages.clone()
    }

    /// Current timeline snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<[Message]> {
        Arc::clone(&self.messages.borrow())
    }

    /// Receiver of channel connection states.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Receiver of coordinator status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }
}
