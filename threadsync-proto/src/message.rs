//! Message model for `threadsync`.
//!
//! A message is either [`Message::Pending`] (created locally, not yet
//! confirmed by the server) or [`Message::Confirmed`] (carries a
//! server-assigned [`MessageId`]). The transition from one to the other
//! happens in exactly one place: the store's identity resolution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::{ConversationId, UserId};

/// Maximum message length in characters, after trimming.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Wraps a raw server id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw server id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated identifier for a message awaiting confirmation.
///
/// UUID v7, so provisional ids created by one client are time-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisionalId(Uuid);

impl ProvisionalId {
    /// Creates a fresh provisional id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ProvisionalId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProvisionalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p-{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff(self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Shifts the timestamp back, saturating at the epoch.
    #[must_use]
    pub const fn saturating_sub_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// Shifts the timestamp forward, saturating at `u64::MAX`.
    #[must_use]
    pub const fn saturating_add_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Fields shared by pending and confirmed messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Text content.
    pub content: String,
    /// Creation time. For pending messages this is the local clock.
    pub created_at: Timestamp,
}

/// A locally created message that the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Locally unique identity until confirmation.
    pub provisional_id: ProvisionalId,
    /// Message fields.
    pub body: MessageBody,
    /// Set when the send was rejected or timed out.
    pub failure: Option<String>,
}

/// A message carrying a server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedMessage {
    /// Server-assigned identity.
    pub id: MessageId,
    /// Message fields.
    pub body: MessageBody,
    /// Whether the message has been read by its recipient.
    pub read: bool,
    /// The provisional id the sending client attached, when the server echoes it.
    pub client_ref: Option<ProvisionalId>,
}

/// Delivery lifecycle as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Sent locally, awaiting the server.
    Pending,
    /// Confirmed by the server.
    Sent,
    /// Rejected or timed out; kept visible for retry or discard.
    Failed,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Identity of a timeline entry.
///
/// Confirmed ids order before provisional ids, so at equal timestamps a
/// confirmed message always precedes a local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKey {
    /// Server-assigned id.
    Confirmed(MessageId),
    /// Local provisional id.
    Provisional(ProvisionalId),
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed(id) => write!(f, "{id}"),
            Self::Provisional(id) => write!(f, "{id}"),
        }
    }
}

/// A timeline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Local message awaiting server confirmation (or failed).
    Pending(PendingMessage),
    /// Server-confirmed message.
    Confirmed(ConfirmedMessage),
}

impl Message {
    /// Returns the shared message fields.
    #[must_use]
    pub const fn body(&self) -> &MessageBody {
        match self {
            Self::Pending(m) => &m.body,
            Self::Confirmed(m) => &m.body,
        }
    }

    /// Returns the identity used for ordering and deduplication.
    #[must_use]
    pub const fn key(&self) -> MessageKey {
        match self {
            Self::Pending(m) => MessageKey::Provisional(m.provisional_id),
            Self::Confirmed(m) => MessageKey::Confirmed(m.id),
        }
    }

    /// Returns the confirmed id, if any.
    #[must_use]
    pub const fn confirmed_id(&self) -> Option<MessageId> {
        match self {
            Self::Pending(_) => None,
            Self::Confirmed(m) => Some(m.id),
        }
    }

    /// Returns the current delivery state.
    #[must_use]
    pub const fn delivery_state(&self) -> DeliveryState {
        match self {
            Self::Pending(PendingMessage { failure: None, .. }) => DeliveryState::Pending,
            Self::Pending(_) => DeliveryState::Failed,
            Self::Confirmed(_) => DeliveryState::Sent,
        }
    }

    /// Whether the message is marked read. Local messages count as read.
    #[must_use]
    pub const fn is_read(&self) -> bool {
        match self {
            Self::Pending(_) => true,
            Self::Confirmed(m) => m.read,
        }
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> Timestamp {
        self.body().created_at
    }
}

/// Error returned when message content is rejected before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty after trimming.
    #[error("message content is empty")]
    Empty,
    /// Content is longer than [`MAX_CONTENT_CHARS`].
    #[error("message too long ({len} characters, max {max})")]
    TooLong {
        /// Length of the trimmed content in characters.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

/// Trims and validates outgoing message content.
///
/// Length is counted in Unicode scalar values, not bytes.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank input, or
/// [`ValidationError::TooLong`] past [`MAX_CONTENT_CHARS`].
pub fn validate_content(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = trimmed.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(ValidationError::TooLong {
            len,
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(trimmed.to_string())
}
