//! Request and response shapes for the REST collaborator API.
//!
//! ```text
//! GET  /conversations/{id}/messages?page=&after=   -> HistoryPage
//! POST /conversations/{id}/messages                -> WireMessage
//! PUT  /conversations/{id}/read-boundary           -> ack
//! ```

use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationId, UserId};
use crate::message::{ConfirmedMessage, MessageBody, MessageId, ProvisionalId, Timestamp};

/// A message as the server serializes it (history items, send responses,
/// and push-channel payloads all use this shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Text content.
    pub content: String,
    /// Server creation time in milliseconds since the epoch.
    pub created_at: Timestamp,
    /// Read flag as known by the server.
    #[serde(default)]
    pub read: bool,
    /// Provisional id supplied by the sending client, if the server echoes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<ProvisionalId>,
}

impl WireMessage {
    /// Converts the wire shape into the timeline model.
    #[must_use]
    pub fn into_confirmed(self) -> ConfirmedMessage {
        ConfirmedMessage {
            id: self.id,
            body: MessageBody {
                conversation_id: self.conversation_id,
                sender_id: self.sender_id,
                content: self.content,
                created_at: self.created_at,
            },
            read: self.read,
            client_ref: self.client_ref,
        }
    }
}

impl From<&ConfirmedMessage> for WireMessage {
    fn from(msg: &ConfirmedMessage) -> Self {
        Self {
            id: msg.id,
            conversation_id: msg.body.conversation_id,
            sender_id: msg.body.sender_id,
            content: msg.body.content.clone(),
            created_at: msg.body.created_at,
            read: msg.read,
            client_ref: msg.client_ref,
        }
    }
}

/// One page of conversation history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Messages on this page, in any order.
    pub items: Vec<WireMessage>,
    /// Whether another page follows.
    pub has_more: bool,
}

/// Parameters for a history fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Zero-based page index.
    pub page: u32,
    /// Only return messages newer than this id (gap-fill).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<MessageId>,
}

impl HistoryQuery {
    /// First page of the full history.
    #[must_use]
    pub const fn first() -> Self {
        Self {
            page: 0,
            after: None,
        }
    }

    /// First page of messages newer than `after`.
    #[must_use]
    pub const fn newer_than(after: MessageId) -> Self {
        Self {
            page: 0,
            after: Some(after),
        }
    }

    /// The same query advanced by one page.
    #[must_use]
    pub const fn next_page(self) -> Self {
        Self {
            page: self.page.saturating_add(1),
            after: self.after,
        }
    }
}

/// Body of `POST /conversations/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Validated, trimmed content.
    pub content: String,
    /// Provisional id, echoed back by servers that support it.
    pub client_ref: ProvisionalId,
}

/// Body of `PUT /conversations/{id}/read-boundary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBoundaryRequest {
    /// Highest message id the local user has seen.
    pub message_id: MessageId,
}
