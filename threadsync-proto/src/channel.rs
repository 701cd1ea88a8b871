//! Push-channel payloads and WebSocket control frames.
//!
//! Control frames are exchanged as JSON text frames between the client and
//! the push gateway. A client subscribes to one topic per conversation
//! (see [`crate::conversation::topic_for`]) and then receives
//! [`ControlFrame::Event`] frames whose `payload` decodes to a
//! [`ChannelEvent`].

use serde::{Deserialize, Serialize};

use crate::api::WireMessage;
use crate::conversation::{ConversationId, UserId};
use crate::message::MessageId;

/// An inbound event on a conversation topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// A message was created (by either participant).
    MessageCreated {
        /// The confirmed message.
        message: WireMessage,
    },
    /// A participant advanced their read boundary.
    MessageRead {
        /// Conversation the receipt belongs to.
        conversation_id: ConversationId,
        /// Who read.
        reader_id: UserId,
        /// Highest message id they have seen.
        message_id: MessageId,
    },
    /// Any event type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl ChannelEvent {
    /// Conversation the event targets, if it names one.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::MessageCreated { message } => Some(message.conversation_id),
            Self::MessageRead {
                conversation_id, ..
            } => Some(*conversation_id),
            Self::Unknown => None,
        }
    }
}

/// Frames exchanged with the push gateway over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Client asks to receive events for a topic.
    Subscribe {
        /// Topic name.
        topic: String,
        /// Bearer token, when the gateway requires one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Client stops receiving events for a topic.
    Unsubscribe {
        /// Topic name.
        topic: String,
    },
    /// Gateway accepted the subscription.
    Subscribed {
        /// Topic name echoed back.
        topic: String,
    },
    /// Gateway refused the subscription (authorization, unknown topic).
    Rejected {
        /// Topic name echoed back.
        topic: String,
        /// Human-readable reason.
        reason: String,
    },
    /// An event published on a topic.
    Event {
        /// Topic name.
        topic: String,
        /// Raw event payload, decoded separately into [`ChannelEvent`].
        payload: serde_json::Value,
    },
}
