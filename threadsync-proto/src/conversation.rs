//! Conversation identity and metadata.

use serde::{Deserialize, Serialize};

use crate::message::Timestamp;

macro_rules! server_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
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

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

server_id!(
    /// Server-assigned conversation identifier.
    ConversationId
);
server_id!(
    /// Server-assigned user identifier.
    UserId
);
server_id!(
    /// Marketplace listing a conversation is attached to.
    ListingId
);

/// A two-party thread scoped to one listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identity.
    pub id: ConversationId,
    /// Participants (buyer and seller).
    pub participants: Vec<UserId>,
    /// The listing this conversation is about.
    pub listing_id: ListingId,
    /// Time of the most recent message or update.
    pub last_activity: Timestamp,
}

impl Conversation {
    /// Whether `user` takes part in this conversation.
    #[must_use]
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }

    /// The participant that is not `user`, if there is one.
    #[must_use]
    pub fn counterpart(&self, user: UserId) -> Option<UserId> {
        self.participants.iter().copied().find(|p| *p != user)
    }
}

/// Push-channel topic for a conversation.
#[must_use]
pub fn topic_for(conversation: ConversationId) -> String {
    format!("conversation.{conversation}")
}
