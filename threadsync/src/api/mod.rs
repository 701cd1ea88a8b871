//! Collaborator API consumed by the sync core.
//!
//! Defines the [`ChatApi`] trait covering the three request/response
//! collaborators (history fetch, send, read receipt). Implementations:
//! - [`http::HttpChatApi`]: REST client over `reqwest`
//! - [`memory::InMemoryChatApi`]: in-process fake server for tests and demos

pub mod http;
pub mod memory;

use threadsync_proto::api::{HistoryPage, HistoryQuery, SendRequest, WireMessage};
use threadsync_proto::conversation::ConversationId;
use threadsync_proto::message::MessageId;

/// Errors returned by a [`ChatApi`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request could not be completed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The server refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The service is temporarily unavailable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// An endpoint URL could not be built.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Async collaborator API for one authenticated user.
///
/// Implementations must be cheap to share behind an `Arc`; the sync core
/// issues calls from spawned tasks.
pub trait ChatApi: Send + Sync + 'static {
    /// Fetches one page of a conversation's history.
    fn fetch_history(
        &self,
        conversation: ConversationId,
        query: HistoryQuery,
    ) -> impl std::future::Future<Output = Result<HistoryPage, ApiError>> + Send;

    /// Posts a message and returns the server-confirmed record.
    fn send_message(
        &self,
        conversation: ConversationId,
        request: SendRequest,
    ) -> impl std::future::Future<Output = Result<WireMessage, ApiError>> + Send;

    /// Advances the server-side read boundary.
    fn put_read_boundary(
        &self,
        conversation: ConversationId,
        message_id: MessageId,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;
}
