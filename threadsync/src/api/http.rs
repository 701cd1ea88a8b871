//! REST implementation of [`ChatApi`].

use reqwest::{Client, RequestBuilder, Response};
use url::Url;

use threadsync_proto::api::{
    HistoryPage, HistoryQuery, ReadBoundaryRequest, SendRequest, WireMessage,
};
use threadsync_proto::conversation::ConversationId;
use threadsync_proto::message::MessageId;

use super::{ApiError, ChatApi};

/// Maximum number of response body bytes kept in [`ApiError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// JSON-over-HTTP client for the conversation endpoints.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl HttpChatApi {
    /// Creates a client rooted at `base_url` (e.g. `https://api.example.com/v1`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Url`] if `base_url` is not a valid URL.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
            token,
        })
    }

    /// Base URL all endpoints are resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, conversation: ConversationId, suffix: &str) -> Result<Url, ApiError> {
        Ok(self
            .base
            .join(&format!("conversations/{conversation}/{suffix}"))?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Turns a non-success response into [`ApiError::Status`].
async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

impl ChatApi for HttpChatApi {
    async fn fetch_history(
        &self,
        conversation: ConversationId,
        query: HistoryQuery,
    ) -> Result<HistoryPage, ApiError> {
        let url = self.endpoint(conversation, "messages")?;
        let response = self
            .authorize(self.http.get(url).query(&query))
            .send()
            .await?;
        let page = ensure_success(response)
            .await?
            .json::<HistoryPage>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(page)
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        request: SendRequest,
    ) -> Result<WireMessage, ApiError> {
        let url = self.endpoint(conversation, "messages")?;
        let response = self
            .authorize(self.http.post(url).json(&request))
            .send()
            .await?;
        let message = ensure_success(response)
            .await?
            .json::<WireMessage>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(message)
    }

    async fn put_read_boundary(
        &self,
        conversation: ConversationId,
        message_id: MessageId,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(conversation, "read-boundary")?;
        let response = self
            .authorize(self.http.put(url).json(&ReadBoundaryRequest { message_id }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}
