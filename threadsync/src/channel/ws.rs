//! WebSocket push gateway transport.
//!
//! One WebSocket connection per subscription. The client sends a
//! [`ControlFrame::Subscribe`] text frame, waits for `Subscribed` or
//! `Rejected`, then forwards the payload of every matching
//! [`ControlFrame::Event`] until the socket closes.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use threadsync_proto::channel::ControlFrame;
use threadsync_proto::codec;

use super::{ChannelTransport, Subscription, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default timeout for the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the subscription acknowledgment.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer between the socket reader and the subscription.
const PAYLOAD_BUFFER: usize = 256;

/// [`ChannelTransport`] backed by a WebSocket push gateway.
#[derive(Debug, Clone)]
pub struct WsChannelTransport {
    url: String,
    token: Option<String>,
    connect_timeout: Duration,
    subscribe_timeout: Duration,
}

impl WsChannelTransport {
    /// Creates a transport for the gateway at `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
        }
    }

    /// Overrides the handshake and acknowledgment timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, subscribe: Duration) -> Self {
        self.connect_timeout = connect;
        self.subscribe_timeout = subscribe;
        self
    }

    /// Gateway URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_control(ws: &mut WsStream, frame: &ControlFrame) -> Result<(), TransportError> {
        let text = codec::encode_control(frame)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        ws.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "failed to send control frame");
            TransportError::ConnectionClosed
        })
    }

    /// Waits for the gateway's answer to a subscribe request.
    async fn await_ack(ws: &mut WsStream, topic: &str) -> Result<(), TransportError> {
        loop {
            let frame = match ws.next().await {
                Some(Ok(Message::Text(text))) => codec::decode_control(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => codec::decode_control(&data),
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TransportError::Io(std::io::Error::other(format!(
                        "WebSocket error during subscribe: {e}"
                    ))));
                }
            };
            match frame {
                Ok(ControlFrame::Subscribed { topic: acked }) if acked == topic => return Ok(()),
                Ok(ControlFrame::Rejected { reason, .. }) => {
                    return Err(TransportError::Unauthorized(reason));
                }
                Ok(other) => {
                    tracing::debug!(?other, "ignoring frame while awaiting subscription ack");
                }
                Err(e) => {
                    return Err(TransportError::Protocol(format!(
                        "malformed subscription ack: {e}"
                    )));
                }
            }
        }
    }
}

impl ChannelTransport for WsChannelTransport {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (mut ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %self.url, "gateway connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %self.url, err = %e, "gateway connect failed");
                map_ws_connect_error(e)
            })?;

        let subscribe = ControlFrame::Subscribe {
            topic: topic.to_string(),
            token: self.token.clone(),
        };
        Self::send_control(&mut ws, &subscribe).await?;

        tokio::time::timeout(self.subscribe_timeout, Self::await_ack(&mut ws, topic))
            .await
            .map_err(|_| {
                tracing::warn!(url = %self.url, topic, "subscription ack timed out");
                TransportError::Timeout
            })??;
        tracing::info!(url = %self.url, topic, "subscribed to push gateway");

        let (tx, rx) = mpsc::channel(PAYLOAD_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(reader_loop(ws, topic.to_string(), tx, shutdown_rx));

        Ok(Subscription::new(topic, rx).on_drop(move || {
            let _ = shutdown_tx.send(());
        }))
    }
}

enum ReaderStep {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Shutdown,
}

/// Forwards event payloads until the socket closes or the subscription is
/// dropped.
async fn reader_loop(
    mut ws: WsStream,
    topic: String,
    tx: mpsc::Sender<Vec<u8>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let step = tokio::select! {
            frame = ws.next() => ReaderStep::Frame(frame),
            _ = &mut shutdown => ReaderStep::Shutdown,
        };

        let frame = match step {
            ReaderStep::Shutdown => {
                let unsubscribe = ControlFrame::Unsubscribe {
                    topic: topic.clone(),
                };
                if WsChannelTransport::send_control(&mut ws, &unsubscribe).await.is_ok() {
                    let _ = ws.close(None).await;
                }
                tracing::debug!(topic = %topic, "gateway subscription closed");
                return;
            }
            ReaderStep::Frame(None) => break,
            ReaderStep::Frame(Some(Err(e))) => {
                tracing::warn!(topic = %topic, err = %e, "gateway read error");
                break;
            }
            ReaderStep::Frame(Some(Ok(Message::Close(_)))) => {
                tracing::info!(topic = %topic, "gateway closed connection");
                break;
            }
            ReaderStep::Frame(Some(Ok(Message::Text(text)))) => codec::decode_control(text.as_bytes()),
            ReaderStep::Frame(Some(Ok(Message::Binary(data)))) => codec::decode_control(&data),
            ReaderStep::Frame(Some(Ok(_))) => continue,
        };

        match frame {
            Ok(ControlFrame::Event {
                topic: event_topic,
                payload,
            }) if event_topic == topic => {
                let bytes = match serde_json::to_vec(&payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(topic = %topic, err = %e, "unencodable event payload, skipping");
                        continue;
                    }
                };
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
            Ok(ControlFrame::Event {
                topic: event_topic, ..
            }) => {
                tracing::debug!(expected = %topic, got = %event_topic, "event for another topic");
            }
            Ok(other) => {
                tracing::debug!(?other, "ignoring control frame");
            }
            Err(e) => {
                tracing::warn!(topic = %topic, err = %e, "malformed gateway frame, skipping");
            }
        }
    }
    tracing::info!(topic = %topic, "gateway reader exiting");
}

/// Maps a handshake failure to a [`TransportError`].
///
/// HTTP 401 and 403 are authorization failures and therefore terminal.
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable => {
                TransportError::Unreachable(io_err.to_string())
            }
            _ => TransportError::Io(io_err),
        },
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                TransportError::Unauthorized(format!("gateway returned HTTP {status}"))
            } else {
                TransportError::Unreachable(format!("gateway returned HTTP {status}"))
            }
        }
        other => TransportError::Io(std::io::Error::other(format!(
            "gateway connection error: {other}"
        ))),
    }
}
