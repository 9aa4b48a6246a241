//! Transport seam between the channel state machine and the wire.
//!
//! The state machine only sees [`ChannelFactory`] and [`ChannelLink`], so it
//! carries no dependency on any particular websocket library. The shipped
//! implementation speaks tokio-tungstenite; tests substitute in-memory
//! links.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::channel::proto::{ClientFrame, ServerFrame};

/// Production websocket endpoint for the console event channel.
pub const CHANNEL_ENDPOINT: &str = "wss://console.nexuswatch.io/v1/ws";
/// Local development websocket endpoint.
pub const LOCAL_CHANNEL_ENDPOINT: &str = "ws://localhost:5000/v1/ws";

/// Errors produced by channel transport and frame handling.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Frame serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The link is gone and cannot carry further frames.
    #[error("channel link is closed")]
    Closed,
}

/// Opens one authenticated link per call.
///
/// The token is the caller's credential snapshot at connect time; later
/// credential changes never affect an already-open link.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, token: Option<SecretString>)
        -> Result<Box<dyn ChannelLink>, ChannelError>;
}

/// One live bidirectional connection.
#[async_trait]
pub trait ChannelLink: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError>;

    /// Receives the next inbound frame.
    ///
    /// `None` means the link ended (peer close or transport teardown);
    /// `Some(Err(_))` is a decode failure on an otherwise-live link.
    async fn recv(&mut self) -> Option<Result<ServerFrame, ChannelError>>;

    async fn close(&mut self);
}

/// tokio-tungstenite implementation of the factory seam.
#[derive(Clone)]
pub struct WsChannelFactory {
    endpoint: String,
}

impl WsChannelFactory {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end().to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Default for WsChannelFactory {
    fn default() -> Self {
        Self::new(CHANNEL_ENDPOINT)
    }
}

#[async_trait]
impl ChannelFactory for WsChannelFactory {
    async fn open(
        &self,
        token: Option<SecretString>,
    ) -> Result<Box<dyn ChannelLink>, ChannelError> {
        let (socket, _) = connect_async(self.endpoint.as_str()).await?;
        debug!(event = "channel_dialed", endpoint = %self.endpoint);

        let mut link = WsLink { socket };
        link.send(ClientFrame::Auth {
            token: token.map(|token| token.expose_secret().clone()),
        })
        .await?;

        Ok(Box::new(link))
    }
}

struct WsLink {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChannelLink for WsLink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError> {
        let text = frame.to_text()?;
        self.socket.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ServerFrame, ChannelError>> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(ServerFrame::from_text(&text).map_err(ChannelError::Json));
                }
                Some(Ok(Message::Ping(payload))) => {
                    if self.socket.send(Message::Pong(payload)).await.is_err() {
                        return None;
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => {
                    debug!(event = "non_text_frame_ignored");
                }
                Some(Err(err)) => return Some(Err(ChannelError::WebSocket(err))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}
