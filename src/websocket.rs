//! WebSocket connector. Each JSON message travels as one text frame.
use std::io;

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message, WebSocketStream};
use tracing::trace;

use crate::{
    error::*,
    transport::{Connector, Link},
};

/// Connects to a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Creates a connector for a `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link> {
        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| match e {
                tungstenite::Error::Io(source) => RpcError::Connect { source },
                other => RpcError::Connect {
                    source: io::Error::new(io::ErrorKind::Other, other),
                },
            })?;
        trace!("WebSocket connection established to: {}", self.url);
        Ok(websocket_link(socket))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// Creates a link over an established WebSocket. Binary frames are accepted if they hold
/// UTF-8; control frames are handled by the socket and skipped here.
pub fn websocket_link<S>(socket: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split::<Message>();
    let sink = sink
        .sink_map_err(ws_error)
        .with(|text: String| future::ready(Ok::<_, RpcError>(Message::Text(text))));
    let stream = stream.map_err(ws_error).try_filter_map(|message| {
        future::ready(match message {
            Message::Text(text) => Ok(Some(text)),
            Message::Binary(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| RpcError::Transport(e.to_string())),
            _ => Ok(None),
        })
    });
    Link::new(sink, stream)
}

fn ws_error(error: tungstenite::Error) -> RpcError {
    match error {
        tungstenite::Error::Io(e) => RpcError::Io(e),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RpcError::ConnectionLost
        }
        other => RpcError::Transport(other.to_string()),
    }
}
