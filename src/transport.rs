//! Transport abstraction and the socket connectors.
//!
//! A [`Connector`] opens a fresh [`Link`] to an endpoint each time it is asked. The link
//! maps the transport events the channel cares about onto a sink and a stream:
//!
//! - open: `connect()` returned a link
//! - message: the stream yields `Ok(text)`
//! - error: the stream yields `Err(e)`, without ending
//! - close: the stream ends
//!
//! The TCP and Unix connectors frame each JSON message as one line of text.

use std::{
    path::{Path, PathBuf},
    pin::Pin,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, Sink, SinkExt, Stream, StreamExt, TryStreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, UnixStream},
};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::trace;

use crate::error::*;

/// Longest accepted line for the JSON-lines connectors.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Outbound half of a link.
pub type LinkSink = Pin<Box<dyn Sink<String, Error = RpcError> + Send>>;

/// Inbound half of a link.
pub type LinkStream = BoxStream<'static, Result<String>>;

/// One open transport instance. Dropping it closes the transport.
pub struct Link {
    pub sink: LinkSink,
    pub stream: LinkStream,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    /// Creates a link from a text sink and a text stream.
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = RpcError> + Send + 'static,
        St: Stream<Item = Result<String>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        }
    }

    /// Creates a link over a byte stream, one JSON message per line.
    pub fn lines<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (sink, stream) = framed.split::<String>();
        Self::new(sink.sink_map_err(lines_error), stream.map_err(lines_error))
    }
}

fn lines_error(error: LinesCodecError) -> RpcError {
    match error {
        LinesCodecError::Io(e) => RpcError::Io(e),
        other => RpcError::Transport(other.to_string()),
    }
}

/// Opens links to a single endpoint.
///
/// Every call to `connect` must produce an independent transport instance; the channel
/// discards the previous one before asking for another.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new link.
    async fn connect(&self) -> Result<Link>;

    /// A description of the endpoint for log messages.
    fn endpoint(&self) -> String;
}

/// Connects over TCP, exchanging newline-delimited JSON.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Creates a connector for a `host:port` address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Link> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| RpcError::Connect { source })?;
        stream.set_nodelay(true)?;
        trace!("TCP connection established to: {}", self.addr);
        Ok(Link::lines(stream))
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Connects over a Unix domain socket, exchanging newline-delimited JSON.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    /// Creates a connector for the socket at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> Result<Link> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| RpcError::Connect { source })?;
        trace!("Unix connection established to: {:?}", self.path);
        Ok(Link::lines(stream))
    }

    fn endpoint(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}
