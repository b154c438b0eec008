//! In-process connector.
//!
//! Each successful `connect` hands a [`MemoryPeer`] to the paired [`MemoryListener`]. The
//! peer plays the backend: it reads the channel's requests and writes responses, can inject
//! transport errors, and closes the link by being dropped. The connector can also be told to
//! refuse or stall connection attempts.

use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    error::*,
    message::{Request, Response},
    transport::{Connector, Link},
};

/// How the connector answers the next connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Open a link and hand the peer to the listener.
    #[default]
    Accept,
    /// Fail the attempt with a connection-refused error.
    Refuse,
    /// Never complete the attempt.
    Stall,
}

#[derive(Debug)]
struct Shared {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    mode: Mutex<ConnectMode>,
    attempts: AtomicUsize,
}

/// Connector side of an in-memory endpoint. Clones share the same endpoint.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

/// Receives one [`MemoryPeer`] per accepted connection.
#[derive(Debug)]
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    /// Creates a connector and the listener that accepts its connections.
    pub fn pair() -> (Self, MemoryListener) {
        let (peers, incoming) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(Shared {
                peers,
                mode: Mutex::new(ConnectMode::Accept),
                attempts: AtomicUsize::new(0),
            }),
        };
        (connector, MemoryListener { peers: incoming })
    }

    /// How the next attempts are answered.
    pub fn mode(&self) -> ConnectMode {
        *self
            .shared
            .mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Changes how the next attempts are answered.
    pub fn set_mode(&self, mode: ConnectMode) {
        *self
            .shared
            .mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = mode;
    }

    /// Number of connection attempts made so far, whatever their outcome.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link> {
        let attempt = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("memory connection attempt {}", attempt);
        match self.mode() {
            ConnectMode::Accept => {}
            ConnectMode::Refuse => {
                return Err(RpcError::Connect {
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
                })
            }
            ConnectMode::Stall => futures::future::pending::<()>().await,
        }

        let (outbound_tx, outbound_rx) = unbounded::<String>();
        let (inbound_tx, inbound_rx) = unbounded::<Result<String>>();
        let peer = MemoryPeer {
            incoming: outbound_rx,
            outgoing: inbound_tx,
        };
        self.shared
            .peers
            .send(peer)
            .map_err(|_| RpcError::Connect {
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"),
            })?;
        let sink = outbound_tx.sink_map_err(|_| RpcError::Transport("peer went away".into()));
        Ok(Link::new(sink, inbound_rx))
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryListener {
    /// Waits for the next accepted connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Returns an already accepted connection, if any.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

/// The backend end of one in-memory link. Dropping it closes the link.
#[derive(Debug)]
pub struct MemoryPeer {
    incoming: UnboundedReceiver<String>,
    outgoing: UnboundedSender<Result<String>>,
}

impl MemoryPeer {
    /// Receives the next raw frame written by the channel. `None` once the channel closed
    /// its end.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.next().await
    }

    /// Receives and decodes the next request.
    pub async fn recv_request(&mut self) -> Result<Request> {
        let text = self.recv().await.ok_or(RpcError::ConnectionLost)?;
        Request::decode(&text)
    }

    /// Sends a raw text frame to the channel. Returns false if the channel side is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.outgoing.unbounded_send(Ok(text.into())).is_ok()
    }

    /// Sends an encoded response.
    pub fn respond(&self, response: &Response) -> Result<bool> {
        Ok(self.send(response.encode()?))
    }

    /// Raises a transport error event on the channel side without closing the link.
    pub fn send_error(&self, message: impl Into<String>) -> bool {
        self.outgoing
            .unbounded_send(Err(RpcError::Transport(message.into())))
            .is_ok()
    }

    /// True once the channel side dropped its end of the link.
    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }

    /// Closes the link, as if the backend hung up.
    pub fn close(self) {}
}
