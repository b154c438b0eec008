use std::{io, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Error occurred during I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error occurred while encoding or decoding JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport could not be opened.
    #[error("connection failed: {source}")]
    Connect {
        /// The underlying failure.
        source: io::Error,
    },

    /// A call was attempted while the channel was not open.
    #[error("not connected")]
    NotConnected,

    /// The connection dropped while the call was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// An inbound payload could not be read as a response envelope.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The backend reported a failure in the response envelope.
    #[error("{0}")]
    Remote(RemoteError),

    /// No response arrived within the call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Error reported by the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// The channel configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Error related to the RPC protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A failure reported by the backend for a single call.
///
/// The backend signals failure with `"success": false` and/or an `"error"` string. The
/// `result` field of the envelope is kept as well, since some backends put details there.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("remote error: {message}")]
pub struct RemoteError {
    pub message: String,
    pub result: Value,
}

impl RpcError {
    /// True for errors caused by the connection rather than the call itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RpcError::NotConnected
                | RpcError::ConnectionLost
                | RpcError::Connect { .. }
                | RpcError::Io(_)
                | RpcError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
