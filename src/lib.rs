//! Reconnecting JSON request/response channel over a persistent socket.
//!
//! An [`RpcChannel`] keeps one connection to a backend open, reconnects after drops, and
//! matches each reply to the call that asked for it. Calls are `{"function", "params"}`
//! JSON objects; replies carry a `result` and optionally `success`/`error`.
//!
//! To make calls:
//! 1. Pick a [`Connector`]: [`TcpConnector`], [`UnixConnector`], `WebSocketConnector` (feature
//!    `websocket`), or [`MemoryConnector`] for tests
//! 2. Create the channel with `RpcChannel::open(connector, ChannelConfig::default())`
//! 3. Use `channel.invoke()` or the typed `channel.call()`
//!
//! The wire format carries no request ids by default, so calls go out one at a time in FIFO
//! order ([`Correlation::Sequential`]). Backends that echo an `id` field can use
//! [`Correlation::Tagged`] to pipeline calls.
//!
//! Uses `tokio` for async I/O and `serde_json` for serialization.

mod channel;
mod config;
mod error;
mod memory;
mod message;
mod pending;
mod transport;
#[cfg(feature = "websocket")]
mod websocket;

pub use channel::*;
pub use config::*;
pub use error::*;
pub use memory::*;
pub use message::*;
pub use transport::*;
#[cfg(feature = "websocket")]
pub use websocket::*;

pub use serde_json::Value;
