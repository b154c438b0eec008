//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use sockrpc::{
    ChannelConfig, MemoryConnector, MemoryListener, MemoryPeer, ReconnectPolicy, Request,
    Response, RpcChannel,
};

/// Answers a request the way the test backends do.
pub fn answer(request: &Request) -> Response {
    let response = match request.function.as_str() {
        "echo" => Response::ok(Value::Array(request.params.clone())),
        "add" => {
            let sum: i64 = request.params.iter().filter_map(Value::as_i64).sum();
            Response::ok(json!(sum))
        }
        "upper" => match request.params.first().and_then(Value::as_str) {
            Some(text) => Response::ok(json!(text.to_uppercase())),
            None => Response::failure("expected a string"),
        },
        "fail" => Response::failure("bad input"),
        other => Response::failure(format!("unknown function {}", other)),
    };
    match request.id {
        Some(id) => response.with_id(id),
        None => response,
    }
}

/// Serves requests on a memory peer until the channel side goes away.
pub async fn serve(mut peer: MemoryPeer) {
    while let Ok(request) = peer.recv_request().await {
        if !peer.respond(&answer(&request)).unwrap() {
            break;
        }
    }
}

/// A config with a short flat reconnect delay.
pub fn quick_config() -> ChannelConfig {
    ChannelConfig::default().with_reconnect(ReconnectPolicy::fixed(Duration::from_millis(100)))
}

/// Opens a channel over a fresh memory endpoint and waits until it is open.
pub async fn connected(
    config: ChannelConfig,
) -> (RpcChannel, MemoryPeer, MemoryConnector, MemoryListener) {
    let (connector, mut listener) = MemoryConnector::pair();
    let channel = RpcChannel::open(connector.clone(), config).unwrap();
    let peer = listener.accept().await.unwrap();
    channel.wait_open().await.unwrap();
    (channel, peer, connector, listener)
}
