//! A notepad client talking to an in-process backend over TCP JSON lines.
//!
//! The backend is restarted halfway through; the channel reconnects on its own and the
//! client reloads its notes when it sees the `Connected` event.

use std::{
    error::Error,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sockrpc::{
    ChannelConfig, ChannelEvent, ReconnectPolicy, Request, Response, RpcChannel, TcpConnector,
};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::codec::{Framed, LinesCodec};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Note {
    id: u64,
    title: String,
    content: String,
}

type Notes = Arc<Mutex<Vec<Note>>>;

fn string_param(params: &[Value], index: usize) -> Result<String, String> {
    params
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("param {} must be a string", index))
}

fn id_param(params: &[Value]) -> Result<u64, String> {
    params
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| "param 0 must be a note id".to_string())
}

fn handle(notes: &Notes, request: &Request) -> Result<Value, String> {
    let mut notes = notes.lock().map_err(|_| "notes are unavailable".to_string())?;
    let params = &request.params;
    match request.function.as_str() {
        "get_notes" => Ok(json!(*notes)),
        "add_note" => {
            let id = notes.iter().map(|n| n.id).max().unwrap_or(0) + 1;
            let note = Note {
                id,
                title: string_param(params, 0)?,
                content: string_param(params, 1)?,
            };
            notes.push(note.clone());
            Ok(json!(note))
        }
        "update_note" => {
            let id = id_param(params)?;
            let title = string_param(params, 1)?;
            let content = string_param(params, 2)?;
            match notes.iter_mut().find(|n| n.id == id) {
                Some(note) => {
                    note.title = title;
                    note.content = content;
                    Ok(json!(note))
                }
                None => Ok(Value::Null),
            }
        }
        "delete_note" => {
            let id = id_param(params)?;
            notes.retain(|n| n.id != id);
            Ok(json!(true))
        }
        other => Err(format!("unknown function {}", other)),
    }
}

/// Serves the notepad on `addr` until the returned set is shut down.
async fn start_backend(addr: SocketAddr, notes: Notes) -> Result<JoinSet<()>, Box<dyn Error>> {
    let listener = TcpListener::bind(addr).await?;
    let mut server = JoinSet::new();
    server.spawn(async move {
        let mut connections = JoinSet::new();
        while let Ok((socket, peer)) = listener.accept().await {
            println!("backend: client {} connected", peer);
            let notes = notes.clone();
            connections.spawn(async move {
                let mut framed = Framed::new(socket, LinesCodec::new());
                while let Some(Ok(line)) = framed.next().await {
                    let response = match Request::decode(&line) {
                        Ok(request) => match handle(&notes, &request) {
                            Ok(result) => Response::ok(result),
                            Err(message) => Response::failure(message),
                        },
                        Err(e) => Response::failure(e.to_string()),
                    };
                    let Ok(text) = response.encode() else { break };
                    if framed.send(text).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(server)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let notes: Notes = Arc::new(Mutex::new(vec![Note {
        id: 1,
        title: "Welcome".into(),
        content: "Notes live on the backend.".into(),
    }]));

    let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let mut backend = start_backend(addr, notes.clone()).await?;

    let config = ChannelConfig::default()
        .with_reconnect(ReconnectPolicy::fixed(Duration::from_millis(500)));
    let channel = RpcChannel::open(TcpConnector::new(addr.to_string()), config)?;
    let mut events = channel.subscribe();

    // Reload the notes every time the connection comes up.
    let watcher = tokio::spawn({
        let channel = channel.clone();
        async move {
            while let Ok(event) = events.recv().await {
                println!("client: {:?}", event);
                if event == ChannelEvent::Connected {
                    match channel.call::<_, Vec<Note>>("get_notes", &()).await {
                        Ok(notes) => println!("client: loaded {} notes", notes.len()),
                        Err(e) => println!("client: failed to load notes: {}", e),
                    }
                }
            }
        }
    });

    channel.wait_open().await?;
    let note: Note = channel
        .call("add_note", &("Shopping", "milk, bread"))
        .await?;
    println!("client: added {:?}", note);
    let updated: Option<Note> = channel
        .call("update_note", &(note.id, "Shopping", "milk, bread, eggs"))
        .await?;
    println!("client: updated {:?}", updated);

    println!("backend: restarting");
    backend.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    backend = start_backend(addr, notes).await?;

    channel.wait_open().await?;
    // The state can still read open until the drop is noticed; retry across the gap.
    let mut deleted = false;
    for _ in 0..10 {
        match channel.call::<_, bool>("delete_note", &[1]).await {
            Ok(result) => {
                deleted = result;
                break;
            }
            Err(e) if e.is_connection_error() => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                channel.wait_open().await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    println!("client: deleted welcome note: {}", deleted);

    let remaining: Vec<Note> = channel.call("get_notes", &()).await?;
    println!("client: {} notes remain", remaining.len());

    channel.shutdown().await;
    watcher.abort();
    backend.shutdown().await;
    Ok(())
}
