//! Call timeouts and cancellation. Runs on a paused clock.

#![allow(clippy::tests_outside_test_module)]

mod common;

use std::time::Duration;

use common::{answer, connected, quick_config, serve};
use serde_json::json;
use sockrpc::{ChannelConfig, ChannelEvent, ChannelState, Correlation, Response, RpcError};
use tokio::{
    task,
    time::{sleep, timeout},
};
use tracing_test::traced_test;

#[tokio::test(start_paused = true)]
async fn test_call_timeout_discards_late_response() -> Result<(), Box<dyn std::error::Error>> {
    let config = ChannelConfig::default().with_call_timeout(Some(Duration::from_secs(2)));
    let (channel, mut peer, _, _) = connected(config).await;

    let slow = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("slow")]).await }
    });
    let request = peer.recv_request().await?;
    match slow.await? {
        Err(RpcError::Timeout(limit)) => assert_eq!(limit, Duration::from_secs(2)),
        other => panic!("Expected timeout, got {:?}", other),
    }

    // The answer to the timed out call shows up after all.
    peer.respond(&answer(&request))?;
    let next = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("next")]).await }
    });
    let request = peer.recv_request().await?;
    assert_eq!(request.params, vec![json!("next")]);
    peer.respond(&answer(&request))?;

    assert_eq!(next.await??, json!(["next"]));
    assert_eq!(channel.state(), ChannelState::Open);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_queued_call_waits_for_owed_reply() -> Result<(), Box<dyn std::error::Error>> {
    let (channel, mut peer, _, _) = connected(ChannelConfig::default()).await;

    let slow = task::spawn({
        let channel = channel.clone();
        async move {
            channel
                .invoke_with_timeout("echo", vec![json!("slow")], Some(Duration::from_secs(1)))
                .await
        }
    });
    let first = peer.recv_request().await?;
    let queued = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("queued")]).await }
    });
    assert!(matches!(slow.await?, Err(RpcError::Timeout(_))));

    // Nothing else goes out until the timed out call's reply has been read.
    assert!(timeout(Duration::from_millis(500), peer.recv()).await.is_err());
    peer.respond(&answer(&first))?;

    let second = peer.recv_request().await?;
    assert_eq!(second.params, vec![json!("queued")]);
    peer.respond(&answer(&second))?;
    assert_eq!(queued.await??, json!(["queued"]));
    Ok(())
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn test_missing_reply_recycles_connection() -> Result<(), Box<dyn std::error::Error>> {
    let config = quick_config()
        .with_call_timeout(Some(Duration::from_secs(1)))
        .with_owed_reply_timeout(Duration::from_secs(2));
    let (channel, mut peer, connector, mut listener) = connected(config).await;
    let mut events = channel.subscribe();

    // The backend never answers this one.
    let lost = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("lost")]).await }
    });
    peer.recv_request().await?;
    assert!(matches!(lost.await?, Err(RpcError::Timeout(_))));

    let held = task::spawn({
        let channel = channel.clone();
        async move {
            channel
                .invoke_with_timeout("echo", vec![json!("held")], None)
                .await
        }
    });
    assert!(timeout(Duration::from_millis(500), peer.recv()).await.is_err());

    // Once the owed reply is overdue the link is dropped and the held call rejected.
    assert!(matches!(held.await?, Err(RpcError::ConnectionLost)));
    assert!(logs_contain("recycling connection"));
    assert_eq!(events.recv().await?, ChannelEvent::Disconnected);
    assert!(peer.recv().await.is_none());

    let peer = listener.accept().await.unwrap();
    channel.wait_open().await?;
    task::spawn(serve(peer));
    for i in 0..3 {
        assert_eq!(channel.invoke("echo", vec![json!(i)]).await?, json!([i]));
    }
    assert_eq!(connector.attempts(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_timeout_waits_indefinitely() -> Result<(), Box<dyn std::error::Error>> {
    let (channel, mut peer, _, _) = connected(ChannelConfig::default()).await;

    let call = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke_with_timeout("add", vec![json!(20), json!(22)], None).await }
    });
    let request = peer.recv_request().await?;
    sleep(Duration::from_secs(600)).await;
    assert!(!call.is_finished());

    peer.respond(&answer(&request))?;
    assert_eq!(call.await??, json!(42));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_in_flight_call() -> Result<(), Box<dyn std::error::Error>> {
    let (channel, mut peer, _, _) = connected(ChannelConfig::default()).await;

    let cancelled = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("cancelled")]).await }
    });
    let first = peer.recv_request().await?;
    cancelled.abort();
    assert!(cancelled.await.unwrap_err().is_cancelled());

    let call = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("kept")]).await }
    });
    // The reply to the cancelled call still arrives and is discarded.
    peer.respond(&answer(&first))?;
    let second = peer.recv_request().await?;
    assert_eq!(second.params, vec![json!("kept")]);
    peer.respond(&answer(&second))?;
    assert_eq!(call.await??, json!(["kept"]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_queued_call_is_never_sent() -> Result<(), Box<dyn std::error::Error>> {
    let (channel, mut peer, _, _) = connected(ChannelConfig::default()).await;

    let first = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("a")]).await }
    });
    let request = peer.recv_request().await?;

    let dropped = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("b")]).await }
    });
    sleep(Duration::from_millis(10)).await;
    dropped.abort();
    assert!(dropped.await.unwrap_err().is_cancelled());

    let last = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("echo", vec![json!("c")]).await }
    });
    sleep(Duration::from_millis(10)).await;

    peer.respond(&answer(&request))?;
    assert_eq!(first.await??, json!(["a"]));

    let request = peer.recv_request().await?;
    assert_eq!(request.params, vec![json!("c")]);
    peer.respond(&answer(&request))?;
    assert_eq!(last.await??, json!(["c"]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_tagged_timeout_ignores_late_id() -> Result<(), Box<dyn std::error::Error>> {
    let config = ChannelConfig::default()
        .with_correlation(Correlation::Tagged)
        .with_call_timeout(Some(Duration::from_secs(1)));
    let (channel, mut peer, _, _) = connected(config).await;

    let slow = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("upper", vec![json!("slow")]).await }
    });
    let late = peer.recv_request().await?;
    assert!(matches!(slow.await?, Err(RpcError::Timeout(_))));

    let call = task::spawn({
        let channel = channel.clone();
        async move { channel.invoke("upper", vec![json!("fast")]).await }
    });
    let request = peer.recv_request().await?;
    assert_ne!(request.id, late.id);

    peer.respond(&answer(&late))?;
    peer.respond(&Response::ok(json!("FAST")).with_id(request.id.unwrap()))?;
    assert_eq!(call.await??, json!("FAST"));
    Ok(())
}
