//! Bidirectional traffic: both ends of one session call and push.

mod common;

use std::time::Duration;

use biplex::prelude::*;
use biplex::MessageSetting;

#[tokio::test]
async fn test_server_pushes_during_call() {
    common::init_tracing();

    let server = common::default_peer();
    server
        .route_call("group/home/Test", |ctx: CallCtx, _arg: String| async move {
            ctx.session()
                .push("/push/test", "test push text".to_string())
                .await?;
            Ok::<_, Status>("test call result text".to_string())
        })
        .unwrap();

    let client = common::default_peer();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    client
        .route_push("push/Test", move |_ctx: PushCtx, text: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(text);
                Ok(())
            }
        })
        .unwrap();

    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let reply: String = cli
        .call("/group/home/test", "request".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "test call result text");

    let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("push should arrive")
        .unwrap();
    assert_eq!(pushed, "test push text");
}

#[tokio::test]
async fn test_concurrent_calls_complete_out_of_order() {
    common::init_tracing();

    let server = common::default_peer();
    server
        .route_call("test/Delay", |_ctx: CallCtx, ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, Status>(ms)
        })
        .unwrap();

    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let slow = cli
        .send_call::<u64, u64>("/test/delay", 300, MessageSetting::new())
        .await
        .unwrap();
    let fast = cli
        .send_call::<u64, u64>("/test/delay", 30, MessageSetting::new())
        .await
        .unwrap();
    assert_ne!(slow.seq(), fast.seq(), "in-flight calls get distinct seqs");

    let started = tokio::time::Instant::now();
    let fast_reply = fast.result().await.unwrap();
    let fast_elapsed = started.elapsed();
    let slow_reply = slow.result().await.unwrap();

    // Replies correlate by sequence even though the second call finished
    // first.
    assert_eq!(fast_reply, 30);
    assert_eq!(slow_reply, 300);
    assert!(
        fast_elapsed < Duration::from_millis(250),
        "fast call must not wait behind the slow one (took {fast_elapsed:?})"
    );
}

#[tokio::test]
async fn test_handler_calls_back_over_same_session() {
    common::init_tracing();

    // The client serves a prefix lookup; the server's handler calls it
    // while formatting its own reply.
    let client = common::default_peer();
    client
        .route_call("client/Prefix", |_ctx: CallCtx, _arg: ()| async move {
            Ok::<_, Status>("PREFIX:".to_string())
        })
        .unwrap();

    let server = common::default_peer();
    server
        .route_call("test/Format", |ctx: CallCtx, arg: String| async move {
            let prefix: String = ctx.session().call("/client/prefix", ()).await?;
            Ok::<_, Status>(format!("{prefix}{arg}"))
        })
        .unwrap();

    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let reply: String = cli.call("/test/format", "tail".to_string()).await.unwrap();
    assert_eq!(reply, "PREFIX:tail");
}

#[tokio::test]
async fn test_dropped_call_cmd_leaves_session_usable() {
    common::init_tracing();

    let server = common::default_peer();
    server
        .route_call("test/Slow", |_ctx: CallCtx, _arg: String| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, Status>("too late".to_string())
        })
        .unwrap();
    server
        .route_call("test/Quick", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();

    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let cmd = cli
        .send_call::<String, String>("/test/slow", "x".to_string(), MessageSetting::new())
        .await
        .unwrap();
    drop(cmd); // cancels locally; the slot is released

    let reply: String = cli.call("/test/quick", "ok".to_string()).await.unwrap();
    assert_eq!(reply, "ok");
}
