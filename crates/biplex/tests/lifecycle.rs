//! Graceful shutdown and session lifecycle.

mod common;

use std::time::Duration;

use biplex::prelude::*;

#[tokio::test]
async fn test_close_waits_for_running_handler() {
    common::init_tracing();

    let server = common::default_peer();
    server
        .route_call("test/Work", |_ctx: CallCtx, arg: String| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, Status>(format!("done: {arg}"))
        })
        .unwrap();

    let client = common::default_peer();
    let (srv, cli) = common::mem_pair(&server, &client).await;

    let call = tokio::spawn({
        let cli = cli.clone();
        async move { cli.call::<_, String>("/test/work", "x".to_string()).await }
    });

    // Let the handler start, then close the server side under it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    srv.close().await.unwrap();
    assert_eq!(srv.status(), SessionStatus::ActiveClosed);

    // The reply was written before the hard close.
    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply, "done: x");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    common::init_tracing();
    let server = common::default_peer();
    let client = common::default_peer();
    let (srv, _cli) = common::mem_pair(&server, &client).await;

    srv.close().await.unwrap();
    srv.close().await.unwrap();
    assert_eq!(srv.status(), SessionStatus::ActiveClosed);
}

#[tokio::test]
async fn test_local_close_drains_pending_calls() {
    common::init_tracing();

    let server = common::default_peer();
    server
        .route_call("test/Forever", |_ctx: CallCtx, _arg: String| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Status>(String::new())
        })
        .unwrap();

    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let pending = cli
        .send_call::<String, String>("/test/forever", "x".to_string(), MessageSetting::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closer = tokio::spawn({
        let cli = cli.clone();
        async move { cli.close().await }
    });

    let err = pending.result().await.unwrap_err();
    assert_eq!(err.code(), biplex::code::CONN_CLOSED);
    closer.await.unwrap().unwrap();
    assert_eq!(cli.status(), SessionStatus::ActiveClosed);
}

#[tokio::test]
async fn test_peer_close_closes_every_session() {
    common::init_tracing();

    let server = common::default_peer();
    server
        .route_call("echo/Text", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();
    let client = common::default_peer();

    let (srv_a, cli_a) = common::mem_pair(&server, &client).await;
    let (srv_b, cli_b) = common::mem_pair(&server, &client).await;
    assert_eq!(server.count_session(), 2);

    let reply: String = cli_a.call("/echo/text", "a".to_string()).await.unwrap();
    assert_eq!(reply, "a");
    let reply: String = cli_b.call("/echo/text", "b".to_string()).await.unwrap();
    assert_eq!(reply, "b");

    server.close().await.unwrap();
    assert_eq!(server.count_session(), 0);
    assert_eq!(srv_a.status(), SessionStatus::ActiveClosed);
    assert_eq!(srv_b.status(), SessionStatus::ActiveClosed);

    // The clients observe the loss.
    let err = cli_a
        .call::<_, String>("/echo/text", "late".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code(), biplex::code::CONN_CLOSED);
}
