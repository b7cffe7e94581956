//! Per-call and per-session deadlines.

mod common;

use std::time::Duration;

use biplex::prelude::*;
use biplex::{code, MessageSetting};

#[tokio::test]
async fn test_context_age_times_out_slow_handler() {
    common::init_tracing();

    let server = common::peer(PeerConfig {
        default_context_age: Duration::from_millis(300),
        ..Default::default()
    });
    server
        .route_call("test/Timeout", |_ctx: CallCtx, _arg: String| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Status>("too late".to_string())
        })
        .unwrap();
    server
        .route_call("test/Ok", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();

    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let started = tokio::time::Instant::now();
    let err = cli
        .call::<_, String>("/test/timeout", "x".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::HANDLE_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(2));

    // A fast call on the same session still works.
    let reply: String = cli.call("/test/ok", "fine".to_string()).await.unwrap();
    assert_eq!(reply, "fine");
}

#[tokio::test]
async fn test_caller_supplied_context_age_wins_when_shorter() {
    common::init_tracing();

    // No server-side default: the deadline comes from the message meta.
    let server = common::default_peer();
    server
        .route_call("test/Sleepy", |_ctx: CallCtx, _arg: String| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, Status>("too late".to_string())
        })
        .unwrap();

    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let started = tokio::time::Instant::now();
    let err = cli
        .call_with::<_, String>(
            "/test/sleepy",
            "x".to_string(),
            MessageSetting::new().with_context_age(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::HANDLE_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_sub_second_context_age_reaches_the_remote_side() {
    common::init_tracing();

    // The handler reports its remaining deadline: a caller asking for
    // 800ms must be seen as sub-second by the remote peer, not rounded up
    // to a whole second.
    let server = common::default_peer();
    server
        .route_call("test/Remaining", |ctx: CallCtx, _arg: String| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let remaining = ctx.remaining().expect("a deadline applies");
            Ok::<_, Status>(remaining.as_millis() as u64)
        })
        .unwrap();

    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let remaining_ms: u64 = cli
        .call_with(
            "/test/remaining",
            "x".to_string(),
            MessageSetting::new().with_context_age(Duration::from_millis(800)),
        )
        .await
        .unwrap();
    assert!(
        remaining_ms <= 750,
        "remaining was {remaining_ms}ms, deadline must not be inflated"
    );
    assert!(remaining_ms > 300, "remaining was {remaining_ms}ms");
}

#[tokio::test]
async fn test_handler_sees_remaining_deadline() {
    common::init_tracing();

    let server = common::peer(PeerConfig {
        default_context_age: Duration::from_secs(2),
        ..Default::default()
    });
    server
        .route_call("test/Remaining", |ctx: CallCtx, _arg: String| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let remaining = ctx.remaining().expect("a deadline applies");
            Ok::<_, Status>(remaining.as_millis() as u64)
        })
        .unwrap();

    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let remaining_ms: u64 = cli
        .call("/test/remaining", "x".to_string())
        .await
        .unwrap();
    assert!(remaining_ms <= 1_950, "remaining was {remaining_ms}ms");
    assert!(remaining_ms > 500, "remaining was {remaining_ms}ms");
}

#[tokio::test]
async fn test_session_age_closes_the_connection() {
    common::init_tracing();

    let server = common::peer(PeerConfig {
        default_session_age: Duration::from_millis(400),
        ..Default::default()
    });
    server
        .route_call("test/Ok", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();

    let client = common::default_peer();
    let (srv, cli) = common::mem_pair(&server, &client).await;

    // Within the age everything works.
    let reply: String = cli.call("/test/ok", "early".to_string()).await.unwrap();
    assert_eq!(reply, "early");

    // After expiry the server closes and the client observes it.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(srv.status(), SessionStatus::ActiveClosed);

    let err = cli
        .call::<_, String>("/test/ok", "late".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::CONN_CLOSED);
}
