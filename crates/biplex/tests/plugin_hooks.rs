//! Plugin hook dispatch around the message paths.

mod common;

use std::sync::{Arc, Mutex};

use biplex::prelude::*;
use biplex::{code, ReadCtx, WriteCtx};

/// Records every hook it sees, in order.
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn new() -> (Arc<dyn Plugin>, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Recorder {
                events: events.clone(),
            }),
            events,
        )
    }
}

impl Plugin for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn pre_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        self.events
            .lock()
            .unwrap()
            .push(format!("pre_write_call {}", ctx.msg().service_method()));
        Ok(())
    }

    fn post_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        self.events
            .lock()
            .unwrap()
            .push(format!("post_write_call {}", ctx.msg().service_method()));
        Ok(())
    }

    fn post_read_reply_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.events
            .lock()
            .unwrap()
            .push(format!("post_read_reply_header {}", ctx.service_method()));
        Ok(())
    }
}

/// Rejects writes to a marker path.
struct Gatekeeper;

impl Plugin for Gatekeeper {
    fn name(&self) -> &'static str {
        "gatekeeper"
    }

    fn pre_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        if ctx.msg().service_method() == "/forbidden" {
            return Err(Status::unauthorized("path is gated"));
        }
        Ok(())
    }
}

struct Panicker;

impl Plugin for Panicker {
    fn name(&self) -> &'static str {
        "panicker"
    }

    fn pre_write_call(&self, _ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        panic!("hook exploded");
    }
}

fn echo_server() -> Peer {
    let server = common::default_peer();
    server
        .route_call("echo/Text", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();
    server
}

#[tokio::test]
async fn test_write_and_reply_hooks_fire_in_order() {
    common::init_tracing();
    let server = echo_server();
    let (recorder, events) = Recorder::new();
    let client = Peer::new(PeerConfig::default(), vec![recorder]).unwrap();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let reply: String = cli.call("/echo/text", "x".to_string()).await.unwrap();
    assert_eq!(reply, "x");

    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "pre_write_call /echo/text",
            "post_write_call /echo/text",
            "post_read_reply_header /echo/text",
        ]
    );
}

#[tokio::test]
async fn test_failing_pre_write_hook_stops_the_call() {
    common::init_tracing();
    let server = echo_server();
    let client = Peer::new(PeerConfig::default(), vec![Arc::new(Gatekeeper)]).unwrap();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let err = cli
        .call::<_, String>("/forbidden", "x".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::UNAUTHORIZED);

    // Ungated paths pass through the same chain.
    let reply: String = cli.call("/echo/text", "ok".to_string()).await.unwrap();
    assert_eq!(reply, "ok");
}

#[tokio::test]
async fn test_panicking_hook_is_contained() {
    common::init_tracing();
    let server = echo_server();
    let client = Peer::new(PeerConfig::default(), vec![Arc::new(Panicker)]).unwrap();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let err = cli
        .call::<_, String>("/echo/text", "x".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::INTERNAL_SERVER_ERROR);
    assert!(err.cause().contains("hook exploded"));
}

/// A body hook that counts only the handlers registered under its group.
struct GroupCounter {
    hits: Arc<Mutex<Vec<String>>>,
}

impl Plugin for GroupCounter {
    fn name(&self) -> &'static str {
        "group-counter"
    }

    fn pre_read_call_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.hits
            .lock()
            .unwrap()
            .push(ctx.service_method().to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_sub_route_plugins_scope_to_their_group() {
    common::init_tracing();
    let hits = Arc::new(Mutex::new(Vec::new()));

    let server = common::default_peer();
    let group = server.sub_route(
        "guarded",
        vec![Arc::new(GroupCounter { hits: hits.clone() })],
    );
    group
        .route_call("Inside", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();
    server
        .route_call("open/Outside", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();

    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let _: String = cli.call("/guarded/inside", "a".to_string()).await.unwrap();
    let _: String = cli.call("/open/outside", "b".to_string()).await.unwrap();

    let seen = hits.lock().unwrap().clone();
    assert_eq!(seen, vec!["/guarded/inside"]);
}
