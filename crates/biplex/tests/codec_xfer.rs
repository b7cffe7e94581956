//! Body codecs and transfer-pipe transforms over a live session.

mod common;

use std::collections::BTreeMap;

use biplex::prelude::*;
use biplex::{code, MessageSetting};

fn map_echo_server() -> Peer {
    let server = common::default_peer();
    server
        .route_call(
            "echo/Map",
            |_ctx: CallCtx, arg: BTreeMap<String, Vec<u8>>| async move {
                Ok::<_, Status>(arg)
            },
        )
        .unwrap();
    server
        .route_call("echo/Text", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();
    server
}

fn sample_map() -> BTreeMap<String, Vec<u8>> {
    let mut map = BTreeMap::new();
    map.insert(
        "bytes".to_string(),
        (0u8..=255).cycle().take(4096).collect(),
    );
    map
}

#[tokio::test]
async fn test_json_body_through_compression_pipe() {
    common::init_tracing();
    let server = map_echo_server();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let sent = sample_map();
    let got: BTreeMap<String, Vec<u8>> = cli
        .call_with(
            "/echo/map",
            sent.clone(),
            MessageSetting::new()
                .with_body_codec(BodyCodec::Json.id())
                .with_xfer_pipe(&[b'l']),
        )
        .await
        .unwrap();
    assert_eq!(got, sent);
}

#[tokio::test]
async fn test_bincode_body_through_zstd_pipe() {
    common::init_tracing();
    let server = map_echo_server();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let sent = sample_map();
    let got: BTreeMap<String, Vec<u8>> = cli
        .call_with(
            "/echo/map",
            sent.clone(),
            MessageSetting::new()
                .with_body_codec(BodyCodec::Bincode.id())
                .with_xfer_pipe(&[b'z']),
        )
        .await
        .unwrap();
    assert_eq!(got, sent);
}

#[tokio::test]
async fn test_stacked_pipes_reverse_on_unpack() {
    common::init_tracing();
    let server = map_echo_server();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let sent = sample_map();
    let got: BTreeMap<String, Vec<u8>> = cli
        .call_with(
            "/echo/map",
            sent.clone(),
            MessageSetting::new().with_xfer_pipe(&[b'l', b'z']),
        )
        .await
        .unwrap();
    assert_eq!(got, sent);
}

#[tokio::test]
async fn test_accepted_reply_codec_is_honoured() {
    common::init_tracing();
    let server = map_echo_server();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    // Request travels as JSON, the reply is asked for in bincode; the
    // decode side follows the codec id on the wire either way.
    let cmd = cli
        .send_call::<String, String>(
            "/echo/text",
            "mixed codecs".to_string(),
            MessageSetting::new()
                .with_body_codec(BodyCodec::Json.id())
                .with_accept_body_codec(BodyCodec::Bincode.id()),
        )
        .await
        .unwrap();
    let (msg, stat) = cmd.reply().await;
    assert!(stat.is_ok());
    let msg = msg.unwrap();
    assert_eq!(msg.body_codec(), BodyCodec::Bincode.id());
    let decoded: String = BodyCodec::Bincode.unmarshal(msg.body()).unwrap();
    assert_eq!(decoded, "mixed codecs");
}

#[tokio::test]
async fn test_unknown_xfer_id_is_rejected_at_the_call_site() {
    common::init_tracing();
    let server = map_echo_server();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let err = cli
        .call_with::<_, String>(
            "/echo/text",
            "x".to_string(),
            MessageSetting::new().with_xfer_pipe(&[0xEE]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::BAD_MESSAGE);
}

#[tokio::test]
async fn test_raw_bytes_roundtrip() {
    common::init_tracing();
    let server = common::default_peer();
    server
        .route_call_raw("blob/Reverse", |_ctx: CallCtx, body: biplex::Bytes| async move {
            let mut out = body.to_vec();
            out.reverse();
            Ok(out)
        })
        .unwrap();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let sent: Vec<u8> = (0u8..=255).collect();
    let mut expected = sent.clone();
    expected.reverse();

    let reply = cli
        .call_bytes("/blob/reverse", sent, MessageSetting::new())
        .await
        .unwrap();
    assert_eq!(&reply[..], &expected[..]);
    assert_eq!(reply[0], 255);
}

#[tokio::test]
async fn test_raw_bytes_through_compression_pipe() {
    common::init_tracing();
    let server = common::default_peer();
    server
        .route_call_raw("blob/Echo", |_ctx: CallCtx, body: biplex::Bytes| async move {
            Ok(body.to_vec())
        })
        .unwrap();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let sent = b"raw raw raw raw raw raw raw raw".repeat(64);
    let reply = cli
        .call_bytes(
            "/blob/echo",
            sent.clone(),
            MessageSetting::new().with_xfer_pipe(&[b'l']),
        )
        .await
        .unwrap();
    assert_eq!(&reply[..], &sent[..]);
}

#[tokio::test]
async fn test_raw_push_reaches_handler() {
    common::init_tracing();
    let server = common::default_peer();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    server
        .route_push_raw("blob/Note", move |_ctx: PushCtx, body: biplex::Bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body.to_vec());
                Ok(())
            }
        })
        .unwrap();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    cli.push_bytes("/blob/note", vec![9, 8, 7], MessageSetting::new())
        .await
        .unwrap();
    let seen = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("push should arrive")
        .unwrap();
    assert_eq!(seen, vec![9, 8, 7]);
}

#[tokio::test]
async fn test_typed_call_cannot_ride_the_raw_codec() {
    common::init_tracing();
    let server = map_echo_server();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let err = cli
        .call_with::<_, String>(
            "/echo/text",
            "x".to_string(),
            MessageSetting::new().with_body_codec(BodyCodec::Raw.id()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::BAD_MESSAGE);
}

#[tokio::test]
async fn test_raw_body_cannot_ride_a_typed_codec() {
    common::init_tracing();
    let server = map_echo_server();
    let client = common::default_peer();
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    let err = cli
        .call_bytes(
            "/echo/text",
            vec![1, 2, 3],
            MessageSetting::new().with_body_codec(BodyCodec::Json.id()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::BAD_MESSAGE);
}

#[tokio::test]
async fn test_default_codec_used_when_unset() {
    common::init_tracing();
    let server = map_echo_server();
    let client = common::peer(PeerConfig {
        default_body_codec: "msgpack".into(),
        ..Default::default()
    });
    let (_srv, cli) = common::mem_pair(&server, &client).await;

    // No explicit codec: the client's default (msgpack) is stamped on the
    // wire and the server decodes by that id.
    let got: String = cli
        .call("/echo/text", "defaults".to_string())
        .await
        .unwrap();
    assert_eq!(got, "defaults");
}
