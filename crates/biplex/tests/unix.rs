//! Unix-domain transport end to end.

#![cfg(unix)]

mod common;

use biplex::prelude::*;

fn socket_path(tag: &str) -> String {
    let dir = std::env::temp_dir();
    dir.join(format!("biplex-test-{}-{tag}.sock", std::process::id()))
        .to_string_lossy()
        .into_owned()
}

#[tokio::test]
async fn test_call_over_unix_socket() {
    common::init_tracing();
    let path = socket_path("echo");
    let _ = std::fs::remove_file(&path);

    let server = Peer::new(
        PeerConfig {
            network: Network::Unix,
            listen_ip: path.clone(),
            ..Default::default()
        },
        Vec::new(),
    )
    .unwrap();
    server
        .route_call("echo/Text", |_ctx: CallCtx, arg: String| async move {
            Ok::<_, Status>(arg)
        })
        .unwrap();
    let srv = server.clone();
    tokio::spawn(async move {
        let _ = srv.listen_and_serve().await;
    });

    // Wait for the socket file to appear.
    for _ in 0..100 {
        if std::path::Path::new(&path).exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let client = Peer::new(
        PeerConfig {
            network: Network::Unix,
            ..Default::default()
        },
        Vec::new(),
    )
    .unwrap();
    let sess = client.dial(&path).await.expect("unix dial");
    let reply: String = sess
        .call("/echo/text", "over unix".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "over unix");

    let _ = server.close().await;
    let _ = std::fs::remove_file(&path);
}
