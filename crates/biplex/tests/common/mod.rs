#![allow(dead_code)]

use std::sync::{Arc, Once};

use biplex::{Peer, PeerConfig, Session};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn peer(cfg: PeerConfig) -> Peer {
    Peer::new(cfg, Vec::new()).expect("peer should build")
}

pub fn default_peer() -> Peer {
    peer(PeerConfig::default())
}

/// Connects two peers over an in-memory duplex stream and returns
/// (server session, client session). Both sides serve: either may call or
/// push the other. Addresses (and so default session ids) are unique per
/// pair.
pub async fn mem_pair(server: &Peer, client: &Peer) -> (Arc<Session>, Arc<Session>) {
    use std::sync::atomic::{AtomicU64, Ordering};
    static PAIR_ID: AtomicU64 = AtomicU64::new(0);
    let n = PAIR_ID.fetch_add(1, Ordering::Relaxed);

    let (a, b) = tokio::io::duplex(256 * 1024);
    let srv = server
        .serve_stream(Box::new(b), format!("mem:server#{n}"), format!("mem:client#{n}"))
        .await
        .expect("server side should serve");
    let cli = client
        .serve_stream(Box::new(a), format!("mem:client#{n}"), format!("mem:server#{n}"))
        .await
        .expect("client side should serve");
    (srv, cli)
}
