//! Peer: owns the router, the plugin container, the session hub, the
//! dialer and the listener side.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use biplex_core::{raw_proto_func, BodyCodec, Conn, MessagePool, ProtoFunc, Status};

use crate::config::{Network, PeerConfig};
use crate::context::{CallCtx, PushCtx, UnknownCallCtx, UnknownPushCtx};
use crate::dialer::Dialer;
use crate::plugin::{Plugin, PluginContainer};
use crate::router::{Router, ServiceMethodMapper, SubRouter};
use crate::session::{RedialFn, Session, SessionHub, SessionStatus};
use crate::task_pool::TaskPool;

/// Peer-wide settings copied into every session.
#[derive(Debug, Clone)]
pub(crate) struct PeerDefaults {
    pub(crate) session_age: Option<Duration>,
    pub(crate) context_age: Option<Duration>,
    pub(crate) slow_comet: Option<Duration>,
    pub(crate) body_codec: u8,
    pub(crate) print_detail: bool,
    pub(crate) count_time: bool,
}

pub(crate) struct PeerCore {
    pub(crate) router: Router,
    pub(crate) plugins: Arc<PluginContainer>,
    pub(crate) hub: SessionHub,
    pub(crate) shutdown: CancellationToken,
    pub(crate) defaults: PeerDefaults,
    pub(crate) dialer: Dialer,
    pub(crate) task_pool: RwLock<TaskPool>,
    pub(crate) msg_pool: MessagePool,
    pub(crate) proto_func: ProtoFunc,
    pub(crate) tls_client: RwLock<Option<Arc<ClientConfig>>>,
    pub(crate) tls_server: RwLock<Option<Arc<ServerConfig>>>,
    pub(crate) listen_addr: String,
    pub(crate) network: Network,
}

/// A communication endpoint acting as client, server, or both.
///
/// Cheap to clone; clones share the same peer. Sessions are owned by their
/// read loops and the callers holding them, so [`Peer::close`] is required
/// for an orderly shutdown but dropping the peer never leaks them.
#[derive(Clone)]
pub struct Peer {
    pub(crate) core: Arc<PeerCore>,
}

impl Peer {
    /// Builds a peer from its configuration. `left_plugins` run before any
    /// later-appended plugin at every hook.
    pub fn new(mut cfg: PeerConfig, left_plugins: Vec<Arc<dyn Plugin>>) -> Result<Self, Status> {
        let mut container = PluginContainer::new();
        container.append_left(left_plugins);
        container.pre_new_peer(&mut cfg)?;
        cfg.check()?;

        let body_codec = BodyCodec::by_name(&cfg.default_body_codec)?.id();
        let defaults = PeerDefaults {
            session_age: cfg.session_age(),
            context_age: cfg.context_age(),
            slow_comet: cfg.slow_comet(),
            body_codec,
            print_detail: cfg.print_detail,
            count_time: cfg.count_time,
        };
        let plugins = Arc::new(container);
        let core = Arc::new(PeerCore {
            router: Router::new((*plugins).clone()),
            plugins,
            hub: SessionHub::new(),
            shutdown: CancellationToken::new(),
            defaults,
            dialer: Dialer::from_config(&cfg),
            task_pool: RwLock::new(TaskPool::unbounded()),
            msg_pool: MessagePool::new(),
            proto_func: raw_proto_func(),
            tls_client: RwLock::new(None),
            tls_server: RwLock::new(None),
            listen_addr: cfg.listen_addr(),
            network: cfg.network,
        });
        let peer = Peer { core };
        peer.core.plugins.post_new_peer(&peer)?;
        Ok(peer)
    }

    /// Bounds handler concurrency across the whole peer. Affects sessions
    /// created afterwards.
    pub fn set_task_pool(&self, max_tasks: usize) {
        *self.core.task_pool.write() = TaskPool::bounded(max_tasks);
    }

    /// TLS configuration for outbound dials.
    pub fn set_tls_client_config(&self, config: Arc<ClientConfig>) {
        *self.core.tls_client.write() = Some(config);
    }

    /// TLS configuration for accepted connections.
    pub fn set_tls_server_config(&self, config: Arc<ServerConfig>) {
        *self.core.tls_server.write() = Some(config);
    }

    // ------------------------------------------------------------------
    // Routing surface
    // ------------------------------------------------------------------

    /// The root router.
    pub fn router(&self) -> &Router {
        &self.core.router
    }

    /// Selects how registration names map to canonical service methods.
    pub fn set_service_method_mapper(&self, mapper: ServiceMethodMapper) {
        self.core.router.set_service_method_mapper(mapper);
    }

    /// Adds a handler group under a path prefix.
    pub fn sub_route(&self, prefix: &str, plugins: Vec<Arc<dyn Plugin>>) -> SubRouter {
        self.core.router.sub_route(prefix, plugins)
    }

    /// Registers a CALL handler and returns its canonical path.
    pub fn route_call<A, R, F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        self.core.router.route_call(name, f)
    }

    /// Registers a PUSH handler and returns its canonical path.
    pub fn route_push<A, F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.core.router.route_push(name, f)
    }

    /// Registers a CALL handler over raw byte bodies and returns its
    /// canonical path.
    pub fn route_call_raw<F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        F: Fn(CallCtx, bytes::Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, Status>> + Send + 'static,
    {
        self.core.router.route_call_raw(name, f)
    }

    /// Registers a PUSH handler over raw byte bodies and returns its
    /// canonical path.
    pub fn route_push_raw<F, Fut>(&self, name: &str, f: F) -> Result<String, Status>
    where
        F: Fn(PushCtx, bytes::Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.core.router.route_push_raw(name, f)
    }

    /// Fallback for CALLs with no matching handler.
    pub fn set_unknown_call<F, Fut>(&self, f: F)
    where
        F: Fn(UnknownCallCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(u8, Vec<u8>), Status>> + Send + 'static,
    {
        self.core.router.set_unknown_call(f);
    }

    /// Fallback for PUSHes with no matching handler.
    pub fn set_unknown_push<F, Fut>(&self, f: F)
    where
        F: Fn(UnknownPushCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.core.router.set_unknown_push(f);
    }

    // ------------------------------------------------------------------
    // Session hub
    // ------------------------------------------------------------------

    /// The session with the given id, if it is alive.
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.core.hub.get(session_id)
    }

    /// Number of live sessions.
    pub fn count_session(&self) -> usize {
        self.core.hub.len()
    }

    /// Visits every live session; stop by returning `false`.
    pub fn range_session(&self, f: impl FnMut(Arc<Session>) -> bool) {
        self.core.hub.range(f);
    }

    // ------------------------------------------------------------------
    // Client role
    // ------------------------------------------------------------------

    /// Connects to a remote peer. With `redial_times` configured, the
    /// session auto-reconnects on a lost connection, preserving its id.
    pub async fn dial(&self, addr: &str) -> Result<Arc<Session>, Status> {
        self.dial_with(addr, None).await
    }

    /// [`Peer::dial`] with a per-connection proto.
    pub async fn dial_with(
        &self,
        addr: &str,
        proto: Option<ProtoFunc>,
    ) -> Result<Arc<Session>, Status> {
        let proto = proto.unwrap_or_else(|| self.core.proto_func.clone());
        let core = &self.core;
        core.plugins.pre_dial(&core.dialer.local_addr(), addr)?;

        let tls = core.tls_client.read().clone();
        let mut sess_slot: Option<Arc<Session>> = None;
        let mut counter = core.dialer.counter();
        let sess = loop {
            match self
                .dial_attempt(&mut sess_slot, addr, &proto, tls.clone())
                .await
            {
                Ok(sess) => break sess,
                Err(stat) => {
                    if !counter.next() {
                        return Err(stat);
                    }
                    tokio::time::sleep(core.dialer.redial_interval()).await;
                    tracing::debug!(
                        network = core.network.as_str(),
                        addr,
                        "trying to redial..."
                    );
                }
            }
        };

        if core.dialer.redial_times() != 0 {
            let weak = Arc::downgrade(core);
            let addr = addr.to_string();
            let redial: RedialFn = Arc::new(move |sess: Arc<Session>| {
                let weak = weak.clone();
                let addr = addr.clone();
                Box::pin(async move { redial_for_client(weak, sess, addr).await })
            });
            sess.set_redial_fn(redial);
        }

        sess.change_status(SessionStatus::Ok);
        sess.start_read_loop();
        core.hub.set(&sess);
        tracing::info!(
            network = core.network.as_str(),
            addr,
            id = %sess.id(),
            "dial ok"
        );
        Ok(sess)
    }

    async fn dial_attempt(
        &self,
        sess_slot: &mut Option<Arc<Session>>,
        addr: &str,
        proto: &ProtoFunc,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<Arc<Session>, Status> {
        let core = &self.core;
        let (conn, local, remote) = core.dialer.dial_one(addr, tls).await?;
        let sess = match sess_slot {
            None => {
                let sess = Session::new(core, conn, local, remote, proto);
                *sess_slot = Some(sess.clone());
                sess
            }
            Some(sess) => {
                sess.socket().reset(conn, local.clone(), remote).await;
                sess.set_id(local);
                sess.clone()
            }
        };
        if let Err(stat) = core.plugins.post_dial(&sess, false).await {
            let _ = sess.socket().close().await;
            return Err(stat);
        }
        Ok(sess)
    }

    // ------------------------------------------------------------------
    // Server role
    // ------------------------------------------------------------------

    /// Binds the configured listen address and serves until the peer is
    /// closed or the listener fails permanently.
    pub async fn listen_and_serve(&self) -> Result<(), Status> {
        match self.core.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let lis = TcpListener::bind(&self.core.listen_addr)
                    .await
                    .map_err(|e| {
                        Status::new(
                            biplex_core::code::UNKNOWN_ERROR,
                            "listen failed",
                            format!("{}: {e}", self.core.listen_addr),
                        )
                    })?;
                self.serve_listener(lis).await
            }
            #[cfg(unix)]
            Network::Unix => {
                let lis = tokio::net::UnixListener::bind(&self.core.listen_addr).map_err(|e| {
                    Status::new(
                        biplex_core::code::UNKNOWN_ERROR,
                        "listen failed",
                        format!("{}: {e}", self.core.listen_addr),
                    )
                })?;
                self.serve_unix_listener(lis).await
            }
            #[cfg(not(unix))]
            Network::Unix => Err(Status::new(
                biplex_core::code::UNKNOWN_ERROR,
                "listen failed",
                "unix sockets are not supported on this platform",
            )),
            Network::Quic | Network::Kcp => Err(Status::new(
                biplex_core::code::UNKNOWN_ERROR,
                "listen failed",
                format!(
                    "network {} is served by an external transport driver",
                    self.core.network.as_str()
                ),
            )),
        }
    }

    /// Serves an externally-bound listener (graceful-restart inheritance).
    pub async fn serve_listener(&self, lis: TcpListener) -> Result<(), Status> {
        let addr = lis
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.core.listen_addr.clone());
        tracing::info!(network = self.core.network.as_str(), addr = %addr, "listen and serve");
        self.core.plugins.post_listen(&addr);

        let mut temp_delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                _ = self.core.shutdown.cancelled() => {
                    return Err(Status::conn_closed("listener is closed"));
                }
                accepted = lis.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        temp_delay = Duration::ZERO;
                        let peer = self.clone();
                        tokio::spawn(async move {
                            peer.accept_tcp(stream, peer_addr).await;
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        temp_delay = next_accept_delay(temp_delay);
                        tracing::trace!(
                            error = %e,
                            delay_ms = temp_delay.as_millis() as u64,
                            "accept error; retrying"
                        );
                        tokio::time::sleep(temp_delay).await;
                    }
                    Err(e) => {
                        return Err(Status::new(
                            biplex_core::code::UNKNOWN_ERROR,
                            "accept failed",
                            e.to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Serves an externally-bound unix listener.
    #[cfg(unix)]
    pub async fn serve_unix_listener(&self, lis: tokio::net::UnixListener) -> Result<(), Status> {
        use std::sync::atomic::{AtomicU64, Ordering};

        let addr = self.core.listen_addr.clone();
        tracing::info!(network = "unix", addr = %addr, "listen and serve");
        self.core.plugins.post_listen(&addr);

        // Unix peers are usually unnamed, so the default session id is
        // disambiguated with an accept counter.
        let accept_seq = AtomicU64::new(0);
        let mut temp_delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                _ = self.core.shutdown.cancelled() => {
                    return Err(Status::conn_closed("listener is closed"));
                }
                accepted = lis.accept() => match accepted {
                    Ok((stream, _peer_addr)) => {
                        temp_delay = Duration::ZERO;
                        let peer = self.clone();
                        let n = accept_seq.fetch_add(1, Ordering::Relaxed);
                        let local = format!("{addr}#{n}");
                        tokio::spawn(async move {
                            let remote = format!("unix:peer#{n}");
                            if let Err(stat) = peer
                                .serve_stream(Box::new(stream), local, remote)
                                .await
                            {
                                tracing::warn!(%stat, "failed to serve accepted connection");
                            }
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        temp_delay = next_accept_delay(temp_delay);
                        tokio::time::sleep(temp_delay).await;
                    }
                    Err(e) => {
                        return Err(Status::new(
                            biplex_core::code::UNKNOWN_ERROR,
                            "accept failed",
                            e.to_string(),
                        ));
                    }
                },
            }
        }
    }

    async fn accept_tcp(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote = peer_addr.to_string();

        let tls = self.core.tls_server.read().clone();
        let conn: Conn = match tls {
            None => Box::new(stream),
            Some(config) => {
                let handshake = TlsAcceptor::from(config).accept(stream);
                // The handshake deadline follows the session age, so an
                // idle client cannot pin the acceptor task.
                let accepted = match self.core.defaults.session_age {
                    Some(age) => match tokio::time::timeout(age, handshake).await {
                        Ok(accepted) => accepted,
                        Err(_elapsed) => {
                            tracing::error!(remote = %remote, "TLS handshake timed out");
                            return;
                        }
                    },
                    None => handshake.await,
                };
                match accepted {
                    Ok(tls_stream) => Box::new(tls_stream),
                    Err(e) => {
                        tracing::error!(remote = %remote, error = %e, "TLS handshake error");
                        return;
                    }
                }
            }
        };

        if let Err(stat) = self.serve_stream(conn, local, remote.clone()).await {
            tracing::warn!(%stat, remote = %remote, "failed to serve accepted connection");
        }
    }

    /// Serves an established TCP connection (either role).
    pub async fn serve_tcp(&self, stream: TcpStream) -> Result<Arc<Session>, Status> {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.serve_stream(Box::new(stream), local, remote).await
    }

    /// Serves any established bidirectional stream: runs the `post_accept`
    /// chain, registers the session and starts its read loop. Redial is
    /// never wired here.
    pub async fn serve_stream(
        &self,
        conn: Conn,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Result<Arc<Session>, Status> {
        self.serve_stream_with(conn, local_addr, remote_addr, None)
            .await
    }

    /// [`Peer::serve_stream`] with a per-connection proto.
    pub async fn serve_stream_with(
        &self,
        conn: Conn,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        proto: Option<ProtoFunc>,
    ) -> Result<Arc<Session>, Status> {
        let proto = proto.unwrap_or_else(|| self.core.proto_func.clone());
        let sess = Session::new(
            &self.core,
            conn,
            local_addr.into(),
            remote_addr.into(),
            &proto,
        );
        if let Err(stat) = self.core.plugins.post_accept(&sess).await {
            let _ = sess.close().await;
            return Err(stat);
        }
        sess.change_status(SessionStatus::Ok);
        sess.start_read_loop();
        self.core.hub.set(&sess);
        tracing::info!(
            network = self.core.network.as_str(),
            remote = %sess.remote_addr(),
            id = %sess.id(),
            "serve ok"
        );
        Ok(sess)
    }

    /// Closes the peer: stops listeners and closes every session in
    /// parallel, returning the first error.
    pub async fn close(&self) -> Result<(), Status> {
        self.core.shutdown.cancel();
        let mut sessions = Vec::new();
        self.core.hub.range(|sess| {
            sessions.push(sess);
            true
        });
        let results = futures::future::join_all(sessions.iter().map(|sess| sess.close())).await;
        let mut first_err = None;
        for result in results {
            if let Err(stat) = result {
                tracing::warn!(%stat, "session close failed");
                first_err.get_or_insert(stat);
            }
        }
        match first_err {
            None => Ok(()),
            Some(stat) => Err(stat),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("network", &self.core.network.as_str())
            .field("listen_addr", &self.core.listen_addr)
            .field("sessions", &self.core.hub.len())
            .finish_non_exhaustive()
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

/// Accept-failure backoff: start at 5ms, double up to 1s.
fn next_accept_delay(current: Duration) -> Duration {
    const START: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);
    if current.is_zero() {
        START
    } else {
        (current * 2).min(MAX)
    }
}

/// Client-side reconnect: redials the captured address on the session's
/// existing socket (the proto stays bound), preserving the session id. A
/// fresh id is only taken when the id was never customized, in which case
/// it tracks the new local address.
async fn redial_for_client(weak: Weak<PeerCore>, sess: Arc<Session>, addr: String) -> bool {
    let Some(core) = weak.upgrade() else {
        return false;
    };
    let old_id = sess.id();
    let old_local = sess.local_addr();

    if let Err(stat) = core.plugins.pre_dial(&core.dialer.local_addr(), &addr) {
        tracing::error!(%stat, addr = %addr, id = %old_id, "redial rejected by pre_dial");
        return false;
    }

    let tls = core.tls_client.read().clone();
    let mut counter = core.dialer.counter();
    loop {
        match core.dialer.dial_one(&addr, tls.clone()).await {
            Ok((conn, local, remote)) => {
                // Step the old connection's read loop aside before the
                // socket halves are swapped.
                sess.replace_conn_token();
                sess.socket().reset(conn, local.clone(), remote).await;
                if old_id == old_local {
                    core.hub.delete(&old_id);
                    sess.set_id(local);
                }
                sess.change_status(SessionStatus::Preparing);
                match core.plugins.post_dial(&sess, true).await {
                    Ok(()) => {
                        sess.change_status(SessionStatus::Ok);
                        sess.start_read_loop();
                        core.hub.set(&sess);
                        tracing::info!(
                            network = core.network.as_str(),
                            addr = %addr,
                            id = %sess.id(),
                            "redial ok"
                        );
                        return true;
                    }
                    Err(stat) => {
                        let _ = sess.socket().close().await;
                        sess.change_status(SessionStatus::Redialing);
                        tracing::warn!(%stat, addr = %addr, "redial rejected by post_dial");
                    }
                }
            }
            Err(stat) => {
                tracing::debug!(%stat, addr = %addr, "redial attempt failed");
            }
        }
        if !counter.next() {
            tracing::error!(
                network = core.network.as_str(),
                addr = %addr,
                id = %old_id,
                "redial failed"
            );
            return false;
        }
        tokio::time::sleep(core.dialer.redial_interval()).await;
        tracing::debug!(addr = %addr, id = %old_id, "trying to redial...");
    }
}
