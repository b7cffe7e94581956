//! Session: the full-duplex engine multiplexing CALLs and PUSHes over one
//! connection.
//!
//! One task per session reads messages; handling is dispatched to the task
//! pool so a slow handler cannot block the read path. REPLYs resolve
//! in-flight CALLs through the sequence table. The lifecycle is an atomic
//! state machine; a lost connection either redials (client role, keeping
//! the session id) or drains every pending call with a connection status.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use biplex_core::{
    BodyCodec, BoxFuture, Conn, Message, MessagePool, MessageSetting, Mtype, PooledMessage,
    ProtoFunc, Socket, Status, NIL_CODEC_ID,
};

use crate::call::CallCmd;
use crate::context::HandlerCtx;
use crate::peer::{PeerCore, PeerDefaults};
use crate::plugin::{panic_message, PluginContainer};
use crate::router::{Handler, HandlerOutcome, Router};
use crate::task_pool::TaskPool;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    /// Created, plugins not yet passed.
    Preparing = 0,
    /// Serving; exactly one read loop is running.
    Ok = 1,
    /// Local close requested, draining handlers.
    ActiveClosing = 2,
    /// Locally closed. Terminal.
    ActiveClosed = 3,
    /// The peer or the connection went away. Terminal unless redialing.
    PassiveClosed = 4,
    /// Reconnecting after a lost connection.
    Redialing = 5,
    /// Redial attempts exhausted. Terminal.
    RedialFailed = 6,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Preparing,
            1 => SessionStatus::Ok,
            2 => SessionStatus::ActiveClosing,
            3 => SessionStatus::ActiveClosed,
            4 => SessionStatus::PassiveClosed,
            5 => SessionStatus::Redialing,
            _ => SessionStatus::RedialFailed,
        }
    }

    /// True for states the session cannot leave (except redial failure
    /// handling).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::ActiveClosed | SessionStatus::PassiveClosed | SessionStatus::RedialFailed
        )
    }
}

/// Opaque per-session key/value scratch shared between plugins and
/// handlers.
#[derive(Default)]
pub struct Swap {
    map: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl Swap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.map.lock().insert(key.into(), Box::new(value));
    }

    /// A clone of the value under `key`, when present with type `T`.
    pub fn get_cloned<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.map
            .lock()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.map.lock().remove(key);
    }
}

pub(crate) type RedialFn = Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, bool> + Send + Sync>;

/// Why the read loop stopped.
enum ReadExit {
    LocalClose,
    AgeExpired,
    /// A redial installed a new connection; a fresh read loop owns it.
    Replaced,
    Transport(Status),
}

/// The logical full-duplex channel over one connection.
///
/// Obtained from a peer's dial or accept path, never constructed directly.
/// All methods take `&Arc<Self>` style receivers where a background task
/// may be spawned.
pub struct Session {
    peer: Weak<PeerCore>,
    socket: Socket,
    seq: AtomicU32,
    status: AtomicU8,
    in_flight: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    swap: Swap,
    defaults: PeerDefaults,
    plugins: Arc<PluginContainer>,
    router: Router,
    task_pool: TaskPool,
    read_cancel: CancellationToken,
    handler_cancel: CancellationToken,
    /// Cancelled and replaced on redial so the previous connection's read
    /// loop steps aside.
    conn_cancel: Mutex<CancellationToken>,
    tracker: TaskTracker,
    redial_fn: Mutex<Option<RedialFn>>,
    redial_gate: AsyncMutex<()>,
    msg_pool: MessagePool,
}

impl Session {
    pub(crate) fn new(
        core: &Arc<PeerCore>,
        conn: Conn,
        local_addr: String,
        remote_addr: String,
        proto: &ProtoFunc,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer: Arc::downgrade(core),
            socket: Socket::new(conn, local_addr, remote_addr, proto),
            seq: AtomicU32::new(0),
            status: AtomicU8::new(SessionStatus::Preparing as u8),
            in_flight: Mutex::new(HashMap::new()),
            swap: Swap::new(),
            defaults: core.defaults.clone(),
            plugins: core.plugins.clone(),
            router: core.router.clone(),
            task_pool: core.task_pool.read().clone(),
            read_cancel: core.shutdown.child_token(),
            handler_cancel: CancellationToken::new(),
            conn_cancel: Mutex::new(CancellationToken::new()),
            tracker: TaskTracker::new(),
            redial_fn: Mutex::new(None),
            redial_gate: AsyncMutex::new(()),
            msg_pool: core.msg_pool.clone(),
        })
    }

    /// The session id. Defaults to the local address; plugins may override
    /// it (for example with an authenticated identity).
    pub fn id(&self) -> String {
        self.socket.id()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        self.socket.set_id(id);
    }

    pub fn local_addr(&self) -> String {
        self.socket.local_addr()
    }

    pub fn remote_addr(&self) -> String {
        self.socket.remote_addr()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// True while the session is serving.
    pub fn health(&self) -> bool {
        self.status() == SessionStatus::Ok
    }

    /// Per-session scratch space.
    pub fn swap(&self) -> &Swap {
        &self.swap
    }

    /// Wire id of the peer's default body codec.
    pub fn default_body_codec(&self) -> u8 {
        self.defaults.body_codec
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(crate) fn set_redial_fn(&self, f: RedialFn) {
        *self.redial_fn.lock() = Some(f);
    }

    pub(crate) fn change_status(&self, to: SessionStatus) {
        self.status.store(to as u8, Ordering::Release);
    }

    pub(crate) fn try_change_status(&self, to: SessionStatus, from: &[SessionStatus]) -> bool {
        for &f in from {
            if self
                .status
                .compare_exchange(f as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn remove_in_flight(&self, seq: u32) {
        self.in_flight.lock().remove(&seq);
    }

    fn upgrade_peer(&self) -> Option<Arc<PeerCore>> {
        self.peer.upgrade()
    }

    // ------------------------------------------------------------------
    // Send paths
    // ------------------------------------------------------------------

    /// Issues a CALL and awaits the decoded REPLY.
    pub async fn call<A, R>(self: &Arc<Self>, service_method: &str, arg: A) -> Result<R, Status>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_with(service_method, arg, MessageSetting::new())
            .await
    }

    /// [`Session::call`] with per-message settings.
    pub async fn call_with<A, R>(
        self: &Arc<Self>,
        service_method: &str,
        arg: A,
        setting: MessageSetting,
    ) -> Result<R, Status>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.send_call(service_method, arg, setting)
            .await?
            .result()
            .await
    }

    /// Writes a CALL and returns the pending command without awaiting the
    /// REPLY.
    pub async fn send_call<A, R>(
        self: &Arc<Self>,
        service_method: &str,
        arg: A,
        setting: MessageSetting,
    ) -> Result<CallCmd<R>, Status>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let mut msg = self.new_request(Mtype::Call, service_method, &setting)?;
        let codec = self.resolve_codec(msg.body_codec())?;
        msg.set_body(codec, &arg)?;
        self.finish_send_call(msg, service_method, &setting).await
    }

    /// Issues a CALL whose body is a pre-encoded byte buffer carried by
    /// the raw codec, and awaits the reply's byte body.
    pub async fn call_bytes(
        self: &Arc<Self>,
        service_method: &str,
        body: impl Into<Bytes>,
        setting: MessageSetting,
    ) -> Result<Bytes, Status> {
        self.send_call_bytes(service_method, body, setting)
            .await?
            .result_bytes()
            .await
    }

    /// Writes a raw-body CALL and returns the pending command. With no
    /// codec set the body travels as the raw codec; a typed codec in the
    /// settings is rejected on this path.
    pub async fn send_call_bytes(
        self: &Arc<Self>,
        service_method: &str,
        body: impl Into<Bytes>,
        setting: MessageSetting,
    ) -> Result<CallCmd<Bytes>, Status> {
        let body: Bytes = body.into();
        let mut msg = self.new_request(Mtype::Call, service_method, &setting)?;
        let codec = self.resolve_bytes_codec(msg.body_codec())?;
        msg.set_raw_body(codec.marshal_bytes(&body)?);
        msg.set_body_codec(codec.id());
        self.finish_send_call(msg, service_method, &setting).await
    }

    /// Issues a fire-and-forget PUSH; only the local send outcome is
    /// returned.
    pub async fn push<A>(self: &Arc<Self>, service_method: &str, arg: A) -> Result<(), Status>
    where
        A: Serialize,
    {
        self.push_with(service_method, arg, MessageSetting::new())
            .await
    }

    /// [`Session::push`] with per-message settings.
    pub async fn push_with<A>(
        self: &Arc<Self>,
        service_method: &str,
        arg: A,
        setting: MessageSetting,
    ) -> Result<(), Status>
    where
        A: Serialize,
    {
        let mut msg = self.new_request(Mtype::Push, service_method, &setting)?;
        let codec = self.resolve_codec(msg.body_codec())?;
        msg.set_body(codec, &arg)?;
        self.finish_push(msg).await
    }

    /// Issues a PUSH whose body is a pre-encoded byte buffer carried by
    /// the raw codec.
    pub async fn push_bytes(
        self: &Arc<Self>,
        service_method: &str,
        body: impl Into<Bytes>,
        setting: MessageSetting,
    ) -> Result<(), Status> {
        let body: Bytes = body.into();
        let mut msg = self.new_request(Mtype::Push, service_method, &setting)?;
        let codec = self.resolve_bytes_codec(msg.body_codec())?;
        msg.set_raw_body(codec.marshal_bytes(&body)?);
        msg.set_body_codec(codec.id());
        self.finish_push(msg).await
    }

    fn new_request(
        &self,
        mtype: Mtype,
        service_method: &str,
        setting: &MessageSetting,
    ) -> Result<PooledMessage, Status> {
        let mut msg = self.msg_pool.get();
        msg.set_seq(self.next_seq());
        msg.set_mtype(mtype);
        msg.set_service_method(service_method);
        setting.apply_to(&mut msg)?;
        Ok(msg)
    }

    /// Hook chain, in-flight registration and write shared by the typed
    /// and raw CALL paths.
    async fn finish_send_call<R>(
        self: &Arc<Self>,
        mut msg: PooledMessage,
        service_method: &str,
        setting: &MessageSetting,
    ) -> Result<CallCmd<R>, Status> {
        let seq = msg.seq();
        self.plugins.pre_write_call(self, &mut msg)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut in_flight = self.in_flight.lock();
            debug_assert!(!in_flight.contains_key(&seq), "sequence reused in flight");
            in_flight.insert(seq, tx);
        }

        if let Err(stat) = self.write_with_redial(&mut msg).await {
            self.remove_in_flight(seq);
            return Err(stat);
        }
        self.log_detail("sent", &msg);

        if let Err(stat) = self.plugins.post_write_call(self, &mut msg) {
            self.remove_in_flight(seq);
            return Err(stat);
        }

        let deadline = setting.context_age().or(self.defaults.context_age);
        Ok(CallCmd::new(
            seq,
            service_method.to_string(),
            rx,
            self.clone(),
            deadline,
            self.defaults.body_codec,
        ))
    }

    async fn finish_push(self: &Arc<Self>, mut msg: PooledMessage) -> Result<(), Status> {
        self.plugins.pre_write_push(self, &mut msg)?;
        self.write_with_redial(&mut msg).await?;
        self.log_detail("sent", &msg);
        self.plugins.post_write_push(self, &mut msg)
    }

    fn resolve_codec(&self, id: u8) -> Result<BodyCodec, Status> {
        match id {
            NIL_CODEC_ID => BodyCodec::by_id(self.defaults.body_codec),
            id => BodyCodec::by_id(id),
        }
    }

    /// A byte body with no codec set travels as the raw codec.
    fn resolve_bytes_codec(&self, id: u8) -> Result<BodyCodec, Status> {
        match id {
            NIL_CODEC_ID => Ok(BodyCodec::Raw),
            id => BodyCodec::by_id(id),
        }
    }

    fn is_conn_error(stat: &Status) -> bool {
        matches!(
            stat.code(),
            biplex_core::code::CONN_CLOSED | biplex_core::code::WRITE_FAILED
        )
    }

    /// Writes a message; a connection-level failure triggers at most one
    /// inline redial before the send fails with `WRONG_CONN`.
    async fn write_with_redial(self: &Arc<Self>, msg: &mut Message) -> Result<(), Status> {
        match self.socket.write_message(msg).await {
            Ok(()) => Ok(()),
            Err(stat) if Self::is_conn_error(&stat) => {
                if self.redial_fn.lock().is_some() {
                    tracing::debug!(id = %self.id(), %stat, "send hit a dead connection; redialing inline");
                    if self.try_redial().await {
                        return self
                            .socket
                            .write_message(msg)
                            .await
                            .map_err(|e| Status::wrong_conn(e.to_string()));
                    }
                    return Err(Status::wrong_conn(stat.to_string()));
                }
                Err(stat)
            }
            Err(stat) => Err(stat),
        }
    }

    fn log_detail(&self, dir: &'static str, msg: &Message) {
        if self.defaults.print_detail {
            tracing::debug!(
                id = %self.id(),
                seq = msg.seq(),
                mtype = msg.mtype().text(),
                service_method = msg.service_method(),
                size = msg.size(),
                body = %String::from_utf8_lossy(msg.body()),
                "{dir} message"
            );
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    pub(crate) fn start_read_loop(self: &Arc<Self>) {
        let sess = self.clone();
        tokio::spawn(async move {
            sess.read_loop().await;
        });
    }

    async fn read_loop(self: Arc<Self>) {
        let conn_token = self.conn_cancel.lock().clone();
        let mut age_fut: BoxFuture<'static, ()> = match self.defaults.session_age {
            Some(age) => Box::pin(tokio::time::sleep(age)),
            None => Box::pin(futures::future::pending()),
        };

        let exit = loop {
            if let Err(stat) = self.plugins.pre_read_header(&self) {
                break ReadExit::Transport(stat);
            }
            let mut msg = self.msg_pool.get();
            tokio::select! {
                biased;
                _ = self.read_cancel.cancelled() => break ReadExit::LocalClose,
                _ = conn_token.cancelled() => break ReadExit::Replaced,
                _ = &mut age_fut => break ReadExit::AgeExpired,
                read = self.socket.read_message(&mut msg) => match read {
                    Ok(()) => {
                        self.log_detail("received", &msg);
                        self.dispatch(msg.take()).await;
                    }
                    // The default proto consumes the whole length-prefixed
                    // frame before parsing, so a malformed message leaves
                    // the stream aligned: answer it instead of closing.
                    Err(stat) if stat.code() == biplex_core::code::BAD_MESSAGE => {
                        tracing::warn!(id = %self.id(), %stat, "malformed message");
                        self.write_reply_for(&msg, stat).await;
                    }
                    Err(stat) => break ReadExit::Transport(stat),
                },
            }
        };
        self.on_read_exit(exit, &conn_token).await;
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg.mtype() {
            Mtype::Call | Mtype::AuthCall => self.handle_incoming_call(msg).await,
            Mtype::Push => self.handle_incoming_push(msg).await,
            Mtype::Reply | Mtype::AuthReply => self.handle_reply(msg),
        }
    }

    /// Deadline for an incoming message: the shorter of the configured
    /// default and the caller-supplied context age.
    fn effective_age(&self, msg: &Message) -> Option<Duration> {
        match (self.defaults.context_age, msg.context_age()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }

    async fn handle_incoming_call(self: &Arc<Self>, mut msg: Message) {
        if let Err(stat) = self.plugins.post_read_call_header(self, &mut msg) {
            self.write_reply_for(&msg, stat).await;
            return;
        }

        let handler = self
            .router
            .get_call(msg.service_method())
            .or_else(|| self.router.unknown_call());
        let Some(handler) = handler else {
            let stat = Status::not_found(format!("no CALL handler for {}", msg.service_method()));
            self.write_reply_for(&msg, stat).await;
            return;
        };

        if let Err(stat) = self.check_body_codec(&msg) {
            self.write_reply_for(&msg, stat).await;
            return;
        }
        if let Err(stat) = handler.plugins().pre_read_call_body(self, &mut msg) {
            self.write_reply_for(&msg, stat).await;
            return;
        }
        if let Err(stat) = handler.plugins().post_read_call_body(self, &mut msg) {
            self.write_reply_for(&msg, stat).await;
            return;
        }

        let age = self.effective_age(&msg);
        let deadline = age.map(|d| Instant::now() + d);
        let sess = self.clone();
        self.task_pool.spawn(&self.tracker, async move {
            sess.run_call_handler(handler, msg, age, deadline).await;
        });
    }

    async fn handle_incoming_push(self: &Arc<Self>, mut msg: Message) {
        if let Err(stat) = self.plugins.post_read_push_header(self, &mut msg) {
            tracing::warn!(id = %self.id(), %stat, "push header rejected");
            return;
        }

        let handler = self
            .router
            .get_push(msg.service_method())
            .or_else(|| self.router.unknown_push());
        let Some(handler) = handler else {
            tracing::error!(
                id = %self.id(),
                service_method = msg.service_method(),
                "no PUSH handler; dropping message"
            );
            return;
        };

        if let Err(stat) = self.check_body_codec(&msg) {
            tracing::warn!(id = %self.id(), %stat, "push body rejected");
            return;
        }
        if let Err(stat) = handler.plugins().pre_read_push_body(self, &mut msg) {
            tracing::warn!(id = %self.id(), %stat, "push body hook rejected");
            return;
        }
        if let Err(stat) = handler.plugins().post_read_push_body(self, &mut msg) {
            tracing::warn!(id = %self.id(), %stat, "push body hook rejected");
            return;
        }

        let age = self.effective_age(&msg);
        let deadline = age.map(|d| Instant::now() + d);
        let sess = self.clone();
        self.task_pool.spawn(&self.tracker, async move {
            sess.run_call_handler(handler, msg, age, deadline).await;
        });
    }

    fn handle_reply(self: &Arc<Self>, mut msg: Message) {
        let mut hook_err = self.plugins.post_read_reply_header(self, &mut msg).err();
        if hook_err.is_none() {
            hook_err = self.plugins.pre_read_reply_body(self, &mut msg).err();
        }
        if hook_err.is_none() {
            hook_err = self.plugins.post_read_reply_body(self, &mut msg).err();
        }
        if let Some(stat) = hook_err {
            tracing::warn!(id = %self.id(), %stat, "reply hook rejected; delivering anyway");
        }
        let tx = self.in_flight.lock().remove(&msg.seq());
        match tx {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => {
                tracing::trace!(id = %self.id(), seq = msg.seq(), "reply without an in-flight call");
            }
        }
    }

    fn check_body_codec(&self, msg: &Message) -> Result<(), Status> {
        match msg.body_codec() {
            NIL_CODEC_ID => BodyCodec::by_id(self.defaults.body_codec).map(|_| ()),
            id => BodyCodec::by_id(id).map(|_| ()),
        }
    }

    /// Runs one handler inside the panic boundary and writes the REPLY for
    /// CALL kinds.
    async fn run_call_handler(
        self: Arc<Self>,
        handler: Arc<Handler>,
        msg: Message,
        age: Option<Duration>,
        deadline: Option<Instant>,
    ) {
        let seq = msg.seq();
        let input_mtype = msg.mtype();
        let service_method = msg.service_method().to_string();

        let hctx = Arc::new(HandlerCtx::new(self.clone(), msg, deadline));
        let guarded = AssertUnwindSafe(handler.invoke(hctx.clone())).catch_unwind();

        let work = async {
            let finished: Result<HandlerOutcome, Box<dyn Any + Send>> = match age {
                Some(age) => match tokio::time::timeout(age, guarded).await {
                    Ok(finished) => finished,
                    Err(_elapsed) => {
                        return HandlerOutcome::error(Status::handle_timeout(format!(
                            "{service_method} exceeded {age:?}"
                        )))
                    }
                },
                None => guarded.await,
            };
            match finished {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let cause = panic_message(payload);
                    tracing::error!(
                        id = %self.id(),
                        service_method = %service_method,
                        %cause,
                        "handler panicked"
                    );
                    HandlerOutcome::error(Status::internal_server_error(format!(
                        "handler panicked: {cause}"
                    )))
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.handler_cancel.cancelled() => return,
            outcome = work => outcome,
        };

        let cost = hctx.start.elapsed();
        if self.defaults.count_time {
            match self.defaults.slow_comet {
                Some(slow) if cost > slow => {
                    tracing::warn!(
                        id = %self.id(),
                        service_method = %service_method,
                        cost_ms = cost.as_millis() as u64,
                        "slow call"
                    );
                }
                _ => {
                    tracing::debug!(
                        id = %self.id(),
                        service_method = %service_method,
                        cost_ms = cost.as_millis() as u64,
                        "call cost"
                    );
                }
            }
        }

        if input_mtype.is_call() {
            let reply_mtype = if input_mtype == Mtype::AuthCall {
                Mtype::AuthReply
            } else {
                Mtype::Reply
            };
            let mut reply = self.msg_pool.get();
            reply.set_seq(seq);
            reply.set_mtype(reply_mtype);
            reply.set_service_method(&service_method);
            *reply.meta_mut() = hctx.reply_meta.lock().clone();
            if outcome.status.is_ok() {
                if let Some(body) = outcome.reply_body {
                    reply.set_body_codec(outcome.reply_codec.id());
                    reply.set_raw_body(body);
                }
            } else {
                reply.set_status(outcome.status);
            }

            if let Err(stat) = handler.plugins().pre_write_reply(&self, &mut reply) {
                reply.set_status(stat);
                reply.set_raw_body(Vec::new());
            }
            if let Err(stat) = self.socket.write_message(&mut reply).await {
                tracing::warn!(id = %self.id(), seq, %stat, "failed to write reply");
                return;
            }
            self.log_detail("sent", &reply);
            if let Err(stat) = handler.plugins().post_write_reply(&self, &mut reply) {
                tracing::warn!(id = %self.id(), %stat, "post_write_reply failed");
            }
        } else if !outcome.status.is_ok() {
            tracing::warn!(
                id = %self.id(),
                service_method = %service_method,
                status = %outcome.status,
                "push handler failed"
            );
        }
    }

    /// Replies to an incoming CALL with a bare status (routing or decode
    /// failures).
    async fn write_reply_for(self: &Arc<Self>, input: &Message, stat: Status) {
        let reply_mtype = if input.mtype() == Mtype::AuthCall {
            Mtype::AuthReply
        } else {
            Mtype::Reply
        };
        let mut reply = self.msg_pool.get();
        reply.set_seq(input.seq());
        reply.set_mtype(reply_mtype);
        reply.set_service_method(input.service_method());
        reply.set_status(stat);
        if let Err(stat) = self.plugins.pre_write_reply(self, &mut reply) {
            reply.set_status(stat);
        }
        if let Err(stat) = self.socket.write_message(&mut reply).await {
            tracing::warn!(id = %self.id(), seq = input.seq(), %stat, "failed to write status reply");
            return;
        }
        let _ = self.plugins.post_write_reply(self, &mut reply);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    async fn on_read_exit(self: &Arc<Self>, exit: ReadExit, conn_token: &CancellationToken) {
        match exit {
            ReadExit::LocalClose => {
                // close() drives the shutdown; nothing to do here.
            }
            ReadExit::Replaced => {
                // The redialed connection runs its own loop.
            }
            ReadExit::AgeExpired => {
                tracing::warn!(id = %self.id(), "session age expired; closing");
                let _ = self.close().await;
            }
            ReadExit::Transport(stat) => {
                if conn_token.is_cancelled() {
                    // A newer connection took over while this loop was
                    // failing; its loop owns the session now.
                    return;
                }
                let current = self.status();
                if matches!(
                    current,
                    SessionStatus::ActiveClosing | SessionStatus::ActiveClosed
                ) {
                    return;
                }
                tracing::debug!(id = %self.id(), %stat, "connection lost");
                if self.redial_fn.lock().is_some() {
                    if self.try_redial().await {
                        return;
                    }
                    if matches!(
                        self.status(),
                        SessionStatus::ActiveClosing | SessionStatus::ActiveClosed
                    ) {
                        return;
                    }
                    self.change_status(SessionStatus::RedialFailed);
                    self.teardown(Status::conn_closed(stat.to_string()), true).await;
                } else {
                    self.change_status(SessionStatus::PassiveClosed);
                    self.teardown(Status::conn_closed(stat.to_string()), true).await;
                }
            }
        }
    }

    /// Runs the stored redial closure, serialized by a gate so the read
    /// loop and an inline send retry cannot race two dials.
    pub(crate) async fn try_redial(self: &Arc<Self>) -> bool {
        let f = match self.redial_fn.lock().clone() {
            Some(f) => f,
            None => return false,
        };
        let _gate = self.redial_gate.lock().await;
        if self.health() {
            // Another path already restored the connection.
            return true;
        }
        if self.try_change_status(
            SessionStatus::Redialing,
            &[
                SessionStatus::Ok,
                SessionStatus::PassiveClosed,
                SessionStatus::Preparing,
            ],
        ) {
            // Pending calls are not replayed over the new connection;
            // their callers decide whether to retry.
            self.drain_in_flight(Status::wrong_conn("connection lost before reply"));
            f(self.clone()).await
        } else {
            false
        }
    }

    /// Retires the current connection's read loop ahead of a redial.
    pub(crate) fn replace_conn_token(&self) {
        let fresh = CancellationToken::new();
        let old = std::mem::replace(&mut *self.conn_cancel.lock(), fresh);
        old.cancel();
    }

    /// Closes the session locally: stops the read loop, waits for running
    /// handlers up to the context age plus a grace second, then hard-closes
    /// the connection.
    pub async fn close(self: &Arc<Self>) -> Result<(), Status> {
        if !self.try_change_status(
            SessionStatus::ActiveClosing,
            &[
                SessionStatus::Preparing,
                SessionStatus::Ok,
                SessionStatus::Redialing,
            ],
        ) {
            return Ok(());
        }
        tracing::info!(id = %self.id(), "closing session");
        self.drain_in_flight(Status::conn_closed("session closed locally"));
        self.teardown(Status::conn_closed("session closed locally"), false)
            .await;
        self.change_status(SessionStatus::ActiveClosed);
        Ok(())
    }

    /// Shared terminal cleanup. In-flight calls must already be drained.
    async fn teardown(self: &Arc<Self>, drain_status: Status, notify_disconnect: bool) {
        self.read_cancel.cancel();
        self.drain_in_flight(drain_status);

        self.tracker.close();
        match self.defaults.context_age {
            Some(age) => {
                let grace = age + Duration::from_secs(1);
                if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
                    tracing::warn!(id = %self.id(), "handlers outlived the grace period; cancelling");
                }
            }
            None => self.tracker.wait().await,
        }
        self.handler_cancel.cancel();

        if let Err(stat) = self.socket.close().await {
            tracing::debug!(id = %self.id(), %stat, "socket close");
        }

        if notify_disconnect {
            self.plugins.post_disconnect(self);
        }
        if let Some(core) = self.upgrade_peer() {
            core.hub.delete(&self.id());
        }
    }

    fn drain_in_flight(&self, stat: Status) {
        let drained: Vec<(u32, oneshot::Sender<Message>)> =
            self.in_flight.lock().drain().collect();
        for (seq, tx) in drained {
            let mut m = Message::new();
            m.set_seq(seq);
            m.set_mtype(Mtype::Reply);
            m.set_status(stat.clone());
            let _ = tx.send(m);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

/// The early view of a session handed to `post_dial` / `post_accept`
/// plugins, before the read loop starts. It allows direct, typed exchange
/// on the socket (authentication) plus identity and swap access.
#[derive(Clone, Copy)]
pub struct PreSession<'a> {
    sess: &'a Arc<Session>,
}

impl<'a> PreSession<'a> {
    pub(crate) fn new(sess: &'a Arc<Session>) -> Self {
        Self { sess }
    }

    pub fn id(&self) -> String {
        self.sess.id()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        self.sess.set_id(id);
    }

    pub fn local_addr(&self) -> String {
        self.sess.local_addr()
    }

    pub fn remote_addr(&self) -> String {
        self.sess.remote_addr()
    }

    pub fn swap(&self) -> &Swap {
        self.sess.swap()
    }

    /// Wire id of the peer's default body codec.
    pub fn default_body_codec(&self) -> u8 {
        self.sess.default_body_codec()
    }

    /// Writes one message directly, before the session serves. No write
    /// hooks run on this path.
    pub async fn pre_send<T: Serialize>(
        &self,
        mtype: Mtype,
        service_method: &str,
        body: Option<&T>,
        stat: Status,
        setting: MessageSetting,
    ) -> Result<(), Status> {
        let mut msg = self.sess.msg_pool.get();
        msg.set_seq(self.sess.next_seq());
        msg.set_mtype(mtype);
        msg.set_service_method(service_method);
        setting.apply_to(&mut msg)?;
        if let Some(body) = body {
            let codec = self.sess.resolve_codec(msg.body_codec())?;
            msg.set_body(codec, body)?;
        }
        if !stat.is_ok() {
            msg.set_status(stat);
        }
        self.sess.socket.write_message(&mut msg).await
    }

    /// Reads one message directly, before the session serves.
    pub async fn pre_receive(&self, timeout: Option<Duration>) -> Result<Message, Status> {
        let mut msg = self.sess.msg_pool.get();
        match timeout {
            Some(t) => match tokio::time::timeout(t, self.sess.socket.read_message(&mut msg)).await
            {
                Ok(read) => read?,
                Err(_elapsed) => {
                    return Err(Status::handle_timeout("no message within the deadline"))
                }
            },
            None => self.sess.socket.read_message(&mut msg).await?,
        }
        Ok(msg.take())
    }

    /// Decodes a message body with its codec, resolving the NIL sentinel
    /// to the peer default.
    pub fn decode_body<T: DeserializeOwned>(&self, msg: &Message) -> Result<T, Status> {
        self.sess.resolve_codec(msg.body_codec())?.unmarshal(msg.body())
    }
}

/// Live sessions of a peer, keyed by session id.
///
/// Holds weak references: a session is owned by its read loop and callers,
/// so a dead entry just disappears from the hub.
#[derive(Default)]
pub(crate) struct SessionHub {
    map: parking_lot::RwLock<HashMap<String, Weak<Session>>>,
}

impl SessionHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, sess: &Arc<Session>) {
        let id = sess.id();
        let prev = self.map.write().insert(id.clone(), Arc::downgrade(sess));
        if let Some(prev) = prev.and_then(|w| w.upgrade()) {
            if !Arc::ptr_eq(&prev, sess) {
                tracing::warn!(%id, "session id replaced an existing session");
            }
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.map.read().get(id).and_then(Weak::upgrade)
    }

    pub(crate) fn delete(&self, id: &str) {
        self.map.write().remove(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.map.read().values().filter(|w| w.strong_count() > 0).count()
    }

    /// Visits every live session; stop by returning `false`.
    pub(crate) fn range(&self, mut f: impl FnMut(Arc<Session>) -> bool) {
        let sessions: Vec<Arc<Session>> = self
            .map
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for sess in sessions {
            if !f(sess) {
                break;
            }
        }
    }
}
