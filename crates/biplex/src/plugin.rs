//! Plugins: ordered hook chains around every stage of the peer.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use biplex_core::{BoxFuture, Message, Status};

use crate::config::PeerConfig;
use crate::context::{ReadCtx, WriteCtx};
use crate::peer::Peer;
use crate::router::Handler;
use crate::session::{PreSession, Session};

/// Renders a panic payload for logs and statuses.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A plugin hooks into the peer's lifecycle by overriding any subset of the
/// methods below; the defaults are no-ops. Fallible hooks short-circuit
/// their chain by returning an error status.
///
/// `post_dial` and `post_accept` run before the session starts serving and
/// may perform IO on it (authentication does); they are therefore async.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Before peer configuration is validated.
    fn pre_new_peer(&self, cfg: &mut PeerConfig) -> Result<(), Status> {
        Ok(())
    }

    /// After the peer is constructed.
    fn post_new_peer(&self, peer: &Peer) -> Result<(), Status> {
        Ok(())
    }

    /// After a handler registration.
    fn post_reg(&self, handler: &Handler) -> Result<(), Status> {
        Ok(())
    }

    /// After a listener is bound.
    fn post_listen(&self, addr: &str) {}

    /// Before a dial attempt.
    fn pre_dial(&self, local_addr: &str, remote_addr: &str) -> Result<(), Status> {
        Ok(())
    }

    /// After a successful dial and protocol setup. `is_redial` marks
    /// reconnections of an existing session.
    fn post_dial<'a>(
        &'a self,
        sess: PreSession<'a>,
        is_redial: bool,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async { Ok(()) })
    }

    /// After an accept and protocol setup.
    fn post_accept<'a>(&'a self, sess: PreSession<'a>) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async { Ok(()) })
    }

    /// Before a CALL is framed.
    fn pre_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After a CALL is written.
    fn post_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// Before a REPLY is framed.
    fn pre_write_reply(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After a REPLY is written.
    fn post_write_reply(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// Before a PUSH is framed.
    fn pre_write_push(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After a PUSH is written.
    fn post_write_push(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// Before the next header is decoded from the socket.
    fn pre_read_header(&self, sess: &Arc<Session>) -> Result<(), Status> {
        Ok(())
    }

    /// After a CALL header is decoded; may rewrite the service method.
    fn post_read_call_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// Before a CALL body is decoded.
    fn pre_read_call_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After a CALL body is decoded.
    fn post_read_call_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After a PUSH header is decoded; may rewrite the service method.
    fn post_read_push_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// Before a PUSH body is decoded.
    fn pre_read_push_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After a PUSH body is decoded.
    fn post_read_push_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After a REPLY header is decoded.
    fn post_read_reply_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// Before a REPLY body is decoded.
    fn pre_read_reply_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After a REPLY body is decoded.
    fn post_read_reply_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// After the connection dropped.
    fn post_disconnect(&self, sess: &Arc<Session>) {}
}

macro_rules! dispatch_write_hook {
    ($fn_name:ident, $hook:ident) => {
        pub(crate) fn $fn_name(
            &self,
            sess: &Arc<Session>,
            msg: &mut Message,
        ) -> Result<(), Status> {
            for p in &self.plugins {
                let mut ctx = WriteCtx::new(sess, msg);
                guard_sync(p.name(), stringify!($hook), || p.$hook(&mut ctx))?;
            }
            Ok(())
        }
    };
}

macro_rules! dispatch_read_hook {
    ($fn_name:ident, $hook:ident) => {
        pub(crate) fn $fn_name(
            &self,
            sess: &Arc<Session>,
            msg: &mut Message,
        ) -> Result<(), Status> {
            for p in &self.plugins {
                let mut ctx = ReadCtx::new(sess, msg);
                guard_sync(p.name(), stringify!($hook), || p.$hook(&mut ctx))?;
            }
            Ok(())
        }
    };
}

fn guard_sync(
    plugin: &'static str,
    hook: &'static str,
    f: impl FnOnce() -> Result<(), Status>,
) -> Result<(), Status> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(stat)) => {
            tracing::warn!(plugin, hook, %stat, "plugin hook failed");
            Err(stat)
        }
        Err(payload) => {
            let msg = panic_message(payload);
            tracing::error!(plugin, hook, %msg, "plugin hook panicked");
            Err(Status::internal_server_error(format!(
                "plugin {plugin} panicked in {hook}: {msg}"
            )))
        }
    }
}

async fn guard_async(
    plugin: &'static str,
    hook: &'static str,
    fut: BoxFuture<'_, Result<(), Status>>,
) -> Result<(), Status> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(stat)) => {
            tracing::warn!(plugin, hook, %stat, "plugin hook failed");
            Err(stat)
        }
        Err(payload) => {
            let msg = panic_message(payload);
            tracing::error!(plugin, hook, %msg, "plugin hook panicked");
            Err(Status::internal_server_error(format!(
                "plugin {plugin} panicked in {hook}: {msg}"
            )))
        }
    }
}

/// An ordered list of plugins.
///
/// Hooks dispatch front-to-back and short-circuit on the first error. A
/// child container (sub-route groups) extends its parent's chain, so group
/// plugins run after the inherited ones.
#[derive(Clone, Default)]
pub struct PluginContainer {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends plugins, preserving their relative order.
    pub fn append_left(&mut self, plugins: Vec<Arc<dyn Plugin>>) {
        let mut merged = plugins;
        merged.extend(self.plugins.drain(..));
        self.plugins = merged;
    }

    /// Appends plugins after the existing chain.
    pub fn append_right(&mut self, plugins: Vec<Arc<dyn Plugin>>) {
        self.plugins.extend(plugins);
    }

    /// A child chain: this container's plugins followed by `extra`.
    pub(crate) fn child_with(&self, extra: &[Arc<dyn Plugin>]) -> Self {
        let mut plugins = self.plugins.clone();
        plugins.extend(extra.iter().cloned());
        Self { plugins }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn pre_new_peer(&self, cfg: &mut PeerConfig) -> Result<(), Status> {
        for p in &self.plugins {
            guard_sync(p.name(), "pre_new_peer", || p.pre_new_peer(cfg))?;
        }
        Ok(())
    }

    pub(crate) fn post_new_peer(&self, peer: &Peer) -> Result<(), Status> {
        for p in &self.plugins {
            guard_sync(p.name(), "post_new_peer", || p.post_new_peer(peer))?;
        }
        Ok(())
    }

    pub(crate) fn post_reg(&self, handler: &Handler) -> Result<(), Status> {
        for p in &self.plugins {
            guard_sync(p.name(), "post_reg", || p.post_reg(handler))?;
        }
        Ok(())
    }

    pub(crate) fn post_listen(&self, addr: &str) {
        for p in &self.plugins {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| p.post_listen(addr)))
                .map_err(|payload| {
                    let msg = panic_message(payload);
                    tracing::error!(plugin = p.name(), %msg, "post_listen panicked");
                });
        }
    }

    pub(crate) fn pre_dial(&self, local_addr: &str, remote_addr: &str) -> Result<(), Status> {
        for p in &self.plugins {
            guard_sync(p.name(), "pre_dial", || p.pre_dial(local_addr, remote_addr))?;
        }
        Ok(())
    }

    pub(crate) async fn post_dial(
        &self,
        sess: &Arc<Session>,
        is_redial: bool,
    ) -> Result<(), Status> {
        for p in &self.plugins {
            guard_async(
                p.name(),
                "post_dial",
                p.post_dial(PreSession::new(sess), is_redial),
            )
            .await?;
        }
        Ok(())
    }

    pub(crate) async fn post_accept(&self, sess: &Arc<Session>) -> Result<(), Status> {
        for p in &self.plugins {
            guard_async(p.name(), "post_accept", p.post_accept(PreSession::new(sess))).await?;
        }
        Ok(())
    }

    pub(crate) fn pre_read_header(&self, sess: &Arc<Session>) -> Result<(), Status> {
        for p in &self.plugins {
            guard_sync(p.name(), "pre_read_header", || p.pre_read_header(sess))?;
        }
        Ok(())
    }

    pub(crate) fn post_disconnect(&self, sess: &Arc<Session>) {
        for p in &self.plugins {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| p.post_disconnect(sess)))
                .map_err(|payload| {
                    let msg = panic_message(payload);
                    tracing::error!(plugin = p.name(), %msg, "post_disconnect panicked");
                });
        }
    }

    dispatch_write_hook!(pre_write_call, pre_write_call);
    dispatch_write_hook!(post_write_call, post_write_call);
    dispatch_write_hook!(pre_write_reply, pre_write_reply);
    dispatch_write_hook!(post_write_reply, post_write_reply);
    dispatch_write_hook!(pre_write_push, pre_write_push);
    dispatch_write_hook!(post_write_push, post_write_push);

    dispatch_read_hook!(post_read_call_header, post_read_call_header);
    dispatch_read_hook!(pre_read_call_body, pre_read_call_body);
    dispatch_read_hook!(post_read_call_body, post_read_call_body);
    dispatch_read_hook!(post_read_push_header, post_read_push_header);
    dispatch_read_hook!(pre_read_push_body, pre_read_push_body);
    dispatch_read_hook!(post_read_push_body, post_read_push_body);
    dispatch_read_hook!(post_read_reply_header, post_read_reply_header);
    dispatch_read_hook!(pre_read_reply_body, pre_read_reply_body);
    dispatch_read_hook!(post_read_reply_body, post_read_reply_body);
}

impl std::fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}
