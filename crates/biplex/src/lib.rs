//! biplex: a peer-to-peer RPC framework with bidirectional messaging over
//! pluggable transports.
//!
//! Every [`Peer`] acts simultaneously as client and server: either side of
//! a [`Session`] may issue a CALL (request/response) or a PUSH
//! (fire-and-forget). Connections are long-lived, multiplexed, and carry
//! an interleaved sequence of framed messages.
//!
//! # Quick start
//!
//! ```ignore
//! use biplex::prelude::*;
//!
//! // Server
//! let srv = Peer::new(PeerConfig { listen_port: 9090, ..Default::default() }, vec![])?;
//! let echo = srv.sub_route("echo", vec![]);
//! echo.route_call("AddSuffix", |_ctx: CallCtx, arg: String| async move {
//!     Ok::<_, Status>(format!("{arg} ------ biplex"))
//! })?;
//! tokio::spawn({ let srv = srv.clone(); async move { srv.listen_and_serve().await } });
//!
//! // Client
//! let cli = Peer::new(PeerConfig::default(), vec![])?;
//! let sess = cli.dial("127.0.0.1:9090").await?;
//! let reply: String = sess.call("/echo/add_suffix", "this is request".to_string()).await?;
//! ```
//!
//! Sessions are symmetric: a server handler may call or push back to the
//! client over `ctx.session()`, and the client routes those through its
//! own handlers.

#![forbid(unsafe_code)]

mod call;
mod config;
mod context;
mod dialer;
mod peer;
mod plugin;
mod router;
mod session;
mod task_pool;

pub mod plugins;

// The wire layer is part of the public surface.
pub use biplex_core::{
    code, raw_proto_func, BodyCodec, BoxFuture, Bytes, Conn, Lz4Filter, Message, MessagePool,
    MessageSetting, Meta, Mtype, PooledMessage, Proto, ProtoFunc, RawProto, Socket, SocketReader,
    SocketWriter, Status, Stream, XferFilter, XferPipe, ZstdFilter, MAX_MESSAGE_SIZE,
    META_ACCEPT_BODY_CODEC, META_CONTEXT_AGE, NIL_CODEC_ID,
};
pub use biplex_core::xfer;

pub use call::CallCmd;
pub use config::{Network, PeerConfig};
pub use context::{CallCtx, PushCtx, ReadCtx, UnknownCallCtx, UnknownPushCtx, WriteCtx};
pub use dialer::Dialer;
pub use peer::Peer;
pub use plugin::{Plugin, PluginContainer};
pub use router::{Handler, HandlerKind, Router, ServiceMethodMapper, SubRouter};
pub use session::{PreSession, Session, SessionStatus, Swap};
pub use task_pool::TaskPool;

/// Convenient imports for peers and handlers.
pub mod prelude {
    pub use crate::{
        BodyCodec, CallCtx, MessageSetting, Mtype, Network, Peer, PeerConfig, Plugin, PushCtx,
        ServiceMethodMapper, Session, SessionStatus, Status,
    };
}
