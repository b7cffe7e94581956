//! Handler and plugin contexts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use biplex_core::{BodyCodec, Message, Meta, Mtype, Status, NIL_CODEC_ID};

use crate::session::{Session, Swap};

/// Shared state of one incoming CALL or PUSH being handled.
pub(crate) struct HandlerCtx {
    pub(crate) sess: Arc<Session>,
    pub(crate) input: Message,
    pub(crate) reply_meta: Mutex<Meta>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) start: std::time::Instant,
}

impl HandlerCtx {
    pub(crate) fn new(sess: Arc<Session>, input: Message, deadline: Option<Instant>) -> Self {
        Self {
            sess,
            input,
            reply_meta: Mutex::new(Meta::new()),
            deadline,
            start: std::time::Instant::now(),
        }
    }

    /// The input body codec with the NIL sentinel resolved to the peer
    /// default.
    pub(crate) fn input_codec(&self) -> Result<BodyCodec, Status> {
        let id = match self.input.body_codec() {
            NIL_CODEC_ID => self.sess.default_body_codec(),
            id => id,
        };
        BodyCodec::by_id(id)
    }

    /// The codec a typed REPLY should be encoded with: the caller's
    /// accepted codec when valid, otherwise the input codec, otherwise the
    /// default. Raw handlers encode their replies themselves, so a typed
    /// reply never rides the raw codec.
    pub(crate) fn reply_codec(&self) -> BodyCodec {
        if let Some(id) = self.input.accept_body_codec() {
            if let Ok(codec) = BodyCodec::by_id(id) {
                if codec != BodyCodec::Raw {
                    return codec;
                }
            }
        }
        if let Ok(codec) = self.input_codec() {
            if codec != BodyCodec::Raw {
                return codec;
            }
        }
        match BodyCodec::by_id(self.sess.default_body_codec()) {
            Ok(codec) if codec != BodyCodec::Raw => codec,
            _ => BodyCodec::Json,
        }
    }
}

macro_rules! handler_ctx_accessors {
    () => {
        /// The session carrying this message. Handlers may issue calls and
        /// pushes back over it.
        pub fn session(&self) -> &Arc<Session> {
            &self.inner.sess
        }

        /// Sequence number of the input message.
        pub fn seq(&self) -> u32 {
            self.inner.input.seq()
        }

        /// Message type of the input message.
        pub fn mtype(&self) -> Mtype {
            self.inner.input.mtype()
        }

        /// Canonical service method of the input message.
        pub fn service_method(&self) -> &str {
            self.inner.input.service_method()
        }

        /// Headers of the input message.
        pub fn meta(&self) -> &Meta {
            self.inner.input.meta()
        }

        /// Serialized input body.
        pub fn input_body(&self) -> &Bytes {
            self.inner.input.body()
        }

        /// Wire id of the input body codec.
        pub fn input_body_codec(&self) -> u8 {
            self.inner.input.body_codec()
        }

        /// Per-session scratch space shared with plugins.
        pub fn swap(&self) -> &Swap {
            self.inner.sess.swap()
        }

        /// Time left before this handler's deadline, if one applies.
        pub fn remaining(&self) -> Option<Duration> {
            self.inner
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
        }
    };
}

/// Context handed to CALL handlers.
#[derive(Clone)]
pub struct CallCtx {
    pub(crate) inner: Arc<HandlerCtx>,
}

impl CallCtx {
    handler_ctx_accessors!();

    /// Replaces a meta key on the pending reply.
    pub fn set_reply_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.reply_meta.lock().set(key, value);
    }

    /// Appends a meta pair to the pending reply.
    pub fn add_reply_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.reply_meta.lock().add(key, value);
    }
}

/// Context handed to PUSH handlers.
#[derive(Clone)]
pub struct PushCtx {
    pub(crate) inner: Arc<HandlerCtx>,
}

impl PushCtx {
    handler_ctx_accessors!();
}

/// Context handed to the unknown-CALL fallback: the body stays raw.
#[derive(Clone)]
pub struct UnknownCallCtx {
    pub(crate) inner: Arc<HandlerCtx>,
}

impl UnknownCallCtx {
    handler_ctx_accessors!();

    /// Replaces a meta key on the pending reply.
    pub fn set_reply_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.reply_meta.lock().set(key, value);
    }
}

/// Context handed to the unknown-PUSH fallback: the body stays raw.
#[derive(Clone)]
pub struct UnknownPushCtx {
    pub(crate) inner: Arc<HandlerCtx>,
}

impl UnknownPushCtx {
    handler_ctx_accessors!();
}

/// Plugin view of a message about to be (or just) written.
pub struct WriteCtx<'a> {
    sess: &'a Arc<Session>,
    msg: &'a mut Message,
}

impl<'a> WriteCtx<'a> {
    pub(crate) fn new(sess: &'a Arc<Session>, msg: &'a mut Message) -> Self {
        Self { sess, msg }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.sess
    }

    pub fn msg(&self) -> &Message {
        self.msg
    }

    pub fn msg_mut(&mut self) -> &mut Message {
        self.msg
    }

    pub fn swap(&self) -> &Swap {
        self.sess.swap()
    }
}

/// Plugin view of a message just read; header hooks may rewrite the
/// service method before routing.
pub struct ReadCtx<'a> {
    sess: &'a Arc<Session>,
    msg: &'a mut Message,
}

impl<'a> ReadCtx<'a> {
    pub(crate) fn new(sess: &'a Arc<Session>, msg: &'a mut Message) -> Self {
        Self { sess, msg }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.sess
    }

    pub fn msg(&self) -> &Message {
        self.msg
    }

    pub fn service_method(&self) -> &str {
        self.msg.service_method()
    }

    /// Rewrites the service method before the router sees it.
    pub fn reset_service_method(&mut self, service_method: impl Into<String>) {
        self.msg.set_service_method(service_method);
    }

    pub fn swap(&self) -> &Swap {
        self.sess.swap()
    }
}
