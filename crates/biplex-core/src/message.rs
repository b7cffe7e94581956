//! The in-memory representation of one wire unit.

use std::time::Duration;

use bytes::Bytes;
use object_pool::Pool;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::codec::{BodyCodec, NIL_CODEC_ID};
use crate::meta::{Meta, META_ACCEPT_BODY_CODEC, META_CONTEXT_AGE};
use crate::status::Status;
use crate::xfer::XferPipe;

/// Message type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Mtype {
    /// Request expecting a reply.
    #[default]
    Call = 1,
    /// Response to a call, correlated by sequence.
    Reply = 2,
    /// Fire-and-forget notification.
    Push = 3,
    /// Authentication request, sent before the session is serving.
    AuthCall = 4,
    /// Authentication response.
    AuthReply = 5,
}

impl Mtype {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Result<Self, Status> {
        match b {
            1 => Ok(Mtype::Call),
            2 => Ok(Mtype::Reply),
            3 => Ok(Mtype::Push),
            4 => Ok(Mtype::AuthCall),
            5 => Ok(Mtype::AuthReply),
            _ => Err(Status::bad_message(format!("unknown message type: {b}"))),
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Mtype::Call => "CALL",
            Mtype::Reply => "REPLY",
            Mtype::Push => "PUSH",
            Mtype::AuthCall => "AUTH_CALL",
            Mtype::AuthReply => "AUTH_REPLY",
        }
    }

    /// True for the request kinds that expect a reply.
    pub fn is_call(self) -> bool {
        matches!(self, Mtype::Call | Mtype::AuthCall)
    }

    /// True for the response kinds.
    pub fn is_reply(self) -> bool {
        matches!(self, Mtype::Reply | Mtype::AuthReply)
    }
}

/// One unit of wire traffic.
///
/// The body is held in serialized form; typed values are marshalled by the
/// session API before the message enters the wire layer, and the transfer
/// pipe is applied by the proto during pack/unpack.
#[derive(Debug, Default)]
pub struct Message {
    seq: u32,
    mtype: Mtype,
    service_method: String,
    meta: Meta,
    body_codec: u8,
    body: Bytes,
    status: Status,
    xfer_pipe: XferPipe,
    size: u32,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
    }

    pub fn mtype(&self) -> Mtype {
        self.mtype
    }

    pub fn set_mtype(&mut self, mtype: Mtype) {
        self.mtype = mtype;
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    pub fn set_service_method(&mut self, service_method: impl Into<String>) {
        self.service_method = service_method.into();
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    /// The body codec id; [`NIL_CODEC_ID`] defers to the peer default.
    pub fn body_codec(&self) -> u8 {
        self.body_codec
    }

    pub fn set_body_codec(&mut self, codec: u8) {
        self.body_codec = codec;
    }

    /// Serialized body bytes (after any transfer-pipe unpack).
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Marshals a typed body with `codec` and records the codec id.
    pub fn set_body<T: Serialize + ?Sized>(
        &mut self,
        codec: BodyCodec,
        v: &T,
    ) -> Result<(), Status> {
        self.body = Bytes::from(codec.marshal(v)?);
        self.body_codec = codec.id();
        Ok(())
    }

    /// Installs raw body bytes; the codec defaults to raw when unset.
    pub fn set_body_bytes(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        if self.body_codec == NIL_CODEC_ID {
            self.body_codec = BodyCodec::Raw.id();
        }
    }

    /// Installs body bytes without touching the codec id. Used by protos.
    pub fn set_raw_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn xfer_pipe(&self) -> &XferPipe {
        &self.xfer_pipe
    }

    pub fn xfer_pipe_mut(&mut self) -> &mut XferPipe {
        &mut self.xfer_pipe
    }

    /// Bytes actually moved on the wire, recorded by the proto after
    /// pack/unpack.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    /// The caller-supplied deadline from `X-Context-Age`, if any. The
    /// value is decimal seconds; fractions carry sub-second deadlines.
    pub fn context_age(&self) -> Option<Duration> {
        self.meta
            .get(META_CONTEXT_AGE)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// The reply codec the caller asked for via `X-Accept-Body-Codec`.
    pub fn accept_body_codec(&self) -> Option<u8> {
        self.meta
            .get(META_ACCEPT_BODY_CODEC)
            .and_then(|v| v.parse::<u8>().ok())
    }

    /// Clears every field back to the freshly-constructed state.
    pub fn reset(&mut self) {
        self.seq = 0;
        self.mtype = Mtype::Call;
        self.service_method.clear();
        self.meta.clear();
        self.body_codec = NIL_CODEC_ID;
        self.body = Bytes::new();
        self.status.reset();
        self.xfer_pipe.reset();
        self.size = 0;
    }
}

/// Per-message options applied at the call site.
///
/// Mirrors the wire surface: body codec, accepted reply codec, transfer
/// pipe, meta edits and the per-call deadline.
#[derive(Debug, Clone, Default)]
pub struct MessageSetting {
    body_codec: Option<u8>,
    accept_body_codec: Option<u8>,
    xfer_ids: Vec<u8>,
    set_meta: Vec<(String, String)>,
    add_meta: Vec<(String, String)>,
    context_age: Option<Duration>,
}

impl MessageSetting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the body codec by wire id.
    pub fn with_body_codec(mut self, id: u8) -> Self {
        self.body_codec = Some(id);
        self
    }

    /// Asks the remote peer to encode the reply with the given codec.
    pub fn with_accept_body_codec(mut self, id: u8) -> Self {
        self.accept_body_codec = Some(id);
        self
    }

    /// Appends transfer filter ids to the message's pipe.
    pub fn with_xfer_pipe(mut self, ids: &[u8]) -> Self {
        self.xfer_ids.extend_from_slice(ids);
        self
    }

    /// Replaces a meta key.
    pub fn with_set_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_meta.push((key.into(), value.into()));
        self
    }

    /// Appends a meta pair.
    pub fn with_add_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_meta.push((key.into(), value.into()));
        self
    }

    /// Bounds the call with a deadline, carried to the remote handler.
    pub fn with_context_age(mut self, age: Duration) -> Self {
        self.context_age = Some(age);
        self
    }

    /// The deadline requested at the call site, if any.
    pub fn context_age(&self) -> Option<Duration> {
        self.context_age
    }

    /// Applies the options to a message being built.
    pub fn apply_to(&self, m: &mut Message) -> Result<(), Status> {
        if let Some(id) = self.body_codec {
            m.set_body_codec(id);
        }
        if let Some(id) = self.accept_body_codec {
            m.meta_mut().set(META_ACCEPT_BODY_CODEC, id.to_string());
        }
        if !self.xfer_ids.is_empty() {
            m.xfer_pipe_mut().append(&self.xfer_ids)?;
        }
        for (k, v) in &self.set_meta {
            m.meta_mut().set(k.clone(), v.clone());
        }
        for (k, v) in &self.add_meta {
            m.meta_mut().add(k.clone(), v.clone());
        }
        if let Some(age) = self.context_age {
            // Encoded as decimal seconds so sub-second deadlines survive
            // the wire; both sides must agree on the shorter deadline.
            if !age.is_zero() {
                m.meta_mut()
                    .set(META_CONTEXT_AGE, age.as_secs_f64().to_string());
            }
        }
        Ok(())
    }
}

/// Number of messages kept on the free list.
const DEFAULT_POOL_CAPACITY: usize = 128;

/// Free list of reusable [`Message`] structs for the hot send/receive
/// paths. Acquiring always yields a fully reset message.
#[derive(Clone)]
pub struct MessagePool {
    pool: Arc<Pool<Message>>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Pool::new(DEFAULT_POOL_CAPACITY, Message::new)),
        }
    }

    /// Pulls a message off the free list, reset to the default state.
    pub fn get(&self) -> PooledMessage {
        let mut inner = self.pool.pull_owned(Message::new);
        inner.reset();
        PooledMessage { inner }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled message that returns to the free list on drop.
pub struct PooledMessage {
    inner: object_pool::ReusableOwned<Message>,
}

impl PooledMessage {
    /// Moves the message out, leaving a reset shell on the free list.
    pub fn take(mut self) -> Message {
        std::mem::take(&mut *self.inner)
    }
}

impl Deref for PooledMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.inner
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.inner
    }
}

impl std::fmt::Debug for PooledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}
