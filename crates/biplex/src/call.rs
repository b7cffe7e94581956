//! The client-side handle of one in-flight CALL.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use biplex_core::{BodyCodec, Message, Meta, Status, NIL_CODEC_ID};

use crate::session::Session;

/// A CALL that has been written and awaits its REPLY.
///
/// The command completes exactly once: with the REPLY, with
/// `HANDLE_TIMEOUT` when the deadline fires first, or with a connection
/// status when the session drops. Dropping the command cancels it and
/// releases its sequence slot.
pub struct CallCmd<R> {
    seq: u32,
    service_method: String,
    rx: oneshot::Receiver<Message>,
    sess: Arc<Session>,
    deadline: Option<Duration>,
    default_codec: u8,
    _reply: PhantomData<fn() -> R>,
}

impl<R> CallCmd<R> {
    pub(crate) fn new(
        seq: u32,
        service_method: String,
        rx: oneshot::Receiver<Message>,
        sess: Arc<Session>,
        deadline: Option<Duration>,
        default_codec: u8,
    ) -> Self {
        Self {
            seq,
            service_method,
            rx,
            sess,
            deadline,
            default_codec,
            _reply: PhantomData,
        }
    }

    /// Sequence number correlating the REPLY.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Canonical service method of the CALL.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Awaits the REPLY and passes its raw-coded body through unchanged.
    ///
    /// The counterpart of [`CallCmd::result`] for byte bodies: the REPLY
    /// must carry the raw codec, anything typed is a `BAD_MESSAGE`.
    pub async fn result_bytes(self) -> Result<Bytes, Status> {
        let default_codec = self.default_codec;
        let msg = self.wait().await?;
        let codec_id = match msg.body_codec() {
            NIL_CODEC_ID => default_codec,
            id => id,
        };
        BodyCodec::by_id(codec_id)?
            .unmarshal_bytes(msg.body())
            .map(Bytes::from)
    }

    /// Awaits the REPLY and returns the raw message together with its
    /// status, without decoding the body.
    pub async fn reply(self) -> (Option<Message>, Status) {
        match self.wait().await {
            Ok(msg) => (Some(msg), Status::ok()),
            Err(stat) => (None, stat),
        }
    }

    /// Awaits the REPLY's meta headers without decoding the body.
    pub async fn reply_meta(self) -> Result<Meta, Status> {
        self.wait().await.map(|msg| msg.meta().clone())
    }

    async fn wait(mut self) -> Result<Message, Status> {
        let recv = &mut self.rx;
        let received = match self.deadline {
            Some(age) => match tokio::time::timeout(age, recv).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    self.sess.remove_in_flight(self.seq);
                    return Err(Status::handle_timeout(format!(
                        "no reply to {} within {:?}",
                        self.service_method, age
                    )));
                }
            },
            None => recv.await,
        };
        match received {
            Ok(msg) => {
                let stat = msg.status().clone();
                if stat.is_ok() {
                    Ok(msg)
                } else {
                    Err(stat)
                }
            }
            // The sender only disappears when the session drains; report it
            // as a closed connection.
            Err(_) => Err(Status::conn_closed("session dropped the pending call")),
        }
    }
}

impl<R: DeserializeOwned> CallCmd<R> {
    /// Awaits the REPLY and decodes its body.
    ///
    /// A non-OK status (remote or local) is returned as the error; on
    /// success the body is decoded with the REPLY's codec.
    pub async fn result(self) -> Result<R, Status> {
        let default_codec = self.default_codec;
        let msg = self.wait().await?;
        let codec_id = match msg.body_codec() {
            NIL_CODEC_ID => default_codec,
            id => id,
        };
        BodyCodec::by_id(codec_id)?.unmarshal(msg.body())
    }
}

impl<R> Drop for CallCmd<R> {
    fn drop(&mut self) {
        // Cancellation path: a completed call has already been removed by
        // the read loop, making this a no-op.
        self.sess.remove_in_flight(self.seq);
    }
}

impl<R> std::fmt::Debug for CallCmd<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCmd")
            .field("seq", &self.seq)
            .field("service_method", &self.service_method)
            .finish_non_exhaustive()
    }
}
