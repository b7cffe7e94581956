//! Proto: the pluggable boundary between a [`Message`] and bytes.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::message::{Message, Mtype};
use crate::meta::Meta;
use crate::socket::{SocketReader, SocketWriter};
use crate::status::Status;
use crate::xfer::XferPipe;
use crate::BoxFuture;

/// Hard cap on one framed message, length prefix excluded.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Encoder/decoder binding a [`Message`] to a byte stream.
///
/// One proto instance is bound to a single socket. Pack writes exactly one
/// message (with a single underlying write where possible) and unpack reads
/// exactly one; both record the encoded size on the message. The socket
/// serializes each direction, so implementations see at most one packer and
/// one unpacker at a time.
///
/// A pack or unpack error is a transport fault: the caller must close the
/// socket, as the stream position can no longer be trusted.
pub trait Proto: Send + Sync + 'static {
    /// Wire id and name of this proto.
    fn version(&self) -> (u8, &'static str);

    /// Writes one message to the stream.
    fn pack<'a>(
        &'a self,
        w: &'a mut SocketWriter,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<(), Status>>;

    /// Reads one message from the stream.
    fn unpack<'a>(
        &'a self,
        r: &'a mut SocketReader,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<(), Status>>;
}

/// Constructor producing a proto for a new socket.
pub type ProtoFunc = Arc<dyn Fn() -> Box<dyn Proto> + Send + Sync>;

/// The default framed proto.
pub fn raw_proto_func() -> ProtoFunc {
    Arc::new(|| Box::new(RawProto))
}

/// Default framed wire format. Big-endian, 4-byte lengths:
///
/// ```text
/// {4: total length (excluding itself)}
/// {4: uri length} {uri}
/// {4: sequence}
/// {1: message type}
/// {1: body codec id}
/// {4: meta length} {meta query string}
/// {4: status length} {status query string}
/// {4: transfer pipe length} {transfer filter ids}
/// {body: remaining bytes}
/// ```
pub struct RawProto;

const RAW_PROTO_ID: u8 = b'r';

/// Fixed header bytes after the uri: seq + mtype + codec + three lengths.
const FIXED_FIELDS: usize = 4 + 1 + 1 + 4 + 4 + 4;

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn take_u32(buf: &[u8], at: usize) -> Result<u32, Status> {
    let end = at
        .checked_add(4)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| Status::bad_message("truncated frame"))?;
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..end]);
    Ok(u32::from_be_bytes(b))
}

fn take_slice(buf: &[u8], at: usize, len: usize) -> Result<&[u8], Status> {
    let end = at
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| Status::bad_message("truncated frame"))?;
    Ok(&buf[at..end])
}

impl Proto for RawProto {
    fn version(&self) -> (u8, &'static str) {
        (RAW_PROTO_ID, "raw")
    }

    fn pack<'a>(
        &'a self,
        w: &'a mut SocketWriter,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            let body = m.xfer_pipe().on_pack(m.body().to_vec())?;
            let uri = m.service_method().as_bytes();
            let meta = m.meta().encode();
            let status = m.status().encode();
            let xfer = m.xfer_pipe().ids();

            let frame_len = 4 + uri.len() + FIXED_FIELDS + meta.len() + status.len() + xfer.len()
                + body.len();
            if frame_len > MAX_MESSAGE_SIZE {
                return Err(Status::bad_message(format!(
                    "frame of {frame_len} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit"
                )));
            }

            let mut buf = Vec::with_capacity(4 + frame_len);
            put_u32(&mut buf, frame_len as u32);
            put_u32(&mut buf, uri.len() as u32);
            buf.extend_from_slice(uri);
            put_u32(&mut buf, m.seq());
            buf.push(m.mtype().byte());
            buf.push(m.body_codec());
            put_u32(&mut buf, meta.len() as u32);
            buf.extend_from_slice(&meta);
            put_u32(&mut buf, status.len() as u32);
            buf.extend_from_slice(&status);
            put_u32(&mut buf, xfer.len() as u32);
            buf.extend_from_slice(xfer);
            buf.extend_from_slice(&body);

            m.set_size(buf.len() as u32);

            w.write_all(&buf).await.map_err(Status::from)?;
            w.flush().await.map_err(Status::from)?;
            Ok(())
        })
    }

    fn unpack<'a>(
        &'a self,
        r: &'a mut SocketReader,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            let mut len_buf = [0u8; 4];
            r.read_exact(&mut len_buf).await.map_err(Status::from)?;
            let frame_len = u32::from_be_bytes(len_buf) as usize;
            if frame_len > MAX_MESSAGE_SIZE {
                // Drain the frame so the stream stays aligned for the
                // caller's error handling.
                let mut remaining = frame_len;
                let mut scratch = [0u8; 8192];
                while remaining > 0 {
                    let take = remaining.min(scratch.len());
                    r.read_exact(&mut scratch[..take])
                        .await
                        .map_err(Status::from)?;
                    remaining -= take;
                }
                return Err(Status::bad_message(format!(
                    "frame of {frame_len} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit"
                )));
            }
            if frame_len < 4 + FIXED_FIELDS {
                return Err(Status::bad_message("frame shorter than its header"));
            }

            let mut buf = vec![0u8; frame_len];
            r.read_exact(&mut buf).await.map_err(Status::from)?;

            let mut at = 0;
            let uri_len = take_u32(&buf, at)? as usize;
            at += 4;
            let uri = take_slice(&buf, at, uri_len)?;
            m.set_service_method(
                std::str::from_utf8(uri)
                    .map_err(|_| Status::bad_message("service method is not utf-8"))?,
            );
            at += uri_len;

            m.set_seq(take_u32(&buf, at)?);
            at += 4;
            let mtype = take_slice(&buf, at, 1)?[0];
            m.set_mtype(Mtype::from_byte(mtype)?);
            at += 1;
            let codec = take_slice(&buf, at, 1)?[0];
            m.set_body_codec(codec);
            at += 1;

            let meta_len = take_u32(&buf, at)? as usize;
            at += 4;
            *m.meta_mut() = Meta::decode(take_slice(&buf, at, meta_len)?)?;
            at += meta_len;

            let status_len = take_u32(&buf, at)? as usize;
            at += 4;
            m.set_status(Status::decode(take_slice(&buf, at, status_len)?)?);
            at += status_len;

            let xfer_len = take_u32(&buf, at)? as usize;
            at += 4;
            let pipe = XferPipe::from_wire(take_slice(&buf, at, xfer_len)?)?;
            at += xfer_len;

            let body = pipe.on_unpack(buf[at..].to_vec())?;
            *m.xfer_pipe_mut() = pipe;
            m.set_raw_body(body);
            m.set_size((4 + frame_len) as u32);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BodyCodec;
    use crate::socket::{new_reader, new_writer};

    async fn roundtrip(m: &mut Message) -> Message {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut w = new_writer(Box::new(a));
        let mut r = new_reader(Box::new(b));

        RawProto.pack(&mut w, m).await.unwrap();
        let mut out = Message::new();
        RawProto.unpack(&mut r, &mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_pack_unpack_all_fields() {
        let mut m = Message::new();
        m.set_seq(42);
        m.set_mtype(Mtype::Call);
        m.set_service_method("/group/home/test");
        m.meta_mut().add("tag", "a");
        m.meta_mut().add("tag", "b");
        m.set_body(BodyCodec::Json, "this is request").unwrap();
        m.xfer_pipe_mut().append(&[b'l']).unwrap();

        let out = roundtrip(&mut m).await;
        assert_eq!(out.seq(), 42);
        assert_eq!(out.mtype(), Mtype::Call);
        assert_eq!(out.service_method(), "/group/home/test");
        assert_eq!(out.meta(), m.meta());
        assert_eq!(out.body_codec(), BodyCodec::Json.id());
        assert_eq!(out.body(), m.body());
        assert_eq!(out.xfer_pipe().ids(), &[b'l']);
        assert!(out.status().is_ok());
        assert_eq!(out.size(), m.size());
        assert!(out.size() > 0);
    }

    #[tokio::test]
    async fn test_status_roundtrip() {
        let mut m = Message::new();
        m.set_mtype(Mtype::Reply);
        m.set_seq(7);
        m.set_status(Status::not_found("/nope"));
        let out = roundtrip(&mut m).await;
        assert_eq!(out.status().code(), crate::status::code::NOT_FOUND);
        assert_eq!(out.status().cause(), "/nope");
    }

    #[tokio::test]
    async fn test_oversized_frame_drained_and_rejected() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut w = new_writer(Box::new(a));
        let mut r = new_reader(Box::new(b));

        let oversize = MAX_MESSAGE_SIZE + 8;
        let writer = tokio::spawn(async move {
            w.write_all(&(oversize as u32).to_be_bytes()).await.unwrap();
            let chunk = [0u8; 8192];
            let mut written = 0;
            while written < oversize {
                let take = (oversize - written).min(chunk.len());
                w.write_all(&chunk[..take]).await.unwrap();
                written += take;
            }
            w.flush().await.unwrap();

            let mut follow_up = Message::new();
            follow_up.set_seq(9);
            follow_up.set_service_method("/after/oversize");
            RawProto.pack(&mut w, &mut follow_up).await.unwrap();
        });

        let mut m = Message::new();
        let err = RawProto.unpack(&mut r, &mut m).await.unwrap_err();
        assert_eq!(err.code(), crate::status::code::BAD_MESSAGE);

        // The stream stayed aligned: the next frame parses normally.
        let mut next = Message::new();
        RawProto.unpack(&mut r, &mut next).await.unwrap();
        assert_eq!(next.seq(), 9);
        assert_eq!(next.service_method(), "/after/oversize");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_mtype_rejected() {
        let (a, b) = tokio::io::duplex(256);
        let mut w = new_writer(Box::new(a));
        let mut r = new_reader(Box::new(b));

        // uri "" + seq + mtype 9 + codec 0 + three empty sections
        let mut frame = Vec::new();
        put_u32(&mut frame, 0);
        put_u32(&mut frame, 1);
        frame.push(9);
        frame.push(0);
        put_u32(&mut frame, 0);
        put_u32(&mut frame, 0);
        put_u32(&mut frame, 0);
        w.write_all(&(frame.len() as u32).to_be_bytes()).await.unwrap();
        w.write_all(&frame).await.unwrap();
        w.flush().await.unwrap();

        let mut m = Message::new();
        let err = RawProto.unpack(&mut r, &mut m).await.unwrap_err();
        assert_eq!(err.code(), crate::status::code::BAD_MESSAGE);
    }
}
