//! Socket: one bidirectional byte stream plus its proto.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::message::Message;
use crate::proto::{Proto, ProtoFunc};
use crate::status::Status;

/// Any bidirectional byte stream the framework can drive: TCP, Unix, TLS,
/// an in-memory duplex, or an upgraded stream supplied by a plugin.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A boxed connection handed to the socket.
pub type Conn = Box<dyn Stream>;

/// Buffered read half, exclusively owned by the unpack path.
pub type SocketReader = BufReader<ReadHalf<Conn>>;

/// Buffered write half, exclusively owned by the pack path.
pub type SocketWriter = BufWriter<WriteHalf<Conn>>;

pub fn new_reader(conn: Conn) -> SocketReader {
    let (r, _) = tokio::io::split(conn);
    BufReader::new(r)
}

pub fn new_writer(conn: Conn) -> SocketWriter {
    let (_, w) = tokio::io::split(conn);
    BufWriter::new(w)
}

/// Wraps a raw bidirectional stream with the message framing discipline.
///
/// The two halves are guarded by separate async mutexes: at most one writer
/// and one reader at a time, which also serializes the proto per direction.
/// The socket owns the session id (defaulting to the local address) and the
/// address strings, and supports swapping the underlying connection before
/// first use (protocol upgrades) or on redial.
pub struct Socket {
    id: RwLock<String>,
    local_addr: RwLock<String>,
    remote_addr: RwLock<String>,
    reader: AsyncMutex<SocketReader>,
    writer: AsyncMutex<SocketWriter>,
    proto: Box<dyn Proto>,
    closed: AtomicBool,
}

impl Socket {
    /// Builds a socket over `conn`, instantiating the proto from `proto_func`.
    pub fn new(
        conn: Conn,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        proto_func: &ProtoFunc,
    ) -> Self {
        let local_addr = local_addr.into();
        let (read_half, write_half) = tokio::io::split(conn);
        Self {
            id: RwLock::new(local_addr.clone()),
            local_addr: RwLock::new(local_addr),
            remote_addr: RwLock::new(remote_addr.into()),
            reader: AsyncMutex::new(BufReader::new(read_half)),
            writer: AsyncMutex::new(BufWriter::new(write_half)),
            proto: proto_func(),
            closed: AtomicBool::new(false),
        }
    }

    /// The session id. Defaults to the local address string.
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        *self.id.write() = id.into();
    }

    pub fn local_addr(&self) -> String {
        self.local_addr.read().clone()
    }

    pub fn remote_addr(&self) -> String {
        self.remote_addr.read().clone()
    }

    /// Wire id and name of the bound proto.
    pub fn proto_version(&self) -> (u8, &'static str) {
        self.proto.version()
    }

    /// Packs and writes one message, holding the write mutex.
    pub async fn write_message(&self, m: &mut Message) -> Result<(), Status> {
        if self.is_closed() {
            return Err(Status::conn_closed("socket is closed"));
        }
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(Status::conn_closed("socket is closed"));
        }
        self.proto.pack(&mut writer, m).await
    }

    /// Reads and unpacks one message, holding the read mutex.
    pub async fn read_message(&self, m: &mut Message) -> Result<(), Status> {
        if self.is_closed() {
            return Err(Status::conn_closed("socket is closed"));
        }
        let mut reader = self.reader.lock().await;
        self.proto.unpack(&mut reader, m).await
    }

    /// Replaces the underlying connection, keeping id and proto.
    ///
    /// Valid before the first read/write (connection upgrades) and between
    /// read loops (redial). Callers must ensure no read or write is in
    /// flight.
    pub async fn reset(
        &self,
        conn: Conn,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) {
        let (read_half, write_half) = tokio::io::split(conn);
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        *reader = BufReader::new(read_half);
        *writer = BufWriter::new(write_half);
        *self.local_addr.write() = local_addr.into();
        *self.remote_addr.write() = remote_addr.into();
        self.closed.store(false, Ordering::Release);
    }

    /// Shuts the write side down and marks the socket closed.
    pub async fn close(&self) -> Result<(), Status> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(Status::from)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Mtype;
    use crate::proto::raw_proto_func;

    fn socket_pair() -> (Socket, Socket) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let proto = raw_proto_func();
        (
            Socket::new(Box::new(a), "mem:a", "mem:b", &proto),
            Socket::new(Box::new(b), "mem:b", "mem:a", &proto),
        )
    }

    #[tokio::test]
    async fn test_write_read_message() {
        let (a, b) = socket_pair();
        let mut m = Message::new();
        m.set_seq(1);
        m.set_mtype(Mtype::Push);
        m.set_service_method("/push/test");
        m.set_body_bytes(&b"test push text"[..]);
        a.write_message(&mut m).await.unwrap();

        let mut out = Message::new();
        b.read_message(&mut out).await.unwrap();
        assert_eq!(out.service_method(), "/push/test");
        assert_eq!(&out.body()[..], b"test push text");
    }

    #[tokio::test]
    async fn test_id_defaults_to_local_addr() {
        let (a, _b) = socket_pair();
        assert_eq!(a.id(), "mem:a");
        a.set_id("custom-id");
        assert_eq!(a.id(), "custom-id");
        assert_eq!(a.local_addr(), "mem:a");
    }

    #[tokio::test]
    async fn test_closed_socket_refuses_io() {
        let (a, _b) = socket_pair();
        a.close().await.unwrap();
        let mut m = Message::new();
        assert!(a.write_message(&mut m).await.is_err());
        assert!(a.read_message(&mut m).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_swaps_connection() {
        let (a, _stale) = socket_pair();
        let (c, d) = tokio::io::duplex(64 * 1024);
        a.reset(Box::new(c), "mem:a2", "mem:d").await;
        assert_eq!(a.id(), "mem:a", "reset keeps the session id");
        assert_eq!(a.local_addr(), "mem:a2");

        let proto = raw_proto_func();
        let other = Socket::new(Box::new(d), "mem:d", "mem:a2", &proto);
        let mut m = Message::new();
        m.set_service_method("/after/reset");
        a.write_message(&mut m).await.unwrap();
        let mut out = Message::new();
        other.read_message(&mut out).await.unwrap();
        assert_eq!(out.service_method(), "/after/reset");
    }
}
