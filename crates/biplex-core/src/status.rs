//! Status codes and the wire status carried on every message.
//!
//! Every fallible operation in the framework resolves to a [`Status`]:
//! handler results, transport faults, plugin rejections and local
//! cancellations all travel through the same type. A status round-trips on
//! the wire as a query string (`code=...&msg=...&cause=...`).

use core::fmt;

use crate::escape::{escape_into, unescape};

/// Well-known status codes.
///
/// Codes follow the HTTP numbering of the wire protocol; 1xx codes are
/// connection-level faults local to this framework.
pub mod code {
    /// Unknown error.
    pub const UNKNOWN_ERROR: i32 = -1;
    /// Success.
    pub const OK: i32 = 0;
    /// The connection was closed.
    pub const CONN_CLOSED: i32 = 102;
    /// The message was sent on a connection that no longer exists
    /// (for example across a redial).
    pub const WRONG_CONN: i32 = 103;
    /// Writing the message to the connection failed.
    pub const WRITE_FAILED: i32 = 104;
    /// Dialing the remote peer failed.
    pub const DIAL_FAILED: i32 = 105;
    /// The message could not be decoded.
    pub const BAD_MESSAGE: i32 = 400;
    /// Authentication failed.
    pub const UNAUTHORIZED: i32 = 401;
    /// No handler is registered for the service method.
    pub const NOT_FOUND: i32 = 404;
    /// The message type is not allowed here.
    pub const MTYPE_NOT_ALLOWED: i32 = 405;
    /// The call did not complete within its deadline.
    pub const HANDLE_TIMEOUT: i32 = 408;
    /// The handler failed internally (including panics).
    pub const INTERNAL_SERVER_ERROR: i32 = 500;
    /// The operation is not implemented.
    pub const NOT_IMPLEMENTED: i32 = 501;
    /// An upstream hop failed.
    pub const BAD_GATEWAY: i32 = 502;
}

fn code_text(code: i32) -> &'static str {
    match code {
        code::OK => "ok",
        code::CONN_CLOSED => "connection closed",
        code::WRONG_CONN => "wrong connection",
        code::WRITE_FAILED => "write failed",
        code::DIAL_FAILED => "dial failed",
        code::BAD_MESSAGE => "bad message",
        code::UNAUTHORIZED => "unauthorized",
        code::NOT_FOUND => "not found",
        code::MTYPE_NOT_ALLOWED => "message type not allowed",
        code::HANDLE_TIMEOUT => "handle timeout",
        code::INTERNAL_SERVER_ERROR => "internal server error",
        code::NOT_IMPLEMENTED => "not implemented",
        code::BAD_GATEWAY => "bad gateway",
        _ => "unknown error",
    }
}

/// The outcome of an operation: a code, a human-readable message and an
/// optional cause with extra detail.
///
/// `code == 0` means success. The default value is OK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    code: i32,
    msg: String,
    cause: String,
}

impl Status {
    /// Creates a status from its parts.
    pub fn new(code: i32, msg: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            cause: cause.into(),
        }
    }

    /// The OK status.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Creates a status with the standard message for `code`.
    pub fn from_code(code: i32, cause: impl Into<String>) -> Self {
        Self::new(code, code_text(code), cause)
    }

    pub fn bad_message(cause: impl Into<String>) -> Self {
        Self::from_code(code::BAD_MESSAGE, cause)
    }

    pub fn unauthorized(cause: impl Into<String>) -> Self {
        Self::from_code(code::UNAUTHORIZED, cause)
    }

    pub fn not_found(cause: impl Into<String>) -> Self {
        Self::from_code(code::NOT_FOUND, cause)
    }

    pub fn mtype_not_allowed(cause: impl Into<String>) -> Self {
        Self::from_code(code::MTYPE_NOT_ALLOWED, cause)
    }

    pub fn handle_timeout(cause: impl Into<String>) -> Self {
        Self::from_code(code::HANDLE_TIMEOUT, cause)
    }

    pub fn internal_server_error(cause: impl Into<String>) -> Self {
        Self::from_code(code::INTERNAL_SERVER_ERROR, cause)
    }

    pub fn conn_closed(cause: impl Into<String>) -> Self {
        Self::from_code(code::CONN_CLOSED, cause)
    }

    pub fn wrong_conn(cause: impl Into<String>) -> Self {
        Self::from_code(code::WRONG_CONN, cause)
    }

    pub fn write_failed(cause: impl Into<String>) -> Self {
        Self::from_code(code::WRITE_FAILED, cause)
    }

    pub fn dial_failed(cause: impl Into<String>) -> Self {
        Self::from_code(code::DIAL_FAILED, cause)
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn cause(&self) -> &str {
        &self.cause
    }

    /// True iff the code is OK.
    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }

    /// Converts into a `Result`, treating any non-OK code as an error.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Resets to OK, releasing the strings.
    pub fn reset(&mut self) {
        self.code = code::OK;
        self.msg.clear();
        self.cause.clear();
    }

    /// Encodes as `code=...&msg=...&cause=...`; an OK status with no text
    /// encodes to nothing.
    pub fn encode(&self) -> Vec<u8> {
        if self.is_ok() && self.msg.is_empty() && self.cause.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(16 + self.msg.len() + self.cause.len());
        out.extend_from_slice(b"code=");
        out.extend_from_slice(self.code.to_string().as_bytes());
        if !self.msg.is_empty() {
            out.extend_from_slice(b"&msg=");
            escape_into(&mut out, self.msg.as_bytes());
        }
        if !self.cause.is_empty() {
            out.extend_from_slice(b"&cause=");
            escape_into(&mut out, self.cause.as_bytes());
        }
        out
    }

    /// Decodes the wire form produced by [`Status::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, Status> {
        let mut stat = Status::ok();
        if data.is_empty() {
            return Ok(stat);
        }
        for pair in data.split(|&b| b == b'&') {
            let mut it = pair.splitn(2, |&b| b == b'=');
            let key = it.next().unwrap_or_default();
            let value = unescape(it.next().unwrap_or_default())?;
            let value = String::from_utf8(value)
                .map_err(|_| Status::bad_message("status field is not utf-8"))?;
            match key {
                b"code" => {
                    stat.code = value
                        .parse()
                        .map_err(|_| Status::bad_message("status code is not an integer"))?;
                }
                b"msg" => stat.msg = value,
                b"cause" => stat.cause = value,
                _ => return Err(Status::bad_message("unknown status field")),
            }
        }
        Ok(stat)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cause.is_empty() {
            write!(f, "[{}] {}", self.code, self.msg)
        } else {
            write!(f, "[{}] {}: {}", self.code, self.msg, self.cause)
        }
    }
}

impl std::error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Status::conn_closed(e.to_string()),
            _ => Status::write_failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_encodes_empty() {
        assert!(Status::ok().encode().is_empty());
        assert!(Status::decode(b"").unwrap().is_ok());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let stat = Status::new(code::HANDLE_TIMEOUT, "handle timeout", "slept 3s > 2s");
        let decoded = Status::decode(&stat.encode()).unwrap();
        assert_eq!(decoded, stat);
    }

    #[test]
    fn test_cause_with_separators() {
        let stat = Status::bad_message("key=value & more");
        let decoded = Status::decode(&stat.encode()).unwrap();
        assert_eq!(decoded.cause(), "key=value & more");
    }

    #[test]
    fn test_bad_code_rejected() {
        assert!(Status::decode(b"code=abc").is_err());
    }
}
