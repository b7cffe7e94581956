//! Body codecs.
//!
//! A codec is identified by a single byte on the wire and by a textual name
//! in configuration. Marshalling is generic over serde, so the set of
//! codecs is a closed enum rather than a runtime registry; the raw codec
//! moves byte bodies through untouched.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::status::Status;

/// Sentinel codec id meaning "use the peer's default body codec".
pub const NIL_CODEC_ID: u8 = 0;

/// A registered body codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyCodec {
    /// Human-readable JSON (`serde_json`).
    Json,
    /// Compact binary (`bincode`).
    Bincode,
    /// MessagePack (`rmp-serde`).
    Msgpack,
    /// Byte passthrough for raw bodies.
    Raw,
}

impl BodyCodec {
    /// The wire id.
    pub fn id(self) -> u8 {
        match self {
            BodyCodec::Json => b'j',
            BodyCodec::Bincode => b'b',
            BodyCodec::Msgpack => b'm',
            BodyCodec::Raw => b'r',
        }
    }

    /// The configuration name.
    pub fn name(self) -> &'static str {
        match self {
            BodyCodec::Json => "json",
            BodyCodec::Bincode => "bincode",
            BodyCodec::Msgpack => "msgpack",
            BodyCodec::Raw => "raw",
        }
    }

    /// Looks a codec up by wire id.
    pub fn by_id(id: u8) -> Result<Self, Status> {
        match id {
            b'j' => Ok(BodyCodec::Json),
            b'b' => Ok(BodyCodec::Bincode),
            b'm' => Ok(BodyCodec::Msgpack),
            b'r' => Ok(BodyCodec::Raw),
            _ => Err(Status::bad_message(format!("unknown body codec id: {id}"))),
        }
    }

    /// Looks a codec up by configuration name.
    pub fn by_name(name: &str) -> Result<Self, Status> {
        match name {
            "json" => Ok(BodyCodec::Json),
            "bincode" => Ok(BodyCodec::Bincode),
            "msgpack" => Ok(BodyCodec::Msgpack),
            "raw" => Ok(BodyCodec::Raw),
            _ => Err(Status::bad_message(format!("unknown body codec name: {name}"))),
        }
    }

    /// Serializes `v` into body bytes.
    ///
    /// The raw codec carries pre-encoded bytes and rejects typed values;
    /// use the byte body directly instead.
    pub fn marshal<T: Serialize + ?Sized>(self, v: &T) -> Result<Vec<u8>, Status> {
        match self {
            BodyCodec::Json => serde_json::to_vec(v)
                .map_err(|e| Status::bad_message(format!("json marshal: {e}"))),
            BodyCodec::Bincode => bincode::serialize(v)
                .map_err(|e| Status::bad_message(format!("bincode marshal: {e}"))),
            BodyCodec::Msgpack => rmp_serde::to_vec(v)
                .map_err(|e| Status::bad_message(format!("msgpack marshal: {e}"))),
            BodyCodec::Raw => Err(Status::bad_message(
                "raw codec carries byte bodies, not typed values",
            )),
        }
    }

    /// Deserializes body bytes into a typed value.
    pub fn unmarshal<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, Status> {
        match self {
            BodyCodec::Json => serde_json::from_slice(data)
                .map_err(|e| Status::bad_message(format!("json unmarshal: {e}"))),
            BodyCodec::Bincode => bincode::deserialize(data)
                .map_err(|e| Status::bad_message(format!("bincode unmarshal: {e}"))),
            BodyCodec::Msgpack => rmp_serde::from_slice(data)
                .map_err(|e| Status::bad_message(format!("msgpack unmarshal: {e}"))),
            BodyCodec::Raw => Err(Status::bad_message(
                "raw codec carries byte bodies, not typed values",
            )),
        }
    }

    /// Moves a pre-encoded byte body onto the wire unchanged. Only the raw
    /// codec carries such bodies; the typed codecs reject this path.
    pub fn marshal_bytes(self, v: &[u8]) -> Result<Vec<u8>, Status> {
        match self {
            BodyCodec::Raw => Ok(v.to_vec()),
            other => Err(Status::bad_message(format!(
                "codec {} carries typed values, not raw bytes",
                other.name()
            ))),
        }
    }

    /// Mirrors [`BodyCodec::marshal_bytes`] on the receive path.
    pub fn unmarshal_bytes(self, data: &[u8]) -> Result<Vec<u8>, Status> {
        match self {
            BodyCodec::Raw => Ok(data.to_vec()),
            other => Err(Status::bad_message(format!(
                "codec {} carries typed values, not raw bytes",
                other.name()
            ))),
        }
    }
}
