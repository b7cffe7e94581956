//! biplex-core: wire layer for the biplex RPC framework.
//!
//! This crate defines:
//! - Status codes and the wire status ([`Status`])
//! - Ordered message headers ([`Meta`])
//! - Body codecs ([`BodyCodec`])
//! - Transfer pipe filters ([`XferFilter`], [`XferPipe`])
//! - The message unit and its pool ([`Message`], [`MessagePool`])
//! - Wire framing ([`Proto`], [`RawProto`])
//! - The socket discipline ([`Socket`])

#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;

mod codec;
mod escape;
mod message;
mod meta;
mod proto;
mod socket;
mod status;
pub mod xfer;

pub use codec::*;
pub use message::*;
pub use meta::*;
pub use proto::*;
pub use socket::*;
pub use status::*;
pub use xfer::{Lz4Filter, XferFilter, XferPipe, ZstdFilter, MAX_UNPACK_SIZE};

// Bodies are exposed as `Bytes`; re-exported so callers need no direct
// dependency.
pub use bytes::Bytes;

/// Boxed future type for object-safe traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
