//! Wire codecs.
//!
//! A [`Codec`] turns values into transport frames and back, and tells the
//! reader how much of a byte buffer forms one frame. The connection layer is
//! generic over this trait, so the HTTP and socket transports share one
//! dispatch path.

mod http;
mod socket;

pub use http::HttpCodec;
pub use socket::{SocketCodec, FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_TRAILER_LEN, MAX_FRAME_LEN};

use serde::Serialize;
use serde_json::Value;

use crate::error::CodecError;

/// How much of a read buffer forms the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The first `n` bytes of the buffer are one complete frame.
    Complete(usize),
    /// More bytes are needed. Carries the declared frame length when the
    /// header has already arrived.
    Partial(Option<usize>),
}

pub trait Codec: Send + Sync + 'static {
    /// Human readable transport name used in logs.
    fn name(&self) -> &'static str;

    /// Encodes `value` into one complete frame.
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decodes one complete frame into a JSON value.
    fn unmarshal(&self, frame: &[u8]) -> Result<Value, CodecError>;

    /// Inspects the start of `buffer` for a frame boundary.
    fn frame_length(&self, buffer: &[u8]) -> Result<FrameStatus, CodecError>;
}
