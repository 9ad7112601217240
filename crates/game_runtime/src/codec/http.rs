use serde::Serialize;
use serde_json::Value;

use super::{Codec, FrameStatus};
use crate::error::CodecError;

/// Bare JSON bodies. The HTTP transport delivers each body whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpCodec;

impl HttpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for HttpCodec {
    fn name(&self) -> &'static str {
        "http"
    }

    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn unmarshal(&self, frame: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(frame)?)
    }

    fn frame_length(&self, buffer: &[u8]) -> Result<FrameStatus, CodecError> {
        if buffer.is_empty() {
            Ok(FrameStatus::Partial(None))
        } else {
            Ok(FrameStatus::Complete(buffer.len()))
        }
    }
}
