//! Length-prefixed socket frames.
//!
//! ```text
//! +----------------+------------------+---------------+
//! | header (4, LE) | JSON body        | reserved (4)  |
//! +----------------+------------------+---------------+
//!   header = (body_len + 8) ^ FRAME_MAGIC
//! ```
//!
//! The declared length covers the whole frame, header and reserved trailer
//! included. The trailer is written as zeros and ignored on read.

use serde::Serialize;
use serde_json::Value;

use super::{Codec, FrameStatus};
use crate::error::CodecError;

pub const FRAME_MAGIC: u32 = 0x0000_1100;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;
pub const FRAME_HEADER_LEN: usize = 4;
pub const FRAME_TRAILER_LEN: usize = 4;

const MIN_FRAME_LEN: usize = FRAME_HEADER_LEN + FRAME_TRAILER_LEN;

#[derive(Debug, Clone, Copy, Default)]
pub struct SocketCodec;

impl SocketCodec {
    pub fn new() -> Self {
        Self
    }

    fn declared_length(header: &[u8]) -> Result<usize, CodecError> {
        let raw = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let declared = (raw ^ FRAME_MAGIC) as usize;
        if declared > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                declared,
                max: MAX_FRAME_LEN,
            });
        }
        if declared < MIN_FRAME_LEN {
            return Err(CodecError::InvalidLength(declared));
        }
        Ok(declared)
    }
}

impl Codec for SocketCodec {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let body = serde_json::to_vec(value)?;
        let declared = body.len() + MIN_FRAME_LEN;
        if declared > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                declared,
                max: MAX_FRAME_LEN,
            });
        }

        let mut frame = Vec::with_capacity(declared);
        frame.extend_from_slice(&((declared as u32) ^ FRAME_MAGIC).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&[0u8; FRAME_TRAILER_LEN]);
        Ok(frame)
    }

    fn unmarshal(&self, frame: &[u8]) -> Result<Value, CodecError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(CodecError::InvalidLength(frame.len()));
        }
        let declared = Self::declared_length(frame)?;
        if declared != frame.len() {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: frame.len(),
            });
        }
        let body = &frame[FRAME_HEADER_LEN..declared - FRAME_TRAILER_LEN];
        Ok(serde_json::from_slice(body)?)
    }

    fn frame_length(&self, buffer: &[u8]) -> Result<FrameStatus, CodecError> {
        if buffer.len() < FRAME_HEADER_LEN {
            return Ok(FrameStatus::Partial(None));
        }
        let declared = Self::declared_length(buffer)?;
        if buffer.len() < declared {
            Ok(FrameStatus::Partial(Some(declared)))
        } else {
            Ok(FrameStatus::Complete(declared))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header(declared: u32) -> [u8; 4] {
        (declared ^ FRAME_MAGIC).to_le_bytes()
    }

    #[test]
    fn marshal_writes_masked_length() {
        let codec = SocketCodec::new();
        let frame = codec.marshal(&json!({"cmd": 1})).unwrap();
        let body_len = br#"{"cmd":1}"#.len();

        assert_eq!(frame.len(), body_len + 8);
        assert_eq!(&frame[..4], &header((body_len + 8) as u32));
        assert_eq!(&frame[4..4 + body_len], br#"{"cmd":1}"#);
        assert_eq!(&frame[frame.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn frame_completes_only_when_every_byte_arrived() {
        let codec = SocketCodec::new();
        let payload = json!({"cmd": 1002, "params": {"user": "ana", "tags": [1, 2, 3]}});
        let frame = codec.marshal(&payload).unwrap();
        let body_len = serde_json::to_vec(&payload).unwrap().len();

        for cut in 0..frame.len() {
            let status = codec.frame_length(&frame[..cut]).unwrap();
            assert!(matches!(status, FrameStatus::Partial(_)), "cut at {cut}");
        }
        assert_eq!(
            codec.frame_length(&frame).unwrap(),
            FrameStatus::Complete(body_len + 8)
        );
        assert_eq!(codec.unmarshal(&frame).unwrap(), payload);
    }

    #[test]
    fn trailing_bytes_belong_to_the_next_frame() {
        let codec = SocketCodec::new();
        let mut buffer = codec.marshal(&json!({"cmd": 1})).unwrap();
        let first_len = buffer.len();
        buffer.extend(codec.marshal(&json!({"cmd": 2})).unwrap());

        assert_eq!(
            codec.frame_length(&buffer).unwrap(),
            FrameStatus::Complete(first_len)
        );
    }

    #[test]
    fn oversize_header_is_rejected() {
        let codec = SocketCodec::new();
        let err = codec.frame_length(&header(0x1_0000)).unwrap_err();
        assert!(matches!(
            err,
            CodecError::FrameTooLarge {
                declared: 0x1_0000,
                ..
            }
        ));
    }

    #[test]
    fn undersize_header_is_rejected() {
        let codec = SocketCodec::new();
        let err = codec.frame_length(&header(3)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidLength(3)));
    }

    #[test]
    fn unmarshal_checks_the_declared_length() {
        let codec = SocketCodec::new();
        let mut frame = codec.marshal(&json!({"cmd": 1})).unwrap();
        frame.push(0);
        assert!(matches!(
            codec.unmarshal(&frame),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn oversize_payload_cannot_be_marshaled() {
        let codec = SocketCodec::new();
        let big = "x".repeat(MAX_FRAME_LEN);
        assert!(matches!(
            codec.marshal(&big),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
