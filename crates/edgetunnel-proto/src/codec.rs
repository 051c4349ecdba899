//! Codec for encoding/decoding RPC frames

use crate::rpc::RpcFrame;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// RPC frame codec
pub struct RpcCodec;

impl RpcCodec {
    /// Maximum frame size (16MB)
    pub const MAX_FRAME_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Encode an RPC frame to bytes
    ///
    /// Format: [length: u32 BE][payload: bincode serialized frame]
    pub fn encode(frame: &RpcFrame) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(frame)?;

        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode an RPC frame from bytes
    ///
    /// Returns Ok(Some(frame)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<RpcFrame>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let frame_bytes = buf.split_to(length);

        let frame: RpcFrame = bincode::deserialize(&frame_bytes)?;

        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcBody, UpdateConfigurationRequest};

    fn frame(id: u64) -> RpcFrame {
        RpcFrame {
            id,
            body: RpcBody::UpdateConfiguration(UpdateConfigurationRequest {
                version: 4,
                config: br#"{"ingress":[]}"#.to_vec(),
            }),
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = RpcCodec::encode(&frame(1)).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(RpcCodec::decode(&mut buf).unwrap(), None);

        // Provide rest of frame
        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(RpcCodec::decode(&mut buf).unwrap(), Some(frame(1)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&RpcCodec::encode(&frame(1)).unwrap());
        buf.extend_from_slice(&RpcCodec::encode(&frame(2)).unwrap());

        assert_eq!(RpcCodec::decode(&mut buf).unwrap().map(|f| f.id), Some(1));
        assert_eq!(RpcCodec::decode(&mut buf).unwrap().map(|f| f.id), Some(2));
        assert_eq!(RpcCodec::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            RpcCodec::decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
