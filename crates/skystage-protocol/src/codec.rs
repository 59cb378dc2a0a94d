//! Codec for encoding and decoding relay frames.
//!
//! Binary messages carry a MessagePack frame behind a 4-byte big-endian
//! length prefix. Text messages carry a bare JSON frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame in bytes.
        size: usize,
        /// Limit that was exceeded.
        max: usize,
    },

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error on the text path or while building a payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Incompatible protocol version.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

impl ProtocolError {
    /// A frame of `size` bytes broke the `max` byte limit.
    #[must_use]
    pub fn too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::too_large(payload.len(), MAX_FRAME_SIZE));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::too_large(length, MAX_FRAME_SIZE));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::too_large(length, MAX_FRAME_SIZE));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

/// Encode a frame as JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_text(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::too_large(text.len(), MAX_FRAME_SIZE));
    }
    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode_text(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::too_large(text.len(), MAX_FRAME_SIZE));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode() {
        let frames = vec![
            Frame::connect(1, Some("token123".to_string()), "user-1"),
            Frame::connected("conn-123", 1, 30_000),
            Frame::event(
                "formation:move",
                json!({ "formationId": "f-1", "startTime": 4.5 }),
            ),
            Frame::error(1001, "Unsupported protocol version"),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::event("show:join", json!({ "roomId": "show-42" }));
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::event("show:update", json!("x".repeat(MAX_FRAME_SIZE)));

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert!(size > MAX_FRAME_SIZE);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        let err = decode_from(&mut buf).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Frame size {} exceeds maximum {}", MAX_FRAME_SIZE + 1, MAX_FRAME_SIZE)
        );
    }

    #[test]
    fn test_too_large_reports_its_limit() {
        let err = ProtocolError::too_large(65_537, 65_536);
        assert_eq!(err.to_string(), "Frame size 65537 exceeds maximum 65536");
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::event("cursor:move", json!({ "x": 1.0, "y": 2.0 }));
        let frame2 = Frame::event("ping", json!({ "timestamp": 99 }));

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        // A partial third frame stays buffered.
        buf.put_u32(16);

        assert_eq!(decode_from(&mut buf).unwrap(), Some(frame1));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(frame2));
        assert_eq!(decode_from(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_text_frames() {
        let frame = decode_text(r#"{"type":"event","event":"pong","data":{"timestamp":7}}"#)
            .unwrap();
        assert_eq!(frame, Frame::event("pong", json!({ "timestamp": 7 })));

        let missing_data = decode_text(r#"{"type":"event","event":"show:leave"}"#).unwrap();
        assert_eq!(
            missing_data,
            Frame::event("show:leave", serde_json::Value::Null)
        );

        assert!(matches!(
            decode_text("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert_eq!(decode_text(&encode_text(&frame).unwrap()).unwrap(), frame);
    }
}
