//! Length-prefixed framing for byte-stream transports.
//!
//! Wire format: `[u32 big-endian payload length][payload]`. The length
//! counts payload bytes only. It is untrusted input and is always checked
//! against a maximum before any buffer is sized from it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::FramingError;

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub fn encode_frame_size(len: u32) -> [u8; FRAME_HEADER_LEN] {
    len.to_be_bytes()
}

pub fn decode_frame_size(header: [u8; FRAME_HEADER_LEN]) -> u32 {
    u32::from_be_bytes(header)
}

/// Total length (prefix + payload) of the first complete frame in `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete. A prefix above
/// `max_frame_size` is rejected as soon as the four header bytes are in,
/// without waiting for (or allocating) the payload.
pub fn frame_boundary(buf: &[u8], max_frame_size: usize) -> Result<Option<usize>, FramingError> {
    let Some(header) = buf.first_chunk::<FRAME_HEADER_LEN>() else {
        return Ok(None);
    };
    let len = decode_frame_size(*header) as usize;
    if len > max_frame_size {
        return Err(FramingError::TooLarge {
            len,
            max: max_frame_size,
        });
    }
    let total = FRAME_HEADER_LEN + len;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

/// Append one frame carrying `payload` to `dst`.
pub fn encode_frame(
    payload: &[u8],
    max_frame_size: usize,
    dst: &mut BytesMut,
) -> Result<(), FramingError> {
    let max = max_frame_size.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(FramingError::TooLarge {
            len: payload.len(),
            max,
        });
    }
    dst.reserve(FRAME_HEADER_LEN + payload.len());
    dst.put_slice(&encode_frame_size(payload.len() as u32));
    dst.put_slice(payload);
    Ok(())
}

/// Build a standalone frame for `payload`.
pub fn frame(payload: &[u8], max_frame_size: usize) -> Result<Bytes, FramingError> {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    encode_frame(payload, max_frame_size, &mut buf)?;
    Ok(buf.freeze())
}
