//! Turning transport-delivered chunks back into whole messages.
//!
//! [`FrameDecoder`] is the per-connection buffer for byte streams: chunks of
//! any size go in, complete length-prefixed payloads come out in order.
//! [`FragmentAssembler`] does the same for message-oriented transports that
//! deliver one logical message as several fragments with a final marker.

use bytes::{Buf, Bytes, BytesMut};

use crate::FramingError;
use crate::frame::{FRAME_HEADER_LEN, frame_boundary};

/// Accumulates stream bytes and extracts length-prefixed frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        FrameDecoder {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        let Some(total) = frame_boundary(&self.buf, self.max_frame_size)? else {
            return Ok(None);
        };
        let mut frame = self.buf.split_to(total);
        frame.advance(FRAME_HEADER_LEN);
        Ok(Some(frame.freeze()))
    }

    /// Append `chunk` and drain every frame it completes, in arrival order.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FramingError> {
        self.push(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Discard any partial frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Room for the next read, sized from the pending prefix when one is known.
    pub(crate) fn spare_hint(&self) -> usize {
        const MIN_READ: usize = 8 * 1024;
        match self.buf.first_chunk::<FRAME_HEADER_LEN>() {
            Some(header) => {
                let len = u32::from_be_bytes(*header) as usize;
                (FRAME_HEADER_LEN + len)
                    .saturating_sub(self.buf.len())
                    .clamp(1, MIN_READ)
            }
            None => MIN_READ,
        }
    }
}

/// Joins fragments of one logical message until the final one arrives.
#[derive(Debug)]
pub struct FragmentAssembler {
    buf: BytesMut,
    max_message_size: usize,
}

impl FragmentAssembler {
    pub fn new(max_message_size: usize) -> Self {
        FragmentAssembler {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Add a fragment. Yields the whole message when `is_final` is set.
    ///
    /// A message growing past the limit is a framing fault; the partial
    /// message is dropped.
    pub fn push(&mut self, fragment: &[u8], is_final: bool) -> Result<Option<Bytes>, FramingError> {
        let len = self.buf.len() + fragment.len();
        if len > self.max_message_size {
            self.buf.clear();
            return Err(FramingError::TooLarge {
                len,
                max: self.max_message_size,
            });
        }
        if is_final && self.buf.is_empty() {
            return Ok(Some(Bytes::copy_from_slice(fragment)));
        }
        self.buf.extend_from_slice(fragment);
        if !is_final {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }

    /// Like [`push`](Self::push) for an owned final fragment, without copying
    /// when nothing is buffered.
    pub fn push_final(&mut self, fragment: Bytes) -> Result<Bytes, FramingError> {
        if self.buf.is_empty() {
            if fragment.len() > self.max_message_size {
                return Err(FramingError::TooLarge {
                    len: fragment.len(),
                    max: self.max_message_size,
                });
            }
            return Ok(fragment);
        }
        Ok(self.push(&fragment, true)?.unwrap_or_default())
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DEFAULT_MAX_FRAME_SIZE, frame};

    fn ten_byte_frame() -> Bytes {
        frame(b"abcdef", DEFAULT_MAX_FRAME_SIZE).unwrap()
    }

    #[test]
    fn whole_frame_in_one_chunk() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let frames = decoder.decode(&ten_byte_frame()).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"abcdef")]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn every_split_point_yields_the_same_frame() {
        let wire = ten_byte_frame();
        assert_eq!(wire.len(), 10);
        for split in 1..wire.len() {
            let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
            let first = decoder.decode(&wire[..split]).unwrap();
            assert!(first.is_empty(), "split at {split} dispatched early");
            let second = decoder.decode(&wire[split..]).unwrap();
            assert_eq!(second, vec![Bytes::from_static(b"abcdef")], "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time() {
        let wire = ten_byte_frame();
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let mut frames = Vec::new();
        for byte in wire.iter() {
            frames.extend(decoder.decode(&[*byte]).unwrap());
        }
        assert_eq!(frames, vec![Bytes::from_static(b"abcdef")]);
    }

    #[test]
    fn pipelined_frames_come_out_in_order() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&frame(b"first", 1024).unwrap());
        wire.extend_from_slice(&frame(b"second", 1024).unwrap());
        wire.extend_from_slice(&frame(b"thi", 1024).unwrap()[..5]);

        let mut decoder = FrameDecoder::new(1024);
        let frames = decoder.decode(&wire).unwrap();
        assert_eq!(
            frames,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
        assert_eq!(decoder.buffered_len(), 5);

        let frames = decoder.decode(b"hi").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"thi")]);
    }

    #[test]
    fn many_tiny_frames_in_one_chunk() {
        let mut wire = BytesMut::new();
        for _ in 0..100_000 {
            wire.extend_from_slice(&[0, 0, 0, 0]);
        }
        let mut decoder = FrameDecoder::new(16);
        let frames = decoder.decode(&wire).unwrap();
        assert_eq!(frames.len(), 100_000);
        assert!(frames.iter().all(|f| f.is_empty()));
    }

    #[test]
    fn oversized_prefix_is_a_framing_fault() {
        let mut decoder = FrameDecoder::new(8);
        let err = decoder.decode(&[0, 0, 0, 9]).unwrap_err();
        assert_eq!(err, FramingError::TooLarge { len: 9, max: 8 });
    }

    #[test]
    fn clear_discards_partial_frame() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&[0, 0, 0, 5, b'a']);
        decoder.clear();
        assert_eq!(decoder.buffered_len(), 0);
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn spare_hint_tracks_pending_frame() {
        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(decoder.spare_hint(), 8 * 1024);
        decoder.push(&[0, 0, 0, 10, 1, 2]);
        assert_eq!(decoder.spare_hint(), 8);
    }

    #[test]
    fn non_final_fragments_never_dispatch() {
        let mut assembler = FragmentAssembler::new(1024);
        assert_eq!(assembler.push(b"he", false).unwrap(), None);
        assert_eq!(assembler.push(b"ll", false).unwrap(), None);
        assert_eq!(assembler.buffered_len(), 4);
        let message = assembler.push(b"o", true).unwrap();
        assert_eq!(message, Some(Bytes::from_static(b"hello")));
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn single_final_fragment_is_a_message() {
        let mut assembler = FragmentAssembler::new(1024);
        let message = assembler.push(b"ping", true).unwrap();
        assert_eq!(message, Some(Bytes::from_static(b"ping")));
    }

    #[test]
    fn assembler_resets_between_messages() {
        let mut assembler = FragmentAssembler::new(1024);
        assembler.push(b"one", false).unwrap();
        assert_eq!(
            assembler.push(b"!", true).unwrap(),
            Some(Bytes::from_static(b"one!"))
        );
        assert_eq!(
            assembler.push(b"two", true).unwrap(),
            Some(Bytes::from_static(b"two"))
        );
    }

    #[test]
    fn assembler_enforces_limit() {
        let mut assembler = FragmentAssembler::new(4);
        assembler.push(b"abc", false).unwrap();
        let err = assembler.push(b"de", false).unwrap_err();
        assert_eq!(err, FramingError::TooLarge { len: 5, max: 4 });
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn push_final_without_buffered_data_is_zero_copy() {
        let mut assembler = FragmentAssembler::new(16);
        let data = Bytes::from_static(b"whole");
        let message = assembler.push_final(data.clone()).unwrap();
        assert_eq!(message.as_ptr(), data.as_ptr());

        assembler.push(b"par", false).unwrap();
        let message = assembler.push_final(Bytes::from_static(b"ts")).unwrap();
        assert_eq!(message, Bytes::from_static(b"parts"));

        assert!(assembler.push_final(Bytes::from(vec![0u8; 17])).is_err());
    }
}
