//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a two-state
//! machine over the 24-bit length prefix:
//! - `WaitingForLength`: need the 3 length bytes
//! - `WaitingForBody`: length known, need the rest of the frame
//!
//! Emitted frames keep their length prefix, since every codec offset is
//! absolute within the full frame.

use bytes::BytesMut;

use super::frame::Frame;
use super::wire_format::{decode_length, FRAME_HEADER_LEN, FRAME_LENGTH_MASK, FRAME_LENGTH_SIZE};
use crate::error::{RSocketError, Result};

/// Default maximum frame size: the whole 24-bit range plus the length field.
pub const DEFAULT_MAX_FRAME_SIZE: usize = FRAME_LENGTH_MASK as usize + FRAME_LENGTH_SIZE;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 3-byte length prefix.
    WaitingForLength,
    /// Length known; waiting for the full frame of `frame_length` bytes
    /// (length prefix included).
    WaitingForBody { frame_length: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame size (length prefix included).
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a frame buffer accepting frames up to the 24-bit maximum.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a frame buffer with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the complete frames decoded so far; partial data stays
    /// buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns an error when a frame exceeds the maximum size or is shorter
    /// than the common header.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        if let State::WaitingForLength = self.state {
            if self.buffer.len() < FRAME_LENGTH_SIZE {
                return Ok(None);
            }
            let frame_length = decode_length(&self.buffer, 0) + FRAME_LENGTH_SIZE;
            if frame_length > self.max_frame_size {
                return Err(RSocketError::FrameTooLarge { len: frame_length });
            }
            if frame_length < FRAME_HEADER_LEN {
                return Err(RSocketError::IllegalFrame(format!(
                    "frame of {frame_length} bytes is shorter than the common header"
                )));
            }
            self.state = State::WaitingForBody { frame_length };
        }

        let State::WaitingForBody { frame_length } = self.state else {
            return Ok(None);
        };
        if self.buffer.len() < frame_length {
            return Ok(None);
        }

        let frame_bytes = self.buffer.split_to(frame_length).freeze();
        self.state = State::WaitingForLength;
        Frame::from_bytes(frame_bytes).map(Some)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use crate::protocol::FrameType;
    use bytes::Bytes;

    fn next_frame_bytes(stream_id: u32, data: &'static [u8]) -> Bytes {
        Frame::next(stream_id, &Payload::new(Bytes::from_static(data)))
            .unwrap()
            .into_bytes()
    }

    #[test]
    fn test_single_frame() {
        let bytes = next_frame_bytes(1, b"hello");
        let mut buffer = FrameBuffer::new();

        let frames = buffer.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id(), 1);
        assert_eq!(frames[0].data().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_multiple_frames_one_push() {
        let mut all = Vec::new();
        for i in 1u32..=5 {
            all.extend_from_slice(&next_frame_bytes(i, b"x"));
        }

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&all).unwrap();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.stream_id(), i as u32 + 1);
        }
    }

    #[test]
    fn test_fragmented_delivery() {
        let bytes = next_frame_bytes(3, b"fragmented frame body");
        let mut buffer = FrameBuffer::new();

        // length prefix split across pushes
        assert!(buffer.push(&bytes[..2]).unwrap().is_empty());
        assert!(buffer.push(&bytes[2..7]).unwrap().is_empty());

        let mid = bytes.len() / 2;
        assert!(buffer.push(&bytes[7..mid]).unwrap().is_empty());

        let frames = buffer.push(&bytes[mid..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data().unwrap().as_ref(), b"fragmented frame body");
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = next_frame_bytes(2, b"drip");
        let mut buffer = FrameBuffer::new();

        let mut collected = Vec::new();
        for b in bytes.iter() {
            collected.extend(buffer.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].frame_type().unwrap(), FrameType::Next);
    }

    #[test]
    fn test_frame_exceeding_max_size() {
        let bytes = next_frame_bytes(1, b"0123456789");
        let mut buffer = FrameBuffer::with_max_frame_size(10);
        assert!(matches!(
            buffer.push(&bytes),
            Err(RSocketError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_runt_frame_rejected() {
        // length field claims 2 bytes follow: shorter than the common header
        let mut buffer = FrameBuffer::new();
        assert!(matches!(
            buffer.push(&[0, 0, 2]),
            Err(RSocketError::IllegalFrame(_))
        ));
    }

    #[test]
    fn test_header_only_frame() {
        let bytes = Frame::cancel(4).unwrap().into_bytes();
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type().unwrap(), FrameType::Cancel);
    }
}
