//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary frame layer:
//! - bit-exact header encoding/decoding with per-type payload offsets
//! - `Frame` view type with builders for every frame type
//! - `FrameBuffer` for accumulating partial reads off a byte stream

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{Frame, PROTOCOL_VERSION};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
pub use wire_format::{
    encode, encode_data, encode_header, encode_metadata, flags, frame_flags, frame_length,
    frame_type, payload_offset, slice_data, slice_metadata, stream_id, wire_frame_type, FrameType,
    FRAME_HEADER_LEN, FRAME_LENGTH_MASK, FRAME_LENGTH_SIZE, PAYLOAD_OFFSET,
};
