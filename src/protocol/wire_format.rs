//! Wire format encoding and decoding.
//!
//! Implements the common frame layout:
//! ```text
//! ┌────────────┬───────────┬──────────────┬─────────────────┬──────┐
//! │ Length     │ Stream ID │ Type ∥ Flags │ [Type header]   │ ...  │
//! │ 3 bytes    │ 4 bytes   │ 6 ∥ 10 bits  │ type-specific   │      │
//! │ uint24 BE  │ uint32 BE │ uint16 BE    │                 │      │
//! └────────────┴───────────┴──────────────┴─────────────────┴──────┘
//! ```
//! followed by an optional metadata block (24-bit length prefixed only for
//! frame types that can also carry data) and the data block, which runs to
//! the end of the frame.
//!
//! All multi-byte integers are Big Endian. The length field encodes the
//! number of bytes *after* itself.

use bytes::{Bytes, BytesMut};

use crate::error::{RSocketError, Result};

/// Size of the 24-bit frame length field.
pub const FRAME_LENGTH_SIZE: usize = 3;

/// Maximum value representable by the 24-bit length field.
pub const FRAME_LENGTH_MASK: u32 = 0xFF_FFFF;

const FRAME_LENGTH_FIELD_OFFSET: usize = 0;
const STREAM_ID_FIELD_OFFSET: usize = FRAME_LENGTH_FIELD_OFFSET + FRAME_LENGTH_SIZE;
const TYPE_AND_FLAGS_FIELD_OFFSET: usize = STREAM_ID_FIELD_OFFSET + 4;

/// Offset of the type-specific header (end of the common header).
pub const PAYLOAD_OFFSET: usize = TYPE_AND_FLAGS_FIELD_OFFSET + 2;

/// Common header length: length + stream id + type-and-flags.
pub const FRAME_HEADER_LEN: usize = PAYLOAD_OFFSET;

const FRAME_TYPE_BITS: u16 = 6;
const FRAME_TYPE_SHIFT: u16 = 16 - FRAME_TYPE_BITS;

/// Flag constants for the low 10 bits of the type-and-flags field.
pub mod flags {
    /// Ignore frame if the type is not understood.
    pub const IGNORE: u16 = 0b10_0000_0000;
    /// Metadata block present.
    pub const METADATA: u16 = 0b01_0000_0000;
    /// More fragments follow this frame.
    pub const FOLLOWS: u16 = 0b00_1000_0000;
    /// Terminal completion of the stream.
    pub const COMPLETE: u16 = 0b00_0100_0000;
    /// Payload element present.
    pub const NEXT: u16 = 0b00_0010_0000;

    /// KEEPALIVE: respond with a KEEPALIVE echo (shares the FOLLOWS bit).
    pub const KEEPALIVE_RESPOND: u16 = 0b00_1000_0000;
    /// SETUP: resume token present (shares the FOLLOWS bit).
    pub const SETUP_RESUME_ENABLE: u16 = 0b00_1000_0000;
    /// SETUP: client honors LEASE frames (shares the COMPLETE bit).
    pub const SETUP_LEASE: u16 = 0b00_0100_0000;

    /// Mask of the 10 flag bits.
    pub const FRAME_FLAGS_MASK: u16 = 0b11_1111_1111;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }
}

/// Frame types, both wire-level and the logical PAYLOAD subtypes.
///
/// `Next`, `Complete` and `NextComplete` never appear on the wire: they are
/// transmitted as `Payload` with the N/C flag bits and recovered by
/// [`frame_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Setup,
    Lease,
    Keepalive,
    RequestResponse,
    RequestFnf,
    RequestStream,
    RequestChannel,
    RequestN,
    Cancel,
    Payload,
    Error,
    MetadataPush,
    Resume,
    ResumeOk,
    Ext,
    /// Logical PAYLOAD with the N flag.
    Next,
    /// Logical PAYLOAD with the C flag.
    Complete,
    /// Logical PAYLOAD with both N and C flags.
    NextComplete,
}

impl FrameType {
    /// 6-bit wire code for this type. Logical payload subtypes share
    /// PAYLOAD's code.
    pub fn encoded_type(self) -> u16 {
        match self {
            FrameType::Setup => 0x01,
            FrameType::Lease => 0x02,
            FrameType::Keepalive => 0x03,
            FrameType::RequestResponse => 0x04,
            FrameType::RequestFnf => 0x05,
            FrameType::RequestStream => 0x06,
            FrameType::RequestChannel => 0x07,
            FrameType::RequestN => 0x08,
            FrameType::Cancel => 0x09,
            FrameType::Payload | FrameType::Next | FrameType::Complete | FrameType::NextComplete => {
                0x0A
            }
            FrameType::Error => 0x0B,
            FrameType::MetadataPush => 0x0C,
            FrameType::Resume => 0x0D,
            FrameType::ResumeOk => 0x0E,
            FrameType::Ext => 0x3F,
        }
    }

    /// Decode a 6-bit wire code. Returns `None` for unassigned codes.
    pub fn from_encoded(code: u16) -> Option<FrameType> {
        Some(match code {
            0x01 => FrameType::Setup,
            0x02 => FrameType::Lease,
            0x03 => FrameType::Keepalive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => FrameType::Payload,
            0x0B => FrameType::Error,
            0x0C => FrameType::MetadataPush,
            0x0D => FrameType::Resume,
            0x0E => FrameType::ResumeOk,
            0x3F => FrameType::Ext,
            _ => return None,
        })
    }

    /// Whether frames of this type may carry a data block.
    pub fn can_have_data(self) -> bool {
        matches!(
            self,
            FrameType::Setup
                | FrameType::Keepalive
                | FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::Payload
                | FrameType::Error
                | FrameType::Ext
                | FrameType::Next
                | FrameType::Complete
                | FrameType::NextComplete
        )
    }

    /// Whether frames of this type may carry a metadata block.
    pub fn can_have_metadata(self) -> bool {
        matches!(
            self,
            FrameType::Setup
                | FrameType::Lease
                | FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::Payload
                | FrameType::MetadataPush
                | FrameType::Ext
                | FrameType::Next
                | FrameType::Complete
                | FrameType::NextComplete
        )
    }

    /// Frames that can carry data prefix their metadata with an explicit
    /// 24-bit length; metadata-only frames let metadata run to the end.
    pub fn has_metadata_length_field(self) -> bool {
        self.can_have_data()
    }
}

/// Write the common header. `frame_length` is the total frame size
/// including the length field itself; the field stores `frame_length - 3`.
pub fn encode_header(
    buf: &mut BytesMut,
    frame_length: usize,
    flags: u16,
    frame_type: FrameType,
    stream_id: u32,
) -> Result<usize> {
    if frame_length as u64 & !(FRAME_LENGTH_MASK as u64) != 0 {
        return Err(RSocketError::FrameTooLarge { len: frame_length });
    }
    ensure_len(buf, FRAME_HEADER_LEN);

    encode_length(
        buf,
        FRAME_LENGTH_FIELD_OFFSET,
        frame_length - FRAME_LENGTH_SIZE,
    )?;
    buf[STREAM_ID_FIELD_OFFSET..STREAM_ID_FIELD_OFFSET + 4]
        .copy_from_slice(&stream_id.to_be_bytes());
    let type_and_flags =
        (frame_type.encoded_type() << FRAME_TYPE_SHIFT) | (flags & flags::FRAME_FLAGS_MASK);
    buf[TYPE_AND_FLAGS_FIELD_OFFSET..TYPE_AND_FLAGS_FIELD_OFFSET + 2]
        .copy_from_slice(&type_and_flags.to_be_bytes());

    Ok(FRAME_HEADER_LEN)
}

/// Write the metadata block at `metadata_offset` and set the M flag in the
/// already-written type-and-flags field. Returns the number of bytes
/// written (length field included when the type carries one).
pub fn encode_metadata(
    buf: &mut BytesMut,
    frame_type: FrameType,
    metadata_offset: usize,
    metadata: &[u8],
) -> Result<usize> {
    if metadata.is_empty() {
        return Ok(0);
    }

    let mut type_and_flags = u16::from_be_bytes([
        buf[TYPE_AND_FLAGS_FIELD_OFFSET],
        buf[TYPE_AND_FLAGS_FIELD_OFFSET + 1],
    ]);
    type_and_flags |= flags::METADATA;
    buf[TYPE_AND_FLAGS_FIELD_OFFSET..TYPE_AND_FLAGS_FIELD_OFFSET + 2]
        .copy_from_slice(&type_and_flags.to_be_bytes());

    let mut length = 0;
    if frame_type.has_metadata_length_field() {
        ensure_len(buf, metadata_offset + FRAME_LENGTH_SIZE);
        encode_length(buf, metadata_offset, metadata.len())?;
        length += FRAME_LENGTH_SIZE;
    }
    ensure_len(buf, metadata_offset + length + metadata.len());
    buf[metadata_offset + length..metadata_offset + length + metadata.len()]
        .copy_from_slice(metadata);
    length += metadata.len();

    Ok(length)
}

/// Append the raw data block at `data_offset`. No length prefix.
pub fn encode_data(buf: &mut BytesMut, data_offset: usize, data: &[u8]) -> usize {
    if data.is_empty() {
        return 0;
    }
    ensure_len(buf, data_offset + data.len());
    buf[data_offset..data_offset + data.len()].copy_from_slice(data);
    data.len()
}

/// Top-level encoder for frame types without a type-specific header.
///
/// Logical payload subtypes are rewritten to PAYLOAD with the matching C/N
/// flag bits; a literal PAYLOAD input is rejected.
pub fn encode(
    buf: &mut BytesMut,
    stream_id: u32,
    flags: u16,
    frame_type: FrameType,
    metadata: &[u8],
    data: &[u8],
) -> Result<usize> {
    let (out_type, flags) = match frame_type {
        FrameType::Payload => {
            return Err(RSocketError::IllegalFrame(
                "raw PAYLOAD frames cannot be encoded, use NEXT, COMPLETE or NEXT_COMPLETE".into(),
            ))
        }
        FrameType::NextComplete => (
            FrameType::Payload,
            flags | self::flags::COMPLETE | self::flags::NEXT,
        ),
        FrameType::Complete => (FrameType::Payload, flags | self::flags::COMPLETE),
        FrameType::Next => (FrameType::Payload, flags | self::flags::NEXT),
        other => (other, flags),
    };

    let frame_length =
        PAYLOAD_OFFSET + computed_metadata_length(frame_type, metadata.len()) + data.len();

    let mut length = encode_header(buf, frame_length, flags, out_type, stream_id)?;
    length += encode_metadata(buf, frame_type, length, metadata)?;
    length += encode_data(buf, length, data);

    Ok(length)
}

/// Flag bits of the frame.
pub fn frame_flags(buf: &[u8]) -> u16 {
    let type_and_flags = u16::from_be_bytes([
        buf[TYPE_AND_FLAGS_FIELD_OFFSET],
        buf[TYPE_AND_FLAGS_FIELD_OFFSET + 1],
    ]);
    type_and_flags & flags::FRAME_FLAGS_MASK
}

/// Stream id of the frame. `0` denotes a connection-level frame.
pub fn stream_id(buf: &[u8]) -> u32 {
    u32::from_be_bytes([
        buf[STREAM_ID_FIELD_OFFSET],
        buf[STREAM_ID_FIELD_OFFSET + 1],
        buf[STREAM_ID_FIELD_OFFSET + 2],
        buf[STREAM_ID_FIELD_OFFSET + 3],
    ])
}

/// Total frame length including the length field itself.
pub fn frame_length(buf: &[u8]) -> usize {
    decode_length(buf, FRAME_LENGTH_FIELD_OFFSET) + FRAME_LENGTH_SIZE
}

/// Strict frame type: PAYLOAD frames are resolved to their logical subtype
/// and must set at least one of N and C.
pub fn frame_type(buf: &[u8]) -> Result<FrameType> {
    let decoded = wire_frame_type(buf)?;

    if decoded != FrameType::Payload {
        return Ok(decoded);
    }

    let frame_flags = frame_flags(buf);
    let complete = flags::has_flag(frame_flags, flags::COMPLETE);
    let next = flags::has_flag(frame_flags, flags::NEXT);
    match (next, complete) {
        (true, true) => Ok(FrameType::NextComplete),
        (false, true) => Ok(FrameType::Complete),
        (true, false) => Ok(FrameType::Next),
        (false, false) => Err(RSocketError::IllegalFrame(
            "PAYLOAD must set either or both of NEXT and COMPLETE".into(),
        )),
    }
}

/// Wire-level frame type, PAYLOAD left unresolved.
pub fn wire_frame_type(buf: &[u8]) -> Result<FrameType> {
    let type_and_flags = u16::from_be_bytes([
        buf[TYPE_AND_FLAGS_FIELD_OFFSET],
        buf[TYPE_AND_FLAGS_FIELD_OFFSET + 1],
    ]);
    let code = type_and_flags >> FRAME_TYPE_SHIFT;
    FrameType::from_encoded(code)
        .ok_or_else(|| RSocketError::IllegalFrame(format!("unknown frame type {code:#04x}")))
}

/// Offset of the metadata/data region: common header plus the type-specific
/// header, which for SETUP depends on the frame contents.
pub fn payload_offset(buf: &[u8]) -> Result<usize> {
    let frame_type = wire_frame_type(buf)?;
    let offset = match frame_type {
        FrameType::Setup => setup_payload_offset(buf)?,
        // error code
        FrameType::Error => PAYLOAD_OFFSET + 4,
        // ttl + number of requests
        FrameType::Lease => PAYLOAD_OFFSET + 8,
        // last received position
        FrameType::Keepalive => PAYLOAD_OFFSET + 8,
        // initial request n
        FrameType::RequestStream | FrameType::RequestChannel => PAYLOAD_OFFSET + 4,
        // request n
        FrameType::RequestN => PAYLOAD_OFFSET + 4,
        _ => PAYLOAD_OFFSET,
    };
    Ok(offset)
}

fn setup_payload_offset(buf: &[u8]) -> Result<usize> {
    let truncated = || RSocketError::IllegalFrame("truncated SETUP header".into());

    // version + keepalive interval + max lifetime
    let mut offset = PAYLOAD_OFFSET + 12;
    if flags::has_flag(frame_flags(buf), flags::SETUP_RESUME_ENABLE) {
        if buf.len() < offset + 2 {
            return Err(truncated());
        }
        let token_len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
        offset += 2 + token_len;
    }
    // metadata MIME then data MIME, each 1-byte length prefixed
    for _ in 0..2 {
        if buf.len() < offset + 1 {
            return Err(truncated());
        }
        offset += 1 + buf[offset] as usize;
    }
    if buf.len() < offset {
        return Err(truncated());
    }
    Ok(offset)
}

/// Zero-copy view of the metadata block. Empty when the M flag is clear or
/// the type cannot carry metadata.
pub fn slice_metadata(buf: &Bytes) -> Result<Bytes> {
    let frame_type = wire_frame_type(buf)?;
    if !frame_type.can_have_metadata() || !flags::has_flag(frame_flags(buf), flags::METADATA) {
        return Ok(Bytes::new());
    }

    let mut metadata_offset = payload_offset(buf)?;
    let metadata_length = metadata_length(buf, frame_type, metadata_offset)?;
    if frame_type.has_metadata_length_field() {
        metadata_offset += FRAME_LENGTH_SIZE;
    }
    if metadata_length == 0 {
        return Ok(Bytes::new());
    }
    let end = metadata_offset + metadata_length;
    if end > buf.len() {
        return Err(RSocketError::IllegalFrame(
            "metadata region exceeds frame".into(),
        ));
    }
    Ok(buf.slice(metadata_offset..end))
}

/// Zero-copy view of the data block. Empty when the type carries no data or
/// the region has zero length.
pub fn slice_data(buf: &Bytes) -> Result<Bytes> {
    let frame_type = wire_frame_type(buf)?;
    if !frame_type.can_have_data() {
        return Ok(Bytes::new());
    }

    let payload_offset = payload_offset(buf)?;
    let data_offset = payload_offset + metadata_field_length(buf, frame_type, payload_offset)?;
    let frame_length = frame_length(buf);
    if frame_length <= data_offset {
        return Ok(Bytes::new());
    }
    if frame_length > buf.len() {
        return Err(RSocketError::IllegalFrame(
            "data region exceeds frame".into(),
        ));
    }
    Ok(buf.slice(data_offset..frame_length))
}

fn metadata_length(buf: &[u8], frame_type: FrameType, metadata_offset: usize) -> Result<usize> {
    if frame_type.has_metadata_length_field() {
        if buf.len() < metadata_offset + FRAME_LENGTH_SIZE {
            return Err(RSocketError::IllegalFrame(
                "truncated metadata length field".into(),
            ));
        }
        Ok(decode_length(buf, metadata_offset))
    } else {
        Ok(frame_length(buf).saturating_sub(metadata_offset))
    }
}

/// Total bytes the metadata region occupies, length prefix included.
fn metadata_field_length(
    buf: &[u8],
    frame_type: FrameType,
    metadata_offset: usize,
) -> Result<usize> {
    if !flags::has_flag(frame_flags(buf), flags::METADATA) {
        return Ok(0);
    }
    Ok(computed_metadata_length(
        frame_type,
        metadata_length(buf, frame_type, metadata_offset)?,
    ))
}

pub(crate) fn computed_metadata_length(frame_type: FrameType, length: usize) -> usize {
    if !frame_type.has_metadata_length_field() {
        // metadata-only frames carry no length field
        length
    } else if length == 0 {
        0
    } else {
        length + FRAME_LENGTH_SIZE
    }
}

/// Write a 24-bit big-endian length, byte by byte so that values up to
/// `1 << 24 - 1` never sign-extend.
pub fn encode_length(buf: &mut BytesMut, offset: usize, length: usize) -> Result<()> {
    if length as u64 & !(FRAME_LENGTH_MASK as u64) != 0 {
        return Err(RSocketError::FrameTooLarge { len: length });
    }
    buf[offset] = (length >> 16) as u8;
    buf[offset + 1] = (length >> 8) as u8;
    buf[offset + 2] = length as u8;
    Ok(())
}

/// Read a 24-bit big-endian length.
pub fn decode_length(buf: &[u8], offset: usize) -> usize {
    ((buf[offset] as usize) << 16) | ((buf[offset + 1] as usize) << 8) | buf[offset + 2] as usize
}

fn ensure_len(buf: &mut BytesMut, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}
