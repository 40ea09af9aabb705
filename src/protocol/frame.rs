//! Frame view type with typed accessors, plus per-frame-type builders.
//!
//! A [`Frame`] wraps the complete encoded frame (length field included) as
//! `bytes::Bytes`; all accessors are zero-copy slices into that buffer.
//!
//! # Example
//!
//! ```
//! use rsocket_engine::protocol::{Frame, FrameType};
//! use rsocket_engine::Payload;
//! use bytes::Bytes;
//!
//! let payload = Payload::new(Bytes::from_static(b"hi"));
//! let frame = Frame::next(1, &payload).unwrap();
//!
//! assert_eq!(frame.stream_id(), 1);
//! assert_eq!(frame.frame_type().unwrap(), FrameType::Next);
//! assert_eq!(frame.data().unwrap().as_ref(), b"hi");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{self, flags, FrameType, FRAME_HEADER_LEN, PAYLOAD_OFFSET};
use crate::error::{RSocketError, Result};
use crate::payload::Payload;

/// Protocol version advertised in SETUP frames (major 1, minor 0).
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// A complete protocol frame backed by a contiguous buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    buf: Bytes,
}

impl Frame {
    /// Wrap an already-framed buffer. The buffer must contain the full
    /// frame, length field included.
    pub fn from_bytes(buf: Bytes) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(RSocketError::IllegalFrame(format!(
                "frame of {} bytes is shorter than the common header",
                buf.len()
            )));
        }
        Ok(Self { buf })
    }

    /// Borrow the backing buffer.
    #[inline]
    pub fn as_bytes(&self) -> &Bytes {
        &self.buf
    }

    /// Unwrap into the backing buffer.
    #[inline]
    pub fn into_bytes(self) -> Bytes {
        self.buf
    }

    /// Total encoded length.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True for a header-only frame.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Stream id; `0` denotes a connection-level frame.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        wire_format::stream_id(&self.buf)
    }

    /// Strict frame type (logical PAYLOAD subtypes resolved).
    #[inline]
    pub fn frame_type(&self) -> Result<FrameType> {
        wire_format::frame_type(&self.buf)
    }

    /// The 10 flag bits.
    #[inline]
    pub fn flags(&self) -> u16 {
        wire_format::frame_flags(&self.buf)
    }

    /// Zero-copy metadata slice; empty when the M flag is clear.
    #[inline]
    pub fn metadata(&self) -> Result<Bytes> {
        wire_format::slice_metadata(&self.buf)
    }

    /// Zero-copy data slice.
    #[inline]
    pub fn data(&self) -> Result<Bytes> {
        wire_format::slice_data(&self.buf)
    }

    /// Decode the payload, sharing the frame's backing buffer.
    pub fn payload(&self) -> Result<Payload> {
        let data = self.data()?;
        if flags::has_flag(self.flags(), flags::METADATA) {
            Ok(Payload::with_metadata(self.metadata()?, data))
        } else {
            Ok(Payload::new(data))
        }
    }

    // ---- builders ----

    /// SETUP frame (no resume token).
    pub fn setup(
        keepalive_interval_millis: u32,
        max_lifetime_millis: u32,
        metadata_mime: &str,
        data_mime: &str,
        payload: &Payload,
    ) -> Result<Self> {
        let mut type_header = Vec::with_capacity(14 + metadata_mime.len() + data_mime.len());
        type_header.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        type_header.extend_from_slice(&keepalive_interval_millis.to_be_bytes());
        type_header.extend_from_slice(&max_lifetime_millis.to_be_bytes());
        for mime in [metadata_mime, data_mime] {
            if mime.len() > u8::MAX as usize {
                return Err(RSocketError::Protocol(format!(
                    "MIME type of {} bytes does not fit its length field",
                    mime.len()
                )));
            }
            type_header.push(mime.len() as u8);
            type_header.extend_from_slice(mime.as_bytes());
        }
        Self::build(0, 0, FrameType::Setup, &type_header, payload)
    }

    /// LEASE frame: time-to-live and request allowance, optional metadata.
    pub fn lease(ttl_millis: u32, number_of_requests: u32, metadata: &[u8]) -> Result<Self> {
        let mut type_header = [0u8; 8];
        type_header[..4].copy_from_slice(&ttl_millis.to_be_bytes());
        type_header[4..].copy_from_slice(&number_of_requests.to_be_bytes());
        Self::build_parts(0, 0, FrameType::Lease, &type_header, metadata, &[])
    }

    /// KEEPALIVE frame carrying opaque data and the last received position.
    pub fn keepalive(respond: bool, last_position: u64, data: &[u8]) -> Result<Self> {
        let frame_flags = if respond { flags::KEEPALIVE_RESPOND } else { 0 };
        Self::build_parts(
            0,
            frame_flags,
            FrameType::Keepalive,
            &last_position.to_be_bytes(),
            &[],
            data,
        )
    }

    /// REQUEST_RESPONSE frame.
    pub fn request_response(stream_id: u32, payload: &Payload) -> Result<Self> {
        Self::encode_simple(stream_id, 0, FrameType::RequestResponse, payload)
    }

    /// REQUEST_FNF frame.
    pub fn request_fnf(stream_id: u32, payload: &Payload) -> Result<Self> {
        Self::encode_simple(stream_id, 0, FrameType::RequestFnf, payload)
    }

    /// REQUEST_STREAM frame with its initial credit.
    pub fn request_stream(stream_id: u32, initial_request_n: u32, payload: &Payload) -> Result<Self> {
        Self::build(
            stream_id,
            0,
            FrameType::RequestStream,
            &initial_request_n.to_be_bytes(),
            payload,
        )
    }

    /// REQUEST_CHANNEL frame with its initial credit.
    pub fn request_channel(
        stream_id: u32,
        initial_request_n: u32,
        payload: &Payload,
    ) -> Result<Self> {
        Self::build(
            stream_id,
            0,
            FrameType::RequestChannel,
            &initial_request_n.to_be_bytes(),
            payload,
        )
    }

    /// REQUEST_N frame granting additional credit.
    pub fn request_n(stream_id: u32, n: u32) -> Result<Self> {
        Self::build_parts(
            stream_id,
            0,
            FrameType::RequestN,
            &n.to_be_bytes(),
            &[],
            &[],
        )
    }

    /// CANCEL frame.
    pub fn cancel(stream_id: u32) -> Result<Self> {
        let mut buf = BytesMut::new();
        wire_format::encode(&mut buf, stream_id, 0, FrameType::Cancel, &[], &[])?;
        Ok(Self { buf: buf.freeze() })
    }

    /// ERROR frame; the message travels as UTF-8 data after the code.
    pub fn error(stream_id: u32, code: u32, message: &str) -> Result<Self> {
        Self::build_parts(
            stream_id,
            0,
            FrameType::Error,
            &code.to_be_bytes(),
            &[],
            message.as_bytes(),
        )
    }

    /// METADATA_PUSH frame on stream 0.
    pub fn metadata_push(metadata: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::new();
        wire_format::encode(&mut buf, 0, 0, FrameType::MetadataPush, metadata, &[])?;
        Ok(Self { buf: buf.freeze() })
    }

    /// Logical NEXT payload frame.
    pub fn next(stream_id: u32, payload: &Payload) -> Result<Self> {
        Self::encode_simple(stream_id, 0, FrameType::Next, payload)
    }

    /// Logical COMPLETE payload frame (no payload bytes).
    pub fn complete(stream_id: u32) -> Result<Self> {
        let mut buf = BytesMut::new();
        wire_format::encode(&mut buf, stream_id, 0, FrameType::Complete, &[], &[])?;
        Ok(Self { buf: buf.freeze() })
    }

    /// Logical NEXT_COMPLETE payload frame.
    pub fn next_complete(stream_id: u32, payload: &Payload) -> Result<Self> {
        Self::encode_simple(stream_id, 0, FrameType::NextComplete, payload)
    }

    fn encode_simple(
        stream_id: u32,
        frame_flags: u16,
        frame_type: FrameType,
        payload: &Payload,
    ) -> Result<Self> {
        let mut buf = BytesMut::new();
        wire_format::encode(
            &mut buf,
            stream_id,
            frame_flags,
            frame_type,
            payload.metadata().map(|m| m.as_ref()).unwrap_or(&[]),
            payload.data(),
        )?;
        Ok(Self { buf: buf.freeze() })
    }

    fn build(
        stream_id: u32,
        frame_flags: u16,
        frame_type: FrameType,
        type_header: &[u8],
        payload: &Payload,
    ) -> Result<Self> {
        Self::build_parts(
            stream_id,
            frame_flags,
            frame_type,
            type_header,
            payload.metadata().map(|m| m.as_ref()).unwrap_or(&[]),
            payload.data(),
        )
    }

    /// Assemble a frame with a type-specific header between the common
    /// header and the metadata/data region.
    fn build_parts(
        stream_id: u32,
        frame_flags: u16,
        frame_type: FrameType,
        type_header: &[u8],
        metadata: &[u8],
        data: &[u8],
    ) -> Result<Self> {
        let frame_length = PAYLOAD_OFFSET
            + type_header.len()
            + wire_format::computed_metadata_length(frame_type, metadata.len())
            + data.len();

        let mut buf = BytesMut::with_capacity(frame_length);
        let mut offset =
            wire_format::encode_header(&mut buf, frame_length, frame_flags, frame_type, stream_id)?;
        offset += wire_format::encode_data(&mut buf, offset, type_header);
        offset += wire_format::encode_metadata(&mut buf, frame_type, offset, metadata)?;
        wire_format::encode_data(&mut buf, offset, data);

        Ok(Self { buf: buf.freeze() })
    }

    // ---- per-type readers ----

    /// Initial credit of a REQUEST_STREAM / REQUEST_CHANNEL frame.
    pub fn initial_request_n(&self) -> Result<u32> {
        self.read_u32_at(PAYLOAD_OFFSET)
    }

    /// Credit granted by a REQUEST_N frame.
    pub fn request_n_value(&self) -> Result<u32> {
        self.read_u32_at(PAYLOAD_OFFSET)
    }

    /// Error code of an ERROR frame.
    pub fn error_code(&self) -> Result<u32> {
        self.read_u32_at(PAYLOAD_OFFSET)
    }

    /// Error message of an ERROR frame.
    pub fn error_message(&self) -> Result<String> {
        if self.buf.len() < PAYLOAD_OFFSET + 4 {
            return Err(truncated("ERROR"));
        }
        Ok(String::from_utf8_lossy(&self.buf[PAYLOAD_OFFSET + 4..]).into_owned())
    }

    /// Whether a KEEPALIVE frame requests an echo.
    pub fn keepalive_respond(&self) -> bool {
        flags::has_flag(self.flags(), flags::KEEPALIVE_RESPOND)
    }

    /// Last received position of a KEEPALIVE frame.
    pub fn keepalive_last_position(&self) -> Result<u64> {
        let end = PAYLOAD_OFFSET + 8;
        if self.buf.len() < end {
            return Err(truncated("KEEPALIVE"));
        }
        Ok(u64::from_be_bytes(
            self.buf[PAYLOAD_OFFSET..end]
                .try_into()
                .expect("checked length"),
        ))
    }

    /// SETUP protocol version.
    pub fn setup_version(&self) -> Result<u32> {
        self.read_u32_at(PAYLOAD_OFFSET)
    }

    /// SETUP keep-alive interval in milliseconds.
    pub fn setup_keepalive_interval(&self) -> Result<u32> {
        self.read_u32_at(PAYLOAD_OFFSET + 4)
    }

    /// SETUP maximum lifetime in milliseconds.
    pub fn setup_max_lifetime(&self) -> Result<u32> {
        self.read_u32_at(PAYLOAD_OFFSET + 8)
    }

    /// SETUP metadata MIME type.
    pub fn setup_metadata_mime(&self) -> Result<String> {
        Ok(self.setup_mimes()?.0)
    }

    /// SETUP data MIME type.
    pub fn setup_data_mime(&self) -> Result<String> {
        Ok(self.setup_mimes()?.1)
    }

    fn setup_mimes(&self) -> Result<(String, String)> {
        let mut offset = PAYLOAD_OFFSET + 12;
        if flags::has_flag(self.flags(), flags::SETUP_RESUME_ENABLE) {
            if self.buf.len() < offset + 2 {
                return Err(truncated("SETUP"));
            }
            let token_len = u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]) as usize;
            offset += 2 + token_len;
        }

        let mut mimes = [String::new(), String::new()];
        for mime in mimes.iter_mut() {
            if self.buf.len() < offset + 1 {
                return Err(truncated("SETUP"));
            }
            let len = self.buf[offset] as usize;
            if self.buf.len() < offset + 1 + len {
                return Err(truncated("SETUP"));
            }
            *mime = String::from_utf8_lossy(&self.buf[offset + 1..offset + 1 + len]).into_owned();
            offset += 1 + len;
        }
        let [metadata_mime, data_mime] = mimes;
        Ok((metadata_mime, data_mime))
    }

    fn read_u32_at(&self, offset: usize) -> Result<u32> {
        if self.buf.len() < offset + 4 {
            return Err(truncated("frame"));
        }
        Ok(u32::from_be_bytes(
            self.buf[offset..offset + 4]
                .try_into()
                .expect("checked length"),
        ))
    }
}

fn truncated(what: &str) -> RSocketError {
    RSocketError::IllegalFrame(format!("truncated {what} header"))
}
