//! Payload: the (metadata, data) pair carried by frames.
//!
//! Both blocks are opaque to the engine. They are `bytes::Bytes`, so
//! slicing a payload out of an inbound frame shares the frame's backing
//! buffer, and handing a payload to the codec transfers ownership of the
//! last reference when the caller drops its clone.

use bytes::Bytes;

/// An opaque payload: optional metadata plus data bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    metadata: Option<Bytes>,
    data: Bytes,
}

impl Payload {
    /// Create a payload carrying only data.
    pub fn new(data: Bytes) -> Self {
        Self {
            metadata: None,
            data,
        }
    }

    /// Create a payload with metadata and data.
    pub fn with_metadata(metadata: Bytes, data: Bytes) -> Self {
        Self {
            metadata: Some(metadata),
            data,
        }
    }

    /// Create an empty payload (no metadata, zero-length data).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a payload from static byte slices.
    pub fn from_static(metadata: Option<&'static [u8]>, data: &'static [u8]) -> Self {
        Self {
            metadata: metadata.map(Bytes::from_static),
            data: Bytes::from_static(data),
        }
    }

    /// Metadata block, if present.
    #[inline]
    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Data block.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// True when there is neither metadata nor data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.data.is_empty()
    }

    /// Split into the (metadata, data) parts.
    pub fn into_parts(self) -> (Option<Bytes>, Bytes) {
        (self.metadata, self.data)
    }
}
