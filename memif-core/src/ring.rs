//! Ring header and descriptor byte layouts.
//!
//! A ring is a fixed 128-byte header followed by `2^L` descriptor slots
//! of 16 bytes each, all little-endian in shared memory:
//!
//! ```text
//! ring header:
//!   +0:  cookie  (u32)  - well-known constant
//!   +4:  flags   (u16)  - bit 0 masks interrupts
//!   +6:  head    (u16)  - free-running producer index
//!   +64: tail    (u16)  - free-running consumer index
//!
//! descriptor:
//!   +0:  flags    (u16) - bit 0 = packet continues in next slot
//!   +2:  region   (u16) - memory region index
//!   +4:  length   (u32) - valid payload bytes in this slot
//!   +8:  offset   (u32) - buffer offset within the region
//!   +12: metadata (u32) - opaque, preserved by the consumer
//! ```
//!
//! The types here are local in-process copies used on cold paths
//! (ring attach/detach) and for staging descriptors; the fast path
//! reads and writes the shared bytes directly.

/// Size of the ring header in bytes.
pub const RING_HDR_SIZE: usize = 128;

/// Byte offset of the cookie within the ring header.
pub const RING_COOKIE_OFFSET: usize = 0;

/// Byte offset of the flags word within the ring header.
pub const RING_FLAGS_OFFSET: usize = 4;

/// Byte offset of the head index within the ring header.
pub const RING_HEAD_OFFSET: usize = 6;

/// Byte offset of the tail index within the ring header.
pub const RING_TAIL_OFFSET: usize = 64;

/// Ring flag bit 0: when set, the consumer does not want eventfd wake-ups.
pub const RING_FLAG_MASK_INT: u16 = 1 << 0;

/// Size of one descriptor in bytes.
pub const DESC_SIZE: usize = 16;

/// Descriptor flag bit 0: the packet continues in the next slot.
pub const DESC_FLAG_NEXT: u16 = 1 << 0;

const DESC_FLAGS_OFFSET: usize = 0;
const DESC_REGION_OFFSET: usize = 2;
const DESC_LENGTH_OFFSET: usize = 4;
const DESC_OFFSET_OFFSET: usize = 8;
const DESC_METADATA_OFFSET: usize = 12;

/// Byte offset of a descriptor's length field, relative to the descriptor.
///
/// The client-side refill path rewrites this single field in place.
pub const DESC_LENGTH_FIELD_OFFSET: usize = DESC_LENGTH_OFFSET;

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Local copy of a ring header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingHdr {
    buf: [u8; RING_HDR_SIZE],
}

impl Default for RingHdr {
    fn default() -> Self {
        Self {
            buf: [0u8; RING_HDR_SIZE],
        }
    }
}

impl RingHdr {
    /// Copies a header out of a 128-byte slice.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than [`RING_HDR_SIZE`].
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hdr = Self::default();
        hdr.buf.copy_from_slice(&bytes[..RING_HDR_SIZE]);
        hdr
    }

    /// Returns the raw header bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; RING_HDR_SIZE] {
        &self.buf
    }

    /// Returns the cookie.
    #[must_use]
    pub fn cookie(&self) -> u32 {
        get_u32(&self.buf, RING_COOKIE_OFFSET)
    }

    /// Sets the cookie.
    pub fn set_cookie(&mut self, value: u32) {
        put_u32(&mut self.buf, RING_COOKIE_OFFSET, value);
    }

    /// Returns the flags word.
    #[must_use]
    pub fn flags(&self) -> u16 {
        get_u16(&self.buf, RING_FLAGS_OFFSET)
    }

    /// Sets the flags word.
    pub fn set_flags(&mut self, value: u16) {
        put_u16(&mut self.buf, RING_FLAGS_OFFSET, value);
    }

    /// Returns the head index.
    #[must_use]
    pub fn head(&self) -> u16 {
        get_u16(&self.buf, RING_HEAD_OFFSET)
    }

    /// Sets the head index.
    pub fn set_head(&mut self, value: u16) {
        put_u16(&mut self.buf, RING_HEAD_OFFSET, value);
    }

    /// Returns the tail index.
    #[must_use]
    pub fn tail(&self) -> u16 {
        get_u16(&self.buf, RING_TAIL_OFFSET)
    }

    /// Sets the tail index.
    pub fn set_tail(&mut self, value: u16) {
        put_u16(&mut self.buf, RING_TAIL_OFFSET, value);
    }
}

/// Local copy of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desc {
    buf: [u8; DESC_SIZE],
}

impl Default for Desc {
    fn default() -> Self {
        Self {
            buf: [0u8; DESC_SIZE],
        }
    }
}

impl Desc {
    /// Copies a descriptor out of a 16-byte slice.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than [`DESC_SIZE`].
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut desc = Self::default();
        desc.buf.copy_from_slice(&bytes[..DESC_SIZE]);
        desc
    }

    /// Returns the raw descriptor bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DESC_SIZE] {
        &self.buf
    }

    /// Returns the flags word.
    #[must_use]
    pub fn flags(&self) -> u16 {
        get_u16(&self.buf, DESC_FLAGS_OFFSET)
    }

    /// Sets the flags word.
    pub fn set_flags(&mut self, value: u16) {
        put_u16(&mut self.buf, DESC_FLAGS_OFFSET, value);
    }

    /// Returns the region index.
    #[must_use]
    pub fn region(&self) -> u16 {
        get_u16(&self.buf, DESC_REGION_OFFSET)
    }

    /// Sets the region index.
    pub fn set_region(&mut self, value: u16) {
        put_u16(&mut self.buf, DESC_REGION_OFFSET, value);
    }

    /// Returns the valid payload length.
    #[must_use]
    pub fn length(&self) -> u32 {
        get_u32(&self.buf, DESC_LENGTH_OFFSET)
    }

    /// Sets the valid payload length.
    pub fn set_length(&mut self, value: u32) {
        put_u32(&mut self.buf, DESC_LENGTH_OFFSET, value);
    }

    /// Returns the buffer offset within the region.
    #[must_use]
    pub fn offset(&self) -> u32 {
        get_u32(&self.buf, DESC_OFFSET_OFFSET)
    }

    /// Sets the buffer offset within the region.
    pub fn set_offset(&mut self, value: u32) {
        put_u32(&mut self.buf, DESC_OFFSET_OFFSET, value);
    }

    /// Returns the metadata word.
    #[must_use]
    pub fn metadata(&self) -> u32 {
        get_u32(&self.buf, DESC_METADATA_OFFSET)
    }

    /// Sets the metadata word.
    pub fn set_metadata(&mut self, value: u32) {
        put_u32(&mut self.buf, DESC_METADATA_OFFSET, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::COOKIE;

    #[test]
    fn test_ring_hdr_field_offsets() {
        let mut hdr = RingHdr::default();
        hdr.set_cookie(COOKIE);
        hdr.set_flags(0x0102);
        hdr.set_head(0x0304);
        hdr.set_tail(0x0506);

        let bytes = hdr.as_bytes();
        assert_eq!(&bytes[0..4], &COOKIE.to_le_bytes());
        assert_eq!(&bytes[4..6], &[0x02, 0x01]);
        assert_eq!(&bytes[6..8], &[0x04, 0x03]);
        assert_eq!(&bytes[64..66], &[0x06, 0x05]);
        // Everything between head and tail stays untouched.
        assert!(bytes[8..64].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ring_hdr_round_trip() {
        let mut hdr = RingHdr::default();
        hdr.set_cookie(COOKIE);
        hdr.set_head(0xFFFF);
        hdr.set_tail(1);

        let copy = RingHdr::from_bytes(hdr.as_bytes());
        assert_eq!(copy.cookie(), COOKIE);
        assert_eq!(copy.head(), 0xFFFF);
        assert_eq!(copy.tail(), 1);
    }

    #[test]
    fn test_desc_field_offsets() {
        let mut desc = Desc::default();
        desc.set_flags(DESC_FLAG_NEXT);
        desc.set_region(0x0A0B);
        desc.set_length(0x01020304);
        desc.set_offset(0x05060708);
        desc.set_metadata(0x090A0B0C);

        let bytes = desc.as_bytes();
        assert_eq!(&bytes[0..2], &[0x01, 0x00]);
        assert_eq!(&bytes[2..4], &[0x0B, 0x0A]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &[0x08, 0x07, 0x06, 0x05]);
        assert_eq!(&bytes[12..16], &[0x0C, 0x0B, 0x0A, 0x09]);
    }

    #[test]
    fn test_desc_metadata_preserved_through_copy() {
        let mut desc = Desc::default();
        desc.set_metadata(0xDEADBEEF);
        desc.set_length(64);

        let mut copy = Desc::from_bytes(desc.as_bytes());
        copy.set_length(0);
        assert_eq!(copy.metadata(), 0xDEADBEEF);
    }
}
