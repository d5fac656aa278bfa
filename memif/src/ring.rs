//! Runtime ring handling: placement, client-side initialisation, and
//! the cold-path header copies used at attach and detach.

use memif_core::control::AddRing;
use memif_core::ring::{DESC_SIZE, RING_HDR_SIZE};
use memif_core::{Desc, Error, MemoryConfig, RingDirection, RingHdr, COOKIE, RING_FLAG_MASK_INT};

use crate::region::Region;

/// Location and shape of one ring inside a region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ring {
    pub(crate) direction: RingDirection,
    pub(crate) region: u16,
    pub(crate) offset: u32,
    pub(crate) log2_size: u8,
}

impl Ring {
    /// Places a ring by the layout formulas (client side).
    pub(crate) fn for_layout(cfg: &MemoryConfig, direction: RingDirection, index: u16) -> Self {
        Self {
            direction,
            region: 0,
            offset: cfg.ring_offset(direction, index) as u32,
            log2_size: cfg.log2_ring_size,
        }
    }

    /// Builds a ring from a received ADD_RING message (server side).
    pub(crate) fn from_wire(msg: &AddRing, direction: RingDirection) -> Self {
        Self {
            direction,
            region: msg.region,
            offset: msg.offset,
            log2_size: msg.log2_ring_size,
        }
    }

    /// Number of slots in the ring.
    pub(crate) fn size(&self) -> u16 {
        1 << self.log2_size
    }

    /// Slot index mask.
    pub(crate) fn mask(&self) -> u16 {
        self.size().wrapping_sub(1)
    }

    /// Byte offset of a descriptor slot within the region.
    pub(crate) fn desc_offset(&self, slot: u16) -> usize {
        self.offset as usize + RING_HDR_SIZE + slot as usize * DESC_SIZE
    }

    /// Copies a local header into shared memory (attach/detach only).
    pub(crate) fn put_hdr(&self, region: &Region, hdr: &RingHdr) {
        region.write_at(self.offset as usize, hdr.as_bytes());
    }

    /// Copies the shared header into a local copy (attach/detach only).
    pub(crate) fn update_hdr(&self, region: &Region) -> RingHdr {
        let mut buf = [0u8; RING_HDR_SIZE];
        region.read_at(self.offset as usize, &mut buf);
        RingHdr::from_bytes(&buf)
    }

    /// Initialises a fresh ring in shared memory (client only): stamps
    /// the cookie, masks interrupts, zeroes the indices, and pre-sizes
    /// every descriptor to one packet buffer.
    pub(crate) fn initialize(&self, region: &Region, cfg: &MemoryConfig, pair_index: u16) {
        let mut hdr = RingHdr::default();
        hdr.set_cookie(COOKIE);
        hdr.set_flags(RING_FLAG_MASK_INT);
        hdr.set_head(0);
        hdr.set_tail(0);
        self.put_hdr(region, &hdr);

        let mut desc = Desc::default();
        desc.set_flags(0);
        desc.set_region(self.region);
        desc.set_length(cfg.packet_buffer_size);
        let base = region.packet_buffer_offset() as usize;
        for slot in 0..self.size() {
            let buffer = base
                + cfg.buffer_slot(self.direction, pair_index, slot)
                    * cfg.packet_buffer_size as usize;
            desc.set_offset(buffer as u32);
            region.write_at(self.desc_offset(slot), desc.as_bytes());
        }
    }

    /// Verifies the cookie of an already-initialised ring (both sides,
    /// at connect).
    pub(crate) fn attach(&self, region: &Region) -> Result<(), Error> {
        let hdr = self.update_hdr(region);
        if hdr.cookie() != COOKIE {
            return Err(Error::WrongCookie);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memif_core::control::AddRing;

    fn small_cfg() -> MemoryConfig {
        MemoryConfig {
            num_queue_pairs: 1,
            log2_ring_size: 3,
            packet_buffer_size: 64,
        }
    }

    #[test]
    fn test_initialize_then_attach() {
        let cfg = small_cfg();
        let region = Region::allocate(&cfg).unwrap();
        let ring = Ring::for_layout(&cfg, RingDirection::S2m, 0);

        ring.initialize(&region, &cfg, 0);
        ring.attach(&region).unwrap();

        let hdr = ring.update_hdr(&region);
        assert_eq!(hdr.cookie(), COOKIE);
        assert_eq!(hdr.flags(), RING_FLAG_MASK_INT);
        assert_eq!(hdr.head(), 0);
        assert_eq!(hdr.tail(), 0);
    }

    #[test]
    fn test_initialize_presizes_descriptors() {
        let cfg = small_cfg();
        let region = Region::allocate(&cfg).unwrap();
        let ring = Ring::for_layout(&cfg, RingDirection::M2s, 0);
        ring.initialize(&region, &cfg, 0);

        for slot in 0..ring.size() {
            let mut buf = [0u8; DESC_SIZE];
            assert!(region.read_at(ring.desc_offset(slot), &mut buf));
            let desc = Desc::from_bytes(&buf);
            assert_eq!(desc.length(), cfg.packet_buffer_size);
            assert_eq!(desc.region(), 0);
            assert_eq!(
                desc.offset() as usize,
                cfg.buffer_offset(RingDirection::M2s, 0, slot)
            );
        }
    }

    #[test]
    fn test_attach_rejects_wrong_cookie() {
        let cfg = small_cfg();
        let region = Region::allocate(&cfg).unwrap();
        let ring = Ring::for_layout(&cfg, RingDirection::S2m, 0);
        ring.initialize(&region, &cfg, 0);

        // Corrupt the cookie in shared memory.
        region.write_at(ring.offset as usize, &[0u8; 4]);
        assert_eq!(ring.attach(&region), Err(Error::WrongCookie));
    }

    #[test]
    fn test_from_wire_round_trip() {
        let msg = AddRing {
            flags: 0,
            index: 0,
            region: 0,
            offset: 4096,
            log2_ring_size: 10,
            private_hdr_size: 0,
        };
        let ring = Ring::from_wire(&msg, RingDirection::M2s);
        assert_eq!(ring.offset, 4096);
        assert_eq!(ring.size(), 1024);
        assert_eq!(ring.mask(), 1023);
    }
}
