//! Shared memory regions.
//!
//! One region backs everything a port shares with its peer: ring
//! headers, descriptor arrays, and packet buffers. The client allocates
//! it as a sealed anonymous memory file and maps it immediately; the
//! server receives the descriptor over the control channel and maps it
//! during the connect transition.
//!
//! The mapping is raw ([`MmapRaw`]): both processes write the same
//! bytes concurrently, so no `&[u8]`/`&mut [u8]` view of the whole
//! region can exist. All access goes through the bounded copy and
//! atomic-word helpers below.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::AtomicU16;

use memmap2::{MmapOptions, MmapRaw};

use memif_core::MemoryConfig;

use crate::error::Result;
use crate::sys;

/// One mapped shared-memory extent.
pub(crate) struct Region {
    file: File,
    size: u64,
    map: Option<MmapRaw>,
    packet_buffer_offset: u32,
}

impl Region {
    /// Allocates a region sized for `cfg` (client only): sealed memfd,
    /// truncated to the computed size, mapped read-write shared.
    pub(crate) fn allocate(cfg: &MemoryConfig) -> Result<Self> {
        let size = cfg.region_size() as u64;
        let file = sys::memfd_sealed(size)?;
        let map = MmapOptions::new().len(size as usize).map_raw(&file)?;
        Ok(Self {
            file,
            size,
            map: Some(map),
            packet_buffer_offset: cfg.packet_buffer_offset() as u32,
        })
    }

    /// Wraps a descriptor received from the peer (server only). The
    /// region stays unmapped until [`Region::map`] runs at connect.
    pub(crate) fn from_fd(fd: OwnedFd, size: u64) -> Self {
        Self {
            file: File::from(fd),
            size,
            map: None,
            packet_buffer_offset: 0,
        }
    }

    /// Maps the region at its advertised size if not yet mapped.
    pub(crate) fn map(&mut self) -> io::Result<()> {
        if self.map.is_none() {
            let map = MmapOptions::new()
                .len(self.size as usize)
                .map_raw(&self.file)?;
            self.map = Some(map);
        }
        Ok(())
    }

    /// Returns the region size in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Returns the offset at which packet buffer storage begins.
    ///
    /// Only meaningful on the allocating (client) side.
    pub(crate) fn packet_buffer_offset(&self) -> u32 {
        self.packet_buffer_offset
    }

    /// Returns the raw descriptor, for sending over the control channel.
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn ptr(&self) -> *mut u8 {
        self.map
            .as_ref()
            .expect("region accessed before mapping")
            .as_mut_ptr()
    }

    /// Copies `dst.len()` bytes out of the region. Returns false if the
    /// range falls outside the mapping.
    pub(crate) fn read_at(&self, offset: usize, dst: &mut [u8]) -> bool {
        if offset.checked_add(dst.len()).is_none_or(|end| end > self.size as usize) {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        true
    }

    /// Copies `src` into the region. Returns false if the range falls
    /// outside the mapping.
    pub(crate) fn write_at(&self, offset: usize, src: &[u8]) -> bool {
        if offset.checked_add(src.len()).is_none_or(|end| end > self.size as usize) {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr().add(offset), src.len());
        }
        true
    }

    /// Returns the shared 16-bit word at `offset` as an atomic.
    ///
    /// `offset` must be 2-aligned and in bounds; ring layout guarantees
    /// both for every head/tail/flags word.
    pub(crate) fn atomic_u16(&self, offset: usize) -> &AtomicU16 {
        assert!(offset % 2 == 0 && offset + 2 <= self.size as usize);
        unsafe { &*(self.ptr().add(offset) as *const AtomicU16) }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("fd", &self.file.as_raw_fd())
            .field("size", &self.size)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn small_cfg() -> MemoryConfig {
        MemoryConfig {
            num_queue_pairs: 1,
            log2_ring_size: 4,
            packet_buffer_size: 128,
        }
    }

    #[test]
    fn test_allocate_matches_formula() {
        let cfg = small_cfg();
        let region = Region::allocate(&cfg).unwrap();
        assert_eq!(region.size(), cfg.region_size() as u64);
        assert_eq!(
            region.packet_buffer_offset(),
            cfg.packet_buffer_offset() as u32
        );
    }

    #[test]
    fn test_read_write_round_trip() {
        let region = Region::allocate(&small_cfg()).unwrap();
        let payload = [0xABu8; 64];
        assert!(region.write_at(256, &payload));
        let mut out = [0u8; 64];
        assert!(region.read_at(256, &mut out));
        assert_eq!(out, payload);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let region = Region::allocate(&small_cfg()).unwrap();
        let size = region.size() as usize;
        let mut buf = [0u8; 8];
        assert!(!region.read_at(size - 4, &mut buf));
        assert!(!region.write_at(size, &buf[..1]));
        assert!(!region.write_at(usize::MAX, &buf));
        assert!(region.read_at(size - 8, &mut buf));
    }

    #[test]
    fn test_attach_sees_client_writes() {
        let cfg = small_cfg();
        let client_side = Region::allocate(&cfg).unwrap();
        assert!(client_side.write_at(0, b"ping"));

        // Simulate the server receiving the fd: reopen by duplicating.
        let dup = client_side.file.try_clone().unwrap();
        let mut server_side = Region::from_fd(OwnedFd::from(dup), client_side.size());
        server_side.map().unwrap();

        let mut out = [0u8; 4];
        assert!(server_side.read_at(0, &mut out));
        assert_eq!(&out, b"ping");

        // Writes flow the other way too.
        assert!(server_side.write_at(0, b"pong"));
        assert!(client_side.read_at(0, &mut out));
        assert_eq!(&out, b"pong");
    }

    #[test]
    fn test_atomic_word_access() {
        let region = Region::allocate(&small_cfg()).unwrap();
        region.atomic_u16(6).store(0x1234, Ordering::Release);
        assert_eq!(region.atomic_u16(6).load(Ordering::Acquire), 0x1234);
        let mut raw = [0u8; 2];
        assert!(region.read_at(6, &mut raw));
        assert_eq!(u16::from_le_bytes(raw), 0x1234);
    }
}
