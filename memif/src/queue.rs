//! Packet fast path.
//!
//! A queue is one side's view of one ring: cached head/tail indices,
//! the interrupt descriptor, and the region table. Both operations are
//! wait-free with respect to the peer; a queue has exactly one producer
//! and one consumer, and a single handle must not be driven from two
//! threads at once.
//!
//! Ordering discipline: the producer publishes its index with a release
//! store after all descriptor and payload writes; the consumer loads
//! the peer's index with an acquire load before touching descriptors.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use memif_core::ring::{
    DESC_LENGTH_FIELD_OFFSET, RING_FLAGS_OFFSET, RING_HEAD_OFFSET, RING_TAIL_OFFSET,
};
use memif_core::{Desc, Error, DESC_FLAG_NEXT, DESC_SIZE, RING_FLAG_MASK_INT};

use crate::error::{MemifError, Result};
use crate::region::Region;
use crate::ring::Ring;
use crate::sys;

/// One direction of packet transfer on a connected port.
///
/// Obtained from [`Port::rx_queue`](crate::Port::rx_queue) and
/// [`Port::tx_queue`](crate::Port::tx_queue) after the connected
/// callback has run.
pub struct Queue {
    ring: Ring,
    regions: Arc<Vec<Region>>,
    is_server: bool,
    packet_buffer_size: u32,
    last_head: AtomicU16,
    last_tail: AtomicU16,
    interrupt: OwnedFd,
}

impl Queue {
    pub(crate) fn new(
        ring: Ring,
        regions: Arc<Vec<Region>>,
        is_server: bool,
        packet_buffer_size: u32,
        interrupt: OwnedFd,
    ) -> Self {
        Self {
            ring,
            regions,
            is_server,
            packet_buffer_size,
            last_head: AtomicU16::new(0),
            last_tail: AtomicU16::new(0),
            interrupt,
        }
    }

    /// Returns the interrupt event descriptor for this queue.
    ///
    /// The peer writes an 8-byte count here after producing, when
    /// interrupts are enabled; a blocked consumer can poll it instead
    /// of spinning.
    #[must_use]
    pub fn event_fd(&self) -> BorrowedFd<'_> {
        self.interrupt.as_fd()
    }

    /// Enables or disables peer wake-ups on this queue's ring.
    ///
    /// Rings start with interrupts masked; a consumer that wants to
    /// block on [`Queue::event_fd`] clears the mask first.
    pub fn enable_interrupts(&self, enabled: bool) {
        let flags = self.ring_region().atomic_u16(self.ring.offset as usize + RING_FLAGS_OFFSET);
        if enabled {
            flags.fetch_and(!RING_FLAG_MASK_INT, Ordering::Relaxed);
        } else {
            flags.fetch_or(RING_FLAG_MASK_INT, Ordering::Relaxed);
        }
    }

    fn ring_region(&self) -> &Region {
        &self.regions[self.ring.region as usize]
    }

    fn shm_head(&self) -> &AtomicU16 {
        self.ring_region()
            .atomic_u16(self.ring.offset as usize + RING_HEAD_OFFSET)
    }

    fn shm_tail(&self) -> &AtomicU16 {
        self.ring_region()
            .atomic_u16(self.ring.offset as usize + RING_TAIL_OFFSET)
    }

    fn shm_flags(&self) -> u16 {
        self.ring_region()
            .atomic_u16(self.ring.offset as usize + RING_FLAGS_OFFSET)
            .load(Ordering::Relaxed)
    }

    fn load_desc(&self, slot: u16) -> Option<Desc> {
        let mut buf = [0u8; DESC_SIZE];
        self.ring_region()
            .read_at(self.ring.desc_offset(slot), &mut buf)
            .then(|| Desc::from_bytes(&buf))
    }

    fn store_desc(&self, slot: u16, desc: &Desc) {
        self.ring_region()
            .write_at(self.ring.desc_offset(slot), desc.as_bytes());
    }

    fn set_desc_length(&self, slot: u16, length: u32) {
        self.ring_region().write_at(
            self.ring.desc_offset(slot) + DESC_LENGTH_FIELD_OFFSET,
            &length.to_le_bytes(),
        );
    }

    /// Copies one descriptor's payload into `pkt[at..]`, clamped to the
    /// caller buffer. Fails if the descriptor points outside the region
    /// table.
    fn copy_payload(&self, desc: &Desc, pkt: &mut [u8], at: usize) -> Result<usize> {
        let region = self
            .regions
            .get(desc.region() as usize)
            .ok_or(Error::InvalidRegionIndex)?;
        let want = desc.length() as usize;
        let n = want.min(pkt.len().saturating_sub(at));
        if !region.read_at(desc.offset() as usize, &mut pkt[at..at + n]) {
            return Err(MemifError::Protocol(Error::DescriptorOutOfBounds));
        }
        Ok(n)
    }

    /// Consumes one packet into `pkt`, returning the number of bytes
    /// read; 0 means the ring is empty.
    ///
    /// Chained descriptors are followed until the final slot; a chain
    /// that runs past the published index is a protocol violation by
    /// the peer.
    ///
    /// # Errors
    /// [`memif_core::Error::IncompleteChain`] on a truncated chain,
    /// [`memif_core::Error::DescriptorOutOfBounds`] or
    /// [`memif_core::Error::InvalidRegionIndex`] when a descriptor
    /// points outside shared memory.
    pub fn read_packet(&self, pkt: &mut [u8]) -> Result<usize> {
        let mask = self.ring.mask();
        // The server consumes at the client-published head, the client
        // at the server-published tail.
        let (mut slot, last) = if self.is_server {
            (
                self.last_head.load(Ordering::Relaxed),
                self.shm_head().load(Ordering::Acquire),
            )
        } else {
            (
                self.last_tail.load(Ordering::Relaxed),
                self.shm_tail().load(Ordering::Acquire),
            )
        };

        let mut n_slots = last.wrapping_sub(slot);
        let mut read = 0usize;

        if n_slots > 0 {
            let mut desc = self
                .load_desc(slot & mask)
                .ok_or(Error::DescriptorOutOfBounds)?;
            read += self.copy_payload(&desc, pkt, read)?;
            slot = slot.wrapping_add(1);
            n_slots -= 1;

            while desc.flags() & DESC_FLAG_NEXT != 0 {
                if n_slots == 0 {
                    return Err(Error::IncompleteChain.into());
                }
                desc = self
                    .load_desc(slot & mask)
                    .ok_or(Error::DescriptorOutOfBounds)?;
                read += self.copy_payload(&desc, pkt, read)?;
                slot = slot.wrapping_add(1);
                n_slots -= 1;
            }
        }

        // Refill: hand the consumed slots back to the producer.
        if self.is_server {
            self.last_head.store(slot, Ordering::Relaxed);
            self.shm_tail().store(slot, Ordering::Release);
        } else {
            self.last_tail.store(slot, Ordering::Relaxed);
            let mut head = self.shm_head().load(Ordering::Relaxed);
            let n_refill = self
                .ring
                .size()
                .wrapping_add(slot)
                .wrapping_sub(head);
            for _ in 0..n_refill {
                self.set_desc_length(head & mask, self.packet_buffer_size);
                head = head.wrapping_add(1);
            }
            self.shm_head().store(head, Ordering::Release);
        }

        Ok(read)
    }

    /// Produces one packet from `pkt`, chaining across slots as needed,
    /// and returns the number of bytes written.
    ///
    /// Returns 0 without advancing the producer index when the packet
    /// does not fit; the packet is never partially committed and the
    /// caller may retry.
    pub fn write_packet(&self, pkt: &[u8]) -> usize {
        let mask = self.ring.mask();
        // The server produces at the tail into client-posted buffers,
        // the client at the head.
        let (mut slot, mut n_free) = if self.is_server {
            let slot = self.shm_tail().load(Ordering::Relaxed);
            (slot, self.shm_head().load(Ordering::Acquire).wrapping_sub(slot))
        } else {
            let slot = self.shm_head().load(Ordering::Relaxed);
            (
                slot,
                self.ring
                    .size()
                    .wrapping_add(self.shm_tail().load(Ordering::Acquire))
                    .wrapping_sub(slot),
            )
        };

        if n_free == 0 {
            self.interrupt();
            return 0;
        }

        let Some(mut desc) = self.load_desc(slot & mask) else {
            return 0;
        };
        desc.set_flags(0);
        let mut written = match self.fill_slot(&mut desc, pkt, 0) {
            Some(n) => n,
            None => return 0,
        };

        while written < pkt.len() {
            n_free -= 1;
            if n_free == 0 {
                self.interrupt();
                return 0;
            }
            desc.set_flags(DESC_FLAG_NEXT);
            self.store_desc(slot & mask, &desc);
            slot = slot.wrapping_add(1);

            desc = match self.load_desc(slot & mask) {
                Some(d) => d,
                None => return 0,
            };
            desc.set_flags(0);
            written += match self.fill_slot(&mut desc, pkt, written) {
                Some(n) => n,
                None => return 0,
            };
        }

        self.store_desc(slot & mask, &desc);
        slot = slot.wrapping_add(1);

        if self.is_server {
            self.shm_tail().store(slot, Ordering::Release);
        } else {
            self.shm_head().store(slot, Ordering::Release);
        }
        self.interrupt();

        written
    }

    /// Copies as much of `pkt[at..]` as fits into the slot's buffer and
    /// records the length in the descriptor. On the server the slot
    /// capacity is whatever the client pre-sized the descriptor to; on
    /// the client it is the configured packet buffer size.
    fn fill_slot(&self, desc: &mut Desc, pkt: &[u8], at: usize) -> Option<usize> {
        let capacity = if self.is_server {
            desc.length() as usize
        } else {
            self.packet_buffer_size as usize
        };
        let region = self.regions.get(desc.region() as usize)?;
        let n = capacity.min(pkt.len() - at);
        if !region.write_at(desc.offset() as usize, &pkt[at..at + n]) {
            return None;
        }
        desc.set_length(n as u32);
        Some(n)
    }

    /// Wakes the peer through the interrupt descriptor unless the ring
    /// has interrupts masked. A saturated counter means a wake-up is
    /// already pending.
    fn interrupt(&self) {
        if self.shm_flags() & RING_FLAG_MASK_INT == 0 {
            if let Err(err) = sys::eventfd_write(self.interrupt.as_fd()) {
                tracing::warn!(error = %err, "eventfd write failed");
            }
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("ring", &self.ring)
            .field("is_server", &self.is_server)
            .field("last_head", &self.last_head.load(Ordering::Relaxed))
            .field("last_tail", &self.last_tail.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memif_core::{MemoryConfig, RingDirection};
    use std::os::fd::AsRawFd;

    // Builds the two ends of one ring over a single region, the way a
    // connected port pair would see it.
    fn ring_pair(direction: RingDirection) -> (Arc<Vec<Region>>, Queue, Queue) {
        let cfg = MemoryConfig {
            num_queue_pairs: 1,
            log2_ring_size: 3,
            packet_buffer_size: 256,
        };
        let region = Region::allocate(&cfg).unwrap();
        let ring = Ring::for_layout(&cfg, direction, 0);
        ring.initialize(&region, &cfg, 0);
        let regions = Arc::new(vec![region]);

        let client = Queue::new(
            ring,
            Arc::clone(&regions),
            false,
            cfg.packet_buffer_size,
            sys::eventfd().unwrap(),
        );
        let server = Queue::new(
            ring,
            Arc::clone(&regions),
            true,
            cfg.packet_buffer_size,
            sys::eventfd().unwrap(),
        );
        (regions, client, server)
    }

    #[test]
    fn test_client_to_server_round_trip() {
        let (_regions, client, server) = ring_pair(RingDirection::S2m);

        let payload = [0xAAu8; 64];
        assert_eq!(client.write_packet(&payload), 64);

        let mut out = [0u8; 2048];
        let n = server.read_packet(&mut out).unwrap();
        assert_eq!(n, 64);
        assert_eq!(&out[..64], &payload[..]);
    }

    #[test]
    fn test_empty_ring_reads_zero() {
        let (_regions, _client, server) = ring_pair(RingDirection::S2m);
        let mut out = [0u8; 64];
        assert_eq!(server.read_packet(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_chained_round_trip() {
        let (_regions, client, server) = ring_pair(RingDirection::S2m);

        // 600 bytes over 256-byte buffers: 3 descriptors, 256+256+88.
        let payload: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        assert_eq!(client.write_packet(&payload), 600);

        let mut out = vec![0u8; 4096];
        let n = server.read_packet(&mut out).unwrap();
        assert_eq!(n, 600);
        assert_eq!(&out[..600], &payload[..]);

        // Three slots were consumed.
        assert_eq!(server.last_head.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_chain_descriptor_flags() {
        let (regions, client, _server) = ring_pair(RingDirection::S2m);
        let payload = vec![7u8; 600];
        assert_eq!(client.write_packet(&payload), 600);

        let cfg = MemoryConfig {
            num_queue_pairs: 1,
            log2_ring_size: 3,
            packet_buffer_size: 256,
        };
        let ring = Ring::for_layout(&cfg, RingDirection::S2m, 0);
        let read_desc = |slot: u16| {
            let mut buf = [0u8; DESC_SIZE];
            assert!(regions[0].read_at(ring.desc_offset(slot), &mut buf));
            Desc::from_bytes(&buf)
        };
        assert_eq!(read_desc(0).flags() & DESC_FLAG_NEXT, DESC_FLAG_NEXT);
        assert_eq!(read_desc(1).flags() & DESC_FLAG_NEXT, DESC_FLAG_NEXT);
        assert_eq!(read_desc(2).flags() & DESC_FLAG_NEXT, 0);
        assert_eq!(read_desc(0).length(), 256);
        assert_eq!(read_desc(1).length(), 256);
        assert_eq!(read_desc(2).length(), 88);
    }

    #[test]
    fn test_back_pressure_returns_zero() {
        let (_regions, client, server) = ring_pair(RingDirection::S2m);
        let payload = [1u8; 256];

        // Ring has 8 slots; a stalled consumer accepts exactly 8
        // full-buffer packets.
        for _ in 0..8 {
            assert_eq!(client.write_packet(&payload), 256);
        }
        assert_eq!(client.write_packet(&payload), 0);

        // The producer index did not move past the published packets.
        let mut out = [0u8; 512];
        for _ in 0..8 {
            assert_eq!(server.read_packet(&mut out).unwrap(), 256);
        }
        assert_eq!(server.read_packet(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_oversized_packet_never_partially_commits() {
        let (_regions, client, server) = ring_pair(RingDirection::S2m);
        // 8 slots of 256 bytes; 3000 bytes cannot fit.
        let payload = vec![9u8; 3000];
        assert_eq!(client.write_packet(&payload), 0);

        let mut out = [0u8; 512];
        assert_eq!(server.read_packet(&mut out).unwrap(), 0);

        // The ring still works afterwards.
        assert_eq!(client.write_packet(&[5u8; 16]), 16);
        assert_eq!(server.read_packet(&mut out).unwrap(), 16);
    }

    #[test]
    fn test_server_to_client_direction() {
        let (_regions, client, server) = ring_pair(RingDirection::M2s);

        // The client arms the ring by reading once (publishing free
        // buffers at the head), as the reference implementation does.
        let mut out = [0u8; 512];
        assert_eq!(client.read_packet(&mut out).unwrap(), 0);

        let payload = [0x5Au8; 100];
        assert_eq!(server.write_packet(&payload), 100);

        let n = client.read_packet(&mut out).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&out[..100], &payload[..]);
    }

    #[test]
    fn test_server_chained_write_uses_posted_capacity() {
        let (_regions, client, server) = ring_pair(RingDirection::M2s);
        let mut out = vec![0u8; 4096];
        assert_eq!(client.read_packet(&mut out).unwrap(), 0);

        let payload: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(server.write_packet(&payload), 700);

        let n = client.read_packet(&mut out).unwrap();
        assert_eq!(n, 700);
        assert_eq!(&out[..700], &payload[..]);
    }

    #[test]
    fn test_refill_restores_capacity_after_chain() {
        let (_regions, client, server) = ring_pair(RingDirection::M2s);
        let mut out = vec![0u8; 4096];
        assert_eq!(client.read_packet(&mut out).unwrap(), 0);

        // Consume a chained packet, then make sure the recycled slots
        // are full-size again for the next one.
        assert_eq!(server.write_packet(&vec![3u8; 600]), 600);
        assert_eq!(client.read_packet(&mut out).unwrap(), 600);
        assert_eq!(server.write_packet(&vec![4u8; 600]), 600);
        assert_eq!(client.read_packet(&mut out).unwrap(), 600);
        assert_eq!(&out[..600], &vec![4u8; 600][..]);
    }

    #[test]
    fn test_incomplete_chain_detected() {
        let (regions, client, server) = ring_pair(RingDirection::S2m);
        let payload = vec![7u8; 600];
        assert_eq!(client.write_packet(&payload), 600);

        // Forge a NEXT flag on the final descriptor of the chain so it
        // runs past the published head.
        let cfg = MemoryConfig {
            num_queue_pairs: 1,
            log2_ring_size: 3,
            packet_buffer_size: 256,
        };
        let ring = Ring::for_layout(&cfg, RingDirection::S2m, 0);
        let mut buf = [0u8; DESC_SIZE];
        assert!(regions[0].read_at(ring.desc_offset(2), &mut buf));
        let mut desc = Desc::from_bytes(&buf);
        desc.set_flags(DESC_FLAG_NEXT);
        assert!(regions[0].write_at(ring.desc_offset(2), desc.as_bytes()));

        let mut out = vec![0u8; 4096];
        let err = server.read_packet(&mut out).unwrap_err();
        assert!(matches!(
            err,
            MemifError::Protocol(Error::IncompleteChain)
        ));
    }

    #[test]
    fn test_spsc_ordering_across_threads() {
        let (_regions, client, server) = ring_pair(RingDirection::S2m);
        let client = Arc::new(client);
        let server = Arc::new(server);

        let producer = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let pkt = i.to_le_bytes();
                    while client.write_packet(&pkt) == 0 {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let mut out = [0u8; 64];
        let mut expected = 0u32;
        while expected < 1000 {
            let n = server.read_packet(&mut out).unwrap();
            if n == 0 {
                std::hint::spin_loop();
                continue;
            }
            assert_eq!(n, 4);
            let got = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);
            assert_eq!(got, expected);
            expected += 1;
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_interrupt_fires_only_when_enabled() {
        let (_regions, client, server) = ring_pair(RingDirection::S2m);

        // Interrupts start masked: producing must not signal.
        assert_eq!(client.write_packet(&[1u8; 8]), 8);
        let mut counter = [0u8; 8];
        let n = unsafe {
            libc::read(
                client.interrupt.as_raw_fd(),
                counter.as_mut_ptr().cast(),
                8,
            )
        };
        assert!(n < 0, "no wake-up expected while masked");

        // Consumer opts in; the next produce signals.
        server.enable_interrupts(true);
        assert_eq!(client.write_packet(&[2u8; 8]), 8);
        let n = unsafe {
            libc::read(
                client.interrupt.as_raw_fd(),
                counter.as_mut_ptr().cast(),
                8,
            )
        };
        assert_eq!(n, 8);
    }
}
