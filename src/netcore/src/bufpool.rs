//! The shared packet buffer pool.  Transmit paths allocate and free buffers
//! at high rate, so freed buffers go onto a freelist under a single mutex
//! and allocation reuses the first one that satisfies the caller's size,
//! alignment, and physical address constraints, falling back to a fresh
//! allocation on a miss.
//!
//! Buffers carry a device-visible address alongside their host storage.  The
//! pool assigns those addresses from its own aligned bump allocator, which
//! stands in for the platform's contiguous I/O memory allocator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use netdefs::constants::{
    NetError, NetResult, BUFFER_FLAG_ADD_DATA_LINK_FOOTERS, BUFFER_FLAG_ADD_DATA_LINK_HEADERS,
    BUFFER_FLAG_ADD_DEVICE_LINK_FOOTERS, BUFFER_FLAG_ADD_DEVICE_LINK_HEADERS,
    BUFFER_SIZE_GRANULARITY,
};

use crate::link::Link;
use crate::NetCore;

/// One packet's worth of storage.  The payload region runs from
/// `data_offset` to `footer_offset`; the bytes before and after it are the
/// header and footer reservations the buffer was allocated with.
pub struct PacketBuffer {
    storage: Vec<u8>,
    physical_address: u64,
    /// Offset where the payload begins; equals the allocated header size.
    pub data_offset: usize,
    /// Offset where the footer reservation begins.
    pub footer_offset: usize,
}

impl PacketBuffer {
    /// The device-visible address of the start of the buffer.
    pub fn physical_address(&self) -> u64 {
        self.physical_address
    }

    /// Total usable bytes in the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The payload region.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.data_offset..self.footer_offset]
    }

    /// The payload region, writable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.data_offset..self.footer_offset]
    }
}

pub(crate) struct BufferPool {
    free_list: Mutex<Vec<PacketBuffer>>,
    next_physical: AtomicU64,
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            free_list: Mutex::new(Vec::new()),
            next_physical: AtomicU64::new(BUFFER_SIZE_GRANULARITY as u64),
        }
    }

    /// Allocates a buffer of `header + size + footer` bytes, rounded up to
    /// `alignment` and then to the pool granularity, whose physical placement
    /// is aligned and ends at or below `max_physical`.
    pub fn allocate(
        &self,
        header_size: usize,
        size: usize,
        footer_size: usize,
        alignment: usize,
        max_physical: u64,
    ) -> NetResult<PacketBuffer> {
        let alignment = alignment.max(1);
        let mut total = header_size + size + footer_size;
        total = align_up(total, alignment);
        total = align_up(total, BUFFER_SIZE_GRANULARITY);

        let mut list = self.free_list.lock();
        let position = list.iter().position(|buffer| {
            buffer.capacity() >= total
                && buffer.physical_address % alignment as u64 == 0
                && buffer.physical_address + buffer.capacity() as u64 <= max_physical
        });

        let mut buffer = match position {
            Some(position) => list.remove(position),
            None => {
                drop(list);
                self.allocate_fresh(total, alignment, max_physical)?
            }
        };

        buffer.data_offset = header_size;
        buffer.footer_offset = header_size + size;
        Ok(buffer)
    }

    /// Returns a buffer to the freelist.  No bookkeeping happens here; all
    /// the fit logic lives in [`allocate`](BufferPool::allocate).
    pub fn free(&self, buffer: PacketBuffer) {
        self.free_list.lock().push(buffer);
    }

    fn allocate_fresh(
        &self,
        total: usize,
        alignment: usize,
        max_physical: u64,
    ) -> NetResult<PacketBuffer> {
        let base = self
            .next_physical
            .fetch_add((total + alignment) as u64, Ordering::Relaxed);
        let physical = (base + alignment as u64 - 1) & !(alignment as u64 - 1);
        if physical + total as u64 > max_physical {
            return Err(NetError::InsufficientResources);
        }

        Ok(PacketBuffer {
            storage: vec![0; total],
            physical_address: physical,
            data_offset: 0,
            footer_offset: total,
        })
    }
}

impl NetCore {
    /// Allocates a transmit buffer for a link.  The flags select which lower
    /// layers' header and footer reservations get added on top of the
    /// caller's own sizes; the link's transmit alignment and maximum
    /// physical address constrain the placement.
    pub fn allocate_buffer(
        &self,
        header_size: usize,
        size: usize,
        footer_size: usize,
        link: &Arc<Link>,
        flags: u32,
    ) -> NetResult<PacketBuffer> {
        let mut header_size = header_size;
        let mut footer_size = footer_size;
        let device_sizes = link.properties().packet_size_information;
        if flags & BUFFER_FLAG_ADD_DEVICE_LINK_HEADERS != 0 {
            header_size += device_sizes.header_size;
        }

        if flags & BUFFER_FLAG_ADD_DEVICE_LINK_FOOTERS != 0 {
            footer_size += device_sizes.footer_size;
        }

        if flags & (BUFFER_FLAG_ADD_DATA_LINK_HEADERS | BUFFER_FLAG_ADD_DATA_LINK_FOOTERS) != 0 {
            if let Some(data_link) = link.data_link_entry() {
                let data_link_sizes = data_link.interface.packet_size_information();
                if flags & BUFFER_FLAG_ADD_DATA_LINK_HEADERS != 0 {
                    header_size += data_link_sizes.header_size;
                }

                if flags & BUFFER_FLAG_ADD_DATA_LINK_FOOTERS != 0 {
                    footer_size += data_link_sizes.footer_size;
                }
            }
        }

        self.buffer_pool.allocate(
            header_size,
            size,
            footer_size,
            link.properties().transmit_alignment,
            link.properties().max_physical_address,
        )
    }

    /// Returns a buffer to the shared freelist.
    pub fn free_buffer(&self, buffer: PacketBuffer) {
        self.buffer_pool.free(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn sizes_round_up_to_alignment_and_granularity() {
        let pool = BufferPool::new();
        let buffer = pool.allocate(14, 33, 4, 4, u64::MAX).unwrap();
        assert_eq!(buffer.capacity() % BUFFER_SIZE_GRANULARITY, 0);
        assert!(buffer.capacity() >= 14 + 33 + 4);
        assert_eq!(buffer.data_offset, 14);
        assert_eq!(buffer.footer_offset, 14 + 33);
        assert_eq!(buffer.data().len(), 33);
    }

    #[test]
    fn freed_buffers_are_reused() {
        let pool = BufferPool::new();
        let buffer = pool.allocate(0, 100, 0, 4, u64::MAX).unwrap();
        let physical = buffer.physical_address();
        pool.free(buffer);

        let again = pool.allocate(8, 64, 0, 4, u64::MAX).unwrap();
        assert_eq!(again.physical_address(), physical);
        assert_eq!(again.data_offset, 8);
        assert_eq!(again.footer_offset, 8 + 64);
    }

    #[test]
    fn reuse_respects_placement_constraints() {
        let pool = BufferPool::new();
        let small = pool.allocate(0, 32, 0, 1, u64::MAX).unwrap();
        pool.free(small);

        // A larger request must not reuse the smaller buffer.
        let large = pool.allocate(0, 4096, 0, 1, u64::MAX).unwrap();
        assert!(large.capacity() >= 4096);
        assert_eq!(large.physical_address() % 1, 0);
    }

    #[test]
    fn placement_is_aligned_and_bounded() {
        let pool = BufferPool::new();
        let buffer = pool.allocate(0, 100, 0, 128, 0xFFFF_FFFF).unwrap();
        assert_eq!(buffer.physical_address() % 128, 0);
        assert!(buffer.physical_address() + buffer.capacity() as u64 <= 0xFFFF_FFFF);
    }

    #[test]
    fn unsatisfiable_placement_fails() {
        let pool = BufferPool::new();
        assert_eq!(
            pool.allocate(0, 100, 0, 4, 8).err(),
            Some(NetError::InsufficientResources)
        );
    }

    #[test]
    fn no_double_checkout_under_concurrency() {
        let pool = Arc::new(BufferPool::new());
        let outstanding = Arc::new(Mutex::new(HashSet::new()));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let outstanding = outstanding.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..200 {
                    let buffer = pool.allocate(0, 256, 0, 4, u64::MAX).unwrap();
                    assert!(
                        outstanding.lock().insert(buffer.physical_address()),
                        "buffer handed out twice"
                    );
                    outstanding.lock().remove(&buffer.physical_address());
                    pool.free(buffer);
                }
            }));
        }

        for worker in workers {
            worker.join().unwrap();
        }
    }
}
