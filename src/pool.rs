// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Pinned buffer pool.
//!
//! Buffers are pinned lazily, up to a fixed capacity, and recycled in LIFO
//! order. Slots live in an arena; a lease names its slot by index plus a
//! generation counter that is bumped on every release, so a stale or
//! duplicated lease can never free a buffer someone else now owns.
//!
//! The pool has its own lock, separate from the transfer queues.

use crate::device::{DmaDevice, PinnedRegion};
use crate::error::{DmaError, DmaResult};
use crate::sync::lock;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Size of every pool buffer; equal to the largest single descriptor.
pub const BUFFER_SIZE: usize = crate::descriptor::MAX_TRANSFER_SIZE as usize;

/// Arena handle of a pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub index: u32,
    pub generation: u32,
}

/// Exclusive use of one pinned buffer until released back to the pool.
#[derive(Debug)]
pub struct BufferLease {
    id: BufferId,
    ptr: *mut u8,
    iova: u64,
    wsid: u64,
    len: usize,
}

// SAFETY: a lease is the only handle to its buffer's bytes while it exists.
unsafe impl Send for BufferLease {}
unsafe impl Sync for BufferLease {}

impl BufferLease {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Device-visible address of the first byte.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn wsid(&self) -> u64 {
        self.wsid
    }

    /// Usable length requested at acquire time.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the buffer at `offset`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` bytes and no DMA may be using this
    /// region of the buffer.
    pub(crate) unsafe fn fill_from(&self, offset: usize, src: *const u8, len: usize) {
        debug_assert!(offset + len <= BUFFER_SIZE);
        std::ptr::copy_nonoverlapping(src, self.ptr.add(offset), len);
    }

    /// Copy `len` bytes at `offset` out to `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` bytes and the DMA that filled this
    /// region must have completed.
    pub(crate) unsafe fn drain_to(&self, offset: usize, dst: *mut u8, len: usize) {
        debug_assert!(offset + len <= BUFFER_SIZE);
        std::ptr::copy_nonoverlapping(self.ptr.add(offset), dst, len);
    }
}

struct Slot {
    region: PinnedRegion,
    generation: u32,
    in_use: bool,
}

struct PoolInner {
    slots: Vec<Slot>,
    /// Free slot indices; the most recently released is reused first.
    free: Vec<u32>,
    in_use: usize,
}

/// Pool of pinned 2 MiB DMA buffers.
pub struct BufferPool {
    device: Arc<dyn DmaDevice>,
    inner: Mutex<PoolInner>,
    returned: Condvar,
    capacity: usize,
}

impl BufferPool {
    pub fn new(device: Arc<dyn DmaDevice>, capacity: usize) -> Self {
        Self {
            device,
            inner: Mutex::new(PoolInner {
                slots: Vec::with_capacity(capacity),
                free: Vec::with_capacity(capacity),
                in_use: 0,
            }),
            returned: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers pinned so far.
    pub fn allocated(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    pub fn in_use(&self) -> usize {
        lock(&self.inner).in_use
    }

    fn check_size(size: usize) -> DmaResult<()> {
        if size == 0 || size > BUFFER_SIZE {
            return Err(DmaError::InvalidParam(format!(
                "buffer size {} not in 1..={}",
                size, BUFFER_SIZE
            )));
        }
        Ok(())
    }

    fn take(&self, inner: &mut PoolInner, size: usize) -> DmaResult<Option<BufferLease>> {
        let index = match inner.free.pop() {
            Some(index) => index,
            None if inner.slots.len() < self.capacity => {
                let region = self.device.prepare_buffer(BUFFER_SIZE)?;
                log::debug!(
                    "Pinned pool buffer {} (wsid {}, iova {:#x})",
                    inner.slots.len(),
                    region.wsid,
                    region.iova
                );
                inner.slots.push(Slot {
                    region,
                    generation: 0,
                    in_use: false,
                });
                (inner.slots.len() - 1) as u32
            }
            None => return Ok(None),
        };

        let slot = &mut inner.slots[index as usize];
        slot.in_use = true;
        inner.in_use += 1;
        Ok(Some(BufferLease {
            id: BufferId {
                index,
                generation: slot.generation,
            },
            ptr: slot.region.ptr,
            iova: slot.region.iova,
            wsid: slot.region.wsid,
            len: size,
        }))
    }

    /// Take a buffer without waiting.
    ///
    /// # Errors
    ///
    /// `DmaError::NoMemory` if every buffer is in use and the pool is at
    /// capacity, or pinning a new buffer failed.
    pub fn try_acquire(&self, size: usize) -> DmaResult<BufferLease> {
        Self::check_size(size)?;
        let mut inner = lock(&self.inner);
        self.take(&mut inner, size)?.ok_or_else(|| {
            DmaError::NoMemory(format!("buffer pool exhausted ({} buffers)", self.capacity))
        })
    }

    /// Take a buffer, waiting up to `timeout` for one to be released.
    ///
    /// # Errors
    ///
    /// Same as [`try_acquire`](Self::try_acquire), after the wait.
    pub fn acquire(&self, size: usize, timeout: Duration) -> DmaResult<BufferLease> {
        Self::check_size(size)?;
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            if let Some(lease) = self.take(&mut inner, size)? {
                return Ok(lease);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DmaError::NoMemory(format!(
                    "buffer pool exhausted ({} buffers) after {:?}",
                    self.capacity, timeout
                )));
            }
            inner = self
                .returned
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Return a buffer. Stale leases are logged and ignored.
    pub fn release(&self, lease: BufferLease) {
        let mut inner = lock(&self.inner);
        let BufferId { index, generation } = lease.id;
        let Some(slot) = inner.slots.get_mut(index as usize) else {
            log::warn!("Release of unknown pool buffer {}", index);
            return;
        };
        if !slot.in_use || slot.generation != generation {
            log::warn!(
                "Ignoring stale release of buffer {} (generation {}, current {})",
                index,
                generation,
                slot.generation
            );
            return;
        }
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        inner.in_use -= 1;
        inner.free.push(index);
        drop(inner);
        self.returned.notify_one();
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.in_use > 0 {
            log::warn!("Dropping buffer pool with {} buffers in use", inner.in_use);
        }
        for slot in inner.slots.drain(..) {
            if let Err(e) = self.device.release_buffer(&slot.region) {
                log::error!("Failed to unpin buffer wsid {}: {}", slot.region.wsid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use std::collections::HashSet;
    use std::thread;

    fn pool(capacity: usize) -> (Arc<SimDevice>, Arc<BufferPool>) {
        let sim = Arc::new(SimDevice::builder().build());
        let pool = Arc::new(BufferPool::new(sim.clone(), capacity));
        (sim, pool)
    }

    #[test]
    fn test_exhaustion() {
        let (_sim, pool) = pool(2);
        let a = pool.try_acquire(BUFFER_SIZE).unwrap();
        let _b = pool.try_acquire(4096).unwrap();
        assert!(matches!(pool.try_acquire(64), Err(DmaError::NoMemory(_))));
        assert!(matches!(
            pool.acquire(64, Duration::from_millis(5)),
            Err(DmaError::NoMemory(_))
        ));
        pool.release(a);
        assert!(pool.try_acquire(64).is_ok());
    }

    #[test]
    fn test_size_limits() {
        let (_sim, pool) = pool(1);
        assert!(matches!(pool.try_acquire(0), Err(DmaError::InvalidParam(_))));
        assert!(matches!(
            pool.try_acquire(BUFFER_SIZE + 1),
            Err(DmaError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_lifo_reuse_bumps_generation() {
        let (_sim, pool) = pool(4);
        let a = pool.try_acquire(64).unwrap();
        let b = pool.try_acquire(64).unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        pool.release(a);
        pool.release(b);

        let c = pool.try_acquire(64).unwrap();
        assert_eq!(c.id().index, b_id.index, "most recently released first");
        assert_eq!(c.id().generation, b_id.generation + 1);
        assert_ne!(c.id(), a_id);
    }

    #[test]
    fn test_stale_release_ignored() {
        let (_sim, pool) = pool(1);
        let a = pool.try_acquire(64).unwrap();
        let stale = BufferLease {
            id: a.id(),
            ptr: a.as_ptr(),
            iova: a.iova(),
            wsid: a.wsid(),
            len: a.len(),
        };
        pool.release(a);
        let _b = pool.try_acquire(64).unwrap();
        pool.release(stale);
        assert_eq!(pool.in_use(), 1, "stale lease must not free the new owner's buffer");
    }

    #[test]
    fn test_identities_bounded_by_capacity() {
        let (_sim, pool) = pool(3);
        let mut seen = HashSet::new();
        for round in 0..50 {
            let leases: Vec<_> = (0..1 + round % 3)
                .map(|_| pool.try_acquire(BUFFER_SIZE).unwrap())
                .collect();
            for lease in leases {
                seen.insert(lease.id().index);
                pool.release(lease);
            }
        }
        assert!(seen.len() <= 3);
        assert_eq!(pool.allocated(), seen.len());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let (_sim, pool) = pool(1);
        let held = pool.try_acquire(64).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(64, Duration::from_secs(5)).map(|l| l.id().index))
        };
        thread::sleep(Duration::from_millis(10));
        pool.release(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_drop_unpins_everything() {
        let (sim, pool) = pool(2);
        let a = pool.try_acquire(64).unwrap();
        let b = pool.try_acquire(64).unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(sim.pinned_regions(), 2);
        drop(pool);
        assert_eq!(sim.pinned_regions(), 0);
    }
}
