// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device access layer.
//!
//! The engine talks to the accelerator only through [`DmaDevice`]: volatile
//! MMIO, pinning host memory for DMA, and waiting on interrupts. Resource
//! enumeration and property lookup stay outside the crate; callers open a
//! device and hand it over.
//!
//! # Platform Support
//!
//! ## Linux
//! [`UioDevice`] drives an accelerator bound to a UIO driver: the first UIO
//! map is the MMIO region, interrupts are read from the UIO node, and DMA
//! buffers are 2 MiB hugepages translated through `/proc/self/pagemap`
//! (requires `CAP_SYS_ADMIN` and reserved hugepages).
//!
//! ## Other platforms
//! [`UioDevice::open`] returns `DmaError::PlatformNotSupported`. The
//! software model in [`crate::sim`] works everywhere.

use crate::error::{DmaError, DmaResult};
use std::path::Path;
use std::time::Duration;

/// A host memory region pinned for DMA.
#[derive(Debug)]
pub struct PinnedRegion {
    /// Virtual address of the first byte.
    pub ptr: *mut u8,
    /// Usable size in bytes.
    pub size: usize,
    /// Workspace id issued by the pinning facility.
    pub wsid: u64,
    /// Device-visible I/O address of the first byte.
    pub iova: u64,
}

// SAFETY: PinnedRegion is a plain description of memory owned by the device
// layer. Access to the bytes is coordinated by the buffer pool.
unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

/// Operations the DMA engine consumes from the platform.
///
/// Offsets are bytes from the start of the accelerator's MMIO region.
/// Register accesses must be volatile and must not be merged or reordered.
pub trait DmaDevice: Send + Sync {
    fn read32(&self, offset: u64) -> u32;
    fn write32(&self, offset: u64, value: u32);
    fn read64(&self, offset: u64) -> u64;
    fn write64(&self, offset: u64, value: u64);

    /// Allocate and pin `size` bytes of host memory.
    ///
    /// # Errors
    ///
    /// Returns `DmaError::NoMemory` if the memory cannot be pinned or
    /// translated to an I/O address.
    fn prepare_buffer(&self, size: usize) -> DmaResult<PinnedRegion>;

    /// Unpin and free a region returned by [`prepare_buffer`](Self::prepare_buffer).
    fn release_buffer(&self, region: &PinnedRegion) -> DmaResult<()>;

    /// Arm interrupt delivery for `vector`.
    fn register_interrupt(&self, vector: u32) -> DmaResult<()>;

    /// Block until `vector` fires or `timeout` expires.
    ///
    /// Returns `Ok(false)` on timeout. A pending count is consumed in full,
    /// so several hardware interrupts may satisfy a single wait. A wake-up
    /// may also come from another vector on a shared line, or from nothing
    /// at all; callers confirm the interrupt in the channel's CSR.
    fn wait_interrupt(&self, vector: u32, timeout: Duration) -> DmaResult<bool>;

    fn unregister_interrupt(&self, vector: u32) -> DmaResult<()>;
}

/// Default size of the UIO MMIO mapping.
pub const DEFAULT_MMIO_SIZE: usize = 256 * 1024;

/// Hugepage size backing pinned buffers.
#[cfg(target_os = "linux")]
const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

#[cfg(target_os = "linux")]
const PAGEMAP_PATH: &str = "/proc/self/pagemap";

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::fs::FileExt;
    use std::os::unix::io::AsRawFd;
    use crate::sync::lock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::Instant;

    /// Shared state of the single UIO interrupt line.
    #[derive(Debug, Default)]
    struct IrqLine {
        /// Bumped on every interrupt read from the node.
        generation: u64,
        /// A waiter is blocked in `poll` on the node.
        reader: bool,
    }

    /// An accelerator bound to a UIO driver.
    ///
    /// UIO exposes a single interrupt line, so every vector waits on the
    /// same event source. One waiter polls the node at a time; every
    /// interrupt it reads wakes all waiters, and each channel then checks
    /// its own CSR to see whether the interrupt was its own.
    pub struct UioDevice {
        file: File,
        irq: Mutex<IrqLine>,
        irq_seen: Condvar,
        mmio: *mut u8,
        mmio_size: usize,
        next_wsid: AtomicU64,
    }

    // SAFETY: the MMIO mapping lives as long as the device and register
    // accesses are single volatile loads/stores.
    unsafe impl Send for UioDevice {}
    unsafe impl Sync for UioDevice {}

    impl UioDevice {
        /// Open a UIO node (e.g. `/dev/uio0`) and map `mmio_size` bytes of
        /// its first map.
        ///
        /// # Errors
        ///
        /// Returns `DmaError::NoDriver` if the node cannot be opened and
        /// `DmaError::MmapFailed` if the register region cannot be mapped.
        pub fn open(path: &Path, mmio_size: usize) -> DmaResult<Self> {
            let file = File::options()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| DmaError::NoDriver(format!("{}: {}", path.display(), e)))?;

            let mmio = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    mmio_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };

            if mmio == libc::MAP_FAILED {
                return Err(DmaError::MmapFailed(format!(
                    "mmap of {} bytes failed for {}: {}",
                    mmio_size,
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }

            log::info!("Mapped {} ({} bytes of MMIO)", path.display(), mmio_size);

            Ok(Self {
                file,
                irq: Mutex::new(IrqLine::default()),
                irq_seen: Condvar::new(),
                mmio: mmio as *mut u8,
                mmio_size,
                next_wsid: AtomicU64::new(1),
            })
        }

        #[inline]
        fn in_range(&self, offset: u64, width: usize) -> bool {
            (offset as usize).saturating_add(width) <= self.mmio_size
        }

        fn rearm(&self) -> DmaResult<()> {
            (&self.file).write_all(&1u32.to_ne_bytes())?;
            Ok(())
        }

        /// Poll the node once; on an interrupt, consume its count and re-arm.
        fn poll_line(&self, timeout: Duration) -> DmaResult<bool> {
            let mut pfd = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let timeout_ms = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                return Err(DmaError::Io(std::io::Error::last_os_error()));
            }
            if rc == 0 {
                return Ok(false);
            }

            let mut count = [0u8; 4];
            (&self.file).read_exact(&mut count)?;
            self.rearm()?;
            Ok(true)
        }

        fn translate(vaddr: usize) -> DmaResult<u64> {
            let page = 4096usize;
            let pagemap = File::open(PAGEMAP_PATH)?;
            let mut entry = [0u8; 8];
            pagemap.read_exact_at(&mut entry, (vaddr / page * 8) as u64)?;
            let entry = u64::from_ne_bytes(entry);
            let present = entry >> 63 == 1;
            let pfn = entry & ((1 << 55) - 1);
            if !present || pfn == 0 {
                return Err(DmaError::NoMemory(
                    "cannot translate pinned page (missing CAP_SYS_ADMIN?)".to_string(),
                ));
            }
            Ok(pfn * page as u64 + (vaddr % page) as u64)
        }
    }

    impl DmaDevice for UioDevice {
        fn read32(&self, offset: u64) -> u32 {
            if !self.in_range(offset, 4) {
                log::warn!("MMIO read32 outside mapping: {:#x}", offset);
                return u32::MAX;
            }
            unsafe { std::ptr::read_volatile(self.mmio.add(offset as usize) as *const u32) }
        }

        fn write32(&self, offset: u64, value: u32) {
            if !self.in_range(offset, 4) {
                log::warn!("MMIO write32 outside mapping: {:#x}", offset);
                return;
            }
            unsafe { std::ptr::write_volatile(self.mmio.add(offset as usize) as *mut u32, value) }
        }

        fn read64(&self, offset: u64) -> u64 {
            if !self.in_range(offset, 8) {
                log::warn!("MMIO read64 outside mapping: {:#x}", offset);
                return u64::MAX;
            }
            unsafe { std::ptr::read_volatile(self.mmio.add(offset as usize) as *const u64) }
        }

        fn write64(&self, offset: u64, value: u64) {
            if !self.in_range(offset, 8) {
                log::warn!("MMIO write64 outside mapping: {:#x}", offset);
                return;
            }
            unsafe { std::ptr::write_volatile(self.mmio.add(offset as usize) as *mut u64, value) }
        }

        fn prepare_buffer(&self, size: usize) -> DmaResult<PinnedRegion> {
            if size == 0 || size > HUGEPAGE_SIZE {
                return Err(DmaError::InvalidParam(format!(
                    "pinned buffer size {} not in 1..={}",
                    size, HUGEPAGE_SIZE
                )));
            }

            // One hugepage is physically contiguous, so a single translation
            // covers the whole buffer.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    HUGEPAGE_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_POPULATE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(DmaError::NoMemory(format!(
                    "hugepage allocation failed: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let guard = scopeguard::guard(ptr, |ptr| unsafe {
                libc::munmap(ptr, HUGEPAGE_SIZE);
            });

            if unsafe { libc::mlock(*guard, HUGEPAGE_SIZE) } != 0 {
                return Err(DmaError::NoMemory(format!(
                    "mlock failed: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let iova = Self::translate(*guard as usize)?;
            let ptr = scopeguard::ScopeGuard::into_inner(guard);

            Ok(PinnedRegion {
                ptr: ptr as *mut u8,
                size,
                wsid: self.next_wsid.fetch_add(1, Ordering::Relaxed),
                iova,
            })
        }

        fn release_buffer(&self, region: &PinnedRegion) -> DmaResult<()> {
            let rc = unsafe { libc::munmap(region.ptr as *mut libc::c_void, HUGEPAGE_SIZE) };
            if rc != 0 {
                return Err(DmaError::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        fn register_interrupt(&self, vector: u32) -> DmaResult<()> {
            log::debug!("Arming UIO interrupt for vector {}", vector);
            self.rearm()
        }

        /// Returns `true` after any interrupt on the line, whichever
        /// channel raised it.
        fn wait_interrupt(&self, _vector: u32, timeout: Duration) -> DmaResult<bool> {
            let deadline = Instant::now() + timeout;
            let mut line = lock(&self.irq);
            let seen = line.generation;
            loop {
                if line.generation != seen {
                    return Ok(true);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                if line.reader {
                    line = self
                        .irq_seen
                        .wait_timeout(line, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    continue;
                }

                line.reader = true;
                drop(line);
                let fired = self.poll_line(deadline - now);
                line = lock(&self.irq);
                line.reader = false;
                if matches!(fired, Ok(true)) {
                    line.generation = line.generation.wrapping_add(1);
                }
                self.irq_seen.notify_all();
                fired?;
            }
        }

        fn unregister_interrupt(&self, vector: u32) -> DmaResult<()> {
            log::debug!("Releasing UIO interrupt for vector {}", vector);
            Ok(())
        }
    }

    impl Drop for UioDevice {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.mmio as *mut libc::c_void, self.mmio_size);
            }
        }
    }
}

// ============================================================================
// Non-Linux Stub Implementation
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod stub_impl {
    use super::*;

    /// Placeholder for platforms without UIO.
    pub struct UioDevice {
        _private: (),
    }

    impl UioDevice {
        /// Always fails on this platform.
        pub fn open(_path: &Path, _mmio_size: usize) -> DmaResult<Self> {
            Err(DmaError::PlatformNotSupported)
        }
    }

    impl DmaDevice for UioDevice {
        fn read32(&self, _offset: u64) -> u32 {
            u32::MAX
        }

        fn write32(&self, _offset: u64, _value: u32) {}

        fn read64(&self, _offset: u64) -> u64 {
            u64::MAX
        }

        fn write64(&self, _offset: u64, _value: u64) {}

        fn prepare_buffer(&self, _size: usize) -> DmaResult<PinnedRegion> {
            Err(DmaError::PlatformNotSupported)
        }

        fn release_buffer(&self, _region: &PinnedRegion) -> DmaResult<()> {
            Err(DmaError::PlatformNotSupported)
        }

        fn register_interrupt(&self, _vector: u32) -> DmaResult<()> {
            Err(DmaError::PlatformNotSupported)
        }

        fn wait_interrupt(&self, _vector: u32, _timeout: Duration) -> DmaResult<bool> {
            Err(DmaError::PlatformNotSupported)
        }

        fn unregister_interrupt(&self, _vector: u32) -> DmaResult<()> {
            Err(DmaError::PlatformNotSupported)
        }
    }
}

// Re-export the appropriate implementation
#[cfg(target_os = "linux")]
pub use linux_impl::UioDevice;

#[cfg(not(target_os = "linux"))]
pub use stub_impl::UioDevice;
