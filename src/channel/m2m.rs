// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Memory-to-memory channel.
//!
//! The device side of a transfer is split into an unaligned head, a
//! 64-byte aligned body and a tail. Head and tail go through the ASE
//! window by MMIO; the body goes by DMA through pinned staging buffers.
//!
//! Host-to-FPGA bodies use the same interrupt ping-pong as TX channels.
//! FPGA-to-host and FPGA-to-FPGA completion is observed with a write
//! fence: a descriptor copying the magic-number ROM into a pinned 64-byte
//! buffer, which lands only after every earlier write has.

use super::ase::AsePager;
use super::{host_buffers, ChannelOps, HwChannel, IrqTracker, Progress, Staging};
use crate::descriptor::{
    chunk_count, chunk_len, split_host_bursts, DescriptorControl, MsgdmaDescriptor, ADDRESS_MASK,
    ALIGN_BYTES, FENCE_MAGIC, MAX_TRANSFER_SIZE, MM_FENCE_HOST_MASK, MM_HOST_MASK,
    MM_ROM_MAGIC_MASK,
};
use crate::device::{DmaDevice, PinnedRegion};
use crate::error::{DmaError, DmaResult};
use crate::pool::BufferLease;
use crate::sync::poll_until;
use crate::transfer::{TransferRequest, TransferType};
use std::sync::Arc;

const MAGIC_SIZE: usize = 64;

/// Chunks between fences on aligned FPGA-to-FPGA copies.
const D2D_FENCE_INTERVAL: u64 = 8;

/// Bytes before the first 64-byte aligned device address.
fn device_head(dev: u64, len: u64) -> u64 {
    match dev % ALIGN_BYTES {
        0 => 0,
        skew => (ALIGN_BYTES - skew).min(len),
    }
}

/// Whether `[src, src + len)` and `[dst, dst + len)` share a byte.
pub(crate) fn ranges_overlap(src: u64, dst: u64, len: u64) -> bool {
    src.abs_diff(dst) < len
}

/// # Safety
///
/// `[addr, addr + len)` must be valid host memory for the returned lifetime.
unsafe fn host_slice<'a>(addr: u64, len: u64) -> &'a [u8] {
    std::slice::from_raw_parts(addr as *const u8, len as usize)
}

/// # Safety
///
/// As [`host_slice`], and nothing else may access the range meanwhile.
unsafe fn host_slice_mut<'a>(addr: u64, len: u64) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(addr as *mut u8, len as usize)
}

pub(crate) struct MmChannel {
    device: Arc<dyn DmaDevice>,
    ase: AsePager,
    magic: PinnedRegion,
}

// SAFETY: the magic buffer is only touched by the channel's worker.
unsafe impl Send for MmChannel {}

impl MmChannel {
    pub(crate) fn new(device: Arc<dyn DmaDevice>) -> DmaResult<Self> {
        let magic = device.prepare_buffer(MAGIC_SIZE)?;
        Ok(Self {
            device,
            ase: AsePager::new(),
            magic,
        })
    }

    fn magic_word(&self) -> *mut u64 {
        self.magic.ptr as *mut u64
    }

    fn issue_fence(&self, hw: &HwChannel) -> DmaResult<u16> {
        // SAFETY: the magic buffer is pinned for the channel's lifetime and
        // no fence is in flight.
        unsafe { std::ptr::write_volatile(self.magic_word(), 0) };
        let mut desc = MsgdmaDescriptor::new(
            MM_ROM_MAGIC_MASK,
            self.magic.iova | MM_FENCE_HOST_MASK,
            MAGIC_SIZE as u32,
        );
        desc.set_control(DescriptorControl::GO | DescriptorControl::TRANSFER_IRQ_EN);
        hw.send_descriptor(desc)
    }

    fn wait_fence(&self, hw: &HwChannel, seq: u16) -> DmaResult<()> {
        hw.wait_retire(seq)?;
        let word = self.magic_word();
        // SAFETY: see `issue_fence`.
        poll_until(hw.config().timeout, || {
            (unsafe { std::ptr::read_volatile(word) } == FENCE_MAGIC).then_some(())
        })
        .ok_or_else(|| DmaError::timeout("write fence", hw.config().timeout))
    }

    fn fence(&self, hw: &HwChannel) -> DmaResult<()> {
        let seq = self.issue_fence(hw)?;
        self.wait_fence(hw, seq)
    }

    /// Issue one chunk split into host burst segments. Only the last
    /// segment may raise the interrupt. Returns its sequence number.
    fn send_chunk(hw: &HwChannel, src: u64, dst: u64, len: u64, host_is_src: bool, irq: bool) -> DmaResult<u16> {
        let host = (if host_is_src { src } else { dst }) & ADDRESS_MASK;
        let segments = split_host_bursts(host, len);
        let last = segments.len() - 1;
        let mut seq = 0;
        for (k, seg) in segments.iter().enumerate() {
            let mut desc =
                MsgdmaDescriptor::new(src + seg.offset, dst + seg.offset, seg.len as u32).with_bursts(seg.burst);
            let mut ctrl = DescriptorControl::GO;
            if irq && k == last {
                ctrl |= DescriptorControl::TRANSFER_IRQ_EN;
            }
            desc.set_control(ctrl);
            seq = hw.send_descriptor(desc)?;
        }
        Ok(seq)
    }

    fn to_device(
        &mut self,
        hw: &HwChannel,
        dev: u64,
        host: u64,
        len: u64,
        staging: &Staging<'_>,
        progress: &mut Progress,
    ) -> DmaResult<()> {
        let g = MAX_TRANSFER_SIZE;
        let start = progress.bytes;
        let head = device_head(dev, len);
        let body = (len - head) / ALIGN_BYTES * ALIGN_BYTES;
        let tail = len - head - body;
        let staging = staging.advance(head);

        if head > 0 {
            // SAFETY: the caller keeps `host..host+len` valid.
            self.ase.write(hw.regs(), dev, unsafe { host_slice(host, head) });
            progress.bytes = start + head;
        }

        let count = chunk_count(body, g);
        let slots = staging.slots(count).min(count.max(1));
        let half = (slots / 2).max(1);
        let mut tracker = IrqTracker::default();
        for i in 0..count {
            let off = head + i * g;
            let clen = chunk_len(body, g, i);
            let irq = i % half == half - 1 || i == count - 1;
            if staging.reuses() {
                tracker.ensure_reusable(hw, i, slots)?;
                // SAFETY: as above; the buffer is idle.
                unsafe { staging.stage(i, (host + off) as *const u8, clen as usize) };
            }
            if irq {
                tracker.wait(hw)?;
            }
            progress.bytes = start + head + (tracker.completed() * g).min(body);
            let seq = Self::send_chunk(hw, staging.iova(i) | MM_HOST_MASK, dev + off, clen, true, irq)?;
            if irq {
                tracker.issued(i, seq);
            }
        }
        tracker.wait(hw)?;

        if tail > 0 {
            let off = head + body;
            // SAFETY: as above.
            self.ase.write(hw.regs(), dev + off, unsafe { host_slice(host + off, tail) });
        }
        progress.bytes = start + len;
        Ok(())
    }

    fn from_device(
        &mut self,
        hw: &HwChannel,
        dev: u64,
        host: u64,
        len: u64,
        staging: &Staging<'_>,
        progress: &mut Progress,
    ) -> DmaResult<()> {
        let g = MAX_TRANSFER_SIZE;
        let start = progress.bytes;
        let head = device_head(dev, len);
        let body = (len - head) / ALIGN_BYTES * ALIGN_BYTES;
        let tail = len - head - body;
        let staging = staging.advance(head);

        if head > 0 {
            // SAFETY: the caller keeps `host..host+len` valid and unaliased.
            self.ase.read(hw.regs(), dev, unsafe { host_slice_mut(host, head) });
            progress.bytes = start + head;
        }

        let count = chunk_count(body, g);
        let slots = staging.slots(count).min(count.max(1));
        let half = (slots / 2).max(1);
        // Chunks before `copied` are in host memory.
        let mut copied = 0u64;
        let mut fence: Option<(u16, u64)> = None;

        let copy_out = |from: u64, through: u64| {
            for j in from..=through {
                let off = head + j * g;
                // SAFETY: the fence covering chunk `j` has landed.
                unsafe { staging.unstage(j, (host + off) as *mut u8, chunk_len(body, g, j) as usize) };
            }
        };

        for i in 0..count {
            if staging.reuses() && i >= copied + slots {
                let through = match fence.take() {
                    Some((seq, through)) => {
                        self.wait_fence(hw, seq)?;
                        through
                    }
                    None => {
                        self.fence(hw)?;
                        i - 1
                    }
                };
                copy_out(copied, through);
                copied = through + 1;
                progress.bytes = start + head + (copied * g).min(body);
            }
            let off = head + i * g;
            Self::send_chunk(
                hw,
                dev + off,
                staging.iova(i) | MM_HOST_MASK,
                chunk_len(body, g, i),
                false,
                false,
            )?;
            if fence.is_none() && i + 1 - copied >= half {
                fence = Some((self.issue_fence(hw)?, i));
            }
        }
        if let Some((seq, through)) = fence.take() {
            self.wait_fence(hw, seq)?;
            copy_out(copied, through);
            copied = through + 1;
        }
        if copied < count {
            self.fence(hw)?;
            copy_out(copied, count - 1);
        }

        if tail > 0 {
            let off = head + body;
            // SAFETY: as above.
            self.ase.read(hw.regs(), dev + off, unsafe { host_slice_mut(host + off, tail) });
        }
        progress.bytes = start + len;
        Ok(())
    }

    fn device_to_device(
        &mut self,
        hw: &HwChannel,
        src: u64,
        dst: u64,
        len: u64,
        bufs: &[BufferLease],
        progress: &mut Progress,
    ) -> DmaResult<()> {
        debug_assert!(!ranges_overlap(src, dst, len));
        let g = MAX_TRANSFER_SIZE;
        let count = chunk_count(len, g);

        if src % ALIGN_BYTES == 0 && dst % ALIGN_BYTES == 0 && len % ALIGN_BYTES == 0 {
            for i in 0..count {
                let mut desc = MsgdmaDescriptor::new(src + i * g, dst + i * g, chunk_len(len, g, i) as u32);
                desc.set_control(DescriptorControl::GO);
                hw.send_descriptor(desc)?;
                if (i + 1) % D2D_FENCE_INTERVAL == 0 || i == count - 1 {
                    self.fence(hw)?;
                    progress.bytes = ((i + 1) * g).min(len);
                }
            }
            return Ok(());
        }

        let bounce = bufs
            .first()
            .ok_or_else(|| DmaError::NoMemory("no bounce buffer for FPGA copy".into()))?;
        let staging = Staging::Direct { iova: bounce.iova() };
        let host = bounce.as_ptr() as u64;
        for i in 0..count {
            let off = i * g;
            let clen = chunk_len(len, g, i);
            let mut scratch = Progress::default();
            self.from_device(hw, src + off, host, clen, &staging, &mut scratch)?;
            self.to_device(hw, dst + off, host, clen, &staging, &mut scratch)?;
            progress.bytes = off + clen;
        }
        Ok(())
    }
}

impl ChannelOps for MmChannel {
    fn buffers_needed(&self, req: &TransferRequest) -> usize {
        match req.transfer_type {
            TransferType::HostToFpgaMm => host_buffers(req.small_buffer(), req.src, req.len),
            TransferType::FpgaToHostMm => host_buffers(req.small_buffer(), req.dst, req.len),
            _ if (req.src | req.dst | req.len) % ALIGN_BYTES == 0 => 0,
            _ => 1,
        }
    }

    fn execute(
        &mut self,
        hw: &HwChannel,
        req: &TransferRequest,
        bufs: &[BufferLease],
        progress: &mut Progress,
    ) -> DmaResult<()> {
        let result = match req.transfer_type {
            TransferType::HostToFpgaMm => {
                let staging = Staging::for_host(req.small_buffer(), req.src, req.len, bufs)?;
                self.to_device(hw, req.dst, req.src, req.len, &staging, progress)
            }
            TransferType::FpgaToHostMm => {
                let staging = Staging::for_host(req.small_buffer(), req.dst, req.len, bufs)?;
                self.from_device(hw, req.src, req.dst, req.len, &staging, progress)
            }
            TransferType::FpgaToFpgaMm => {
                self.device_to_device(hw, req.src, req.dst, req.len, bufs, progress)
            }
            other => Err(DmaError::InvalidParam(format!(
                "transfer type {:?} on an MM channel",
                other
            ))),
        };
        if result.is_err() {
            self.ase.invalidate();
        }
        result
    }
}

impl Drop for MmChannel {
    fn drop(&mut self) {
        if let Err(e) = self.device.release_buffer(&self.magic) {
            log::error!("Failed to unpin fence buffer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_head() {
        assert_eq!(device_head(0x1000, 4096), 0);
        assert_eq!(device_head(0x1001, 4096), 63);
        assert_eq!(device_head(0x1030, 8), 8);
    }

    #[test]
    fn test_ranges_overlap() {
        assert!(ranges_overlap(0, 100, 4096));
        assert!(ranges_overlap(100, 0, 4096));
        assert!(!ranges_overlap(0, 4096, 4096));
        assert!(!ranges_overlap(8192, 0, 4096));
        assert!(!ranges_overlap(0, 4096, 0));
    }

    #[test]
    fn test_ranges_overlap_near_address_space_end() {
        assert!(!ranges_overlap(0, u64::MAX - 10, 100));
        assert!(!ranges_overlap(u64::MAX - 10, 0, 100));
        assert!(ranges_overlap(u64::MAX - 200, u64::MAX - 150, 100));
        assert!(!ranges_overlap(u64::MAX - 200, u64::MAX - 100, 100));
    }
}
