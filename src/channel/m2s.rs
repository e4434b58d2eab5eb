// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Memory-to-stream (TX) channel.
//!
//! The source is cut into 2 MiB chunks and copied through a rotating set of
//! pinned buffers. Every `half` chunks one descriptor asks for an interrupt;
//! before the next such descriptor goes out the previous one is waited on,
//! so the CPU fills one half of the buffers while the hardware drains the
//! other.

use super::{host_buffers, ChannelOps, HwChannel, IrqTracker, Progress, Staging};
use crate::descriptor::{
    chunk_count, chunk_len, tx_control_for, DescriptorControl, MsgdmaDescriptor,
    MAX_TRANSFER_SIZE, ST_HOST_MASK,
};
use crate::error::DmaResult;
use crate::pool::BufferLease;
use crate::transfer::TransferRequest;

pub(crate) struct M2sChannel;

impl ChannelOps for M2sChannel {
    fn buffers_needed(&self, req: &TransferRequest) -> usize {
        host_buffers(req.small_buffer(), req.src, req.len)
    }

    fn execute(
        &mut self,
        hw: &HwChannel,
        req: &TransferRequest,
        bufs: &[BufferLease],
        progress: &mut Progress,
    ) -> DmaResult<()> {
        let g = MAX_TRANSFER_SIZE;
        let len = req.len;
        let staging = Staging::for_host(req.small_buffer(), req.src, len, bufs)?;
        let count = chunk_count(len, g);
        let slots = staging.slots(count).min(count);
        let half = (slots / 2).max(1);
        let mut tracker = IrqTracker::default();

        for i in 0..count {
            let clen = chunk_len(len, g, i);
            let irq = i % half == half - 1 || i == count - 1;

            if staging.reuses() {
                tracker.ensure_reusable(hw, i, slots)?;
                // SAFETY: the caller keeps `src..src+len` valid; the buffer
                // is idle after `ensure_reusable`.
                unsafe { staging.stage(i, (req.src + i * g) as *const u8, clen as usize) };
            }
            if irq {
                tracker.wait(hw)?;
            }
            progress.bytes = (tracker.completed() * g).min(len);

            let mut desc = MsgdmaDescriptor::new(staging.iova(i) | ST_HOST_MASK, 0, clen as u32);
            let mut ctrl = DescriptorControl::GO | tx_control_for(i, count, req.tx_control);
            if irq {
                ctrl |= DescriptorControl::TRANSFER_IRQ_EN;
            }
            desc.set_control(ctrl);
            let seq = hw.send_descriptor(desc)?;
            if irq {
                tracker.issued(i, seq);
            }
        }
        tracker.wait(hw)?;
        progress.bytes = len;
        Ok(())
    }
}
