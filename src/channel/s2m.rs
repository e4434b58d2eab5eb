// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Stream-to-memory (RX) channel.
//!
//! Up to one descriptor per staging buffer is kept outstanding. Responses
//! are popped in FIFO order; each carries the byte count actually written
//! and whether an end-of-packet closed the descriptor. The transfer ends at
//! the first EOP (when asked to) or once `len` bytes have arrived. Anything
//! still queued in the dispatcher after an early end is flushed.

use super::{host_buffers, ChannelOps, HwChannel, Progress, Staging};
use crate::descriptor::{
    chunk_count, chunk_len, DescriptorControl, MsgdmaDescriptor, MAX_TRANSFER_SIZE, ST_HOST_MASK,
};
use crate::error::{DmaError, DmaResult};
use crate::pool::BufferLease;
use crate::regs::{ResponseStatus, ValveControl};
use crate::transfer::{RxControl, TransferRequest};
use std::collections::VecDeque;

pub(crate) struct S2mChannel;

impl S2mChannel {
    fn program_valve(hw: &HwChannel, len: u64, end_on_eop: bool) {
        let regs = hw.regs();
        regs.set_valve_control(ValveControl::CLR_BYTES_TRANSFERRED);
        let mode = if end_on_eop {
            ValveControl::EN_NON_DET_TF
        } else {
            regs.set_valve_bytes_to_transfer(len.min(u32::MAX as u64) as u32);
            ValveControl::EN_DET_TF
        };
        regs.set_valve_control(ValveControl::EN_DATA_FLOW | mode);
    }
}

impl ChannelOps for S2mChannel {
    fn buffers_needed(&self, req: &TransferRequest) -> usize {
        host_buffers(req.small_buffer(), req.dst, req.len)
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
        let end_on_eop = req.rx_control == RxControl::EndOnEop;
        let staging = Staging::for_host(req.small_buffer(), req.dst, len, bufs)?;
        let count = chunk_count(len, g);
        let slots = staging.slots(count).min(count);

        Self::program_valve(hw, len, end_on_eop);

        let mut ctrl = DescriptorControl::GO | DescriptorControl::TRANSFER_IRQ_EN;
        if end_on_eop {
            ctrl |= DescriptorControl::END_ON_EOP | DescriptorControl::EOP_RCVD_IRQ_EN;
        }

        let mut inflight = VecDeque::with_capacity(slots as usize);
        let mut next = 0u64;
        loop {
            while next < count && (inflight.len() as u64) < slots {
                let clen = chunk_len(len, g, next);
                let mut desc = MsgdmaDescriptor::new(0, staging.iova(next) | ST_HOST_MASK, clen as u32);
                desc.set_control(ctrl);
                hw.send_descriptor(desc)?;
                inflight.push_back(next);
                next += 1;
            }
            let Some(&chunk) = inflight.front() else {
                break;
            };

            if hw.regs().rsp_fill_level() == 0 {
                hw.wait_irq()?;
                continue;
            }
            let rsp = hw.regs().pop_response();
            hw.ring().pop();
            inflight.pop_front();

            if rsp.status.error_code() != 0 {
                return Err(DmaError::TransferFailed(format!(
                    "response error {:#04x} on chunk {}",
                    rsp.status.error_code(),
                    chunk
                )));
            }
            let got = (rsp.bytes as u64).min(len - progress.bytes);
            // SAFETY: the caller keeps `dst..dst+len` valid and the response
            // says the DMA into this chunk's buffer is done.
            unsafe { staging.unstage(chunk, (req.dst + progress.bytes) as *mut u8, got as usize) };
            progress.bytes += got;

            if end_on_eop && rsp.status.contains(ResponseStatus::EOP_ARRIVED) {
                progress.eop = true;
                break;
            }
            if progress.bytes >= len {
                break;
            }
        }

        if !inflight.is_empty() {
            log::debug!(
                "Channel {}: flushing {} descriptors after EOP at {} bytes",
                hw.desc().index,
                inflight.len(),
                progress.bytes
            );
            hw.flush()?;
        }
        Ok(())
    }
}
