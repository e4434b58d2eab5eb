// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of an accelerator with msgdma channels.
//!
//! [`SimDevice`] implements [`DmaDevice`] entirely in process memory, so the
//! engine can be developed, tested and benchmarked without hardware. It
//! lays out a feature list with one BBB feature per configured channel and
//! executes descriptors synchronously when their `GO` word is written:
//!
//! - M2S (TX) descriptors append to a byte sink with SOP/EOP marks;
//! - S2M (RX) descriptors consume packets injected with
//!   [`SimDevice::push_rx_packet`], completing early on EOP when asked;
//! - MM descriptors copy between host buffers, device memory and the
//!   magic-number ROM.
//!
//! Pinned buffers are plain heap allocations with made-up I/O addresses.

use crate::descriptor::{
    DescriptorControl, MsgdmaDescriptor, ADDRESS_MASK, FENCE_MAGIC, MM_HOST_MASK,
    MM_ROM_MAGIC_MASK,
};
use crate::device::{DmaDevice, PinnedRegion};
use crate::dfh::{FeatureHeader, DFH_TYPE_BBB, M2S_GUID, MM_GUID, S2M_GUID};
use crate::error::{DmaError, DmaResult};
use crate::regs::*;
use crate::sync::lock;
use std::alloc::{self, Layout};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Distance between consecutive channel features.
pub const SIM_FEATURE_STRIDE: u64 = 0x2000;

const AFU_FEATURE_TYPE: u64 = 1;
const FIRST_IOVA: u64 = 0x1_0000_0000;
const REGION_ALIGN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimKind {
    Tx,
    Rx,
    Mm,
}

/// Builder for [`SimDevice`].
#[derive(Debug, Default)]
pub struct SimBuilder {
    channels: Vec<(SimKind, usize)>,
}

impl SimBuilder {
    /// Add an MM channel backed by `mem_size` bytes of device memory.
    pub fn mm_channel(mut self, mem_size: usize) -> Self {
        self.channels.push((SimKind::Mm, mem_size));
        self
    }

    pub fn tx_channel(mut self) -> Self {
        self.channels.push((SimKind::Tx, 0));
        self
    }

    pub fn rx_channel(mut self) -> Self {
        self.channels.push((SimKind::Rx, 0));
        self
    }

    pub fn build(self) -> SimDevice {
        let channels = self
            .channels
            .iter()
            .enumerate()
            .map(|(i, &(kind, mem_size))| SimChannel::new(kind, (i as u64 + 1) * SIM_FEATURE_STRIDE, mem_size))
            .collect();
        SimDevice {
            state: Mutex::new(SimState {
                channels,
                regions: Vec::new(),
                next_iova: FIRST_IOVA,
                next_wsid: 1,
            }),
            irq: Condvar::new(),
        }
    }
}

#[derive(Debug)]
struct PendingRx {
    desc: MsgdmaDescriptor,
    written: u32,
}

#[derive(Debug)]
struct SimChannel {
    kind: SimKind,
    base: u64,
    status: CsrStatus,
    control: CsrControl,
    desc_words: [u64; 4],
    log: Vec<MsgdmaDescriptor>,
    fail_next: bool,
    irq_count: u64,
    irq_registered: bool,

    // M2S
    tx_bytes: Vec<u8>,
    tx_sop: Vec<usize>,
    tx_eop: Vec<usize>,

    // S2M
    rx_source: VecDeque<(Vec<u8>, bool)>,
    rx_cursor: usize,
    pending: VecDeque<PendingRx>,
    responses: VecDeque<(u32, ResponseStatus)>,
    valve_control: ValveControl,
    valve_status: ValveStatus,
    valve_bytes: u64,

    // MM
    mem: Vec<u8>,
    ase_page: u64,
    ase_page_writes: u64,
}

impl SimChannel {
    fn new(kind: SimKind, base: u64, mem_size: usize) -> Self {
        Self {
            kind,
            base,
            status: CsrStatus::empty(),
            control: CsrControl::empty(),
            desc_words: [0; 4],
            log: Vec::new(),
            fail_next: false,
            irq_count: 0,
            irq_registered: false,
            tx_bytes: Vec::new(),
            tx_sop: Vec::new(),
            tx_eop: Vec::new(),
            rx_source: VecDeque::new(),
            rx_cursor: 0,
            pending: VecDeque::new(),
            responses: VecDeque::new(),
            valve_control: ValveControl::empty(),
            valve_status: ValveStatus::empty(),
            valve_bytes: 0,
            mem: vec![0; mem_size],
            ase_page: 0,
            ase_page_writes: 0,
        }
    }

    fn guid(&self) -> crate::dfh::FeatureGuid {
        match self.kind {
            SimKind::Tx => M2S_GUID,
            SimKind::Rx => S2M_GUID,
            SimKind::Mm => MM_GUID,
        }
    }

    fn csr_status(&self) -> CsrStatus {
        let mut status = self.status;
        status.set(CsrStatus::DESC_BUF_EMPTY, self.pending.is_empty());
        status.set(CsrStatus::BUSY, !self.pending.is_empty());
        status.set(CsrStatus::RSP_BUF_EMPTY, self.responses.is_empty());
        status
    }

    fn raise_irq(&mut self) {
        self.status |= CsrStatus::IRQ;
        if self.control.contains(CsrControl::GLOBAL_INTR_EN) {
            self.irq_count += 1;
        }
    }

    fn stop_on_error(&mut self) {
        self.status |= CsrStatus::STOPPED | CsrStatus::STOPPED_ON_ERROR;
        self.raise_irq();
    }

    fn is_stopped(&self) -> bool {
        self.status.contains(CsrStatus::STOPPED)
    }

    /// Data flows while enabled, and in packet mode only until the first EOP.
    fn valve_open(&self) -> bool {
        self.valve_control.contains(ValveControl::EN_DATA_FLOW)
            && !(self.valve_control.contains(ValveControl::EN_NON_DET_TF)
                && self.valve_status.contains(ValveStatus::NON_DET_TF_OCCURRED))
    }
}

struct SimRegion {
    ptr: *mut u8,
    size: usize,
    iova: u64,
    wsid: u64,
}

struct SimState {
    channels: Vec<SimChannel>,
    regions: Vec<SimRegion>,
    next_iova: u64,
    next_wsid: u64,
}

// SAFETY: region pointers are heap allocations owned by the model and only
// touched while the state lock is held (or by the engine through leases).
unsafe impl Send for SimState {}

impl SimState {
    fn host_ptr(&self, iova: u64, len: usize) -> Option<*mut u8> {
        self.regions.iter().find_map(|r| {
            let end = r.iova + r.size as u64;
            (iova >= r.iova && iova + len as u64 <= end)
                .then(|| unsafe { r.ptr.add((iova - r.iova) as usize) })
        })
    }

    fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        let index = (offset / SIM_FEATURE_STRIDE).checked_sub(1)? as usize;
        (index < self.channels.len()).then_some((index, offset % SIM_FEATURE_STRIDE))
    }
}

/// In-process msgdma accelerator model.
pub struct SimDevice {
    state: Mutex<SimState>,
    irq: Condvar,
}

impl SimDevice {
    pub fn builder() -> SimBuilder {
        SimBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    fn with_channel<R>(&self, index: usize, f: impl FnOnce(&mut SimChannel) -> R) -> R {
        let mut state = self.state();
        f(&mut state.channels[index])
    }

    /// Inject a packet into an RX channel's stream source.
    pub fn push_rx_packet(&self, channel: usize, data: &[u8], eop: bool) {
        let mut state = self.state();
        state.channels[channel].rx_source.push_back((data.to_vec(), eop));
        Self::process_rx(&mut state, channel);
        drop(state);
        self.irq.notify_all();
    }

    /// Every byte a TX channel has streamed out.
    pub fn tx_bytes(&self, channel: usize) -> Vec<u8> {
        self.with_channel(channel, |ch| ch.tx_bytes.clone())
    }

    /// Packets delimited by SOP/EOP markers on a TX channel.
    pub fn tx_packets(&self, channel: usize) -> Vec<Vec<u8>> {
        self.with_channel(channel, |ch| {
            ch.tx_sop
                .iter()
                .zip(ch.tx_eop.iter())
                .map(|(&start, &end)| ch.tx_bytes[start..end].to_vec())
                .collect()
        })
    }

    pub fn read_mem(&self, channel: usize, addr: u64, len: usize) -> Vec<u8> {
        self.with_channel(channel, |ch| ch.mem[addr as usize..addr as usize + len].to_vec())
    }

    pub fn write_mem(&self, channel: usize, addr: u64, data: &[u8]) {
        self.with_channel(channel, |ch| {
            ch.mem[addr as usize..addr as usize + data.len()].copy_from_slice(data)
        })
    }

    /// Number of writes to the ASE window select register.
    pub fn ase_page_writes(&self, channel: usize) -> u64 {
        self.with_channel(channel, |ch| ch.ase_page_writes)
    }

    /// Descriptors accepted by the channel's dispatcher, in order.
    pub fn descriptor_log(&self, channel: usize) -> Vec<MsgdmaDescriptor> {
        self.with_channel(channel, |ch| ch.log.clone())
    }

    pub fn clear_descriptor_log(&self, channel: usize) {
        self.with_channel(channel, |ch| ch.log.clear())
    }

    /// Forget captured TX output and the descriptor log.
    pub fn clear_capture(&self, channel: usize) {
        self.with_channel(channel, |ch| {
            ch.log.clear();
            ch.tx_bytes.clear();
            ch.tx_sop.clear();
            ch.tx_eop.clear();
        })
    }

    /// Make the next descriptor stop the dispatcher with an error.
    pub fn fail_next_descriptor(&self, channel: usize) {
        self.with_channel(channel, |ch| ch.fail_next = true)
    }

    /// Wake waiters on `channel`'s interrupt vector without raising the
    /// CSR interrupt, as another channel on a shared line would.
    pub fn inject_spurious_interrupt(&self, channel: usize) {
        self.with_channel(channel, |ch| ch.irq_count += 1);
        self.irq.notify_all();
    }

    /// Descriptors waiting in an RX dispatcher for stream data.
    pub fn pending_descriptors(&self, channel: usize) -> usize {
        self.with_channel(channel, |ch| ch.pending.len())
    }

    pub fn pinned_regions(&self) -> usize {
        self.state().regions.len()
    }

    fn complete_rx(ch: &mut SimChannel, pending: PendingRx, eop: bool) {
        let ctrl = pending.desc.control();
        let mut status = ResponseStatus::empty();
        if eop {
            status |= ResponseStatus::EOP_ARRIVED;
            ch.valve_status |= ValveStatus::NON_DET_TF_OCCURRED;
        }
        ch.valve_bytes += pending.written as u64;
        ch.responses.push_back((pending.written, status));
        if ctrl.contains(DescriptorControl::TRANSFER_IRQ_EN)
            || (eop && ctrl.contains(DescriptorControl::EOP_RCVD_IRQ_EN))
        {
            ch.raise_irq();
        }
    }

    fn process_rx(state: &mut SimState, index: usize) {
        loop {
            let ch = &state.channels[index];
            if ch.is_stopped()
                || !ch.valve_open()
                || ch.pending.is_empty()
                || ch.rx_source.is_empty()
            {
                return;
            }

            let (want, dst, end_on_eop, written) = {
                let p = &ch.pending[0];
                (
                    p.desc.len - p.written,
                    p.desc.dst(),
                    p.desc.control().contains(DescriptorControl::END_ON_EOP),
                    p.written,
                )
            };
            let (available, packet_eop) = {
                let (data, eop) = &ch.rx_source[0];
                (data.len() - ch.rx_cursor, *eop)
            };
            let n = (want as usize).min(available);

            let host = state.host_ptr((dst & ADDRESS_MASK) + written as u64, n);
            let ch = &mut state.channels[index];
            let Some(host) = host else {
                log::warn!("RX descriptor targets unpinned memory {:#x}", dst);
                ch.pending.pop_front();
                ch.stop_on_error();
                return;
            };
            let src = &ch.rx_source[0].0[ch.rx_cursor..ch.rx_cursor + n];
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), host, n) };

            ch.rx_cursor += n;
            let packet_done = ch.rx_cursor == ch.rx_source[0].0.len();
            if packet_done {
                ch.rx_source.pop_front();
                ch.rx_cursor = 0;
            }
            let eop_hit = packet_done && packet_eop && end_on_eop;

            let Some(front) = ch.pending.front_mut() else {
                return;
            };
            front.written += n as u32;
            if eop_hit || front.written == front.desc.len {
                if let Some(done) = ch.pending.pop_front() {
                    Self::complete_rx(ch, done, eop_hit);
                }
            }
        }
    }

    fn mm_source(state: &SimState, index: usize, addr: u64, len: usize) -> Option<Vec<u8>> {
        if addr & MM_HOST_MASK != 0 {
            let ptr = state.host_ptr(addr & ADDRESS_MASK, len)?;
            let mut out = vec![0u8; len];
            unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len) };
            Some(out)
        } else if addr & MM_ROM_MAGIC_MASK != 0 {
            Some(FENCE_MAGIC.to_le_bytes().iter().copied().cycle().take(len).collect())
        } else {
            let mem = &state.channels[index].mem;
            let start = addr as usize;
            mem.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
        }
    }

    fn mm_sink(state: &mut SimState, index: usize, addr: u64, data: &[u8]) -> bool {
        if addr & MM_HOST_MASK != 0 {
            match state.host_ptr(addr & ADDRESS_MASK, data.len()) {
                Some(ptr) => {
                    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
                    true
                }
                None => false,
            }
        } else {
            let mem = &mut state.channels[index].mem;
            let start = addr as usize;
            match mem.get_mut(start..start + data.len()) {
                Some(dst) => {
                    dst.copy_from_slice(data);
                    true
                }
                None => false,
            }
        }
    }

    fn execute(state: &mut SimState, index: usize, desc: MsgdmaDescriptor) {
        let ch = &mut state.channels[index];
        ch.log.push(desc);
        if ch.fail_next {
            ch.fail_next = false;
            ch.stop_on_error();
            return;
        }
        let ctrl = desc.control();
        let len = desc.len as usize;

        match ch.kind {
            SimKind::Rx => {
                ch.pending.push_back(PendingRx { desc, written: 0 });
                Self::process_rx(state, index);
            }
            SimKind::Tx => {
                let src = desc.src() & ADDRESS_MASK;
                let Some(ptr) = state.host_ptr(src, len) else {
                    state.channels[index].stop_on_error();
                    return;
                };
                let ch = &mut state.channels[index];
                if ctrl.contains(DescriptorControl::GENERATE_SOP) {
                    ch.tx_sop.push(ch.tx_bytes.len());
                }
                let start = ch.tx_bytes.len();
                ch.tx_bytes.resize(start + len, 0);
                unsafe { std::ptr::copy_nonoverlapping(ptr, ch.tx_bytes[start..].as_mut_ptr(), len) };
                if ctrl.contains(DescriptorControl::GENERATE_EOP) {
                    ch.tx_eop.push(ch.tx_bytes.len());
                }
                if ctrl.contains(DescriptorControl::TRANSFER_IRQ_EN) {
                    ch.raise_irq();
                }
            }
            SimKind::Mm => {
                let moved = Self::mm_source(state, index, desc.src(), len)
                    .map(|data| Self::mm_sink(state, index, desc.dst(), &data))
                    .unwrap_or(false);
                let ch = &mut state.channels[index];
                if !moved {
                    log::warn!("MM descriptor {:#x} -> {:#x} out of range", desc.src(), desc.dst());
                    ch.stop_on_error();
                } else if ctrl.contains(DescriptorControl::TRANSFER_IRQ_EN) {
                    ch.raise_irq();
                }
            }
        }
    }

    fn write_control(state: &mut SimState, index: usize, value: u32) {
        let ch = &mut state.channels[index];
        let ctrl = CsrControl::from_bits_retain(value);
        if ctrl.contains(CsrControl::RESET_DISPATCHER) {
            ch.status = CsrStatus::empty();
            ch.pending.clear();
            ch.responses.clear();
        }
        if ctrl.contains(CsrControl::FLUSH_DESCRIPTORS) {
            ch.pending.clear();
        }
        let stop = ctrl.contains(CsrControl::STOP_DISPATCHER);
        if stop {
            ch.status |= CsrStatus::STOPPED;
        } else if !ch.status.is_fatal() {
            ch.status -= CsrStatus::STOPPED;
        }
        // Reset and flush bits are self-clearing.
        ch.control = ctrl
            - (CsrControl::RESET_DISPATCHER
                | CsrControl::FLUSH_DESCRIPTORS
                | CsrControl::FLUSH_RD_MASTER
                | CsrControl::FLUSH_WR_MASTER);
        if !stop {
            Self::process_rx(state, index);
        }
    }

    fn reg_write32(state: &mut SimState, index: usize, rel: u64, value: u32) {
        let ch = &mut state.channels[index];
        match rel {
            r if r == CSR_OFFSET + CSR_STATUS => {
                if value & CsrStatus::IRQ.bits() != 0 {
                    ch.status -= CsrStatus::IRQ;
                }
            }
            r if r == CSR_OFFSET + CSR_CONTROL => Self::write_control(state, index, value),
            r if r == STREAMING_VALVE_OFFSET + VALVE_CONTROL => {
                let ctrl = ValveControl::from_bits_retain(value);
                if ctrl.contains(ValveControl::CLR_BYTES_TRANSFERRED) {
                    ch.valve_bytes = 0;
                    ch.valve_status = ValveStatus::empty();
                }
                ch.valve_control = ctrl - ValveControl::CLR_BYTES_TRANSFERRED;
                Self::process_rx(state, index);
            }
            r if (ASE_DATA_OFFSET..ASE_DATA_OFFSET + ASE_WINDOW_SIZE).contains(&r) => {
                let addr = (ch.ase_page + (r - ASE_DATA_OFFSET)) as usize;
                if let Some(dst) = ch.mem.get_mut(addr..addr + 4) {
                    dst.copy_from_slice(&value.to_le_bytes());
                }
            }
            _ => {}
        }
    }

    fn reg_read32(state: &mut SimState, index: usize, rel: u64) -> u32 {
        let ch = &mut state.channels[index];
        match rel {
            r if r == CSR_OFFSET + CSR_STATUS => ch.csr_status().bits(),
            r if r == CSR_OFFSET + CSR_CONTROL => ch.control.bits(),
            r if r == CSR_OFFSET + CSR_DESC_FILL_LEVEL => ch.pending.len() as u32,
            r if r == CSR_OFFSET + CSR_RSP_FILL_LEVEL => ch.responses.len() as u32 & 0xFFFF,
            r if r == CSR_OFFSET + CSR_SEQ_NUM => ch.log.last().map_or(0, |d| d.seq_num as u32),
            r if r == RSP_OFFSET + RSP_BYTES_TRANSFERRED => {
                ch.responses.front().map_or(0, |&(bytes, _)| bytes)
            }
            r if r == RSP_OFFSET + RSP_STATUS => ch
                .responses
                .pop_front()
                .map_or(0, |(_, status)| status.bits()),
            r if r == STREAMING_VALVE_OFFSET + VALVE_BYTES_TRANSFERRED_LO => ch.valve_bytes as u32,
            r if r == STREAMING_VALVE_OFFSET + VALVE_BYTES_TRANSFERRED_HI => {
                (ch.valve_bytes >> 32) as u32
            }
            r if r == STREAMING_VALVE_OFFSET + VALVE_CONTROL => ch.valve_control.bits(),
            r if r == STREAMING_VALVE_OFFSET + VALVE_STATUS => ch.valve_status.bits(),
            r if (ASE_DATA_OFFSET..ASE_DATA_OFFSET + ASE_WINDOW_SIZE).contains(&r) => {
                let addr = (ch.ase_page + (r - ASE_DATA_OFFSET)) as usize;
                ch.mem
                    .get(addr..addr + 4)
                    .map_or(u32::MAX, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            _ => 0,
        }
    }
}

impl DmaDevice for SimDevice {
    fn read32(&self, offset: u64) -> u32 {
        let mut state = self.state();
        match state.locate(offset) {
            Some((index, rel)) => Self::reg_read32(&mut state, index, rel),
            None => 0,
        }
    }

    fn write32(&self, offset: u64, value: u32) {
        let mut state = self.state();
        if let Some((index, rel)) = state.locate(offset) {
            Self::reg_write32(&mut state, index, rel, value);
        }
        drop(state);
        self.irq.notify_all();
    }

    fn read64(&self, offset: u64) -> u64 {
        let mut state = self.state();
        let Some((index, rel)) = state.locate(offset) else {
            // AFU header
            return match offset {
                0 if state.channels.is_empty() => {
                    FeatureHeader::encode(AFU_FEATURE_TYPE, 0, true).0
                }
                0 => FeatureHeader::encode(AFU_FEATURE_TYPE, SIM_FEATURE_STRIDE, false).0,
                _ => 0,
            };
        };
        let last = index + 1 == state.channels.len();
        let ch = &state.channels[index];
        match rel {
            0 => FeatureHeader::encode(DFH_TYPE_BBB, if last { 0 } else { SIM_FEATURE_STRIDE }, last).0,
            8 => ch.guid().lo,
            16 => ch.guid().hi,
            r if (ASE_DATA_OFFSET..ASE_DATA_OFFSET + ASE_WINDOW_SIZE).contains(&r) => {
                let addr = (ch.ase_page + (r - ASE_DATA_OFFSET)) as usize;
                ch.mem.get(addr..addr + 8).map_or(u64::MAX, |b| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(b);
                    u64::from_le_bytes(word)
                })
            }
            r => {
                let lo = Self::reg_read32(&mut state, index, r) as u64;
                let hi = Self::reg_read32(&mut state, index, r + 4) as u64;
                (hi << 32) | lo
            }
        }
    }

    fn write64(&self, offset: u64, value: u64) {
        let mut state = self.state();
        let Some((index, rel)) = state.locate(offset) else {
            return;
        };
        match rel {
            r if (DESC_OFFSET..DESC_OFFSET + 32).contains(&r) => {
                let word = ((r - DESC_OFFSET) / 8) as usize;
                let ch = &mut state.channels[index];
                ch.desc_words[word] = value;
                if word == 3 {
                    let desc = MsgdmaDescriptor::from_qwords(ch.desc_words);
                    if desc.control().contains(DescriptorControl::GO) {
                        Self::execute(&mut state, index, desc);
                    }
                }
            }
            r if r == ASE_CNTL_OFFSET => {
                let ch = &mut state.channels[index];
                ch.ase_page = value;
                ch.ase_page_writes += 1;
            }
            r if (ASE_DATA_OFFSET..ASE_DATA_OFFSET + ASE_WINDOW_SIZE).contains(&r) => {
                let ch = &mut state.channels[index];
                let addr = (ch.ase_page + (r - ASE_DATA_OFFSET)) as usize;
                if let Some(dst) = ch.mem.get_mut(addr..addr + 8) {
                    dst.copy_from_slice(&value.to_le_bytes());
                }
            }
            r => {
                Self::reg_write32(&mut state, index, r, value as u32);
                Self::reg_write32(&mut state, index, r + 4, (value >> 32) as u32);
            }
        }
        drop(state);
        self.irq.notify_all();
    }

    fn prepare_buffer(&self, size: usize) -> DmaResult<PinnedRegion> {
        let layout = Layout::from_size_align(size.max(1), REGION_ALIGN)
            .map_err(|e| DmaError::InvalidParam(e.to_string()))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DmaError::NoMemory(format!("cannot allocate {} bytes", size)));
        }
        let mut state = self.state();
        let iova = state.next_iova;
        // Keep regions apart so off-by-one DMA never lands in a neighbour.
        state.next_iova += (size as u64).next_multiple_of(crate::pool::BUFFER_SIZE as u64);
        let wsid = state.next_wsid;
        state.next_wsid += 1;
        state.regions.push(SimRegion { ptr, size, iova, wsid });
        Ok(PinnedRegion { ptr, size, wsid, iova })
    }

    fn release_buffer(&self, region: &PinnedRegion) -> DmaResult<()> {
        let mut state = self.state();
        let pos = state
            .regions
            .iter()
            .position(|r| r.wsid == region.wsid)
            .ok_or_else(|| DmaError::InvalidParam(format!("unknown wsid {}", region.wsid)))?;
        let r = state.regions.swap_remove(pos);
        if let Ok(layout) = Layout::from_size_align(r.size.max(1), REGION_ALIGN) {
            unsafe { alloc::dealloc(r.ptr, layout) };
        }
        Ok(())
    }

    fn register_interrupt(&self, vector: u32) -> DmaResult<()> {
        let mut state = self.state();
        let ch = state
            .channels
            .get_mut(vector as usize)
            .ok_or_else(|| DmaError::InvalidParam(format!("no interrupt vector {}", vector)))?;
        ch.irq_registered = true;
        ch.irq_count = 0;
        Ok(())
    }

    fn wait_interrupt(&self, vector: u32, timeout: Duration) -> DmaResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            let ch = state
                .channels
                .get_mut(vector as usize)
                .ok_or_else(|| DmaError::InvalidParam(format!("no interrupt vector {}", vector)))?;
            if !ch.irq_registered {
                return Err(DmaError::InvalidParam(format!("vector {} not registered", vector)));
            }
            if ch.irq_count > 0 {
                ch.irq_count = 0;
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .irq
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn unregister_interrupt(&self, vector: u32) -> DmaResult<()> {
        let mut state = self.state();
        if let Some(ch) = state.channels.get_mut(vector as usize) {
            ch.irq_registered = false;
        }
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for r in state.regions.drain(..) {
            if let Ok(layout) = Layout::from_size_align(r.size.max(1), REGION_ALIGN) {
                unsafe { alloc::dealloc(r.ptr, layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ST_HOST_MASK;

    fn base(index: usize) -> u64 {
        (index as u64 + 1) * SIM_FEATURE_STRIDE
    }

    #[test]
    fn test_mm_descriptor_copies_device_memory() {
        let sim = SimDevice::builder().mm_channel(8192).build();
        sim.write_mem(0, 0, &[7u8; 64]);
        let regs = ChannelRegs::new(std::sync::Arc::new(sim), base(0));
        let mut desc = MsgdmaDescriptor::new(0, 4096, 64);
        desc.set_control(DescriptorControl::GO);
        regs.write_descriptor(&desc);
        assert!(!regs.status().is_fatal());
    }

    #[test]
    fn test_rx_partial_then_eop() {
        let sim = SimDevice::builder().rx_channel().build();
        let region = sim.prepare_buffer(4096).unwrap();
        sim.write32(
            base(0) + STREAMING_VALVE_OFFSET + VALVE_CONTROL,
            (ValveControl::EN_DATA_FLOW | ValveControl::EN_NON_DET_TF).bits(),
        );
        let mut desc = MsgdmaDescriptor::new(0, region.iova | ST_HOST_MASK, 4096);
        desc.set_control(DescriptorControl::GO | DescriptorControl::END_ON_EOP);
        for (i, word) in desc.as_qwords().iter().enumerate() {
            sim.write64(base(0) + DESC_OFFSET + 8 * i as u64, *word);
        }
        assert_eq!(sim.pending_descriptors(0), 1);

        sim.push_rx_packet(0, &[1u8; 100], false);
        assert_eq!(sim.pending_descriptors(0), 1);
        sim.push_rx_packet(0, &[2u8; 28], true);
        assert_eq!(sim.pending_descriptors(0), 0);

        let rsp = base(0) + RSP_OFFSET;
        assert_eq!(sim.read32(base(0) + CSR_OFFSET + CSR_RSP_FILL_LEVEL), 1);
        assert_eq!(sim.read32(rsp + RSP_BYTES_TRANSFERRED), 128);
        let status = ResponseStatus::from_bits_retain(sim.read32(rsp + RSP_STATUS));
        assert!(status.contains(ResponseStatus::EOP_ARRIVED));
        assert_eq!(sim.read32(base(0) + CSR_OFFSET + CSR_RSP_FILL_LEVEL), 0);
        sim.release_buffer(&region).unwrap();
    }

    #[test]
    fn test_irq_counts_only_when_enabled() {
        let sim = SimDevice::builder().mm_channel(4096).build();
        sim.register_interrupt(0).unwrap();
        let mut desc = MsgdmaDescriptor::new(0, 64, 64);
        desc.set_control(DescriptorControl::GO | DescriptorControl::TRANSFER_IRQ_EN);
        let words = desc.as_qwords();

        for (i, word) in words.iter().enumerate() {
            sim.write64(base(0) + DESC_OFFSET + 8 * i as u64, *word);
        }
        assert!(!sim.wait_interrupt(0, Duration::from_millis(1)).unwrap());

        sim.write32(base(0) + CSR_OFFSET + CSR_CONTROL, CsrControl::GLOBAL_INTR_EN.bits());
        for (i, word) in words.iter().enumerate() {
            sim.write64(base(0) + DESC_OFFSET + 8 * i as u64, *word);
        }
        assert!(sim.wait_interrupt(0, Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_fail_next_stops_dispatcher() {
        let sim = SimDevice::builder().mm_channel(4096).build();
        sim.fail_next_descriptor(0);
        let mut desc = MsgdmaDescriptor::new(0, 64, 64);
        desc.set_control(DescriptorControl::GO);
        for (i, word) in desc.as_qwords().iter().enumerate() {
            sim.write64(base(0) + DESC_OFFSET + 8 * i as u64, *word);
        }
        let status = CsrStatus::from_bits_retain(sim.read32(base(0) + CSR_OFFSET + CSR_STATUS));
        assert!(status.contains(CsrStatus::STOPPED_ON_ERROR));

        sim.write32(base(0) + CSR_OFFSET + CSR_CONTROL, CsrControl::RESET_DISPATCHER.bits());
        let status = CsrStatus::from_bits_retain(sim.read32(base(0) + CSR_OFFSET + CSR_STATUS));
        assert!(!status.is_fatal());
    }
}
