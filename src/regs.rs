// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! msgdma register layouts and typed accessors.
//!
//! Every channel exposes the same block of registers at fixed offsets from
//! its feature header:
//!
//! | Offset   | Block                       |
//! |----------|-----------------------------|
//! | `0x040`  | CSR (status/control/levels) |
//! | `0x060`  | Descriptor port             |
//! | `0x080`  | Response port (S2M only)    |
//! | `0x0A0`  | Streaming valve (S2M only)  |
//! | `0x200`  | ASE window select (MM only) |
//! | `0x1000` | ASE data window, 4 KiB      |
//!
//! All accesses are volatile and go through [`DmaDevice`]. Nothing in this
//! module retries or recovers; callers poll status and act.

use crate::descriptor::MsgdmaDescriptor;
use crate::device::DmaDevice;
use bitflags::bitflags;
use std::sync::Arc;

/// CSR block offset from the channel base.
pub const CSR_OFFSET: u64 = 0x40;
/// Descriptor port offset from the channel base.
pub const DESC_OFFSET: u64 = 0x60;
/// Response port offset from the channel base.
pub const RSP_OFFSET: u64 = 0x80;
/// Streaming valve offset from the channel base.
pub const STREAMING_VALVE_OFFSET: u64 = 0xA0;
/// ASE window select register offset from the channel base.
pub const ASE_CNTL_OFFSET: u64 = 0x200;
/// ASE data window offset from the channel base.
pub const ASE_DATA_OFFSET: u64 = 0x1000;
/// Size of the ASE data window.
pub const ASE_WINDOW_SIZE: u64 = 0x1000;
/// Mask selecting the offset inside the ASE data window.
pub const ASE_WINDOW_MASK: u64 = ASE_WINDOW_SIZE - 1;

pub const CSR_STATUS: u64 = 0x0;
pub const CSR_CONTROL: u64 = 0x4;
pub const CSR_DESC_FILL_LEVEL: u64 = 0x8;
pub const CSR_RSP_FILL_LEVEL: u64 = 0xC;
pub const CSR_SEQ_NUM: u64 = 0x10;

pub const RSP_BYTES_TRANSFERRED: u64 = 0x0;
pub const RSP_STATUS: u64 = 0x4;

pub const VALVE_BYTES_TRANSFERRED_LO: u64 = 0x0;
pub const VALVE_BYTES_TRANSFERRED_HI: u64 = 0x4;
pub const VALVE_BYTES_TO_TRANSFER: u64 = 0x8;
pub const VALVE_CONTROL: u64 = 0xC;
pub const VALVE_STATUS: u64 = 0x10;

bitflags! {
    /// CSR status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CsrStatus: u32 {
        const BUSY = 1 << 0;
        const DESC_BUF_EMPTY = 1 << 1;
        const DESC_BUF_FULL = 1 << 2;
        const RSP_BUF_EMPTY = 1 << 3;
        const RSP_BUF_FULL = 1 << 4;
        const STOPPED = 1 << 5;
        const RESETTING = 1 << 6;
        const STOPPED_ON_ERROR = 1 << 7;
        const STOPPED_ON_EARLY_TERM = 1 << 8;
        /// Interrupt pending. Write 1 to clear.
        const IRQ = 1 << 9;
    }
}

impl CsrStatus {
    /// Dispatcher halted by a fatal condition that needs a channel reset.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.intersects(Self::STOPPED_ON_ERROR | Self::STOPPED_ON_EARLY_TERM)
    }
}

bitflags! {
    /// CSR control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CsrControl: u32 {
        const STOP_DISPATCHER = 1 << 0;
        const RESET_DISPATCHER = 1 << 1;
        const STOP_ON_ERROR = 1 << 2;
        const STOP_ON_EARLY_TERM = 1 << 3;
        const GLOBAL_INTR_EN = 1 << 4;
        const STOP_DESCRIPTORS = 1 << 5;
        const FLUSH_DESCRIPTORS = 1 << 6;
        const FLUSH_RD_MASTER = 1 << 7;
        const FLUSH_WR_MASTER = 1 << 8;
    }
}

/// Control value written on forced teardown (stop dispatcher and descriptors).
pub const SHUTDOWN_CONTROL: CsrControl =
    CsrControl::STOP_DISPATCHER.union(CsrControl::STOP_DESCRIPTORS);

bitflags! {
    /// Response status word (S2M response port).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseStatus: u32 {
        const ERROR = 0xFF;
        const EARLY_TERMINATION = 1 << 8;
        const EOP_ARRIVED = 1 << 9;
        const ERR_IRQ_MASK = 0xFF << 10;
        const EARLY_TERM_IRQ_MASK = 1 << 18;
        const DESC_BUFFER_FULL = 1 << 19;
    }
}

impl ResponseStatus {
    /// Error code carried in bits 0..7.
    #[inline]
    pub fn error_code(&self) -> u8 {
        (self.bits() & Self::ERROR.bits()) as u8
    }
}

bitflags! {
    /// Streaming valve control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValveControl: u32 {
        const EN_DATA_FLOW = 1 << 0;
        /// Deterministic length: stop after `bytes_to_transfer`.
        const EN_DET_TF = 1 << 1;
        /// Non-deterministic length: stop at end of packet.
        const EN_NON_DET_TF = 1 << 2;
        const CLR_BYTES_TRANSFERRED = 1 << 3;
    }
}

bitflags! {
    /// Streaming valve status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValveStatus: u32 {
        const DET_TF_OCCURRED = 1 << 0;
        const NON_DET_TF_OCCURRED = 1 << 1;
    }
}

/// One entry popped from the response port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub bytes: u32,
    pub status: ResponseStatus,
}

/// Register view of one channel.
///
/// Cheap to clone; holds the device handle and the channel base offset.
#[derive(Clone)]
pub struct ChannelRegs {
    device: Arc<dyn DmaDevice>,
    base: u64,
}

impl ChannelRegs {
    pub fn new(device: Arc<dyn DmaDevice>, base: u64) -> Self {
        Self { device, base }
    }

    /// Channel base offset inside the accelerator MMIO space.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn device(&self) -> &Arc<dyn DmaDevice> {
        &self.device
    }

    #[inline]
    fn csr(&self, reg: u64) -> u64 {
        self.base + CSR_OFFSET + reg
    }

    #[inline]
    pub fn status(&self) -> CsrStatus {
        CsrStatus::from_bits_retain(self.device.read32(self.csr(CSR_STATUS)))
    }

    /// Write-1-to-clear the pending interrupt.
    #[inline]
    pub fn clear_irq(&self) {
        self.device
            .write32(self.csr(CSR_STATUS), CsrStatus::IRQ.bits());
    }

    #[inline]
    pub fn control(&self) -> CsrControl {
        CsrControl::from_bits_retain(self.device.read32(self.csr(CSR_CONTROL)))
    }

    #[inline]
    pub fn set_control(&self, ctrl: CsrControl) {
        self.device.write32(self.csr(CSR_CONTROL), ctrl.bits());
    }

    /// Read-modify-write the control register.
    pub fn update_control(&self, set: CsrControl, clear: CsrControl) {
        let ctrl = (self.control() | set) - clear;
        self.set_control(ctrl);
    }

    pub fn desc_fill_level(&self) -> u32 {
        self.device.read32(self.csr(CSR_DESC_FILL_LEVEL))
    }

    /// Number of responses waiting in the response FIFO.
    pub fn rsp_fill_level(&self) -> u16 {
        (self.device.read32(self.csr(CSR_RSP_FILL_LEVEL)) & 0xFFFF) as u16
    }

    pub fn seq_num(&self) -> u32 {
        self.device.read32(self.csr(CSR_SEQ_NUM))
    }

    /// Pop the oldest response. Reading the status word retires the entry,
    /// so the byte count has to be read first.
    pub fn pop_response(&self) -> Response {
        let rsp = self.base + RSP_OFFSET;
        let bytes = self.device.read32(rsp + RSP_BYTES_TRANSFERRED);
        let status = ResponseStatus::from_bits_retain(self.device.read32(rsp + RSP_STATUS));
        Response { bytes, status }
    }

    /// Write a descriptor into the dispatcher as four 64-bit stores.
    ///
    /// The control word (with `GO`) lives in the last quad word, so the
    /// dispatcher only sees a complete descriptor.
    pub fn write_descriptor(&self, desc: &MsgdmaDescriptor) {
        let port = self.base + DESC_OFFSET;
        for (i, word) in desc.as_qwords().iter().enumerate() {
            self.device.write64(port + 8 * i as u64, *word);
        }
    }

    pub fn valve_control(&self) -> ValveControl {
        ValveControl::from_bits_retain(
            self.device
                .read32(self.base + STREAMING_VALVE_OFFSET + VALVE_CONTROL),
        )
    }

    pub fn set_valve_control(&self, ctrl: ValveControl) {
        self.device.write32(
            self.base + STREAMING_VALVE_OFFSET + VALVE_CONTROL,
            ctrl.bits(),
        );
    }

    pub fn set_valve_bytes_to_transfer(&self, bytes: u32) {
        self.device.write32(
            self.base + STREAMING_VALVE_OFFSET + VALVE_BYTES_TO_TRANSFER,
            bytes,
        );
    }

    pub fn valve_status(&self) -> ValveStatus {
        ValveStatus::from_bits_retain(
            self.device
                .read32(self.base + STREAMING_VALVE_OFFSET + VALVE_STATUS),
        )
    }

    pub fn valve_bytes_transferred(&self) -> u64 {
        let valve = self.base + STREAMING_VALVE_OFFSET;
        let lo = self.device.read32(valve + VALVE_BYTES_TRANSFERRED_LO) as u64;
        let hi = self.device.read32(valve + VALVE_BYTES_TRANSFERRED_HI) as u64;
        (hi << 32) | lo
    }

    /// Select the device page visible through the ASE data window.
    pub fn set_ase_page(&self, page: u64) {
        self.device.write64(self.base + ASE_CNTL_OFFSET, page);
    }

    #[inline]
    pub fn ase_read32(&self, window_offset: u64) -> u32 {
        self.device
            .read32(self.base + ASE_DATA_OFFSET + (window_offset & ASE_WINDOW_MASK))
    }

    #[inline]
    pub fn ase_write32(&self, window_offset: u64, value: u32) {
        self.device.write32(
            self.base + ASE_DATA_OFFSET + (window_offset & ASE_WINDOW_MASK),
            value,
        );
    }

    #[inline]
    pub fn ase_read64(&self, window_offset: u64) -> u64 {
        self.device
            .read64(self.base + ASE_DATA_OFFSET + (window_offset & ASE_WINDOW_MASK))
    }

    #[inline]
    pub fn ase_write64(&self, window_offset: u64, value: u64) {
        self.device.write64(
            self.base + ASE_DATA_OFFSET + (window_offset & ASE_WINDOW_MASK),
            value,
        );
    }
}
