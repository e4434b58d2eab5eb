// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! msgdma extended hardware descriptor.
//!
//! The descriptor layout is fixed by the IP core: 32 bytes, little endian,
//! no padding. It is written to the dispatcher's descriptor port by
//! [`ChannelRegs::write_descriptor`](crate::regs::ChannelRegs::write_descriptor).

use crate::transfer::TxControl;
use bitflags::bitflags;

/// Largest payload a single descriptor moves (and the pinned buffer size).
pub const MAX_TRANSFER_SIZE: u64 = 2 * 1024 * 1024;

/// Streaming and MM body transfers must be multiples of this.
pub const ALIGN_BYTES: u64 = 64;

/// Host-side burst boundary used to split MM descriptors.
pub const BURST_BOUNDARY: u64 = 256;

/// Address-space selector for host memory on streaming channels.
pub const ST_HOST_MASK: u64 = 0x0001_0000_0000_0000;
/// Address-space selector for host memory on MM channels.
pub const MM_HOST_MASK: u64 = 0x0002_0000_0000_0000;
/// Write-fence destination selector on MM channels.
pub const MM_FENCE_HOST_MASK: u64 = 0x0003_0000_0000_0000;
/// Selects the magic-number ROM as an MM read source.
pub const MM_ROM_MAGIC_MASK: u64 = 0x0001_0000_0000_0000;
/// Value returned by the magic-number ROM.
pub const FENCE_MAGIC: u64 = 0x5772_745F_5379_6E63;
/// Strips the address-space selector bits.
pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

bitflags! {
    /// Descriptor control word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorControl: u32 {
        /// Streaming channel number, bits 0..7.
        const TX_CHANNEL = 0xFF;
        const GENERATE_SOP = 1 << 8;
        const GENERATE_EOP = 1 << 9;
        const PARK_READS = 1 << 10;
        const PARK_WRITES = 1 << 11;
        const END_ON_EOP = 1 << 12;
        const EOP_RCVD_IRQ_EN = 1 << 13;
        const TRANSFER_IRQ_EN = 1 << 14;
        const EARLY_TERM_IRQ_EN = 1 << 15;
        /// Per-error interrupt enables, bits 16..23.
        const TRANS_ERROR_IRQ_EN = 0xFF << 16;
        const EARLY_DONE_EN = 1 << 24;
        const WAIT_FOR_WR_RSP = 1 << 25;
        /// Commit the descriptor to the dispatcher.
        const GO = 1 << 31;
    }
}

/// 32-byte msgdma extended descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MsgdmaDescriptor {
    pub rd_address: u32,
    pub wr_address: u32,
    pub len: u32,
    pub seq_num: u16,
    pub rd_burst_count: u8,
    pub wr_burst_count: u8,
    pub rd_stride: u16,
    pub wr_stride: u16,
    pub rd_address_ext: u32,
    pub wr_address_ext: u32,
    pub control: u32,
}

impl MsgdmaDescriptor {
    /// Descriptor moving `len` bytes from `src` to `dst` with unit strides.
    pub fn new(src: u64, dst: u64, len: u32) -> Self {
        let mut desc = Self {
            len,
            rd_stride: 1,
            wr_stride: 1,
            ..Default::default()
        };
        desc.set_src(src);
        desc.set_dst(dst);
        desc
    }

    #[inline]
    pub fn set_src(&mut self, addr: u64) {
        self.rd_address = addr as u32;
        self.rd_address_ext = (addr >> 32) as u32;
    }

    #[inline]
    pub fn set_dst(&mut self, addr: u64) {
        self.wr_address = addr as u32;
        self.wr_address_ext = (addr >> 32) as u32;
    }

    #[inline]
    pub fn src(&self) -> u64 {
        ((self.rd_address_ext as u64) << 32) | self.rd_address as u64
    }

    #[inline]
    pub fn dst(&self) -> u64 {
        ((self.wr_address_ext as u64) << 32) | self.wr_address as u64
    }

    #[inline]
    pub fn control(&self) -> DescriptorControl {
        DescriptorControl::from_bits_retain(self.control)
    }

    #[inline]
    pub fn set_control(&mut self, ctrl: DescriptorControl) {
        self.control = ctrl.bits();
    }

    pub fn with_bursts(mut self, burst: u8) -> Self {
        self.rd_burst_count = burst;
        self.wr_burst_count = burst;
        self
    }

    /// The descriptor as the four 64-bit words written to the port.
    pub fn as_qwords(&self) -> [u64; 4] {
        [
            self.rd_address as u64 | (self.wr_address as u64) << 32,
            self.len as u64
                | (self.seq_num as u64) << 32
                | (self.rd_burst_count as u64) << 48
                | (self.wr_burst_count as u64) << 56,
            self.rd_stride as u64
                | (self.wr_stride as u64) << 16
                | (self.rd_address_ext as u64) << 32,
            self.wr_address_ext as u64 | (self.control as u64) << 32,
        ]
    }

    /// Rebuild a descriptor from the four words seen on the port.
    pub fn from_qwords(words: [u64; 4]) -> Self {
        Self {
            rd_address: words[0] as u32,
            wr_address: (words[0] >> 32) as u32,
            len: words[1] as u32,
            seq_num: (words[1] >> 32) as u16,
            rd_burst_count: (words[1] >> 48) as u8,
            wr_burst_count: (words[1] >> 56) as u8,
            rd_stride: words[2] as u16,
            wr_stride: (words[2] >> 16) as u16,
            rd_address_ext: (words[2] >> 32) as u32,
            wr_address_ext: words[3] as u32,
            control: (words[3] >> 32) as u32,
        }
    }
}

// Layout is bit-exact to the IP core.
const _: () = assert!(std::mem::size_of::<MsgdmaDescriptor>() == 32);

/// Number of descriptors needed to move `len` bytes in `granularity` pieces.
#[inline]
pub fn chunk_count(len: u64, granularity: u64) -> u64 {
    len.div_ceil(granularity)
}

/// Length of chunk `index` when `len` bytes are cut into `granularity` pieces.
#[inline]
pub fn chunk_len(len: u64, granularity: u64, index: u64) -> u64 {
    granularity.min(len - index * granularity)
}

/// Packet markers for descriptor `index` of `count` in a TX transfer.
///
/// A single descriptor carries the transfer's control unchanged. Otherwise
/// SOP goes on the first descriptor and EOP on the last.
pub fn tx_control_for(index: u64, count: u64, ctrl: TxControl) -> DescriptorControl {
    let (sop, eop) = match ctrl {
        TxControl::NoPacket => (false, false),
        TxControl::GenerateSop => (true, false),
        TxControl::GenerateEop => (false, true),
        TxControl::GenerateSopAndEop => (true, true),
    };
    let mut flags = DescriptorControl::empty();
    if count == 1 {
        flags.set(DescriptorControl::GENERATE_SOP, sop);
        flags.set(DescriptorControl::GENERATE_EOP, eop);
    } else {
        flags.set(DescriptorControl::GENERATE_SOP, sop && index == 0);
        flags.set(DescriptorControl::GENERATE_EOP, eop && index == count - 1);
    }
    flags
}

/// A host-side burst segment of a memory-mapped transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstSegment {
    /// Offset into the transfer.
    pub offset: u64,
    pub len: u64,
    pub burst: u8,
}

/// Split a host transfer on 256-byte boundaries.
///
/// The head up to the first boundary and the tail after the last one go
/// out with burst 1; the aligned body uses burst 4.
pub fn split_host_bursts(host_addr: u64, len: u64) -> Vec<BurstSegment> {
    let mut segments = Vec::with_capacity(3);
    let mut offset = 0;
    let misalign = host_addr % BURST_BOUNDARY;
    if misalign != 0 {
        let head = (BURST_BOUNDARY - misalign).min(len);
        segments.push(BurstSegment {
            offset,
            len: head,
            burst: 1,
        });
        offset += head;
    }
    let body = (len - offset) / BURST_BOUNDARY * BURST_BOUNDARY;
    if body > 0 {
        segments.push(BurstSegment {
            offset,
            len: body,
            burst: 4,
        });
        offset += body;
    }
    if offset < len {
        segments.push(BurstSegment {
            offset,
            len: len - offset,
            burst: 1,
        });
    }
    segments
}
