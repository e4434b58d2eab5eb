// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Address span extender access.
//!
//! FPGA memory is reachable by MMIO only through a 4 KiB window whose base
//! is selected by the ASE control register. The selected page is cached so
//! the register is written only when an access leaves the current window.

use crate::regs::{ChannelRegs, ASE_WINDOW_MASK};

pub(crate) struct AsePager {
    cur_page: u64,
}

impl AsePager {
    pub(crate) fn new() -> Self {
        Self { cur_page: u64::MAX }
    }

    /// Forget the cached page, forcing the next access to reprogram it.
    pub(crate) fn invalidate(&mut self) {
        self.cur_page = u64::MAX;
    }

    /// Make `addr` visible and return its offset inside the window.
    fn select(&mut self, regs: &ChannelRegs, addr: u64) -> u64 {
        let page = addr & !ASE_WINDOW_MASK;
        if page != self.cur_page {
            regs.set_ase_page(page);
            self.cur_page = page;
        }
        addr & ASE_WINDOW_MASK
    }

    /// Write `src` to FPGA memory at `addr`.
    ///
    /// Uses 64-bit stores where both address and length allow, 32-bit
    /// stores otherwise, and read-modify-write for sub-word edges.
    pub(crate) fn write(&mut self, regs: &ChannelRegs, mut addr: u64, mut src: &[u8]) {
        while !src.is_empty() {
            let offset = self.select(regs, addr);
            let n = if addr % 8 == 0 && src.len() >= 8 {
                let mut word = [0u8; 8];
                word.copy_from_slice(&src[..8]);
                regs.ase_write64(offset, u64::from_le_bytes(word));
                8
            } else if addr % 4 == 0 && src.len() >= 4 {
                let mut word = [0u8; 4];
                word.copy_from_slice(&src[..4]);
                regs.ase_write32(offset, u32::from_le_bytes(word));
                4
            } else {
                let skew = (addr % 4) as usize;
                let n = (4 - skew).min(src.len());
                let aligned = offset & !3;
                let mut word = regs.ase_read32(aligned).to_le_bytes();
                word[skew..skew + n].copy_from_slice(&src[..n]);
                regs.ase_write32(aligned, u32::from_le_bytes(word));
                n
            };
            addr += n as u64;
            src = &src[n..];
        }
    }

    /// Read FPGA memory at `addr` into `dst`.
    pub(crate) fn read(&mut self, regs: &ChannelRegs, mut addr: u64, mut dst: &mut [u8]) {
        while !dst.is_empty() {
            let offset = self.select(regs, addr);
            let n = if addr % 8 == 0 && dst.len() >= 8 {
                dst[..8].copy_from_slice(&regs.ase_read64(offset).to_le_bytes());
                8
            } else {
                let skew = (addr % 4) as usize;
                let n = (4 - skew).min(dst.len());
                let word = regs.ase_read32(offset & !3).to_le_bytes();
                dst[..n].copy_from_slice(&word[skew..skew + n]);
                n
            };
            addr += n as u64;
            dst = &mut dst[n..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SIM_FEATURE_STRIDE};
    use std::sync::Arc;

    fn setup() -> (Arc<SimDevice>, ChannelRegs) {
        let sim = Arc::new(SimDevice::builder().mm_channel(64 * 1024).build());
        let regs = ChannelRegs::new(sim.clone(), SIM_FEATURE_STRIDE);
        (sim, regs)
    }

    #[test]
    fn test_one_reprogram_per_window() {
        let (sim, regs) = setup();
        let mut ase = AsePager::new();

        // [0xFF0, 0x2010) spans windows 0x0000, 0x1000 and 0x2000.
        let data: Vec<u8> = (0..0x1020u32).map(|i| i as u8).collect();
        ase.write(&regs, 0xFF0, &data);
        assert_eq!(sim.ase_page_writes(0), 3);
        assert_eq!(sim.read_mem(0, 0xFF0, data.len()), data);

        // Still inside the cached window.
        ase.write(&regs, 0x2010, &[1, 2, 3]);
        assert_eq!(sim.ase_page_writes(0), 3);

        ase.invalidate();
        ase.write(&regs, 0x2010, &[1, 2, 3]);
        assert_eq!(sim.ase_page_writes(0), 4);
    }

    #[test]
    fn test_unaligned_edges() {
        let (sim, regs) = setup();
        sim.write_mem(0, 0, &[0xAA; 32]);
        let mut ase = AsePager::new();

        ase.write(&regs, 3, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        let mem = sim.read_mem(0, 0, 16);
        assert_eq!(&mem[..3], &[0xAA; 3]);
        assert_eq!(&mem[3..14], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(&mem[14..], &[0xAA; 2]);

        let mut back = [0u8; 11];
        ase.read(&regs, 3, &mut back);
        assert_eq!(back, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }
}
