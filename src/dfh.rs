// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device feature header (DFH) walk.
//!
//! Features form a singly linked list starting at MMIO offset 0. Each
//! header is followed by its 128-bit GUID; msgdma channels are BBB-type
//! features identified by one of three GUIDs.

use crate::channel::{ChannelDesc, ChannelType};
use crate::device::DmaDevice;
use crate::error::{DmaError, DmaResult};

/// Feature type of a basic building block.
pub const DFH_TYPE_BBB: u64 = 2;

/// Upper bound on the number of headers walked before giving up.
const MAX_FEATURES: usize = 256;

/// A feature GUID split as it appears in MMIO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureGuid {
    pub lo: u64,
    pub hi: u64,
}

pub const M2S_GUID: FeatureGuid = FeatureGuid {
    hi: 0xfee6_9b44_2f77_43ed,
    lo: 0x9ff4_9b8c_f9ee_6335,
};

pub const S2M_GUID: FeatureGuid = FeatureGuid {
    hi: 0xf118_209a_d59a_4b3f,
    lo: 0xa66c_d700_a658_a015,
};

pub const MM_GUID: FeatureGuid = FeatureGuid {
    hi: 0xef82_def7_f6ec_40fc,
    lo: 0xa914_9a35_bace_01ea,
};

/// Decoded 64-bit feature header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureHeader(pub u64);

impl FeatureHeader {
    #[inline]
    pub fn feature_type(&self) -> u64 {
        self.0 >> 60
    }

    #[inline]
    pub fn is_eol(&self) -> bool {
        (self.0 >> 40) & 1 == 1
    }

    /// Offset of the next header relative to this one.
    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 16) & 0xff_ffff
    }

    /// Build a header word; used by the software model.
    pub fn encode(feature_type: u64, next: u64, eol: bool) -> Self {
        Self((feature_type << 60) | ((eol as u64) << 40) | ((next & 0xff_ffff) << 16))
    }
}

fn channel_type_for(guid: FeatureGuid) -> Option<ChannelType> {
    match guid {
        M2S_GUID => Some(ChannelType::TxSt),
        S2M_GUID => Some(ChannelType::RxSt),
        MM_GUID => Some(ChannelType::Mm),
        _ => None,
    }
}

/// Walk the feature list and return every msgdma channel, in list order.
///
/// # Errors
///
/// Returns `DmaError::NoDriver` if the list is not terminated within
/// 256 headers.
pub fn discover_channels(device: &dyn DmaDevice) -> DmaResult<Vec<ChannelDesc>> {
    let mut channels = Vec::new();
    let mut offset = 0u64;

    for _ in 0..MAX_FEATURES {
        let header = FeatureHeader(device.read64(offset));
        if header.feature_type() == DFH_TYPE_BBB {
            let guid = FeatureGuid {
                lo: device.read64(offset + 8),
                hi: device.read64(offset + 16),
            };
            if let Some(ch_type) = channel_type_for(guid) {
                let desc = ChannelDesc::new(channels.len(), ch_type, offset);
                log::debug!("Found {:?} channel {} at {:#x}", ch_type, desc.index, offset);
                channels.push(desc);
            }
        }

        if header.is_eol() {
            return Ok(channels);
        }
        if header.next() == 0 {
            log::warn!("Feature list at {:#x} has no successor and no EOL", offset);
            return Ok(channels);
        }
        offset += header.next();
    }

    Err(DmaError::NoDriver(format!(
        "feature list longer than {} entries",
        MAX_FEATURES
    )))
}
