// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # FPGA msgDMA Driver
//!
//! A user-space driver for msgdma-style DMA engines in FPGA accelerators.
//! The engine discovers DMA channels from the accelerator's device feature
//! list, moves data between host memory and the FPGA through pinned
//! staging buffers, and reports completion synchronously, through a
//! callback, through a pollable file descriptor or (with the `async`
//! feature) as a future.
//!
//! ## Channel Types
//!
//! | Type | Transfers |
//! |------|-----------|
//! | TX streaming (M2S) | host memory to an FPGA stream, optionally framed with SOP/EOP |
//! | RX streaming (S2M) | FPGA stream to host memory, optionally ending at EOP |
//! | Memory-mapped (MM) | host to FPGA memory, FPGA memory to host, FPGA to FPGA |
//!
//! ## Platform Support
//!
//! | Platform | Hardware | Software model |
//! |----------|----------|----------------|
//! | Linux    | UIO device node | Supported |
//! | Others   | Not available   | Supported |
//!
//! Hardware access goes through the [`DmaDevice`] trait. [`UioDevice`] maps
//! a Linux UIO node and pins hugepage buffers; [`SimDevice`] is an
//! in-process model of the hardware used by the tests, benchmarks and demo.
//!
//! ## Example
//!
//! ```rust
//! use fpga_msgdma::{DmaEngine, DmaError, EngineConfig, SimDevice, TxControl};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), DmaError> {
//!     let device = Arc::new(SimDevice::builder().tx_channel().build());
//!     let engine = DmaEngine::open(device.clone(), EngineConfig::default())?;
//!
//!     let tx = engine.open_channel(0)?;
//!     tx.send(b"Hello, FPGA!", TxControl::GenerateSopAndEop)?;
//!
//!     assert_eq!(device.tx_packets(0), vec![b"Hello, FPGA!".to_vec()]);
//!     Ok(())
//! }
//! ```
//!
//! ## Requirements (hardware)
//!
//! - Linux with the accelerator exposed through UIO
//! - 2 MiB hugepages available for pinned buffers
//! - An IOMMU-less or identity-mapped setup so physical addresses are
//!   valid I/O addresses

pub mod channel;
mod completion;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dfh;
pub mod engine;
pub mod error;
pub mod pool;
pub mod queue;
pub mod regs;
pub mod ring;
pub mod sim;
mod sync;
pub mod transfer;

pub use channel::{Channel, ChannelDesc, ChannelType};
pub use config::{CompletionMode, EngineConfig};
pub use device::{DmaDevice, PinnedRegion, UioDevice};
pub use engine::DmaEngine;
pub use error::{DmaError, DmaResult, ErrorKind};
pub use sim::SimDevice;
pub use transfer::{
    CompletionStatus, RxControl, SmallBuffer, Transfer, TransferCallback, TransferStatus,
    TransferType, TxControl,
};
