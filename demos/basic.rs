// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example of msgDMA usage.
//!
//! Opens the UIO device given as the first argument, or the software
//! device model when none is given.
//!
//! Run with: `cargo run --example basic [/dev/uioN]`

use fpga_msgdma::{
    ChannelType, DmaEngine, EngineConfig, RxControl, SimDevice, TransferType, TxControl,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn open_engine() -> Option<(DmaEngine, Option<Arc<SimDevice>>)> {
    let config = EngineConfig::default().with_timeout(Duration::from_secs(5));
    match std::env::args().nth(1) {
        Some(path) => match DmaEngine::open_uio(Path::new(&path), config) {
            Ok(engine) => {
                println!("  Opened {}", path);
                Some((engine, None))
            }
            Err(e) => {
                println!("  Failed to open {}: {}", path, e);
                None
            }
        },
        None => {
            let sim = Arc::new(
                SimDevice::builder()
                    .tx_channel()
                    .rx_channel()
                    .mm_channel(16 * 1024 * 1024)
                    .build(),
            );
            match DmaEngine::open(sim.clone(), config) {
                Ok(engine) => {
                    println!("  Opened software device model");
                    Some((engine, Some(sim)))
                }
                Err(e) => {
                    println!("  Failed to open device model: {}", e);
                    None
                }
            }
        }
    }
}

fn main() {
    println!("FPGA msgDMA Basic Example");
    println!("=========================\n");

    println!("Opening DMA engine...");
    let Some((engine, sim)) = open_engine() else {
        return;
    };
    println!();

    println!("Enumerating channels...");
    let (channels, total) = engine.enumerate_channels(16);
    println!("  {} channel(s)", total);
    for desc in &channels {
        println!("    [{}] {:?} at {:#x}", desc.index, desc.ch_type, desc.base);
    }
    println!();

    for desc in &channels {
        let channel = match engine.open_channel(desc.index) {
            Ok(channel) => channel,
            Err(e) => {
                println!("  Channel {}: failed to open: {}", desc.index, e);
                continue;
            }
        };

        match desc.ch_type {
            ChannelType::Mm => {
                println!("Memory-mapped channel {}...", desc.index);
                let data: Vec<u8> = (0..1024 * 1024 + 5).map(|i| (i % 251) as u8).collect();
                let mut back = vec![0u8; data.len()];
                let dev_addr = 0x1003;
                match channel
                    .copy_to_device(&data, dev_addr)
                    .and_then(|_| channel.copy_from_device(dev_addr, &mut back))
                {
                    Ok(()) => println!("  Round trip of {} bytes: match = {}", data.len(), data == back),
                    Err(e) => println!("  Error: {}", e),
                }

                let transfer = channel.transfer_init();
                let setup = transfer
                    .set_type(TransferType::FpgaToFpgaMm)
                    .and_then(|_| transfer.set_src(dev_addr))
                    .and_then(|_| transfer.set_dst(0x40_0000))
                    .and_then(|_| transfer.set_len(data.len() as u64));
                let result = setup.and_then(|_| {
                    // SAFETY: FPGA-to-FPGA transfers touch no host memory.
                    unsafe { channel.transfer_start(&transfer) }
                });
                match result {
                    Ok(status) => println!("  FPGA copy: {} bytes", status.bytes_transferred),
                    Err(e) => println!("  FPGA copy error: {}", e),
                }
                channel.transfer_destroy(transfer);
            }
            ChannelType::TxSt => {
                println!("TX streaming channel {}...", desc.index);
                match channel.send(b"Hello, FPGA!", TxControl::GenerateSopAndEop) {
                    Ok(()) => println!("  Sent one packet"),
                    Err(e) => println!("  Error: {}", e),
                }
                if let Some(sim) = &sim {
                    println!("  Device saw: {:?}", sim.tx_packets(desc.index));
                }
            }
            ChannelType::RxSt => {
                println!("RX streaming channel {}...", desc.index);
                let Some(sim) = &sim else {
                    println!("  Skipped: needs a stream source");
                    continue;
                };
                sim.push_rx_packet(desc.index, b"Hello, host!", true);
                let mut buf = vec![0u8; 4096];
                match channel.receive(&mut buf, RxControl::EndOnEop) {
                    Ok(status) => {
                        let n = status.bytes_transferred as usize;
                        println!(
                            "  Received {:?} (eop: {})",
                            String::from_utf8_lossy(&buf[..n]),
                            status.eop_arrived
                        );
                    }
                    Err(e) => println!("  Error: {}", e),
                }
            }
        }
        println!();
    }

    println!("Staging buffers in use: {}", engine.buffers_in_use());
    match engine.close() {
        Ok(()) => println!("Engine closed."),
        Err(e) => println!("Error closing engine: {}", e),
    }
}
