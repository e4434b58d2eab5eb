// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Benchmarks of the driver paths against the software device model, with
//! a plain memory copy as the baseline.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fpga_msgdma::{DmaEngine, EngineConfig, SimDevice, TxControl};
use std::sync::Arc;

const DEVICE_MEM: usize = 16 * 1024 * 1024;

fn mm_engine() -> (Arc<SimDevice>, DmaEngine) {
    let sim = Arc::new(SimDevice::builder().mm_channel(DEVICE_MEM).build());
    let engine = DmaEngine::open(sim.clone(), EngineConfig::default()).unwrap();
    (sim, engine)
}

/// Host-to-FPGA and FPGA-to-host copies on an MM channel.
fn bench_mm_copy(c: &mut Criterion) {
    let sizes: Vec<usize> = vec![
        4 * 1024,        // 4 KB
        64 * 1024,       // 64 KB
        1024 * 1024,     // 1 MB
        8 * 1024 * 1024, // 8 MB
    ];

    let (sim, engine) = mm_engine();
    let mm = engine.open_channel(0).unwrap();
    let mut group = c.benchmark_group("mm_copy");

    for size in sizes {
        let src: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
        let mut dst = vec![0u8; size];
        let mut dst_software = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("std_copy", size), &src, |b, src| {
            b.iter(|| unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst_software.as_mut_ptr(), src.len());
            });
        });

        group.bench_with_input(BenchmarkId::new("to_device", size), &src, |b, src| {
            b.iter(|| {
                mm.copy_to_device(src, 0).unwrap();
                sim.clear_capture(0);
            });
        });

        group.bench_function(BenchmarkId::new("from_device", size), |b| {
            b.iter(|| {
                mm.copy_from_device(0, &mut dst).unwrap();
                sim.clear_capture(0);
            });
        });
    }

    group.finish();
}

/// Unaligned device addresses exercise the ASE head and tail path.
fn bench_mm_unaligned(c: &mut Criterion) {
    let (sim, engine) = mm_engine();
    let mm = engine.open_channel(0).unwrap();
    let size = 64 * 1024 + 17;
    let src: Vec<u8> = (0..size).map(|i| ((i * 7) & 0xFF) as u8).collect();

    let mut group = c.benchmark_group("mm_unaligned");
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("to_device", |b| {
        b.iter(|| {
            mm.copy_to_device(&src, 0x1003).unwrap();
            sim.clear_capture(0);
        });
    });
    group.finish();
}

/// Framed packets on a TX streaming channel.
fn bench_tx_send(c: &mut Criterion) {
    let sizes: Vec<usize> = vec![
        256,         // 256 B
        4 * 1024,    // 4 KB
        1024 * 1024, // 1 MB
    ];

    let sim = Arc::new(SimDevice::builder().tx_channel().build());
    let engine = DmaEngine::open(sim.clone(), EngineConfig::default()).unwrap();
    let tx = engine.open_channel(0).unwrap();
    let mut group = c.benchmark_group("tx_send");

    for size in sizes {
        let data: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("packet", size), &data, |b, data| {
            b.iter(|| {
                tx.send(data, TxControl::GenerateSopAndEop).unwrap();
                sim.clear_capture(0);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mm_copy, bench_mm_unaligned, bench_tx_send);
criterion_main!(benches);
