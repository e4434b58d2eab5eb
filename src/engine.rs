// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! High-level DMA engine API.

use crate::channel::{Channel, ChannelDesc, ChannelShared};
use crate::completion::{self, Completion};
use crate::config::EngineConfig;
use crate::device::{DmaDevice, UioDevice, DEFAULT_MMIO_SIZE};
use crate::dfh::discover_channels;
use crate::error::{DmaError, DmaResult};
use crate::pool::BufferPool;
use crate::queue::TransferQueue;
use crate::sync::lock;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// State shared by the engine handle and its open channels.
pub(crate) struct EngineShared {
    pub(crate) device: Arc<dyn DmaDevice>,
    pub(crate) config: EngineConfig,
    channels: Vec<ChannelDesc>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) completions: Arc<TransferQueue<Completion>>,
    pub(crate) small_outstanding: Arc<AtomicUsize>,
    open: Mutex<Vec<Option<Arc<ChannelShared>>>>,
}

impl EngineShared {
    /// Forget a closed channel so its index can be opened again.
    pub(crate) fn release_slot(&self, index: usize) {
        if let Some(slot) = lock(&self.open).get_mut(index) {
            *slot = None;
        }
    }
}

/// A msgdma engine on one accelerator.
///
/// `DmaEngine` owns the discovered channel list, the pinned buffer pool and
/// the completion dispatcher. Channels opened from it stay usable until
/// they are closed or the engine is dropped.
///
/// # Example
///
/// ```rust
/// use fpga_msgdma::{DmaEngine, DmaError, EngineConfig, SimDevice};
/// use std::sync::Arc;
///
/// fn main() -> Result<(), DmaError> {
///     let device = Arc::new(SimDevice::builder().mm_channel(1 << 20).build());
///     let engine = DmaEngine::open(device, EngineConfig::default())?;
///     let channel = engine.open_channel(0)?;
///
///     let data = vec![0x5Au8; 4096];
///     channel.copy_to_device(&data, 0x1000)?;
///     let mut back = vec![0u8; 4096];
///     channel.copy_from_device(0x1000, &mut back)?;
///     assert_eq!(data, back);
///     Ok(())
/// }
/// ```
pub struct DmaEngine {
    shared: Arc<EngineShared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl DmaEngine {
    /// Open an engine on `device`.
    ///
    /// Walks the device feature list for msgdma channels and starts the
    /// completion dispatcher.
    ///
    /// # Errors
    ///
    /// - `DmaError::InvalidParam` for an inconsistent `config`;
    /// - `DmaError::NoDriver` if the device exposes no msgdma channel;
    /// - `DmaError::Timeout` if the dispatcher thread did not start.
    pub fn open(device: Arc<dyn DmaDevice>, config: EngineConfig) -> DmaResult<Self> {
        config.validate()?;
        let channels = discover_channels(device.as_ref())?;
        if channels.is_empty() {
            return Err(DmaError::NoDriver("no msgdma channels in the feature list".into()));
        }

        let pool_capacity = channels.len() * config.buffers_per_transfer + config.max_small_buffers;
        let pool = Arc::new(BufferPool::new(Arc::clone(&device), pool_capacity));
        let completions = Arc::new(TransferQueue::new(config.queue_capacity)?);
        let dispatcher = completion::spawn_dispatcher(
            Arc::clone(&pool),
            Arc::clone(&completions),
            config.startup_timeout,
        )?;

        log::info!(
            "Opened msgdma engine: {} channels, pool of {} buffers",
            channels.len(),
            pool_capacity
        );
        let open = Mutex::new(vec![None; channels.len()]);
        Ok(Self {
            shared: Arc::new(EngineShared {
                device,
                config,
                channels,
                pool,
                completions,
                small_outstanding: Arc::new(AtomicUsize::new(0)),
                open,
            }),
            dispatcher: Some(dispatcher),
        })
    }

    /// Open an engine on a UIO device node such as `/dev/uio0`.
    ///
    /// # Errors
    ///
    /// As [`UioDevice::open`] and [`open`](Self::open).
    pub fn open_uio(path: &Path, config: EngineConfig) -> DmaResult<Self> {
        let device = UioDevice::open(path, DEFAULT_MMIO_SIZE)?;
        Self::open(Arc::new(device), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Every channel found on the device, in feature-list order.
    pub fn channels(&self) -> &[ChannelDesc] {
        &self.shared.channels
    }

    /// At most `max` channel descriptors, plus the total number found.
    pub fn enumerate_channels(&self, max: usize) -> (Vec<ChannelDesc>, usize) {
        let all = &self.shared.channels;
        (all.iter().take(max).copied().collect(), all.len())
    }

    /// Open channel `index`.
    ///
    /// # Errors
    ///
    /// - `DmaError::ChannelNotFound` if `index` is out of range;
    /// - `DmaError::Busy` if the channel is already open;
    /// - errors from attaching the interrupt or resetting the dispatcher.
    pub fn open_channel(&self, index: usize) -> DmaResult<Channel> {
        let desc = *self
            .shared
            .channels
            .get(index)
            .ok_or(DmaError::ChannelNotFound {
                index,
                available: self.shared.channels.len(),
            })?;
        let mut open = lock(&self.shared.open);
        if open[index].is_some() {
            return Err(DmaError::Busy(format!("channel {} is already open", index)));
        }
        let shared = ChannelShared::open(&self.shared, desc)?;
        open[index] = Some(Arc::clone(&shared));
        Ok(Channel::new(shared))
    }

    /// Pinned buffers currently leased from the pool.
    pub fn buffers_in_use(&self) -> usize {
        self.shared.pool.in_use()
    }

    /// Close every channel and stop the dispatcher.
    ///
    /// # Errors
    ///
    /// `DmaError::Busy` if a channel did not drain within the timeout. That
    /// channel's dispatcher is halted and the completion thread is left
    /// running for the transfer still in flight.
    pub fn close(mut self) -> DmaResult<()> {
        let result = self.shutdown();
        // Dropping the handle detaches a dispatcher that is still needed.
        self.dispatcher.take();
        result
    }

    fn shutdown(&mut self) -> DmaResult<()> {
        let Some(dispatcher) = self.dispatcher.take() else {
            return Ok(());
        };
        let channels: Vec<_> = lock(&self.shared.open).iter_mut().filter_map(Option::take).collect();

        let mut first_err = None;
        for channel in channels {
            if let Err(e) = channel.close() {
                log::error!("Channel {} did not drain: {}", channel.index(), e);
                channel.hw().halt();
                let index = channel.index();
                lock(&self.shared.open)[index] = Some(channel);
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            self.dispatcher = Some(dispatcher);
            return Err(e);
        }

        self.shared.completions.shutdown();
        if dispatcher.join().is_err() {
            log::error!("Completion dispatcher panicked");
        }
        // Anything the dispatcher left behind. Later posts are delivered inline.
        for completion in self.shared.completions.drain() {
            completion.deliver(&self.shared.pool);
        }
        log::info!("Closed msgdma engine");
        Ok(())
    }
}

impl std::fmt::Debug for DmaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaEngine")
            .field("channels", &self.shared.channels)
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Drop for DmaEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Engine teardown incomplete: {}", e);
            self.dispatcher.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;
    use crate::config::CompletionMode;
    use crate::descriptor::{MAX_TRANSFER_SIZE, MM_ROM_MAGIC_MASK};
    use crate::error::ErrorKind;
    use crate::sim::SimDevice;
    use crate::transfer::{CompletionStatus, RxControl, TransferType, TxControl};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const TX: usize = 0;
    const RX: usize = 1;
    const MM: usize = 2;
    const MEM: usize = 24 * 1024 * 1024;
    const MIB: usize = 1024 * 1024;

    fn setup(config: EngineConfig) -> (Arc<SimDevice>, DmaEngine) {
        let sim = Arc::new(
            SimDevice::builder()
                .tx_channel()
                .rx_channel()
                .mm_channel(MEM)
                .build(),
        );
        let engine = DmaEngine::open(sim.clone(), config).unwrap();
        (sim, engine)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_enumerate_channels() {
        let (_sim, engine) = setup(EngineConfig::default());
        let (some, total) = engine.enumerate_channels(2);
        assert_eq!(total, 3);
        assert_eq!(some.len(), 2);
        assert_eq!(some[0].ch_type, ChannelType::TxSt);
        assert_eq!(some[1].ch_type, ChannelType::RxSt);
        assert_eq!(engine.channels()[2].ch_type, ChannelType::Mm);
    }

    #[test]
    fn test_open_requires_channels() {
        let sim = Arc::new(SimDevice::builder().build());
        let err = DmaEngine::open(sim, EngineConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDriver);
    }

    #[test]
    fn test_open_channel_twice_and_out_of_range() {
        let (_sim, engine) = setup(EngineConfig::default());
        let ch = engine.open_channel(MM).unwrap();
        assert_eq!(ch.channel_type(), ChannelType::Mm);
        assert!(matches!(engine.open_channel(MM), Err(DmaError::Busy(_))));
        assert_eq!(engine.open_channel(3).unwrap_err().kind(), ErrorKind::NotFound);

        ch.close().unwrap();
        let again = engine.open_channel(MM).unwrap();
        drop(again);
        engine.open_channel(MM).unwrap();
    }

    #[test]
    fn test_descriptor_count_per_length() {
        let (sim, engine) = setup(EngineConfig::default());
        let tx = engine.open_channel(TX).unwrap();

        tx.send(&pattern(4096, 1), TxControl::NoPacket).unwrap();
        assert_eq!(sim.descriptor_log(TX).len(), 1);

        sim.clear_descriptor_log(TX);
        let len = 5 * MIB;
        tx.send(&pattern(len, 2), TxControl::NoPacket).unwrap();
        let log = sim.descriptor_log(TX);
        assert_eq!(log.len(), 3);
        assert_eq!(log.iter().map(|d| d.len as usize).sum::<usize>(), len);
        assert!(log.iter().all(|d| d.len as u64 <= MAX_TRANSFER_SIZE));
        assert_eq!(sim.tx_bytes(TX)[4096..], pattern(len, 2)[..]);
    }

    #[test]
    fn test_device_copy_descriptors_are_contiguous() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let len = 5 * MIB as u64;
        sim.write_mem(MM, 0, &pattern(len as usize, 3));

        mm.copy_device_to_device(0, 8 * MIB as u64, len).unwrap();
        let data: Vec<_> = sim
            .descriptor_log(MM)
            .into_iter()
            .filter(|d| d.src() != MM_ROM_MAGIC_MASK)
            .collect();
        assert_eq!(data.len(), 3);
        let mut next = 0;
        for d in &data {
            assert_eq!(d.src(), next);
            assert_eq!(d.dst(), 8 * MIB as u64 + next);
            next += d.len as u64;
        }
        assert_eq!(next, len);
        assert_eq!(sim.read_mem(MM, 8 * MIB as u64, len as usize), pattern(len as usize, 3));
    }

    #[test]
    fn test_mm_round_trip_10mib() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let len = 10 * MIB;
        let data = pattern(len, 7);

        let t = mm.transfer_init();
        t.set_type(TransferType::HostToFpgaMm).unwrap();
        t.set_src(data.as_ptr() as u64).unwrap();
        t.set_dst(0x1000).unwrap();
        t.set_len(len as u64).unwrap();
        let status = unsafe { mm.transfer_start(&t) }.unwrap();
        assert_eq!(status.bytes_transferred, len as u64);
        assert_eq!(t.bytes_transferred(), len as u64);
        assert_eq!(sim.read_mem(MM, 0x1000, len), data);

        let mut back = vec![0u8; len];
        mm.copy_from_device(0x1000, &mut back).unwrap();
        assert!(back == data);
        assert_eq!(engine.buffers_in_use(), 0);
    }

    #[test]
    fn test_mm_unaligned_round_trip() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let len = 3 * MIB + 1000;
        let data = pattern(len, 9);

        mm.copy_to_device(&data[5..], 0x2003).unwrap();
        assert_eq!(sim.read_mem(MM, 0x2003, len - 5), data[5..]);

        let mut back = vec![0u8; len - 11];
        mm.copy_from_device(0x2009, &mut back).unwrap();
        assert_eq!(back, data[11..]);
    }

    #[test]
    fn test_ase_window_programmed_per_window() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let data = pattern(100, 4);

        // Head [0xFF0, 0x1000) and tail [0x1040, 0x1054) sit in two windows.
        mm.copy_to_device(&data, 0xFF0).unwrap();
        assert_eq!(sim.ase_page_writes(MM), 2);
        assert_eq!(sim.read_mem(MM, 0xFF0, 100), data);

        // Same window as the tail.
        mm.copy_to_device(&data[..10], 0x1060).unwrap();
        assert_eq!(sim.ase_page_writes(MM), 2);
    }

    #[test]
    fn test_device_to_device_unaligned_and_overlap() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let data = pattern(5000, 5);
        sim.write_mem(MM, 3, &data);

        mm.copy_device_to_device(3, 2 * MIB as u64 + 1, 5000).unwrap();
        assert_eq!(sim.read_mem(MM, 2 * MIB as u64 + 1, 5000), data);

        let err = mm.copy_device_to_device(0, 100, 4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_device_ranges_near_address_space_end() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();

        let err = mm.copy_device_to_device(0, u64::MAX - 10, 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
        let err = mm.copy_device_to_device(u64::MAX - 10, 0, 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
        let err = mm.copy_to_device(&[0u8; 128], u64::MAX - 63).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
        let mut buf = [0u8; 128];
        let err = mm.copy_from_device(u64::MAX - 63, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);

        // The channel is still usable afterwards.
        let data = pattern(4096, 9);
        mm.copy_to_device(&data, 0).unwrap();
        assert_eq!(sim.read_mem(MM, 0, 4096), data);
        assert_eq!(engine.buffers_in_use(), 0);
    }

    #[test]
    fn test_rx_waits_through_spurious_interrupts() {
        let (sim, engine) = setup(EngineConfig::default().with_timeout(Duration::from_secs(5)));
        let rx = engine.open_channel(RX).unwrap();
        let mut buf = vec![0u8; 4096];

        let t = rx.transfer_init();
        t.set_dst(buf.as_mut_ptr() as u64).unwrap();
        t.set_len(4096).unwrap();
        t.set_callback(|_| {}).unwrap();
        unsafe { rx.transfer_start(&t) }.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sim.pending_descriptors(RX) == 0 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        for _ in 0..5 {
            sim.inject_spurious_interrupt(RX);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(t.is_in_progress());
        assert_eq!(sim.pending_descriptors(RX), 1);

        let data = pattern(4096, 8);
        sim.push_rx_packet(RX, &data, false);
        let status = t.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(status.status, CompletionStatus::Success);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_rx_end_on_eop() {
        let (sim, engine) = setup(EngineConfig::default());
        let rx = engine.open_channel(RX).unwrap();
        let mut buf = vec![0u8; MIB];

        sim.push_rx_packet(RX, &pattern(4096, 6), true);
        let status = rx.receive(&mut buf, RxControl::EndOnEop).unwrap();
        assert!(status.eop_arrived);
        assert_eq!(status.bytes_transferred, 4096);
        assert_eq!(buf[..4096], pattern(4096, 6)[..]);
    }

    #[test]
    fn test_rx_without_eop_fills_buffer() {
        let (sim, engine) = setup(EngineConfig::default());
        let rx = engine.open_channel(RX).unwrap();
        let mut buf = vec![0u8; MIB];

        let t = rx.transfer_init();
        t.set_dst(buf.as_mut_ptr() as u64).unwrap();
        t.set_len(MIB as u64).unwrap();
        t.set_rx_control(RxControl::EndOnEop).unwrap();
        sim.push_rx_packet(RX, &pattern(MIB / 2, 1), false);
        sim.push_rx_packet(RX, &pattern(MIB, 2), false);
        let status = unsafe { rx.transfer_start(&t) }.unwrap();

        assert!(!t.eop_arrived());
        assert!(!status.eop_arrived);
        assert_eq!(status.bytes_transferred, MIB as u64);
        assert_eq!(buf[..MIB / 2], pattern(MIB / 2, 1)[..]);
    }

    #[test]
    fn test_tx_packets_are_framed() {
        let (sim, engine) = setup(EngineConfig::default());
        let tx = engine.open_channel(TX).unwrap();
        let a = pattern(100, 1);
        let b = pattern(3 * MIB, 2);

        tx.send(&a, TxControl::GenerateSopAndEop).unwrap();
        tx.send(&b, TxControl::GenerateSopAndEop).unwrap();
        assert_eq!(sim.tx_packets(TX), vec![a, b]);
    }

    #[test]
    fn test_small_buffer_quota() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();

        let mut small: Vec<_> = (0..4).map(|_| mm.transfer_init_small(4096).unwrap()).collect();
        assert_eq!(mm.transfer_init_small(4096).unwrap_err().kind(), ErrorKind::NoMemory);
        assert!(matches!(mm.transfer_init_small(0), Err(DmaError::InvalidParam(_))));

        // Zero-copy transfer straight out of the pinned buffer.
        let t = small.pop().unwrap();
        let addr = t.small_buffer().unwrap().addr();
        t.with_small_buffer(|b| b.fill(0xC3)).unwrap();
        t.set_type(TransferType::HostToFpgaMm).unwrap();
        t.set_src(addr).unwrap();
        t.set_dst(0x4000).unwrap();
        t.set_len(4096).unwrap();
        unsafe { mm.transfer_start(&t) }.unwrap();
        assert_eq!(sim.read_mem(MM, 0x4000, 4096), vec![0xC3; 4096]);

        // An unstarted transfer gives its buffer back as soon as it is destroyed.
        mm.transfer_destroy(small.pop().unwrap());
        mm.transfer_init_small(4096).unwrap();
        mm.transfer_destroy(t);
    }

    #[test]
    fn test_hardware_stop_then_reset() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let data = pattern(4096, 8);

        sim.fail_next_descriptor(MM);
        let err = mm.copy_to_device(&data, 0).unwrap_err();
        assert!(matches!(err, DmaError::HardwareStopped { .. }));
        assert_eq!(err.kind(), ErrorKind::Exception);

        mm.reset().unwrap();
        mm.copy_to_device(&data, 0).unwrap();
        assert_eq!(sim.read_mem(MM, 0, 4096), data);
    }

    #[test]
    fn test_polling_mode_round_trip() {
        let config = EngineConfig::default().with_completion_mode(CompletionMode::Polling);
        let (_sim, engine) = setup(config);
        let mm = engine.open_channel(MM).unwrap();
        let data = pattern(3 * MIB, 2);

        mm.copy_to_device(&data, 64).unwrap();
        let mut back = vec![0u8; data.len()];
        mm.copy_from_device(64, &mut back).unwrap();
        assert!(back == data);
    }

    #[test]
    fn test_busy_while_in_progress() {
        let config = EngineConfig::default().with_timeout(Duration::from_millis(300));
        let (sim, engine) = setup(config);
        let rx = engine.open_channel(RX).unwrap();
        let mut buf = vec![0u8; 4096];

        let t = rx.transfer_init();
        t.set_dst(buf.as_mut_ptr() as u64).unwrap();
        t.set_len(4096).unwrap();
        t.set_callback(|_| {}).unwrap();
        unsafe { rx.transfer_start(&t) }.unwrap();
        assert!(matches!(unsafe { rx.transfer_start(&t) }, Err(DmaError::Busy(_))));
        assert!(matches!(t.set_len(64), Err(DmaError::Busy(_))));

        sim.push_rx_packet(RX, &[1u8; 4096], false);
        let status = t.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(status.status, CompletionStatus::Success);
        assert_eq!(buf, vec![1u8; 4096]);
    }

    #[test]
    fn test_close_cancels_queued_transfers() {
        let config = EngineConfig::default().with_timeout(Duration::from_millis(200));
        let (sim, engine) = setup(config);
        let rx = engine.open_channel(RX).unwrap();
        let mut bufs = vec![vec![0u8; 4096]; 4];

        let transfers: Vec<_> = bufs
            .iter_mut()
            .map(|buf| {
                let t = rx.transfer_init();
                t.set_dst(buf.as_mut_ptr() as u64).unwrap();
                t.set_len(4096).unwrap();
                t.set_callback(|_| {}).unwrap();
                unsafe { rx.transfer_start(&t) }.unwrap();
                t
            })
            .collect();

        // Let the worker pick up the first transfer before closing.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sim.pending_descriptors(RX) == 0 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        rx.close().unwrap();
        let statuses: Vec<_> = transfers
            .iter()
            .map(|t| t.wait(Duration::from_secs(5)).unwrap().status)
            .collect();

        // No data ever arrives: the running transfer times out, the rest
        // never reach the hardware.
        assert!(matches!(statuses[0], CompletionStatus::TimedOut { .. }));
        assert!(statuses[1..].iter().all(|s| *s == CompletionStatus::Cancelled));
        assert_eq!(engine.buffers_in_use(), 0);
        assert!(matches!(unsafe { rx.transfer_start(&transfers[0]) }, Err(DmaError::InvalidParam(_))));
    }

    #[test]
    fn test_close_wakes_blocked_submitter() {
        let config = EngineConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_queue_capacity(1);
        let (sim, engine) = setup(config);
        let rx = engine.open_channel(RX).unwrap();
        let mut running = vec![0u8; 4096];
        let mut queued = vec![0u8; 4096];

        let start = |buf: &mut Vec<u8>| {
            let t = rx.transfer_init();
            t.set_dst(buf.as_mut_ptr() as u64).unwrap();
            t.set_len(4096).unwrap();
            t.set_callback(|_| {}).unwrap();
            unsafe { rx.transfer_start(&t) }.map(|_| t)
        };
        let first = start(&mut running).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sim.pending_descriptors(RX) == 0 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        let second = start(&mut queued).unwrap();

        std::thread::scope(|s| {
            let blocked = s.spawn(|| {
                let mut buf = vec![0u8; 4096];
                let begun = std::time::Instant::now();
                let res = start(&mut buf).map(|_| ());
                (res, begun.elapsed())
            });
            // Give the third submitter time to block on the full queue.
            std::thread::sleep(Duration::from_millis(50));
            let closer = s.spawn(|| rx.close());

            let (res, elapsed) = blocked.join().unwrap();
            assert!(matches!(res, Err(DmaError::Cancelled) | Err(DmaError::InvalidParam(_))));
            assert!(elapsed < Duration::from_secs(2), "submitter held for {:?}", elapsed);

            sim.push_rx_packet(RX, &[3u8; 4096], false);
            closer.join().unwrap().unwrap();
        });

        assert_eq!(first.wait(Duration::from_secs(5)).unwrap().status, CompletionStatus::Success);
        assert_eq!(second.wait(Duration::from_secs(5)).unwrap().status, CompletionStatus::Cancelled);
        assert_eq!(running, vec![3u8; 4096]);
        assert_eq!(engine.buffers_in_use(), 0);
    }

    #[test]
    fn test_callbacks_once_and_in_order() {
        let (_sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let data = pattern(64 * 1024, 3);
        let order = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicU32::new(0));

        let transfers: Vec<_> = (0..10u64)
            .map(|i| {
                let t = mm.transfer_init();
                t.set_type(TransferType::HostToFpgaMm).unwrap();
                t.set_src(data.as_ptr() as u64).unwrap();
                t.set_dst(i * 0x10000).unwrap();
                t.set_len(data.len() as u64).unwrap();
                let (order, calls, id) = (Arc::clone(&order), Arc::clone(&calls), t.id());
                t.set_callback(move |status| {
                    assert!(status.status.is_success());
                    calls.fetch_add(1, Ordering::SeqCst);
                    lock(&order).push(id);
                })
                .unwrap();
                let status = unsafe { mm.transfer_start(&t) }.unwrap();
                assert!(status.status.is_pending());
                t
            })
            .collect();

        for t in &transfers {
            t.wait(Duration::from_secs(10)).unwrap();
        }
        engine.close().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(*lock(&order), transfers.iter().map(|t| t.id()).collect::<Vec<_>>());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_poll_mode_signals_descriptor() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let data = pattern(4096, 1);

        let t = mm.transfer_init();
        t.set_type(TransferType::HostToFpgaMm).unwrap();
        t.set_src(data.as_ptr() as u64).unwrap();
        t.set_dst(0).unwrap();
        t.set_len(4096).unwrap();
        let fd = t.enable_poll().unwrap();
        unsafe { mm.transfer_start(&t) }.unwrap();

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 5000) };
        assert_eq!(ready, 1);
        assert!(t.wait(Duration::from_secs(1)).unwrap().status.is_success());
        assert_eq!(sim.read_mem(MM, 0, 4096), data);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_async_transfer() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        let data = pattern(8192, 2);

        let t = mm.transfer_init();
        t.set_type(TransferType::HostToFpgaMm).unwrap();
        t.set_src(data.as_ptr() as u64).unwrap();
        t.set_dst(0x100).unwrap();
        t.set_len(data.len() as u64).unwrap();
        let status = unsafe { mm.transfer_start_async(&t) }.await.unwrap();
        assert_eq!(status.bytes_transferred, 8192);
        assert_eq!(sim.read_mem(MM, 0x100, 8192), data);
    }

    #[test]
    fn test_drop_closes_channels() {
        let (sim, engine) = setup(EngineConfig::default());
        let mm = engine.open_channel(MM).unwrap();
        mm.copy_to_device(&pattern(4096, 0), 0).unwrap();
        drop(engine);
        assert!(mm.copy_to_device(&[0u8; 64], 0).is_err());
        // The fence buffer went with the worker, pool buffers with the last handle.
        drop(mm);
        assert_eq!(sim.pinned_regions(), 0);
    }
}
