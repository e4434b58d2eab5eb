// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! msgdma channels.
//!
//! A [`Channel`] is the caller's handle on one opened hardware channel. It
//! validates transfers and queues them; a worker thread owned by the
//! channel drives the hardware through one of three kind-specific state
//! machines:
//!
//! | Kind | Module | Moves data |
//! |------|--------|------------|
//! | [`ChannelType::TxSt`] | `m2s` | host memory to an FPGA stream |
//! | [`ChannelType::RxSt`] | `s2m` | FPGA stream to host memory |
//! | [`ChannelType::Mm`]   | `m2m` | between host and FPGA memory, or within FPGA memory |
//!
//! The register block, descriptor ring and configuration they share live
//! once in [`HwChannel`]; the kind-specific behavior sits behind
//! [`ChannelOps`].

mod ase;
mod m2m;
mod m2s;
mod s2m;

use crate::completion::{self, Completion, WorkerHandle};
use crate::config::{CompletionMode, EngineConfig};
use crate::descriptor::{chunk_count, MsgdmaDescriptor, ALIGN_BYTES, MAX_TRANSFER_SIZE};
use crate::device::DmaDevice;
use crate::engine::EngineShared;
use crate::error::{DmaError, DmaResult};
use crate::pool::{BufferLease, BufferPool, BUFFER_SIZE};
use crate::queue::TransferQueue;
use crate::regs::{
    ChannelRegs, CsrControl, CsrStatus, ASE_CNTL_OFFSET, ASE_DATA_OFFSET, CSR_OFFSET, DESC_OFFSET,
    RSP_OFFSET, SHUTDOWN_CONTROL, STREAMING_VALVE_OFFSET,
};
use crate::ring::{DescriptorRing, PushPolicy};
use crate::sync::{lock, poll_until};
use crate::transfer::{
    Notifier, RxControl, SmallBuffer, Transfer, TransferRequest, TransferStatus, TransferType,
    TxControl,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use m2m::ranges_overlap;
pub(crate) use m2m::MmChannel;
pub(crate) use m2s::M2sChannel;
pub(crate) use s2m::S2mChannel;

/// Channel topology, identified by the feature GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Memory to stream (host to FPGA).
    TxSt,
    /// Stream to memory (FPGA to host).
    RxSt,
    /// Memory to memory through the address span extender.
    Mm,
}

/// One msgdma channel found on the device. Immutable once enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDesc {
    /// Position among the msgdma features, in list order.
    pub index: usize,
    pub ch_type: ChannelType,
    /// MMIO offset of the channel's feature header.
    pub base: u64,
}

impl ChannelDesc {
    pub fn new(index: usize, ch_type: ChannelType, base: u64) -> Self {
        Self {
            index,
            ch_type,
            base,
        }
    }

    pub fn csr_base(&self) -> u64 {
        self.base + CSR_OFFSET
    }

    pub fn desc_base(&self) -> u64 {
        self.base + DESC_OFFSET
    }

    pub fn rsp_base(&self) -> u64 {
        self.base + RSP_OFFSET
    }

    pub fn streaming_valve_base(&self) -> u64 {
        self.base + STREAMING_VALVE_OFFSET
    }

    pub fn ase_cntl_base(&self) -> u64 {
        self.base + ASE_CNTL_OFFSET
    }

    pub fn ase_data_base(&self) -> u64 {
        self.base + ASE_DATA_OFFSET
    }
}

// ============================================================================
// Shared hardware state
// ============================================================================

/// Register block, descriptor ring and policy of one open channel.
pub(crate) struct HwChannel {
    desc: ChannelDesc,
    regs: ChannelRegs,
    ring: DescriptorRing,
    config: EngineConfig,
}

/// Longest sleep in an interrupt wait before the CSR is read again.
const IRQ_RECHECK: Duration = Duration::from_millis(50);

fn stopped(status: CsrStatus) -> DmaError {
    log::error!("Dispatcher stopped, status {:#06x}", status.bits());
    DmaError::HardwareStopped {
        status: status.bits(),
        bytes_transferred: 0,
    }
}

impl HwChannel {
    pub(crate) fn new(device: Arc<dyn DmaDevice>, desc: ChannelDesc, config: &EngineConfig) -> DmaResult<Self> {
        Ok(Self {
            desc,
            regs: ChannelRegs::new(device, desc.base),
            ring: DescriptorRing::new(config.ring_capacity)?,
            config: config.clone(),
        })
    }

    pub(crate) fn desc(&self) -> &ChannelDesc {
        &self.desc
    }

    pub(crate) fn regs(&self) -> &ChannelRegs {
        &self.regs
    }

    pub(crate) fn ring(&self) -> &DescriptorRing {
        &self.ring
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn vector(&self) -> u32 {
        self.desc.index as u32
    }

    fn uses_interrupts(&self) -> bool {
        self.config.completion_mode == CompletionMode::Interrupt
    }

    /// Attach the interrupt and bring the dispatcher to a clean state.
    pub(crate) fn start(&self) -> DmaResult<()> {
        if self.uses_interrupts() {
            self.regs.device().register_interrupt(self.vector())?;
        }
        if let Err(e) = self.reset() {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Disable interrupts and detach the vector.
    pub(crate) fn stop(&self) {
        self.regs
            .update_control(CsrControl::empty(), CsrControl::GLOBAL_INTR_EN);
        if self.uses_interrupts() {
            if let Err(e) = self.regs.device().unregister_interrupt(self.vector()) {
                log::warn!("Channel {}: unregister interrupt: {}", self.desc.index, e);
            }
        }
    }

    /// Force the dispatcher to halt; used when a close could not drain.
    pub(crate) fn halt(&self) {
        self.regs.set_control(SHUTDOWN_CONTROL);
    }

    /// Reset the dispatcher and forget every outstanding descriptor.
    pub(crate) fn reset(&self) -> DmaResult<()> {
        self.regs.set_control(CsrControl::RESET_DISPATCHER);
        self.poll_status("dispatcher reset", |s| !s.contains(CsrStatus::RESETTING))?;
        let dropped = self.ring.clear();
        if dropped > 0 {
            log::debug!("Channel {}: reset dropped {} descriptors", self.desc.index, dropped);
        }
        self.regs.clear_irq();
        self.regs.set_control(CsrControl::GLOBAL_INTR_EN);
        Ok(())
    }

    /// Poll CSR status until `done` holds, bounded by the configured timeout.
    pub(crate) fn poll_status(
        &self,
        what: &'static str,
        done: impl Fn(CsrStatus) -> bool,
    ) -> DmaResult<CsrStatus> {
        poll_until(self.config.timeout, || {
            let status = self.regs.status();
            done(status).then_some(status)
        })
        .ok_or_else(|| DmaError::timeout(what, self.config.timeout))
    }

    /// Hand a descriptor to the dispatcher once it has room.
    ///
    /// Returns the sequence number stamped on the descriptor.
    pub(crate) fn send_descriptor(&self, desc: MsgdmaDescriptor) -> DmaResult<u16> {
        let status = self.poll_status("descriptor buffer space", |s| {
            !s.contains(CsrStatus::DESC_BUF_FULL) || s.is_fatal()
        })?;
        if status.is_fatal() {
            return Err(stopped(status));
        }
        let stamped = self
            .ring
            .push(desc, PushPolicy::Block(self.config.timeout))?;
        log::trace!(
            "Channel {}: desc seq {} {:#x} -> {:#x} len {} ctrl {:#010x}",
            self.desc.index,
            stamped.seq_num,
            stamped.src(),
            stamped.dst(),
            stamped.len,
            stamped.control
        );
        self.regs.write_descriptor(&stamped);
        Ok(stamped.seq_num)
    }

    /// Wait for the channel interrupt, acknowledge it and check for a stop.
    ///
    /// A wake-up counts only once this channel's CSR shows `IRQ` or a stop.
    pub(crate) fn wait_irq(&self) -> DmaResult<()> {
        if self.uses_interrupts() {
            let timeout = self.config.timeout;
            let deadline = Instant::now() + timeout;
            loop {
                let status = self.regs.status();
                if status.contains(CsrStatus::IRQ) || status.is_fatal() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(DmaError::timeout("interrupt", timeout));
                }
                // Bounded so an interrupt taken by another waiter is not missed.
                let slice = (deadline - now).min(IRQ_RECHECK);
                if self.regs.device().wait_interrupt(self.vector(), slice)? {
                    log::trace!("Channel {}: interrupt wake-up", self.desc.index);
                }
            }
        } else {
            self.poll_status("interrupt", |s| s.contains(CsrStatus::IRQ) || s.is_fatal())?;
        }
        self.regs.clear_irq();
        let status = self.regs.status();
        if status.is_fatal() {
            return Err(stopped(status));
        }
        Ok(())
    }

    /// Wait for the interrupt of descriptor `seq` and retire it and
    /// everything before it.
    pub(crate) fn wait_retire(&self, seq: u16) -> DmaResult<()> {
        self.wait_irq()?;
        self.ring.retire_through(seq);
        Ok(())
    }

    /// Throw away descriptors the dispatcher has not started.
    pub(crate) fn flush(&self) -> DmaResult<()> {
        self.regs
            .set_control(CsrControl::STOP_DISPATCHER | CsrControl::FLUSH_DESCRIPTORS);
        self.poll_status("dispatcher stop", |s| s.contains(CsrStatus::STOPPED))?;
        self.regs
            .set_control(CsrControl::STOP_DISPATCHER | CsrControl::FLUSH_WR_MASTER);
        while self.regs.rsp_fill_level() > 0 {
            self.regs.pop_response();
        }
        self.ring.clear();
        self.regs.clear_irq();
        self.regs.set_control(CsrControl::GLOBAL_INTR_EN);
        Ok(())
    }
}

// ============================================================================
// Kind-specific execution
// ============================================================================

/// Result fields accumulated while a transfer executes.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Progress {
    pub bytes: u64,
    pub eop: bool,
}

/// Where staged chunks of a host transfer live.
pub(crate) enum Staging<'a> {
    /// The host range is already pinned; DMA straight from its I/O address.
    Direct { iova: u64 },
    /// Rotate through pool buffers, one chunk per buffer.
    Buffers(&'a [BufferLease]),
}

impl<'a> Staging<'a> {
    /// Stage `[host, host + len)` through the small buffer when it lies
    /// inside it, otherwise through `bufs`.
    pub(crate) fn for_host(
        small: Option<&SmallBuffer>,
        host: u64,
        len: u64,
        bufs: &'a [BufferLease],
    ) -> DmaResult<Self> {
        if let Some(small) = small {
            if let Some(offset) = small.offset_of(host, len) {
                return Ok(Self::Direct {
                    iova: small.iova() + offset,
                });
            }
        }
        if bufs.is_empty() {
            return Err(DmaError::NoMemory("no staging buffer for transfer".into()));
        }
        Ok(Self::Buffers(bufs))
    }

    /// Chunks that can be in flight before a buffer is reused.
    pub(crate) fn slots(&self, chunks: u64) -> u64 {
        match self {
            Self::Direct { .. } => chunks.max(1),
            Self::Buffers(bufs) => bufs.len() as u64,
        }
    }

    /// The same staging for a range starting `by` bytes later.
    pub(crate) fn advance(&self, by: u64) -> Staging<'a> {
        match self {
            Self::Direct { iova } => Self::Direct { iova: iova + by },
            Self::Buffers(bufs) => Self::Buffers(*bufs),
        }
    }

    pub(crate) fn reuses(&self) -> bool {
        matches!(self, Self::Buffers(_))
    }

    pub(crate) fn iova(&self, chunk: u64) -> u64 {
        match self {
            Self::Direct { iova } => iova + chunk * MAX_TRANSFER_SIZE,
            Self::Buffers(bufs) => bufs[(chunk % bufs.len() as u64) as usize].iova(),
        }
    }

    /// Copy a chunk into its buffer.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` bytes, and the buffer must not be the
    /// target of an unfinished DMA.
    pub(crate) unsafe fn stage(&self, chunk: u64, src: *const u8, len: usize) {
        if let Self::Buffers(bufs) = self {
            bufs[(chunk % bufs.len() as u64) as usize].fill_from(0, src, len);
        }
    }

    /// Copy a received chunk out of its buffer.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` bytes and the DMA into the buffer
    /// must have completed.
    pub(crate) unsafe fn unstage(&self, chunk: u64, dst: *mut u8, len: usize) {
        if let Self::Buffers(bufs) = self {
            bufs[(chunk % bufs.len() as u64) as usize].drain_to(0, dst, len);
        }
    }
}

/// Buffers a host range needs when it is not inside the small buffer.
pub(crate) fn host_buffers(small: Option<&SmallBuffer>, host: u64, len: u64) -> usize {
    match small.and_then(|s| s.offset_of(host, len)) {
        Some(_) => 0,
        None => chunk_count(len, MAX_TRANSFER_SIZE) as usize,
    }
}

/// Tracks the single interrupt-raising descriptor a ping-pong loop keeps
/// in flight, and how many chunks are known to be complete.
#[derive(Debug, Default)]
pub(crate) struct IrqTracker {
    outstanding: Option<(u64, u16)>,
    done: u64,
}

impl IrqTracker {
    /// Chunks `0..completed()` have been written by the hardware.
    pub(crate) fn completed(&self) -> u64 {
        self.done
    }

    pub(crate) fn issued(&mut self, chunk: u64, seq: u16) {
        debug_assert!(self.outstanding.is_none());
        self.outstanding = Some((chunk, seq));
    }

    pub(crate) fn wait(&mut self, hw: &HwChannel) -> DmaResult<()> {
        if let Some((chunk, seq)) = self.outstanding.take() {
            hw.wait_retire(seq)?;
            self.done = chunk + 1;
        }
        Ok(())
    }

    /// Before reusing the buffer of chunk `chunk`, make sure the chunk
    /// that used it last (`chunk - slots`) is done.
    pub(crate) fn ensure_reusable(&mut self, hw: &HwChannel, chunk: u64, slots: u64) -> DmaResult<()> {
        if chunk >= slots && self.done <= chunk - slots {
            self.wait(hw)?;
        }
        Ok(())
    }
}

/// Behavior that differs between channel kinds.
pub(crate) trait ChannelOps {
    /// Pool buffers `req` needs; the worker caps this at the per-transfer limit.
    fn buffers_needed(&self, req: &TransferRequest) -> usize;

    /// Run `req` to completion on the hardware.
    fn execute(
        &mut self,
        hw: &HwChannel,
        req: &TransferRequest,
        bufs: &[BufferLease],
        progress: &mut Progress,
    ) -> DmaResult<()>;
}

/// The channel kinds, dispatched by match.
pub(crate) enum ChannelKind {
    Tx(M2sChannel),
    Rx(S2mChannel),
    Mm(MmChannel),
}

impl ChannelKind {
    pub(crate) fn new(hw: &HwChannel) -> DmaResult<Self> {
        Ok(match hw.desc().ch_type {
            ChannelType::TxSt => Self::Tx(M2sChannel),
            ChannelType::RxSt => Self::Rx(S2mChannel),
            ChannelType::Mm => Self::Mm(MmChannel::new(Arc::clone(hw.regs().device()))?),
        })
    }
}

impl ChannelOps for ChannelKind {
    fn buffers_needed(&self, req: &TransferRequest) -> usize {
        match self {
            Self::Tx(ch) => ch.buffers_needed(req),
            Self::Rx(ch) => ch.buffers_needed(req),
            Self::Mm(ch) => ch.buffers_needed(req),
        }
    }

    fn execute(
        &mut self,
        hw: &HwChannel,
        req: &TransferRequest,
        bufs: &[BufferLease],
        progress: &mut Progress,
    ) -> DmaResult<()> {
        match self {
            Self::Tx(ch) => ch.execute(hw, req, bufs, progress),
            Self::Rx(ch) => ch.execute(hw, req, bufs, progress),
            Self::Mm(ch) => ch.execute(hw, req, bufs, progress),
        }
    }
}

/// Check a started transfer against the channel it is started on.
pub(crate) fn validate(ch_type: ChannelType, req: &TransferRequest) -> DmaResult<()> {
    use TransferType::*;

    let tt = req.transfer_type;
    if tt.is_reserved() {
        return Err(DmaError::NotSupported(format!("transfer type {:?}", tt)));
    }
    let fits = matches!(
        (ch_type, tt),
        (ChannelType::TxSt, HostToFpgaSt)
            | (ChannelType::RxSt, FpgaToHostSt)
            | (ChannelType::Mm, HostToFpgaMm | FpgaToHostMm | FpgaToFpgaMm)
    );
    if !fits {
        return Err(DmaError::InvalidParam(format!(
            "transfer type {:?} on a {:?} channel",
            tt, ch_type
        )));
    }
    if req.len == 0 {
        return Err(DmaError::InvalidParam("transfer length is zero".into()));
    }
    if ch_type != ChannelType::TxSt && req.tx_control != TxControl::NoPacket {
        return Err(DmaError::InvalidParam(format!(
            "TX control {:?} on a {:?} channel",
            req.tx_control, ch_type
        )));
    }
    if ch_type != ChannelType::RxSt && req.rx_control != RxControl::NoPacket {
        return Err(DmaError::InvalidParam(format!(
            "RX control {:?} on a {:?} channel",
            req.rx_control, ch_type
        )));
    }
    let unframed = match ch_type {
        ChannelType::TxSt => req.tx_control == TxControl::NoPacket,
        ChannelType::RxSt => req.rx_control == RxControl::NoPacket,
        ChannelType::Mm => false,
    };
    if unframed && req.len % ALIGN_BYTES != 0 {
        return Err(DmaError::InvalidParam(format!(
            "unframed streaming length {} is not a multiple of {}",
            req.len, ALIGN_BYTES
        )));
    }
    for (what, addr) in [("source", req.src), ("destination", req.dst)] {
        if addr.checked_add(req.len).is_none() {
            return Err(DmaError::InvalidParam(format!(
                "{} range {:#x}+{:#x} wraps the address space",
                what, addr, req.len
            )));
        }
    }
    if tt == FpgaToFpgaMm && ranges_overlap(req.src, req.dst, req.len) {
        return Err(DmaError::NotSupported(format!(
            "overlapping FPGA copy {:#x} -> {:#x} ({} bytes)",
            req.src, req.dst, req.len
        )));
    }
    let host_src = matches!(tt, HostToFpgaSt | HostToFpgaMm);
    let host_dst = matches!(tt, FpgaToHostSt | FpgaToHostMm);
    if (host_src && req.src == 0) || (host_dst && req.dst == 0) {
        return Err(DmaError::InvalidParam("null host address".into()));
    }
    Ok(())
}

// ============================================================================
// Public channel handle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Open,
    /// A close gave up waiting for the worker; it may be retried.
    Closing,
    Closed,
}

pub(crate) struct ChannelShared {
    hw: Arc<HwChannel>,
    queue: Arc<TransferQueue<TransferRequest>>,
    worker: Mutex<WorkerHandle>,
    state: RwLock<ChannelState>,
    pool: Arc<BufferPool>,
    completions: Arc<TransferQueue<Completion>>,
    small_outstanding: Arc<AtomicUsize>,
    engine: Weak<EngineShared>,
}

impl ChannelShared {
    /// Bring up the hardware and the worker of channel `desc`.
    pub(crate) fn open(engine: &Arc<EngineShared>, desc: ChannelDesc) -> DmaResult<Arc<Self>> {
        let config = &engine.config;
        let hw = Arc::new(HwChannel::new(Arc::clone(&engine.device), desc, config)?);
        hw.start()?;
        let guard = scopeguard::guard(Arc::clone(&hw), |hw| hw.stop());

        let kind = ChannelKind::new(&hw)?;
        let queue = Arc::new(TransferQueue::new(config.queue_capacity)?);
        let worker = completion::spawn_worker(
            kind,
            Arc::clone(&hw),
            Arc::clone(&queue),
            Arc::clone(&engine.pool),
            Arc::clone(&engine.completions),
        )?;
        scopeguard::ScopeGuard::into_inner(guard);

        log::info!("Opened {:?} channel {} at {:#x}", desc.ch_type, desc.index, desc.base);
        Ok(Arc::new(Self {
            hw,
            queue,
            worker: Mutex::new(worker),
            state: RwLock::new(ChannelState::Open),
            pool: Arc::clone(&engine.pool),
            completions: Arc::clone(&engine.completions),
            small_outstanding: Arc::clone(&engine.small_outstanding),
            engine: Arc::downgrade(engine),
        }))
    }

    pub(crate) fn index(&self) -> usize {
        self.hw.desc().index
    }

    pub(crate) fn hw(&self) -> &HwChannel {
        &self.hw
    }

    fn submit(&self, transfer: &Transfer, notifier: Option<Notifier>) -> DmaResult<bool> {
        // Not held across the enqueue: close() shuts the queue down, which
        // wakes a submitter blocked on a full queue.
        if *self.state.read().unwrap_or_else(PoisonError::into_inner) != ChannelState::Open {
            return Err(DmaError::InvalidParam(format!("channel {} is closed", self.index())));
        }
        if transfer.channel_type() != self.hw.desc().ch_type {
            return Err(DmaError::InvalidParam(format!(
                "transfer created for a {:?} channel started on a {:?} channel",
                transfer.channel_type(),
                self.hw.desc().ch_type
            )));
        }

        let inner = transfer.inner();
        let req = inner.begin(notifier)?;
        if let Err(e) = validate(self.hw.desc().ch_type, &req) {
            inner.abort_begin();
            return Err(e);
        }
        let blocking = req.notifier.is_blocking();
        log::debug!(
            "Channel {}: queue transfer {} ({:?}, {} bytes)",
            self.index(),
            req.id(),
            req.transfer_type,
            req.len
        );
        if let Err((_req, e)) = self.queue.enqueue_timeout(req, self.hw.config().timeout) {
            inner.abort_begin();
            return Err(e);
        }
        Ok(blocking)
    }

    /// Cancel queued transfers, stop the worker and release the hardware.
    pub(crate) fn close(&self) -> DmaResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ChannelState::Closed => return Ok(()),
            ChannelState::Open => {
                let cancelled = self.queue.drain();
                if !cancelled.is_empty() {
                    log::info!(
                        "Channel {}: cancelling {} queued transfers",
                        self.index(),
                        cancelled.len()
                    );
                }
                for req in cancelled {
                    Completion::cancelled(req).post(&self.completions, &self.pool);
                }
                self.queue.shutdown();
                *state = ChannelState::Closing;
            }
            ChannelState::Closing => {}
        }

        let config = self.hw.config();
        lock(&self.worker).join(config.timeout + config.startup_timeout)?;
        self.hw.stop();
        *state = ChannelState::Closed;
        drop(state);

        if let Some(engine) = self.engine.upgrade() {
            engine.release_slot(self.index());
        }
        log::info!("Closed channel {}", self.index());
        Ok(())
    }

    fn init_small(&self, size: usize) -> DmaResult<Transfer> {
        if size == 0 || size > BUFFER_SIZE {
            return Err(DmaError::InvalidParam(format!(
                "small transfer size {} not in 1..={}",
                size, BUFFER_SIZE
            )));
        }
        let max = self.hw.config().max_small_buffers;
        self.small_outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|n| {
                DmaError::NoMemory(format!("{} of {} small buffers in use", n, max))
            })?;
        let lease = match self.pool.try_acquire(size) {
            Ok(lease) => lease,
            Err(e) => {
                self.small_outstanding.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        let small = SmallBuffer::new(lease, Arc::clone(&self.pool), Arc::clone(&self.small_outstanding));
        Ok(Transfer::new(self.hw.desc().ch_type, Some(small)))
    }
}

/// An open msgdma channel.
///
/// Dropping the handle closes the channel; use [`close`](Self::close) to
/// observe a failure.
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>) -> Self {
        Self { shared }
    }

    pub fn index(&self) -> usize {
        self.shared.index()
    }

    pub fn channel_type(&self) -> ChannelType {
        self.shared.hw().desc().ch_type
    }

    pub fn desc(&self) -> ChannelDesc {
        *self.shared.hw().desc()
    }

    /// New transfer with defaults for this channel's type.
    pub fn transfer_init(&self) -> Transfer {
        Transfer::new(self.channel_type(), None)
    }

    /// New transfer owning a pinned buffer of `size` bytes.
    ///
    /// Point `src`/`dst` into [`Transfer::small_buffer`] to skip staging
    /// copies. The buffer goes back to the pool when the transfer is
    /// dropped.
    ///
    /// # Errors
    ///
    /// `DmaError::InvalidParam` for a size of 0 or above 2 MiB, and
    /// `DmaError::NoMemory` when the engine's small-buffer quota is used up.
    pub fn transfer_init_small(&self, size: usize) -> DmaResult<Transfer> {
        self.shared.init_small(size)
    }

    /// Release a transfer. One still in progress is detached; its small
    /// buffer is returned once it completes.
    pub fn transfer_destroy(&self, transfer: Transfer) {
        if transfer.is_in_progress() {
            log::debug!("Destroying transfer {} while in progress", transfer.id());
        }
        drop(transfer);
    }

    /// Start a transfer.
    ///
    /// With the default blocking notification this returns the final status
    /// once the transfer is done. With a callback or poll descriptor armed it
    /// returns a pending status as soon as the request is queued.
    ///
    /// # Errors
    ///
    /// - `DmaError::Busy` if the transfer is already in progress or the
    ///   request queue stayed full for the configured timeout;
    /// - `DmaError::NotSupported` for reserved transfer types;
    /// - `DmaError::InvalidParam` for attributes that do not fit the channel;
    /// - for a blocking start, the error matching a failed completion.
    ///
    /// # Safety
    ///
    /// Host addresses set on the transfer must stay valid for `len` bytes
    /// until it completes, unless they lie inside the transfer's own small
    /// buffer.
    pub unsafe fn transfer_start(&self, transfer: &Transfer) -> DmaResult<TransferStatus> {
        if self.shared.submit(transfer, None)? {
            transfer.inner().wait(None)?.into_result()
        } else {
            Ok(TransferStatus::pending())
        }
    }

    /// Start a transfer and await its completion.
    ///
    /// # Errors
    ///
    /// As [`transfer_start`](Self::transfer_start); `DmaError::Cancelled` if
    /// the engine went away before reporting.
    ///
    /// # Safety
    ///
    /// As [`transfer_start`](Self::transfer_start). The future must be
    /// polled to completion before the host memory is reused.
    #[cfg(feature = "async")]
    pub async unsafe fn transfer_start_async(&self, transfer: &Transfer) -> DmaResult<TransferStatus> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.shared.submit(transfer, Some(Notifier::Async(tx)))?;
        rx.await.map_err(|_| DmaError::Cancelled)?.into_result()
    }

    /// Reset the dispatcher after a hardware stop.
    ///
    /// # Errors
    ///
    /// `DmaError::Timeout` if the dispatcher stays in reset.
    pub fn reset(&self) -> DmaResult<()> {
        log::info!("Resetting channel {}", self.index());
        self.shared.hw().reset()
    }

    /// Close the channel. Queued transfers complete as cancelled; the
    /// transfer the hardware is working on finishes first.
    ///
    /// # Errors
    ///
    /// `DmaError::Busy` if the worker did not finish within the timeout.
    /// The channel stays registered and the close can be retried.
    pub fn close(&self) -> DmaResult<()> {
        self.shared.close()
    }

    fn run(&self, transfer: &Transfer) -> DmaResult<TransferStatus> {
        // SAFETY: the caller's borrows outlive this blocking start.
        unsafe { self.transfer_start(transfer) }
    }

    /// Copy `src` into FPGA memory at `dev_addr` (MM channels).
    ///
    /// # Errors
    ///
    /// As [`transfer_start`](Self::transfer_start).
    pub fn copy_to_device(&self, src: &[u8], dev_addr: u64) -> DmaResult<()> {
        let t = self.transfer_init();
        t.set_type(TransferType::HostToFpgaMm)?;
        t.set_src(src.as_ptr() as u64)?;
        t.set_dst(dev_addr)?;
        t.set_len(src.len() as u64)?;
        self.run(&t).map(|_| ())
    }

    /// Copy FPGA memory at `dev_addr` into `dst` (MM channels).
    ///
    /// # Errors
    ///
    /// As [`transfer_start`](Self::transfer_start).
    pub fn copy_from_device(&self, dev_addr: u64, dst: &mut [u8]) -> DmaResult<()> {
        let t = self.transfer_init();
        t.set_type(TransferType::FpgaToHostMm)?;
        t.set_src(dev_addr)?;
        t.set_dst(dst.as_mut_ptr() as u64)?;
        t.set_len(dst.len() as u64)?;
        self.run(&t).map(|_| ())
    }

    /// Copy `len` bytes within FPGA memory (MM channels).
    ///
    /// # Errors
    ///
    /// `DmaError::NotSupported` for overlapping ranges, otherwise as
    /// [`transfer_start`](Self::transfer_start).
    pub fn copy_device_to_device(&self, src: u64, dst: u64, len: u64) -> DmaResult<()> {
        let t = self.transfer_init();
        t.set_type(TransferType::FpgaToFpgaMm)?;
        t.set_src(src)?;
        t.set_dst(dst)?;
        t.set_len(len)?;
        self.run(&t).map(|_| ())
    }

    /// Stream `data` out (TX channels).
    ///
    /// # Errors
    ///
    /// As [`transfer_start`](Self::transfer_start).
    pub fn send(&self, data: &[u8], ctrl: TxControl) -> DmaResult<()> {
        let t = self.transfer_init();
        t.set_src(data.as_ptr() as u64)?;
        t.set_len(data.len() as u64)?;
        t.set_tx_control(ctrl)?;
        self.run(&t).map(|_| ())
    }

    /// Receive into `buf` (RX channels). With [`RxControl::EndOnEop`] the
    /// transfer may end early; the status carries the byte count and
    /// whether an end-of-packet arrived.
    ///
    /// # Errors
    ///
    /// As [`transfer_start`](Self::transfer_start).
    pub fn receive(&self, buf: &mut [u8], ctrl: RxControl) -> DmaResult<TransferStatus> {
        let t = self.transfer_init();
        t.set_dst(buf.as_mut_ptr() as u64)?;
        t.set_len(buf.len() as u64)?;
        t.set_rx_control(ctrl)?;
        self.run(&t)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("index", &self.index())
            .field("type", &self.channel_type())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.shared.close() {
            log::error!("Channel {}: close on drop failed: {}", self.index(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn request(ch_type: ChannelType, setup: impl FnOnce(&Transfer)) -> DmaResult<()> {
        let t = Transfer::new(ch_type, None);
        setup(&t);
        let req = t.inner().begin(None)?;
        validate(ch_type, &req)
    }

    #[test]
    fn test_channel_desc_bases() {
        let d = ChannelDesc::new(0, ChannelType::Mm, 0x2000);
        assert_eq!(d.csr_base(), 0x2040);
        assert_eq!(d.desc_base(), 0x2060);
        assert_eq!(d.rsp_base(), 0x2080);
        assert_eq!(d.streaming_valve_base(), 0x20A0);
        assert_eq!(d.ase_cntl_base(), 0x2200);
        assert_eq!(d.ase_data_base(), 0x3000);
    }

    #[test]
    fn test_validate_reserved_and_mismatched_types() {
        let reserved = request(ChannelType::Mm, |t| {
            t.set_type(TransferType::FpgaMmToFpgaSt).unwrap();
            t.set_len(64).unwrap();
        });
        assert!(matches!(reserved, Err(DmaError::NotSupported(_))));

        let wrong_way = request(ChannelType::RxSt, |t| {
            t.set_type(TransferType::HostToFpgaSt).unwrap();
            t.set_src(0x1000).unwrap();
            t.set_len(64).unwrap();
        });
        assert!(matches!(wrong_way, Err(DmaError::InvalidParam(_))));

        let tx_on_rx = request(ChannelType::RxSt, |t| {
            t.set_dst(0x1000).unwrap();
            t.set_len(64).unwrap();
            t.set_tx_control(TxControl::GenerateEop).unwrap();
        });
        assert!(matches!(tx_on_rx, Err(DmaError::InvalidParam(_))));

        let st_on_mm = request(ChannelType::Mm, |t| {
            t.set_type(TransferType::FpgaToHostSt).unwrap();
            t.set_dst(0x1000).unwrap();
            t.set_len(64).unwrap();
        });
        assert!(matches!(st_on_mm, Err(DmaError::InvalidParam(_))));
    }

    #[test]
    fn test_validate_streaming_alignment() {
        let unaligned = request(ChannelType::TxSt, |t| {
            t.set_src(0x1000).unwrap();
            t.set_len(100).unwrap();
        });
        assert!(matches!(unaligned, Err(DmaError::InvalidParam(_))));

        let framed = request(ChannelType::TxSt, |t| {
            t.set_src(0x1000).unwrap();
            t.set_len(100).unwrap();
            t.set_tx_control(TxControl::GenerateSopAndEop).unwrap();
        });
        assert!(framed.is_ok());

        let eop = request(ChannelType::RxSt, |t| {
            t.set_dst(0x1000).unwrap();
            t.set_len(1000).unwrap();
            t.set_rx_control(RxControl::EndOnEop).unwrap();
        });
        assert!(eop.is_ok());
    }

    #[test]
    fn test_validate_rejects_wrapping_ranges() {
        let wraps = request(ChannelType::Mm, |t| {
            t.set_type(TransferType::FpgaToFpgaMm).unwrap();
            t.set_src(0).unwrap();
            t.set_dst(u64::MAX - 10).unwrap();
            t.set_len(100).unwrap();
        });
        assert!(matches!(wraps, Err(DmaError::InvalidParam(_))));

        let host_wraps = request(ChannelType::Mm, |t| {
            t.set_type(TransferType::HostToFpgaMm).unwrap();
            t.set_src(u64::MAX - 63).unwrap();
            t.set_dst(0).unwrap();
            t.set_len(128).unwrap();
        });
        assert!(matches!(host_wraps, Err(DmaError::InvalidParam(_))));

        // Ending exactly at the top of the address space is fine.
        let to_end = request(ChannelType::Mm, |t| {
            t.set_type(TransferType::FpgaToFpgaMm).unwrap();
            t.set_src(0).unwrap();
            t.set_dst(u64::MAX - 99).unwrap();
            t.set_len(100).unwrap();
        });
        assert!(to_end.is_ok());
    }

    #[test]
    fn test_wait_irq_ignores_spurious_wakeup() {
        let sim = Arc::new(SimDevice::builder().rx_channel().build());
        let desc = ChannelDesc::new(0, ChannelType::RxSt, crate::sim::SIM_FEATURE_STRIDE);
        let config = EngineConfig::default().with_timeout(Duration::from_millis(200));
        let hw = HwChannel::new(sim.clone(), desc, &config).unwrap();
        hw.start().unwrap();

        let regs = hw.regs();
        regs.set_valve_control(crate::regs::ValveControl::CLR_BYTES_TRANSFERRED);
        regs.set_valve_bytes_to_transfer(4096);
        regs.set_valve_control(
            crate::regs::ValveControl::EN_DATA_FLOW | crate::regs::ValveControl::EN_DET_TF,
        );

        let region = sim.prepare_buffer(4096).unwrap();
        let mut d = MsgdmaDescriptor::new(0, region.iova | crate::descriptor::ST_HOST_MASK, 4096);
        d.set_control(
            crate::descriptor::DescriptorControl::GO
                | crate::descriptor::DescriptorControl::TRANSFER_IRQ_EN,
        );
        let seq = hw.send_descriptor(d).unwrap();
        assert_eq!(sim.pending_descriptors(0), 1);

        // A wake-up without the CSR interrupt bit must not end the wait.
        sim.inject_spurious_interrupt(0);
        assert!(matches!(hw.wait_irq(), Err(DmaError::Timeout { .. })));
        assert_eq!(sim.pending_descriptors(0), 1);

        sim.push_rx_packet(0, &[7; 4096], false);
        hw.wait_retire(seq).unwrap();
        assert!(hw.ring().is_empty());
        let received = unsafe { std::slice::from_raw_parts(region.ptr, 4096) };
        assert!(received.iter().all(|&b| b == 7));
        sim.release_buffer(&region).unwrap();
    }

    #[test]
    fn test_irq_tracker_waits_before_reuse() {
        let sim = Arc::new(SimDevice::builder().mm_channel(4096).build());
        let desc = ChannelDesc::new(0, ChannelType::Mm, crate::sim::SIM_FEATURE_STRIDE);
        let config = EngineConfig::default().with_completion_mode(CompletionMode::Polling);
        let hw = HwChannel::new(sim, desc, &config).unwrap();
        hw.start().unwrap();

        let mut d = MsgdmaDescriptor::new(0, 64, 64);
        d.set_control(
            crate::descriptor::DescriptorControl::GO
                | crate::descriptor::DescriptorControl::TRANSFER_IRQ_EN,
        );
        let seq = hw.send_descriptor(d).unwrap();

        let mut tracker = IrqTracker::default();
        tracker.issued(3, seq);
        tracker.ensure_reusable(&hw, 5, 4).unwrap();
        assert_eq!(tracker.completed(), 4);
        assert!(hw.ring().is_empty());
        // Already done: no second wait.
        tracker.ensure_reusable(&hw, 6, 4).unwrap();
    }

    #[test]
    fn test_send_descriptor_reports_stop() {
        let sim = Arc::new(SimDevice::builder().mm_channel(4096).build());
        let desc = ChannelDesc::new(0, ChannelType::Mm, crate::sim::SIM_FEATURE_STRIDE);
        let config = EngineConfig::default().with_completion_mode(CompletionMode::Polling);
        let hw = HwChannel::new(sim.clone(), desc, &config).unwrap();
        hw.start().unwrap();

        sim.fail_next_descriptor(0);
        let mut d = MsgdmaDescriptor::new(0, 64, 64);
        d.set_control(crate::descriptor::DescriptorControl::GO);
        hw.send_descriptor(d).unwrap();
        assert!(matches!(
            hw.send_descriptor(d),
            Err(DmaError::HardwareStopped { .. })
        ));
        hw.reset().unwrap();
        assert!(hw.send_descriptor(d).is_ok());
    }
}
