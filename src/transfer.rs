// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Transfer objects.
//!
//! A [`Transfer`] describes one logical data movement and carries its
//! result. It is created by a channel, configured with the setters, and
//! handed to [`Channel::transfer_start`](crate::Channel::transfer_start).
//! While it is in progress the setters fail with `DmaError::Busy`; the
//! completion engine owns it until it reports back.
//!
//! Completion is reported in exactly one way, selected by the transfer:
//! - blocking (default): `transfer_start` returns when the transfer is done;
//! - callback: [`Transfer::set_callback`] arms a closure run on the
//!   completion thread;
//! - poll: [`Transfer::enable_poll`] returns a descriptor that becomes
//!   readable at completion.

use crate::channel::ChannelType;
use crate::error::{DmaError, DmaResult};
use crate::pool::{BufferLease, BufferPool};
use crate::sync::lock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Direction and endpoint kinds of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Host memory to an FPGA stream (TX channels).
    HostToFpgaSt,
    /// FPGA stream to host memory (RX channels).
    FpgaToHostSt,
    /// Reserved.
    FpgaMmToFpgaSt,
    /// Reserved.
    FpgaStToFpgaMm,
    /// Host memory to FPGA memory (MM channels).
    HostToFpgaMm,
    /// FPGA memory to host memory (MM channels).
    FpgaToHostMm,
    /// FPGA memory to FPGA memory (MM channels).
    FpgaToFpgaMm,
}

impl TransferType {
    /// Reserved types are rejected on every channel.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::FpgaMmToFpgaSt | Self::FpgaStToFpgaMm)
    }

    /// Default type for transfers created on a channel of `ch_type`.
    pub fn default_for(ch_type: ChannelType) -> Self {
        match ch_type {
            ChannelType::TxSt => Self::HostToFpgaSt,
            ChannelType::RxSt => Self::FpgaToHostSt,
            ChannelType::Mm => Self::HostToFpgaMm,
        }
    }
}

/// Packet framing for TX streaming transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxControl {
    /// Deterministic length, no packet markers.
    #[default]
    NoPacket,
    GenerateSop,
    GenerateEop,
    GenerateSopAndEop,
}

/// Packet handling for RX streaming transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxControl {
    /// Deterministic length.
    #[default]
    NoPacket,
    /// Stop at the first end-of-packet, or at `len` bytes.
    EndOnEop,
}

/// Final state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Not yet complete.
    Pending,
    Success,
    /// Still queued when its channel or engine closed.
    Cancelled,
    /// A hardware wait exceeded the configured timeout.
    TimedOut { timeout_ms: u64 },
    /// Dispatcher stopped on an error; `status` is the CSR status word.
    StoppedOnError { status: u32 },
    /// Dispatcher stopped on early termination.
    StoppedOnEarlyTermination { status: u32 },
    /// Any other failure; see [`TransferStatus::error`].
    Failed,
}

impl CompletionStatus {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Pending | Self::Success)
    }
}

/// Result fields of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    pub status: CompletionStatus,
    /// Bytes moved. For RX streaming this is the received byte count.
    pub bytes_transferred: u64,
    /// RX streaming only: the transfer ended on an end-of-packet.
    pub eop_arrived: bool,
    /// Description of a `Failed` status.
    pub error: Option<String>,
}

impl TransferStatus {
    pub(crate) fn pending() -> Self {
        Self {
            status: CompletionStatus::Pending,
            bytes_transferred: 0,
            eop_arrived: false,
            error: None,
        }
    }

    pub(crate) fn success(bytes_transferred: u64, eop_arrived: bool) -> Self {
        Self {
            status: CompletionStatus::Success,
            bytes_transferred,
            eop_arrived,
            error: None,
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            status: CompletionStatus::Cancelled,
            ..Self::pending()
        }
    }

    pub(crate) fn from_error(err: &DmaError, bytes_transferred: u64, eop_arrived: bool) -> Self {
        use crate::regs::CsrStatus;

        let status = match err {
            DmaError::Timeout { timeout_ms, .. } => CompletionStatus::TimedOut {
                timeout_ms: *timeout_ms,
            },
            DmaError::Cancelled => CompletionStatus::Cancelled,
            DmaError::HardwareStopped { status, .. } => {
                if CsrStatus::from_bits_retain(*status).contains(CsrStatus::STOPPED_ON_EARLY_TERM) {
                    CompletionStatus::StoppedOnEarlyTermination { status: *status }
                } else {
                    CompletionStatus::StoppedOnError { status: *status }
                }
            }
            _ => CompletionStatus::Failed,
        };
        Self {
            status,
            bytes_transferred,
            eop_arrived,
            error: Some(err.to_string()),
        }
    }

    /// Turn a failed status into the matching error.
    ///
    /// # Errors
    ///
    /// Every status other than `Success` maps to a `DmaError`.
    pub fn into_result(self) -> DmaResult<Self> {
        match self.status {
            CompletionStatus::Success => Ok(self),
            CompletionStatus::Pending => {
                Err(DmaError::Busy("transfer has not completed".to_string()))
            }
            CompletionStatus::Cancelled => Err(DmaError::Cancelled),
            CompletionStatus::TimedOut { timeout_ms } => Err(DmaError::Timeout {
                what: "hardware completion",
                timeout_ms,
            }),
            CompletionStatus::StoppedOnError { status }
            | CompletionStatus::StoppedOnEarlyTermination { status } => {
                Err(DmaError::HardwareStopped {
                    status,
                    bytes_transferred: self.bytes_transferred,
                })
            }
            CompletionStatus::Failed => Err(DmaError::TransferFailed(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }
}

/// Completion callback. Runs on the engine's completion thread and must not
/// block for long.
pub type TransferCallback = Arc<dyn Fn(&TransferStatus) + Send + Sync>;

/// A pinned buffer owned by a small transfer.
///
/// Returned to the pool, and to the engine's small-buffer quota, when the
/// transfer that owns it is dropped.
pub struct SmallBuffer {
    lease: Option<BufferLease>,
    pool: Arc<BufferPool>,
    outstanding: Arc<AtomicUsize>,
}

impl SmallBuffer {
    pub(crate) fn new(lease: BufferLease, pool: Arc<BufferPool>, outstanding: Arc<AtomicUsize>) -> Self {
        Self {
            lease: Some(lease),
            pool,
            outstanding,
        }
    }

    /// Host address of the first byte; use it for `src`/`dst`.
    pub fn addr(&self) -> u64 {
        self.lease.as_ref().map_or(0, |l| l.as_ptr() as u64)
    }

    pub fn len(&self) -> usize {
        self.lease.as_ref().map_or(0, BufferLease::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn iova(&self) -> u64 {
        self.lease.as_ref().map_or(0, BufferLease::iova)
    }

    /// Offset of `[addr, addr + len)` inside this buffer, if it lies inside.
    pub(crate) fn offset_of(&self, addr: u64, len: u64) -> Option<u64> {
        let base = self.addr();
        let end = base + self.len() as u64;
        (addr >= base && addr.checked_add(len)? <= end).then(|| addr - base)
    }
}

impl fmt::Debug for SmallBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmallBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for SmallBuffer {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.release(lease);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// ============================================================================
// Poll-mode event descriptor
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::os::unix::io::RawFd;

    /// Non-blocking eventfd signalled at completion.
    #[derive(Debug)]
    pub struct CompletionFd {
        fd: RawFd,
    }

    impl CompletionFd {
        pub fn new() -> DmaResult<Self> {
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
            if fd < 0 {
                return Err(DmaError::Io(std::io::Error::last_os_error()));
            }
            Ok(Self { fd })
        }

        pub fn raw_fd(&self) -> RawFd {
            self.fd
        }

        pub fn signal(&self) {
            let one: u64 = 1;
            let rc = unsafe { libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8) };
            if rc != 8 {
                log::warn!("eventfd write failed: {}", std::io::Error::last_os_error());
            }
        }

        /// Consume any pending signal.
        pub fn reset(&self) {
            let mut count: u64 = 0;
            unsafe {
                libc::read(self.fd, &mut count as *mut u64 as *mut libc::c_void, 8);
            }
        }
    }

    impl Drop for CompletionFd {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod stub_impl {
    use super::*;

    /// Poll mode needs eventfd; unavailable here.
    #[derive(Debug)]
    pub struct CompletionFd {
        _private: (),
    }

    impl CompletionFd {
        pub fn new() -> DmaResult<Self> {
            Err(DmaError::PlatformNotSupported)
        }

        pub fn raw_fd(&self) -> i32 {
            -1
        }

        pub fn signal(&self) {}

        pub fn reset(&self) {}
    }
}

#[cfg(target_os = "linux")]
use linux_impl::CompletionFd;

#[cfg(not(target_os = "linux"))]
use stub_impl::CompletionFd;

/// How completion is reported; at most one mode is armed.
#[derive(Clone)]
enum NotifyMode {
    Blocking,
    Poll(Arc<CompletionFd>),
    Callback(TransferCallback),
}

/// Per-start notification target, moved through the completion path.
pub(crate) enum Notifier {
    Blocking,
    Poll(Arc<CompletionFd>),
    Callback(TransferCallback),
    #[cfg(feature = "async")]
    Async(tokio::sync::oneshot::Sender<TransferStatus>),
}

impl Notifier {
    /// The submitter waits in `transfer_start`.
    pub(crate) fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking)
    }
}

#[derive(Clone, Copy)]
struct TransferAttrs {
    src: u64,
    dst: u64,
    len: u64,
    transfer_type: TransferType,
    tx_control: TxControl,
    rx_control: RxControl,
}

impl TransferAttrs {
    fn defaults(ch_type: ChannelType) -> Self {
        Self {
            src: 0,
            dst: 0,
            len: 0,
            transfer_type: TransferType::default_for(ch_type),
            tx_control: TxControl::NoPacket,
            rx_control: RxControl::NoPacket,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InProgress,
    Complete,
}

struct TransferState {
    attrs: TransferAttrs,
    notify: NotifyMode,
    phase: Phase,
    result: TransferStatus,
}

pub(crate) struct TransferInner {
    id: u64,
    channel_type: ChannelType,
    state: Mutex<TransferState>,
    done: Condvar,
    small: Option<SmallBuffer>,
}

/// Snapshot of a transfer taken when it is started.
pub(crate) struct TransferRequest {
    pub transfer: Arc<TransferInner>,
    pub src: u64,
    pub dst: u64,
    pub len: u64,
    pub transfer_type: TransferType,
    pub tx_control: TxControl,
    pub rx_control: RxControl,
    pub notifier: Notifier,
}

impl TransferRequest {
    pub fn id(&self) -> u64 {
        self.transfer.id
    }

    pub fn small_buffer(&self) -> Option<&SmallBuffer> {
        self.transfer.small.as_ref()
    }
}

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// One logical DMA transfer.
pub struct Transfer {
    inner: Arc<TransferInner>,
}

impl Transfer {
    pub(crate) fn new(channel_type: ChannelType, small: Option<SmallBuffer>) -> Self {
        Self {
            inner: Arc::new(TransferInner {
                id: NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed),
                channel_type,
                state: Mutex::new(TransferState {
                    attrs: TransferAttrs::defaults(channel_type),
                    notify: NotifyMode::Blocking,
                    phase: Phase::Idle,
                    result: TransferStatus::pending(),
                }),
                done: Condvar::new(),
                small,
            }),
        }
    }

    /// Process-unique transfer id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Type of the channel this transfer was created on.
    pub fn channel_type(&self) -> ChannelType {
        self.inner.channel_type
    }

    fn update<F: FnOnce(&mut TransferState)>(&self, f: F) -> DmaResult<()> {
        let mut state = lock(&self.inner.state);
        if state.phase == Phase::InProgress {
            return Err(DmaError::Busy(format!("transfer {} in progress", self.inner.id)));
        }
        f(&mut state);
        Ok(())
    }

    /// Restore default attributes and blocking notification.
    ///
    /// # Errors
    ///
    /// `DmaError::Busy` while the transfer is in progress (as for every setter).
    pub fn reset(&self) -> DmaResult<()> {
        let ch_type = self.inner.channel_type;
        self.update(|s| {
            s.attrs = TransferAttrs::defaults(ch_type);
            s.notify = NotifyMode::Blocking;
            s.phase = Phase::Idle;
            s.result = TransferStatus::pending();
        })
    }

    pub fn set_src(&self, src: u64) -> DmaResult<()> {
        self.update(|s| s.attrs.src = src)
    }

    pub fn set_dst(&self, dst: u64) -> DmaResult<()> {
        self.update(|s| s.attrs.dst = dst)
    }

    pub fn set_len(&self, len: u64) -> DmaResult<()> {
        self.update(|s| s.attrs.len = len)
    }

    pub fn set_type(&self, transfer_type: TransferType) -> DmaResult<()> {
        self.update(|s| s.attrs.transfer_type = transfer_type)
    }

    pub fn set_tx_control(&self, ctrl: TxControl) -> DmaResult<()> {
        self.update(|s| s.attrs.tx_control = ctrl)
    }

    pub fn set_rx_control(&self, ctrl: RxControl) -> DmaResult<()> {
        self.update(|s| s.attrs.rx_control = ctrl)
    }

    /// Arm callback notification, replacing poll or blocking mode.
    pub fn set_callback<F>(&self, callback: F) -> DmaResult<()>
    where
        F: Fn(&TransferStatus) + Send + Sync + 'static,
    {
        let callback: TransferCallback = Arc::new(callback);
        self.update(|s| s.notify = NotifyMode::Callback(callback))
    }

    /// Arm poll notification and return the descriptor to poll.
    ///
    /// The descriptor becomes readable when the transfer completes; collect
    /// the result with [`wait`](Self::wait) or [`status`](Self::status).
    ///
    /// # Errors
    ///
    /// `DmaError::PlatformNotSupported` where eventfd is unavailable.
    pub fn enable_poll(&self) -> DmaResult<i32> {
        let fd = Arc::new(CompletionFd::new()?);
        let raw = fd.raw_fd();
        self.update(|s| s.notify = NotifyMode::Poll(fd))?;
        Ok(raw)
    }

    /// Bytes moved by the last completed start.
    pub fn bytes_transferred(&self) -> u64 {
        lock(&self.inner.state).result.bytes_transferred
    }

    /// Whether the last RX start ended on an end-of-packet.
    pub fn eop_arrived(&self) -> bool {
        lock(&self.inner.state).result.eop_arrived
    }

    pub fn status(&self) -> TransferStatus {
        lock(&self.inner.state).result.clone()
    }

    pub fn is_in_progress(&self) -> bool {
        lock(&self.inner.state).phase == Phase::InProgress
    }

    /// Wait for an in-progress transfer to finish.
    ///
    /// Returns immediately with the current result if none is in progress.
    ///
    /// # Errors
    ///
    /// `DmaError::Timeout` if the transfer did not complete in time.
    pub fn wait(&self, timeout: Duration) -> DmaResult<TransferStatus> {
        self.inner.wait(Some(timeout))
    }

    /// The pinned buffer of a small transfer.
    pub fn small_buffer(&self) -> Option<&SmallBuffer> {
        self.inner.small.as_ref()
    }

    /// Access the small buffer's bytes while no DMA is using them.
    ///
    /// # Errors
    ///
    /// `DmaError::InvalidParam` if this is not a small transfer and
    /// `DmaError::Busy` while it is in progress.
    pub fn with_small_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> DmaResult<R> {
        let small = self
            .inner
            .small
            .as_ref()
            .ok_or_else(|| DmaError::InvalidParam("not a small transfer".to_string()))?;
        let state = lock(&self.inner.state);
        if state.phase == Phase::InProgress {
            return Err(DmaError::Busy(format!("transfer {} in progress", self.inner.id)));
        }
        // SAFETY: the buffer is pinned for the lifetime of `small`; holding
        // the state lock keeps the transfer from being started meanwhile.
        let bytes = unsafe { std::slice::from_raw_parts_mut(small.addr() as *mut u8, small.len()) };
        let r = f(bytes);
        drop(state);
        Ok(r)
    }

    pub(crate) fn inner(&self) -> &Arc<TransferInner> {
        &self.inner
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Transfer")
            .field("id", &self.inner.id)
            .field("type", &state.attrs.transfer_type)
            .field("src", &format_args!("{:#x}", state.attrs.src))
            .field("dst", &format_args!("{:#x}", state.attrs.dst))
            .field("len", &state.attrs.len)
            .field("phase", &state.phase)
            .finish()
    }
}

impl TransferInner {
    /// Move to in-progress and snapshot the attributes.
    ///
    /// `override_notifier` replaces the armed notification for this start only.
    pub(crate) fn begin(self: &Arc<Self>, override_notifier: Option<Notifier>) -> DmaResult<TransferRequest> {
        let mut state = lock(&self.state);
        if state.phase == Phase::InProgress {
            return Err(DmaError::Busy(format!("transfer {} already in progress", self.id)));
        }
        state.phase = Phase::InProgress;
        state.result = TransferStatus::pending();

        let notifier = match override_notifier {
            Some(n) => n,
            None => match &state.notify {
                NotifyMode::Blocking => Notifier::Blocking,
                NotifyMode::Poll(fd) => {
                    fd.reset();
                    Notifier::Poll(Arc::clone(fd))
                }
                NotifyMode::Callback(cb) => Notifier::Callback(Arc::clone(cb)),
            },
        };

        let a = state.attrs;
        Ok(TransferRequest {
            transfer: Arc::clone(self),
            src: a.src,
            dst: a.dst,
            len: a.len,
            transfer_type: a.transfer_type,
            tx_control: a.tx_control,
            rx_control: a.rx_control,
            notifier,
        })
    }

    /// Undo [`begin`](Self::begin) when the request never reached a queue.
    pub(crate) fn abort_begin(&self) {
        let mut state = lock(&self.state);
        state.phase = Phase::Idle;
    }

    /// Record the result, wake a blocked submitter and fire the notifier.
    pub(crate) fn complete(&self, result: TransferStatus, notifier: Notifier) {
        {
            let mut state = lock(&self.state);
            state.phase = Phase::Complete;
            state.result = result.clone();
        }
        self.done.notify_all();

        match notifier {
            Notifier::Blocking => {}
            Notifier::Poll(fd) => fd.signal(),
            Notifier::Callback(cb) => cb(&result),
            #[cfg(feature = "async")]
            Notifier::Async(tx) => {
                let _ = tx.send(result);
            }
        }
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> DmaResult<TransferStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.state);
        while state.phase == Phase::InProgress {
            state = match deadline {
                None => self.done.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DmaError::timeout(
                            "transfer completion",
                            timeout.unwrap_or_default(),
                        ));
                    }
                    self.done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        Ok(state.result.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    #[test]
    fn test_defaults_follow_channel_type() {
        let t = Transfer::new(ChannelType::RxSt, None);
        let req = t.inner().begin(None).unwrap();
        assert_eq!(req.transfer_type, TransferType::FpgaToHostSt);
        assert_eq!(req.rx_control, RxControl::NoPacket);
        assert!(req.notifier.is_blocking());
    }

    #[test]
    fn test_setters_rejected_in_progress() {
        let t = Transfer::new(ChannelType::Mm, None);
        t.set_len(4096).unwrap();
        let req = t.inner().begin(None).unwrap();
        assert_eq!(req.len, 4096);
        assert!(matches!(t.set_len(1), Err(DmaError::Busy(_))));
        assert!(matches!(t.inner().begin(None), Err(DmaError::Busy(_))));

        t.inner().complete(TransferStatus::success(4096, false), req.notifier);
        t.set_len(1).unwrap();
        assert_eq!(t.bytes_transferred(), 4096);
    }

    #[test]
    fn test_callback_replaces_blocking() {
        let t = Transfer::new(ChannelType::TxSt, None);
        let hits = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&hits);
        t.set_callback(move |status| {
            assert!(status.status.is_success());
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let req = t.inner().begin(None).unwrap();
        assert!(!req.notifier.is_blocking());
        t.inner().complete(TransferStatus::success(64, false), req.notifier);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        t.reset().unwrap();
        assert!(t.inner().begin(None).unwrap().notifier.is_blocking());
    }

    #[test]
    fn test_wait_wakes_on_complete() {
        let t = Transfer::new(ChannelType::Mm, None);
        let req = t.inner().begin(None).unwrap();
        let inner = Arc::clone(t.inner());
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            inner.complete(TransferStatus::success(128, true), req.notifier);
        });
        let status = t.wait(Duration::from_secs(5)).unwrap();
        completer.join().unwrap();
        assert_eq!(status.bytes_transferred, 128);
        assert!(t.eop_arrived());
    }

    #[test]
    fn test_wait_timeout() {
        let t = Transfer::new(ChannelType::Mm, None);
        let _req = t.inner().begin(None).unwrap();
        assert!(matches!(
            t.wait(Duration::from_millis(5)),
            Err(DmaError::Timeout { .. })
        ));
    }

    #[test]
    fn test_status_into_result() {
        let err = DmaError::HardwareStopped {
            status: crate::regs::CsrStatus::STOPPED_ON_ERROR.bits(),
            bytes_transferred: 10,
        };
        let status = TransferStatus::from_error(&err, 10, false);
        assert!(matches!(status.status, CompletionStatus::StoppedOnError { .. }));
        assert!(matches!(
            status.into_result(),
            Err(DmaError::HardwareStopped { bytes_transferred: 10, .. })
        ));
        assert!(matches!(
            TransferStatus::cancelled().into_result(),
            Err(DmaError::Cancelled)
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_poll_fd_becomes_readable() {
        let t = Transfer::new(ChannelType::Mm, None);
        let fd = t.enable_poll().unwrap();
        let req = t.inner().begin(None).unwrap();

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 0);
        t.inner().complete(TransferStatus::success(1, false), req.notifier);
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 1000) }, 1);
    }
}
