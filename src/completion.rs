// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Worker and completion threads.
//!
//! Every open channel runs one worker. It takes requests from the channel
//! queue in order, leases staging buffers, drives the hardware and posts a
//! [`Completion`]. A single dispatcher per engine turns completions into
//! results: buffers go back to the pool, blocked submitters wake up and
//! callbacks run, outside the workers.

use crate::channel::{ChannelKind, ChannelOps, HwChannel, Progress};
use crate::error::{DmaError, DmaResult};
use crate::pool::{BufferLease, BufferPool, BUFFER_SIZE};
use crate::queue::TransferQueue;
use crate::sync::Semaphore;
use crate::transfer::{TransferRequest, TransferStatus};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A finished (or cancelled) request on its way to the dispatcher.
pub(crate) struct Completion {
    request: TransferRequest,
    status: TransferStatus,
    leases: Vec<BufferLease>,
}

impl Completion {
    pub(crate) fn cancelled(request: TransferRequest) -> Self {
        Self {
            request,
            status: TransferStatus::cancelled(),
            leases: Vec::new(),
        }
    }

    /// Hand the completion to the dispatcher, or deliver it here when the
    /// completion queue is full.
    pub(crate) fn post(self, completions: &TransferQueue<Completion>, pool: &BufferPool) {
        if let Err(completion) = completions.try_enqueue(self) {
            log::debug!(
                "Completion queue full, delivering transfer {} inline",
                completion.request.id()
            );
            completion.deliver(pool);
        }
    }

    /// Release the leases and publish the result.
    pub(crate) fn deliver(self, pool: &BufferPool) {
        let Self {
            request,
            status,
            leases,
        } = self;
        for lease in leases {
            pool.release(lease);
        }
        log::debug!(
            "Transfer {} done: {:?}, {} bytes",
            request.id(),
            status.status,
            status.bytes_transferred
        );
        request.transfer.complete(status, request.notifier);
    }
}

/// Join handle of a worker together with its exit signal, so a join can
/// be bounded.
pub(crate) struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    exited: Arc<Semaphore>,
}

impl WorkerHandle {
    /// Wait up to `timeout` for the worker to exit.
    ///
    /// # Errors
    ///
    /// `DmaError::Busy` if it is still running; the handle stays valid so
    /// the join can be retried.
    pub(crate) fn join(&mut self, timeout: Duration) -> DmaResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if !self.exited.acquire_timeout(timeout) {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            self.thread = Some(thread);
            return Err(DmaError::Busy(format!("{} still running a transfer", name)));
        }
        if thread.join().is_err() {
            log::error!("Worker thread panicked");
        }
        Ok(())
    }
}

fn thread_name(kind: &ChannelKind, index: usize) -> String {
    let tag = match kind {
        ChannelKind::Tx(_) => "tx",
        ChannelKind::Rx(_) => "rx",
        ChannelKind::Mm(_) => "mm",
    };
    format!("msgdma-{}-{}", tag, index)
}

/// Spawn a thread and wait until it is running.
fn spawn_checked<F>(name: String, startup: Duration, body: F) -> DmaResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let started = Arc::new(Semaphore::new(0));
    let signal = Arc::clone(&started);
    let thread = thread::Builder::new().name(name.clone()).spawn(move || {
        signal.release();
        body();
    })?;
    if !started.acquire_timeout(startup) {
        // The thread exits on its own once it sees its queue shut down.
        return Err(DmaError::timeout("worker start", startup));
    }
    log::debug!("Started {}", name);
    Ok(thread)
}

fn acquire_leases(pool: &BufferPool, count: usize, timeout: Duration) -> DmaResult<Vec<BufferLease>> {
    let mut leases = Vec::with_capacity(count);
    for _ in 0..count {
        match pool.acquire(BUFFER_SIZE, timeout) {
            Ok(lease) => leases.push(lease),
            Err(e) => {
                for lease in leases {
                    pool.release(lease);
                }
                return Err(e);
            }
        }
    }
    Ok(leases)
}

fn run_one(
    kind: &mut ChannelKind,
    hw: &HwChannel,
    pool: &BufferPool,
    request: TransferRequest,
) -> Completion {
    let config = hw.config();
    let needed = kind.buffers_needed(&request).min(config.buffers_per_transfer);
    let leases = match acquire_leases(pool, needed, config.timeout) {
        Ok(leases) => leases,
        Err(e) => {
            log::warn!("Transfer {}: no staging buffers: {}", request.id(), e);
            return Completion {
                status: TransferStatus::from_error(&e, 0, false),
                request,
                leases: Vec::new(),
            };
        }
    };

    let mut progress = Progress::default();
    let status = match kind.execute(hw, &request, &leases, &mut progress) {
        Ok(()) => TransferStatus::success(progress.bytes, progress.eop),
        Err(DmaError::HardwareStopped { status, .. }) => {
            let e = DmaError::HardwareStopped {
                status,
                bytes_transferred: progress.bytes,
            };
            log::error!("Transfer {}: {}", request.id(), e);
            TransferStatus::from_error(&e, progress.bytes, progress.eop)
        }
        Err(e) => {
            log::error!("Transfer {}: {}", request.id(), e);
            TransferStatus::from_error(&e, progress.bytes, progress.eop)
        }
    };
    Completion {
        request,
        status,
        leases,
    }
}

/// Start the worker of one channel.
pub(crate) fn spawn_worker(
    mut kind: ChannelKind,
    hw: Arc<HwChannel>,
    queue: Arc<TransferQueue<TransferRequest>>,
    pool: Arc<BufferPool>,
    completions: Arc<TransferQueue<Completion>>,
) -> DmaResult<WorkerHandle> {
    let name = thread_name(&kind, hw.desc().index);
    let startup = hw.config().startup_timeout;
    let exited = Arc::new(Semaphore::new(0));
    let exit_signal = Arc::clone(&exited);
    let requests = Arc::clone(&queue);

    let spawned = spawn_checked(name, startup, move || {
        let _exit = scopeguard::guard(exit_signal, |s| s.release());
        while let Some(request) = queue.dequeue() {
            log::trace!(
                "Channel {}: run transfer {} ({} bytes)",
                hw.desc().index,
                request.id(),
                request.len
            );
            run_one(&mut kind, &hw, &pool, request).post(&completions, &pool);
        }
        log::debug!("Channel {} worker exiting", hw.desc().index);
    });
    if spawned.is_err() {
        requests.shutdown();
    }
    Ok(WorkerHandle {
        thread: Some(spawned?),
        exited,
    })
}

/// Start the engine's completion dispatcher.
pub(crate) fn spawn_dispatcher(
    pool: Arc<BufferPool>,
    completions: Arc<TransferQueue<Completion>>,
    startup: Duration,
) -> DmaResult<JoinHandle<()>> {
    let queue = Arc::clone(&completions);
    let spawned = spawn_checked("msgdma-completion".to_string(), startup, move || {
        while let Some(completion) = completions.dequeue() {
            let id = completion.request.id();
            if panic::catch_unwind(AssertUnwindSafe(|| completion.deliver(&pool))).is_err() {
                log::error!("Completion callback of transfer {} panicked", id);
            }
        }
        log::debug!("Completion dispatcher exiting");
    });
    if spawned.is_err() {
        queue.shutdown();
    }
    spawned
}
