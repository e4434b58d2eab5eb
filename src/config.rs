// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Engine configuration.

use std::time::Duration;

/// How channel workers learn that the hardware finished a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Block on the channel's interrupt vector.
    #[default]
    Interrupt,
    /// Poll the CSR IRQ bit, spinning first and then backing off.
    Polling,
}

/// Policy constants of a [`DmaEngine`](crate::DmaEngine).
///
/// The defaults reproduce the fixed limits of the reference driver.
///
/// ```
/// use fpga_msgdma::{CompletionMode, EngineConfig};
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_timeout(Duration::from_secs(5))
///     .with_completion_mode(CompletionMode::Polling);
/// assert_eq!(config.max_small_buffers, 4);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on every hardware wait (descriptor slot, interrupt, fence,
    /// dispatcher stop/reset) and on queueing a request.
    pub timeout: Duration,
    /// Entries in each channel's request queue and in the completion queue.
    pub queue_capacity: usize,
    /// Descriptors a channel keeps outstanding in its ring.
    pub ring_capacity: usize,
    /// Concurrent small-transfer buffers per engine.
    pub max_small_buffers: usize,
    /// Pinned 2 MiB buffers one transfer may hold.
    pub buffers_per_transfer: usize,
    pub completion_mode: CompletionMode,
    /// How long `open`/`open_channel` wait for a started thread to report in.
    pub startup_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            queue_capacity: 100_000,
            ring_capacity: 64,
            max_small_buffers: 4,
            buffers_per_transfer: 8,
            completion_mode: CompletionMode::Interrupt,
            startup_timeout: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn with_max_small_buffers(mut self, max: usize) -> Self {
        self.max_small_buffers = max;
        self
    }

    pub fn with_buffers_per_transfer(mut self, buffers: usize) -> Self {
        self.buffers_per_transfer = buffers;
        self
    }

    pub fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        self.completion_mode = mode;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Reject values the engine cannot run with.
    pub(crate) fn validate(&self) -> crate::DmaResult<()> {
        let zero = [
            ("queue_capacity", self.queue_capacity),
            ("ring_capacity", self.ring_capacity),
            ("buffers_per_transfer", self.buffers_per_transfer),
        ]
        .into_iter()
        .find(|&(_, v)| v == 0);
        if let Some((name, _)) = zero {
            return Err(crate::DmaError::InvalidParam(format!("{} must be non-zero", name)));
        }
        // A transfer keeps up to three burst segments per staged chunk plus
        // a fence in flight.
        if self.ring_capacity < 4 * self.buffers_per_transfer {
            return Err(crate::DmaError::InvalidParam(format!(
                "ring_capacity {} below 4 x buffers_per_transfer ({})",
                self.ring_capacity, self.buffers_per_transfer
            )));
        }
        if self.timeout.is_zero() {
            return Err(crate::DmaError::InvalidParam("timeout must be non-zero".into()));
        }
        Ok(())
    }
}
