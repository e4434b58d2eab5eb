// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Descriptor ring.
//!
//! Tracks descriptors handed to a channel's dispatcher until the hardware
//! retires them. The ring stamps each descriptor with a sequence number so
//! completions can be matched against submissions in FIFO order.
//!
//! The free-slot count is a [`Semaphore`]; indices and slots sit behind a
//! separate mutex. `write - read (mod capacity)` always equals the number
//! of outstanding descriptors.

use crate::descriptor::MsgdmaDescriptor;
use crate::error::{DmaError, DmaResult};
use crate::sync::{lock, Semaphore};
use std::sync::Mutex;
use std::time::Duration;

/// What to do when the ring has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPolicy {
    /// Fail immediately with `DmaError::Busy`.
    NonBlocking,
    /// Wait for a slot, failing with `DmaError::Timeout` after the duration.
    Block(Duration),
}

struct RingState {
    slots: Vec<Option<MsgdmaDescriptor>>,
    read: usize,
    write: usize,
    used: usize,
    next_seq: u16,
}

impl RingState {
    #[inline]
    fn check(&self) {
        let cap = self.slots.len();
        debug_assert!(self.read < cap && self.write < cap);
        debug_assert_eq!((self.write + cap - self.read) % cap, self.used % cap);
    }
}

/// Fixed-capacity circular buffer of in-flight descriptors.
pub struct DescriptorRing {
    state: Mutex<RingState>,
    free: Semaphore,
    capacity: usize,
}

impl DescriptorRing {
    /// # Errors
    ///
    /// Returns `DmaError::InvalidParam` for a zero capacity.
    pub fn new(capacity: usize) -> DmaResult<Self> {
        if capacity == 0 {
            return Err(DmaError::InvalidParam("ring capacity must be non-zero".into()));
        }
        Ok(Self {
            state: Mutex::new(RingState {
                slots: vec![None; capacity],
                read: 0,
                write: 0,
                used: 0,
                next_seq: 0,
            }),
            free: Semaphore::new(capacity),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of descriptors pushed and not yet popped.
    pub fn outstanding(&self) -> usize {
        lock(&self.state).used
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }

    /// Current `(read, write)` indices.
    pub fn indices(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.read, state.write)
    }

    /// Claim a slot for `desc` and stamp it with the next sequence number.
    ///
    /// Returns the stamped descriptor, ready to be written to hardware.
    ///
    /// # Errors
    ///
    /// `DmaError::Busy` when the ring is full under
    /// [`PushPolicy::NonBlocking`], `DmaError::Timeout` when no slot freed
    /// up in time under [`PushPolicy::Block`].
    pub fn push(&self, mut desc: MsgdmaDescriptor, policy: PushPolicy) -> DmaResult<MsgdmaDescriptor> {
        let acquired = match policy {
            PushPolicy::NonBlocking => self.free.try_acquire(),
            PushPolicy::Block(timeout) => self.free.acquire_timeout(timeout),
        };
        if !acquired {
            return Err(match policy {
                PushPolicy::NonBlocking => {
                    DmaError::Busy(format!("descriptor ring full ({} slots)", self.capacity))
                }
                PushPolicy::Block(timeout) => DmaError::timeout("descriptor ring slot", timeout),
            });
        }

        let mut state = lock(&self.state);
        desc.seq_num = state.next_seq;
        state.next_seq = state.next_seq.wrapping_add(1);
        let write = state.write;
        state.slots[write] = Some(desc);
        state.write = (write + 1) % self.capacity;
        state.used += 1;
        state.check();
        Ok(desc)
    }

    /// Retire the oldest descriptor.
    pub fn pop(&self) -> Option<MsgdmaDescriptor> {
        let mut state = lock(&self.state);
        if state.used == 0 {
            return None;
        }
        let read = state.read;
        let desc = state.slots[read].take();
        state.read = (read + 1) % self.capacity;
        state.used -= 1;
        state.check();
        drop(state);
        self.free.release();
        desc
    }

    /// Retire descriptors up to and including the one stamped `seq`.
    ///
    /// Returns how many were retired.
    pub fn retire_through(&self, seq: u16) -> usize {
        let mut retired = 0;
        while let Some(desc) = self.pop() {
            retired += 1;
            if desc.seq_num == seq {
                return retired;
            }
        }
        log::warn!("Descriptor seq {} not outstanding, retired {}", seq, retired);
        retired
    }

    /// Retire everything; used after the dispatcher has been flushed.
    pub fn clear(&self) -> usize {
        let mut retired = 0;
        while self.pop().is_some() {
            retired += 1;
        }
        retired
    }
}
