// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Synchronization helpers: poison-tolerant locking, a counting semaphore
//! used to gate ring slots, queue entries and worker start-up, and register
//! polling with back-off.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting semaphore with timed acquire.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Take a permit if one is available.
    pub fn try_acquire(&self) -> bool {
        let mut permits = lock(&self.permits);
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, waiting at most `timeout`.
    ///
    /// Returns `false` if no permit became available in time.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            permits = self
                .cond
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *permits -= 1;
        true
    }

    /// Take a permit, waiting indefinitely.
    pub fn acquire(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    pub fn release(&self) {
        let mut permits = lock(&self.permits);
        *permits += 1;
        self.cond.notify_one();
    }

    pub fn available(&self) -> usize {
        *lock(&self.permits)
    }
}

/// Spin, then yield, then sleep with growing pauses.
///
/// Used wherever a register is polled until a bit changes.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

const SPIN_STEPS: u32 = 64;
const YIELD_STEPS: u32 = 128;
const MAX_SLEEP: Duration = Duration::from_millis(1);

impl Backoff {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < SPIN_STEPS {
            core::hint::spin_loop();
        } else if self.step < YIELD_STEPS {
            std::thread::yield_now();
        } else {
            let shift = (self.step - YIELD_STEPS).min(10);
            std::thread::sleep(Duration::from_micros(1 << shift).min(MAX_SLEEP));
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Poll `check` until it yields a value or `timeout` expires.
pub(crate) fn poll_until<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    let mut backoff = Backoff::new();
    loop {
        if let Some(v) = check() {
            return Some(v);
        }
        if Instant::now() >= deadline {
            return None;
        }
        backoff.snooze();
    }
}
