// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Bounded transfer request queue.
//!
//! Each open channel has one of these for pending requests, and the engine
//! has one for completed transfers waiting to be dispatched. Capacity is
//! enforced up front; storage grows on demand.
//!
//! The queue pairs one lock (protecting the entries) with two counting
//! semaphores: `items` wakes the consumer, `space` gates producers. Once
//! shut down the queue refuses new items and wakes blocked producers.

use crate::error::{DmaError, DmaResult};
use crate::sync::{lock, Semaphore};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

enum Entry<T> {
    Item(T),
    Shutdown,
}

enum Popped<T> {
    Item(T),
    Shutdown,
    Drained,
}

struct Entries<T> {
    queue: VecDeque<Entry<T>>,
    closed: bool,
}

/// A bounded MPSC queue with a shutdown sentinel.
pub struct TransferQueue<T> {
    entries: Mutex<Entries<T>>,
    items: Semaphore,
    space: Semaphore,
    capacity: usize,
}

impl<T> TransferQueue<T> {
    /// # Errors
    ///
    /// Returns `DmaError::InvalidParam` for a zero capacity.
    pub fn new(capacity: usize) -> DmaResult<Self> {
        if capacity == 0 {
            return Err(DmaError::InvalidParam("queue capacity must be non-zero".into()));
        }
        Ok(Self {
            entries: Mutex::new(Entries {
                queue: VecDeque::new(),
                closed: false,
            }),
            items: Semaphore::new(0),
            space: Semaphore::new(capacity),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.entries).closed
    }

    /// Push an item whose `space` permit is already held.
    fn push(&self, item: T) -> Result<(), T> {
        let mut entries = lock(&self.entries);
        if entries.closed {
            drop(entries);
            // Pass the permit on so the next blocked producer also wakes.
            self.space.release();
            return Err(item);
        }
        entries.queue.push_back(Entry::Item(item));
        drop(entries);
        self.items.release();
        Ok(())
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// Returns the item back inside `Err` if the queue is at capacity or
    /// shut down.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        if !self.space.try_acquire() {
            return Err(item);
        }
        self.push(item)
    }

    /// Enqueue, waiting up to `timeout` for space.
    ///
    /// # Errors
    ///
    /// Returns the item and `DmaError::Busy` if the queue stayed full, or
    /// `DmaError::Cancelled` if it was shut down before or during the wait.
    pub fn enqueue_timeout(&self, item: T, timeout: Duration) -> Result<(), (T, DmaError)> {
        if !self.space.acquire_timeout(timeout) {
            let err = DmaError::Busy(format!("transfer queue full ({} entries)", self.capacity));
            return Err((item, err));
        }
        self.push(item).map_err(|item| (item, DmaError::Cancelled))
    }

    /// Wake the consumer with a shutdown marker and refuse further items.
    ///
    /// The marker does not take capacity so shutdown never blocks. Entries
    /// queued before it are still delivered. Producers waiting for space
    /// are woken and get their item back.
    pub fn shutdown(&self) {
        let mut entries = lock(&self.entries);
        if entries.closed {
            return;
        }
        entries.closed = true;
        entries.queue.push_back(Entry::Shutdown);
        drop(entries);
        self.items.release();
        self.space.release();
    }

    /// Block until an entry is available. Returns `None` at the shutdown marker.
    pub fn dequeue(&self) -> Option<T> {
        loop {
            self.items.acquire();
            match self.pop() {
                Popped::Item(item) => return Some(item),
                Popped::Shutdown => return None,
                Popped::Drained => continue,
            }
        }
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    ///
    /// Returns `Ok(None)` at the shutdown marker.
    ///
    /// # Errors
    ///
    /// Returns `DmaError::Timeout` if nothing arrived.
    pub fn dequeue_timeout(&self, timeout: Duration) -> DmaResult<Option<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.items.acquire_timeout(remaining) {
                return Err(DmaError::timeout("transfer queue entry", timeout));
            }
            match self.pop() {
                Popped::Item(item) => return Ok(Some(item)),
                Popped::Shutdown => return Ok(None),
                Popped::Drained => continue,
            }
        }
    }

    fn pop(&self) -> Popped<T> {
        match lock(&self.entries).queue.pop_front() {
            Some(Entry::Item(item)) => {
                self.space.release();
                Popped::Item(item)
            }
            Some(Entry::Shutdown) => Popped::Shutdown,
            // A concurrent drain took the entry this permit was issued for.
            None => Popped::Drained,
        }
    }

    /// Remove every queued item, leaving any shutdown marker in place.
    pub fn drain(&self) -> Vec<T> {
        let mut entries = lock(&self.entries);
        let mut drained = Vec::new();
        let mut kept = VecDeque::new();
        for entry in entries.queue.drain(..) {
            match entry {
                Entry::Item(item) => drained.push(item),
                Entry::Shutdown => kept.push_back(Entry::Shutdown),
            }
        }
        entries.queue = kept;
        drop(entries);
        for _ in 0..drained.len() {
            // Each drained item held one `items` permit and one `space` slot.
            self.items.try_acquire();
            self.space.release();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = TransferQueue::new(8).unwrap();
        for i in 0..5 {
            q.try_enqueue(i).unwrap();
        }
        let out: Vec<_> = (0..5).map(|_| q.dequeue().unwrap()).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_backpressure() {
        let q = TransferQueue::new(2).unwrap();
        q.try_enqueue(1).unwrap();
        q.try_enqueue(2).unwrap();
        assert_eq!(q.try_enqueue(3), Err(3));

        let (item, err) = q.enqueue_timeout(4, Duration::from_millis(10)).unwrap_err();
        assert_eq!(item, 4);
        assert!(matches!(err, DmaError::Busy(_)));

        assert_eq!(q.dequeue(), Some(1));
        q.try_enqueue(3).unwrap();
    }

    #[test]
    fn test_shutdown_after_items() {
        let q = TransferQueue::new(4).unwrap();
        q.try_enqueue("a").unwrap();
        q.shutdown();
        assert_eq!(q.dequeue(), Some("a"));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_drain_keeps_shutdown() {
        let q = TransferQueue::new(4).unwrap();
        q.try_enqueue(1).unwrap();
        q.try_enqueue(2).unwrap();
        q.shutdown();
        assert_eq!(q.drain(), vec![1, 2]);
        assert_eq!(q.dequeue(), None);
        assert!(q.is_shut_down());
        assert_eq!(q.try_enqueue(3), Err(3));
    }

    #[test]
    fn test_drain_restores_capacity() {
        let q = TransferQueue::new(4).unwrap();
        for i in 0..4 {
            q.try_enqueue(i).unwrap();
        }
        assert_eq!(q.drain(), vec![0, 1, 2, 3]);
        for i in 0..4 {
            q.try_enqueue(i).unwrap();
        }
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_shutdown_wakes_blocked_producers() {
        let q = Arc::new(TransferQueue::new(1).unwrap());
        q.try_enqueue(0).unwrap();
        let producers: Vec<_> = (1..=3)
            .map(|i| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let start = Instant::now();
                    let res = q.enqueue_timeout(i, Duration::from_secs(10));
                    (res, start.elapsed())
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        q.shutdown();
        for producer in producers {
            let (res, elapsed) = producer.join().unwrap();
            let (_, err) = res.unwrap_err();
            assert!(matches!(err, DmaError::Cancelled));
            assert!(elapsed < Duration::from_secs(5));
        }
        assert_eq!(q.dequeue(), Some(0));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_dequeue_timeout() {
        let q: TransferQueue<u32> = TransferQueue::new(1).unwrap();
        let err = q.dequeue_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, DmaError::Timeout { .. }));
    }

    #[test]
    fn test_blocked_producer_resumes() {
        let q = Arc::new(TransferQueue::new(1).unwrap());
        q.try_enqueue(0).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.enqueue_timeout(1, Duration::from_secs(5)).is_ok())
        };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(q.dequeue(), Some(0));
        assert!(producer.join().unwrap());
        assert_eq!(q.dequeue(), Some(1));
    }
}
