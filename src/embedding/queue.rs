//! Backpressure for the embedding provider's in-flight request window
//! (spec §5 "Backpressure").
//!
//! The provider itself stays a plain synchronous `Embedder`; this wraps calls
//! to it with a bounded window so a burst of concurrent writes degrades to
//! `ResourceExhausted` instead of piling up unboundedly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{EngramError, Result};

/// Bounded in-flight window around embedding calls.
///
/// `max_in_flight` bounds concurrently-executing embed calls; `max_queued`
/// bounds callers waiting for a slot before they are rejected outright.
pub struct EmbeddingQueue {
    in_flight: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
    max_in_flight: usize,
    max_queued: usize,
}

/// Holds one in-flight slot; releases it on drop.
pub struct QueueSlot {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EmbeddingQueue {
    pub fn new(max_in_flight: usize, max_queued: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.max(1),
            max_queued,
        }
    }

    /// Acquire a slot, blocking the caller's thread briefly if the in-flight
    /// window is full but there is room in the wait queue; fails fast with
    /// `ResourceExhausted` once the wait queue is also full.
    pub fn acquire(&self) -> Result<QueueSlot> {
        loop {
            let current = self.in_flight.load(Ordering::SeqCst);
            if current < self.max_in_flight {
                if self
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(QueueSlot {
                        in_flight: self.in_flight.clone(),
                    });
                }
                continue;
            }

            let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
            if waiting >= self.max_queued {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return Err(EngramError::ResourceExhausted(format!(
                    "embedding queue saturated: {current} in flight, {waiting} waiting"
                )));
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            std::thread::yield_now();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for EmbeddingQueue {
    fn default() -> Self {
        Self::new(8, 256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases_a_slot() {
        let queue = EmbeddingQueue::new(1, 1);
        assert_eq!(queue.in_flight(), 0);
        let slot = queue.acquire().unwrap();
        assert_eq!(queue.in_flight(), 1);
        drop(slot);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn rejects_when_saturated_with_zero_queue_room() {
        let queue = EmbeddingQueue::new(1, 0);
        let _slot = queue.acquire().unwrap();
        let err = queue.acquire().unwrap_err();
        assert!(matches!(err, EngramError::ResourceExhausted(_)));
    }
}
