//! In-flight accounting for backpressure
//!
//! Counts entries this node has claimed and not yet finished, whether they
//! sit in the buffer or are being dispatched.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic in-flight counter bounded by `max`
///
/// Slots are reserved before claiming, so concurrent claimers can never push
/// the count past `max`.
pub struct InFlightTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    min: usize,
    max: usize,
}

impl InFlightTracker {
    /// Create a tracker with the given bounds
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            min: min.min(max),
            max,
        }
    }

    /// Reserve up to `wanted` slots and return how many were granted
    ///
    /// Grants nothing when the tracker is full, including the case where
    /// `min == max == current`.
    pub fn reserve(&self, wanted: usize) -> usize {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            let grant = wanted.min(self.max.saturating_sub(current));
            if grant == 0 {
                return 0;
            }

            match self.current.compare_exchange_weak(
                current,
                current + grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(current + grant, Ordering::Relaxed);
                    return grant;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `count` slots
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        // Saturate instead of wrapping on a double release
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            });
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Highest in-flight count observed
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_full(&self) -> bool {
        self.current() >= self.max
    }

    /// Whether the poller should re-poll without waiting
    pub fn below_min(&self) -> bool {
        self.current() < self.min
    }
}
