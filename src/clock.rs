// src/clock.rs - Monotonic timestamps and a lock-free f64 cell
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Nanoseconds since the first call in this process.
pub fn now_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// `f64` stored as raw bits so readers on other threads never lock.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Exponential moving average update: `rate * sample + (1 - rate) * old`.
    /// Single writer; concurrent writers may lose an update.
    pub fn decay_toward(&self, sample: f64, rate: f64) -> f64 {
        let next = rate * sample + (1.0 - rate) * self.load();
        self.store(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_decay_toward() {
        let cell = AtomicF64::new(0.0);
        assert_eq!(cell.decay_toward(100.0, 0.5), 50.0);
        assert_eq!(cell.decay_toward(100.0, 0.5), 75.0);
        assert_eq!(cell.load(), 75.0);
    }
}
