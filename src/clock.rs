//! Audio Clock
//!
//! The scheduling engine never reads wall time directly. Every decision is
//! taken against an external monotonic clock expressed in seconds, the same
//! time base used by the processing units that receive the scheduled events.
//!
//! - `AudioClock` - the clock contract
//! - `ManualClock` - a shareable clock advanced explicitly (offline rendering, tests)
//! - `SystemClock` - a clock backed by `std::time::Instant`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Atomic f64 for lock-free sharing of the current clock value
///
/// Uses AtomicU64 internally since there's no native AtomicF64.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// A monotonic clock measured in seconds
pub trait AudioClock: Send + Sync {
    /// Current instant of the audio time line
    fn now(&self) -> f64;
}

/// Clock that only moves when told to
///
/// Cloning yields another handle onto the same time value, so a test or an
/// offline renderer can keep one handle while the engine holds the other.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    time: Arc<AtomicF64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            time: Arc::new(AtomicF64::new(start)),
        }
    }

    /// Jump to an absolute instant. Moving backwards is ignored.
    pub fn set(&self, time: f64) {
        if time >= self.time.get() {
            self.time.set(time);
        }
    }

    pub fn advance(&self, dt: f64) {
        self.set(self.time.get() + dt.max(0.0));
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> f64 {
        self.time.get()
    }
}

/// Clock measuring seconds elapsed since its creation
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Shared handle to any clock
pub type SharedClock = Arc<dyn AudioClock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f64_roundtrip() {
        let a = AtomicF64::new(1.5);
        assert_eq!(a.get(), 1.5);
        a.set(-0.25);
        assert_eq!(a.get(), -0.25);
    }

    #[test]
    fn test_manual_clock_shared_handles() {
        let clock = ManualClock::new(0.0);
        let other = clock.clone();
        clock.advance(0.5);
        assert_eq!(other.now(), 0.5);
    }

    #[test]
    fn test_manual_clock_is_monotonic() {
        let clock = ManualClock::new(2.0);
        clock.set(1.0);
        assert_eq!(clock.now(), 2.0);
        clock.advance(-1.0);
        assert_eq!(clock.now(), 2.0);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
