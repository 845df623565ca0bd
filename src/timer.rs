//! Lookahead Timer
//!
//! Converts a tempo into periodic wake-ups that schedule work slightly ahead
//! of the audio clock. A wake-up drains every timer unit whose instant falls
//! inside `[.., now + lookahead)`, in order, so callback jitter smaller than
//! the look-ahead window never delays or drops a unit.
//!
//! The timer owns no thread. The host calls [`Timer::wake`] at least every
//! [`Timer::wake_period`], or hands a dedicated thread to [`Timer::run`].

use crate::clock::SharedClock;
use crate::config::{validate_bpm, ConfigError, TimerConfig};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, trace};

pub struct Timer {
    clock: SharedClock,
    config: TimerConfig,
    bpm: f64,
    unit: f64,
    next_instant: f64,
    running: bool,
    faults: u64,
}

impl Timer {
    pub fn new(clock: SharedClock, config: TimerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let unit = config.unit_duration(config.bpm);
        Ok(Self {
            clock,
            config,
            bpm: config.bpm,
            unit,
            next_instant: 0.0,
            running: false,
            faults: 0,
        })
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Change the tempo without skipping or repeating a unit.
    ///
    /// The pending instant is moved from `last + old_unit` to
    /// `last + new_unit`, where `last` is the instant most recently handed
    /// to the callback.
    pub fn set_tempo(&mut self, bpm: f64) -> Result<(), ConfigError> {
        validate_bpm(bpm)?;
        self.bpm = bpm;
        self.next_instant -= self.unit;
        self.unit = self.config.unit_duration(bpm);
        self.next_instant += self.unit;
        Ok(())
    }

    /// Duration of one timer unit in seconds
    pub fn unit_duration(&self) -> f64 {
        self.unit
    }

    pub fn next_instant(&self) -> f64 {
        self.next_instant
    }

    pub fn lookahead(&self) -> f64 {
        self.config.lookahead
    }

    pub fn wake_period(&self) -> Duration {
        Duration::from_secs_f64(self.config.wake_interval)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of callback panics caught so far
    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Start the timer at the current clock instant and run the first
    /// wake-up immediately. Does nothing if already running.
    pub fn start(&mut self, callback: &mut dyn FnMut(f64)) {
        if self.arm() {
            self.wake(callback);
        }
    }

    /// Start without an immediate wake-up. Returns false if already running.
    pub fn arm(&mut self) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        self.next_instant = self.clock.now();
        true
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Hand every unit inside the look-ahead window to `callback`.
    ///
    /// Returns the number of units dispatched. A panic raised by the callback
    /// is caught and logged; the unit still counts as consumed.
    pub fn wake(&mut self, callback: &mut dyn FnMut(f64)) -> usize {
        if !self.running {
            return 0;
        }
        let horizon = self.clock.now() + self.config.lookahead;
        let mut dispatched = 0;
        while self.next_instant < horizon {
            let instant = self.next_instant;
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(instant)));
            if let Err(payload) = result {
                self.faults += 1;
                error!(
                    instant,
                    message = panic_message(payload.as_ref()),
                    "timer callback panicked"
                );
            }
            self.next_instant += self.unit;
            dispatched += 1;
        }
        trace!(dispatched, next = self.next_instant, "timer wake-up");
        dispatched
    }

    /// Blocking wake-up loop for a dedicated scheduling thread.
    ///
    /// Returns when the timer is stopped or `quit` is raised.
    pub fn run(&mut self, callback: &mut dyn FnMut(f64), quit: &AtomicBool) {
        while self.running && !quit.load(Ordering::Acquire) {
            self.wake(callback);
            std::thread::sleep(self.wake_period());
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("bpm", &self.bpm)
            .field("unit", &self.unit)
            .field("next_instant", &self.next_instant)
            .field("running", &self.running)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
