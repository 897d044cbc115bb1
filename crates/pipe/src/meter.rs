// SPDX-License-Identifier: Apache-2.0

//! Time-weighted gauge used for pipe load and worker utilization statistics.

use parking_lot::Mutex;
use std::time::Instant;

/// A gauge that tracks its current value and the time-weighted average of all
/// values it has held since creation (or the last [`reset`](Meter::reset)).
///
/// The pipe reports `occupancy / base_capacity` through one of these; the
/// worker runtime reports `busy_tasks / concurrency`. Readers never block
/// writers for long: the meter holds a single short-lived lock.
#[derive(Debug)]
pub struct Meter {
    inner: Mutex<MeterState>,
}

#[derive(Debug)]
struct MeterState {
    started: Instant,
    last_update: Instant,
    /// Value held since `last_update`.
    value: f64,
    /// Integral of the value over `started..last_update`, in value-seconds.
    weighted_sum: f64,
    /// Set once the meter is stopped; freezes the average.
    stopped: Option<Instant>,
}

impl Meter {
    /// Creates a meter reading zero.
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(MeterState {
                started: now,
                last_update: now,
                value: 0.0,
                weighted_sum: 0.0,
                stopped: None,
            }),
        }
    }

    /// Sets the current value. No-op after [`stop`](Meter::stop).
    pub fn set(&self, value: f64) {
        let mut state = self.inner.lock();
        if state.stopped.is_some() {
            return;
        }
        let now = Instant::now();
        let held = now.duration_since(state.last_update).as_secs_f64();
        state.weighted_sum += state.value * held;
        state.last_update = now;
        state.value = value;
    }

    /// Returns the value most recently set.
    #[must_use]
    pub fn current(&self) -> f64 {
        self.inner.lock().value
    }

    /// Returns the time-weighted average of the gauge since creation (or the
    /// last reset), up to now or the stop instant.
    #[must_use]
    pub fn average(&self) -> f64 {
        let state = self.inner.lock();
        let end = state.stopped.unwrap_or_else(Instant::now);
        let total = end.duration_since(state.started).as_secs_f64();
        if total <= 0.0 {
            return state.value;
        }
        let tail = end.duration_since(state.last_update).as_secs_f64();
        (state.weighted_sum + state.value * tail) / total
    }

    /// Restarts the observation window at zero.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        let now = Instant::now();
        state.started = now;
        state.last_update = now;
        state.value = 0.0;
        state.weighted_sum = 0.0;
        state.stopped = None;
    }

    /// Freezes the average at the current instant and pins the value to zero.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        if state.stopped.is_some() {
            return;
        }
        let now = Instant::now();
        let held = now.duration_since(state.last_update).as_secs_f64();
        state.weighted_sum += state.value * held;
        state.last_update = now;
        state.value = 0.0;
        state.stopped = Some(now);
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_meter_reads_zero() {
        let m = Meter::new();
        assert_eq!(m.current(), 0.0);
        assert!(m.average() >= 0.0);
    }

    #[test]
    fn average_stays_between_extremes() {
        let m = Meter::new();
        m.set(1.0);
        std::thread::sleep(Duration::from_millis(20));
        m.set(0.5);
        std::thread::sleep(Duration::from_millis(20));
        let avg = m.average();
        assert!(avg > 0.0 && avg <= 1.0, "average out of range: {avg}");
        assert_eq!(m.current(), 0.5);
    }

    #[test]
    fn stop_freezes_average() {
        let m = Meter::new();
        m.set(1.0);
        std::thread::sleep(Duration::from_millis(10));
        m.stop();
        let frozen = m.average();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(m.average(), frozen);
        assert_eq!(m.current(), 0.0);
        // Further sets are ignored.
        m.set(1.0);
        assert_eq!(m.current(), 0.0);
    }

    #[test]
    fn reset_restarts_window() {
        let m = Meter::new();
        m.set(1.0);
        std::thread::sleep(Duration::from_millis(10));
        m.reset();
        assert_eq!(m.current(), 0.0);
    }
}
