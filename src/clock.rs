// ===============================
// src/clock.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : clock.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Semua komponen membaca waktu lewat `Clock`, bukan `Utc::now()` langsung,
// supaya test bisa pakai jam manual yang deterministik.
//
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// How long the caller should actually sleep to reach `until`.
    /// Manual clocks jump forward and return zero.
    fn idle_until(&self, until: DateTime<Utc>) -> Duration {
        (until - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Stepped clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self { Self { current: Mutex::new(start) } }

    pub fn set(&self, when: DateTime<Utc>) {
        if let Ok(mut cur) = self.current.lock() { *cur = when; }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        if let Ok(mut cur) = self.current.lock() { *cur += delta; }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.current.lock() {
            Ok(cur) => *cur,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn idle_until(&self, until: DateTime<Utc>) -> Duration {
        if until > self.now() { self.set(until); }
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_jumps_instead_of_sleeping() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap();
        let clock = ManualClock::new(start);
        let target = start + chrono::Duration::seconds(30);
        assert_eq!(clock.idle_until(target), Duration::ZERO);
        assert_eq!(clock.now(), target);

        // going backwards is ignored
        clock.idle_until(start);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn advance_moves_forward() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::milliseconds(1500));
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(1500));
    }
}
