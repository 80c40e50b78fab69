//! Clock capability trait.

use chrono::{DateTime, Utc};

pub trait ClockPort {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used by the live engine.
pub struct SystemClock;

impl ClockPort for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for tests and deterministic replays.
pub struct FixedClock(pub DateTime<Utc>);

impl ClockPort for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
