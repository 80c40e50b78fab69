//! Time-based strategy activation.
//!
//! A scheduled strategy is held out of evaluation (and `enabled` is held
//! false) until its instant arrives; activation then happens atomically in
//! the cycle that first observes the due time. Precision is bounded by the
//! engine poll interval.

use chrono::{DateTime, Utc};

use crate::domain::strategy::Strategy;

/// True while the strategy must stay dormant.
pub fn schedule_pending(strategy: &Strategy, now: DateTime<Utc>) -> bool {
    strategy.schedule_pending(now)
}

/// Enforce the dormancy invariant: a scheduled strategy is not enabled.
pub fn hold_if_scheduled(strategy: &mut Strategy, now: DateTime<Utc>) {
    if strategy.schedule_pending(now) && strategy.enabled {
        strategy.enabled = false;
        strategy.touch(now);
    }
}

/// If the strategy's schedule time has arrived, enable it and clear the
/// schedule. Returns true when an activation happened; the caller persists
/// and audits it.
pub fn activate_if_due(strategy: &mut Strategy, now: DateTime<Utc>) -> bool {
    if !strategy.schedule_enabled {
        return false;
    }
    let Some(at) = strategy.schedule_at else {
        return false;
    };
    if at > now {
        return false;
    }
    strategy.enabled = true;
    strategy.schedule_enabled = false;
    strategy.schedule_at = None;
    strategy.touch(now);
    true
}
