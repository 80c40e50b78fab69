//! Strategy store port trait.

use chrono::{DateTime, Utc};

use crate::domain::error::TradeloopError;
use crate::domain::strategy::Strategy;

pub trait StrategyStorePort {
    fn load_all(&self) -> Result<Vec<Strategy>, TradeloopError>;

    fn load(&self, id: &str) -> Result<Strategy, TradeloopError>;

    /// Insert or replace by id. Writes are atomic: readers never observe a
    /// torn document.
    fn upsert(&self, strategy: &Strategy) -> Result<(), TradeloopError>;

    fn delete(&self, id: &str) -> Result<(), TradeloopError>;

    /// Enabled, unscheduled, non-terminal, non-quarantined strategies in
    /// deterministic id order.
    fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Strategy>, TradeloopError>;
}
