//! Trade ledger port trait.

use chrono::{DateTime, Utc};

use crate::domain::error::TradeloopError;
use crate::domain::ledger::{DailyActivity, FillRecord};

pub trait LedgerPort {
    fn record_fill(&self, fill: &FillRecord) -> Result<(), TradeloopError>;

    /// Realized P&L and trade count for the UTC day containing `now`.
    fn daily_activity(&self, now: DateTime<Utc>) -> Result<DailyActivity, TradeloopError>;
}
