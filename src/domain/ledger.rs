//! Trade fill records and daily activity aggregation.
//!
//! Every fill the engine observes is recorded here. The safety gate reads
//! the day's realized P&L and trade count back out of it.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::TradeloopError;
use crate::domain::order::OrderSide;
use crate::ports::ledger_port::LedgerPort;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub price: f64,
    /// Realized P&L against the strategy's entry fill; present on exit fills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    pub strategy_id: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DailyActivity {
    pub realized_pnl: f64,
    pub trade_count: u32,
}

/// In-memory ledger for backtests and tests; the live engine uses the
/// SQLite-backed adapter.
#[derive(Default)]
pub struct MemoryLedger {
    fills: Mutex<Vec<FillRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fills(&self) -> Vec<FillRecord> {
        self.fills.lock().expect("ledger poisoned").clone()
    }
}

impl LedgerPort for MemoryLedger {
    fn record_fill(&self, fill: &FillRecord) -> Result<(), TradeloopError> {
        self.fills.lock().expect("ledger poisoned").push(fill.clone());
        Ok(())
    }

    fn daily_activity(&self, now: DateTime<Utc>) -> Result<DailyActivity, TradeloopError> {
        let day = now.date_naive();
        let fills = self.fills.lock().expect("ledger poisoned");
        let mut activity = DailyActivity::default();
        for fill in fills.iter().filter(|f| f.ts.date_naive() == day) {
            activity.trade_count += 1;
            activity.realized_pnl += fill.realized_pnl.unwrap_or(0.0);
        }
        Ok(activity)
    }
}
