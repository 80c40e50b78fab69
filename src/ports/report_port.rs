//! Backtest report port trait.

use crate::domain::error::TradeloopError;
use crate::domain::metrics::BacktestResult;

pub trait ReportPort {
    /// Persist a result; returns a human-usable location string.
    fn write(&self, result: &BacktestResult) -> Result<String, TradeloopError>;
}
