//! Historical bar data port trait.

use chrono::{DateTime, Utc};

use crate::domain::bar::Bar;
use crate::domain::error::TradeloopError;

pub trait BarDataPort {
    /// Bars for `symbol` within `[start, end]` (inclusive, either side
    /// optional), in ascending timestamp order.
    fn fetch_bars(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, TradeloopError>;

    fn list_symbols(&self) -> Result<Vec<String>, TradeloopError>;
}
