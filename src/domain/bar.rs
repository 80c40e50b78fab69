//! OHLCV bar representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::TradeloopError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Bar {
    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// Range integrity: low <= open <= high and low <= close <= high.
    pub fn validate(&self) -> Result<(), TradeloopError> {
        let ok = self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= 0;
        if ok {
            Ok(())
        } else {
            Err(TradeloopError::Data {
                reason: format!(
                    "bar at {} violates OHLC range: o={} h={} l={} c={}",
                    self.ts, self.open, self.high, self.low, self.close
                ),
            })
        }
    }
}

/// Validate a bar series: each bar in range, timestamps strictly ascending.
pub fn validate_series(bars: &[Bar]) -> Result<(), TradeloopError> {
    for bar in bars {
        bar.validate()?;
    }
    for pair in bars.windows(2) {
        if pair[1].ts <= pair[0].ts {
            return Err(TradeloopError::Data {
                reason: format!(
                    "bar timestamps not strictly ascending: {} then {}",
                    pair[0].ts, pair[1].ts
                ),
            });
        }
    }
    Ok(())
}
