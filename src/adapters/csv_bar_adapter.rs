//! CSV bar data adapter.
//!
//! Reads `timestamp,open,high,low,close,volume` files, one per symbol
//! (`{SYMBOL}.csv`). Timestamps are RFC 3339 or `YYYY-MM-DD HH:MM:SS`
//! (naive values are taken as exchange-local and stored as-is), and rows
//! must be strictly ascending.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::domain::bar::{self, Bar};
use crate::domain::error::TradeloopError;
use crate::ports::data_port::BarDataPort;

pub struct CsvBarAdapter {
    base_path: PathBuf,
}

impl CsvBarAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        self.base_path.join(format!("{}.csv", symbol.to_uppercase()))
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TradeloopError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).expect("midnight exists").and_utc());
    }
    Err(TradeloopError::Data {
        reason: format!("invalid timestamp: {value}"),
    })
}

fn parse_field<T: std::str::FromStr>(
    record: &csv::StringRecord,
    index: usize,
    name: &str,
) -> Result<T, TradeloopError>
where
    T::Err: std::fmt::Display,
{
    let raw = record.get(index).ok_or_else(|| TradeloopError::Data {
        reason: format!("missing {name} column"),
    })?;
    raw.parse().map_err(|e| TradeloopError::Data {
        reason: format!("invalid {name} value `{raw}`: {e}"),
    })
}

impl BarDataPort for CsvBarAdapter {
    fn fetch_bars(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, TradeloopError> {
        let path = self.csv_path(symbol);
        let content = std::fs::read_to_string(&path).map_err(|e| TradeloopError::Data {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let mut bars = Vec::new();

        for result in rdr.records() {
            let record = result.map_err(|e| TradeloopError::Data {
                reason: format!("CSV parse error: {e}"),
            })?;

            let ts_raw = record.get(0).ok_or_else(|| TradeloopError::Data {
                reason: "missing timestamp column".into(),
            })?;
            let ts = parse_timestamp(ts_raw)?;
            if start.map_or(false, |s| ts < s) || end.map_or(false, |e| ts > e) {
                continue;
            }

            bars.push(Bar {
                ts,
                open: parse_field(&record, 1, "open")?,
                high: parse_field(&record, 2, "high")?,
                low: parse_field(&record, 3, "low")?,
                close: parse_field(&record, 4, "close")?,
                volume: parse_field(&record, 5, "volume")?,
            });
        }

        bar::validate_series(&bars)?;
        Ok(bars)
    }

    fn list_symbols(&self) -> Result<Vec<String>, TradeloopError> {
        let entries = std::fs::read_dir(&self.base_path).map_err(|e| TradeloopError::Data {
            reason: format!("failed to read directory {}: {}", self.base_path.display(), e),
        })?;

        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TradeloopError::Data {
                reason: format!("directory entry error: {e}"),
            })?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(symbol) = name_str.strip_suffix(".csv") {
                symbols.push(symbol.to_string());
            }
        }
        symbols.sort();
        Ok(symbols)
    }
}
