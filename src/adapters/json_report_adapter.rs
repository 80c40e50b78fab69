//! JSON backtest report adapter.
//!
//! Each result is written to `<id>.json` in the results directory, and a
//! compact `index.json` is refreshed for listing without parsing every
//! full document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::error::TradeloopError;
use crate::domain::metrics::BacktestResult;
use crate::ports::report_port::ReportPort;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub symbol: String,
    pub variant: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub total_return: f64,
    pub total_trades: usize,
}

pub struct JsonReportAdapter {
    dir: PathBuf,
}

impl JsonReportAdapter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self, id: &str) -> Result<BacktestResult, TradeloopError> {
        let path = self.dir.join(format!("{id}.json"));
        let content = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TradeloopError::NotFound {
                what: "backtest",
                id: id.to_string(),
            },
            _ => e.into(),
        })?;
        serde_json::from_str(&content).map_err(|e| TradeloopError::Data {
            reason: format!("failed to parse {}: {}", path.display(), e),
        })
    }

    pub fn list(&self) -> Result<Vec<IndexEntry>, TradeloopError> {
        let path = self.dir.join("index.json");
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| TradeloopError::Data {
                reason: format!("failed to parse {}: {}", path.display(), e),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn update_index(&self, result: &BacktestResult) -> Result<(), TradeloopError> {
        let mut index = self.list()?;
        index.retain(|entry| entry.id != result.id);
        index.push(IndexEntry {
            id: result.id.clone(),
            symbol: result.symbol.clone(),
            variant: result.variant.clone(),
            created_at: result.created_at,
            total_return: result.metrics.total_return,
            total_trades: result.metrics.total_trades,
        });
        index.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let body = serde_json::to_string_pretty(&index).map_err(|e| TradeloopError::Data {
            reason: format!("index serialization: {e}"),
        })?;
        std::fs::write(self.dir.join("index.json"), body)?;
        Ok(())
    }
}

impl ReportPort for JsonReportAdapter {
    fn write(&self, result: &BacktestResult) -> Result<String, TradeloopError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", result.id));
        let body = serde_json::to_string_pretty(result).map_err(|e| TradeloopError::Data {
            reason: format!("result serialization: {e}"),
        })?;
        std::fs::write(&path, body)?;
        self.update_index(result)?;
        Ok(path.display().to_string())
    }
}
