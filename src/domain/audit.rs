//! Append-only audit log.
//!
//! One JSON record per line for every state-changing action. Appends are
//! flushed to disk; the file is never rewritten. Rotation is by UTC day,
//! with a size-based overflow suffix within a day.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::TradeloopError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub source: String,
    pub action: String,
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

enum Sink {
    Dir(PathBuf),
    Null,
}

pub struct AuditLog {
    sink: Sink,
    source: String,
    max_file_bytes: u64,
}

impl AuditLog {
    pub fn new(dir: impl AsRef<Path>, source: &str, max_file_bytes: u64) -> Self {
        AuditLog {
            sink: Sink::Dir(dir.as_ref().to_path_buf()),
            source: source.to_string(),
            max_file_bytes,
        }
    }

    /// Discards every record. Used by backtests, which audit nothing.
    pub fn null() -> Self {
        AuditLog {
            sink: Sink::Null,
            source: String::new(),
            max_file_bytes: 0,
        }
    }

    pub fn record(
        &self,
        now: DateTime<Utc>,
        action: &str,
        details: Value,
    ) -> Result<(), TradeloopError> {
        self.append(now, action, details, None)
    }

    pub fn record_error(
        &self,
        now: DateTime<Utc>,
        action: &str,
        details: Value,
        error: &TradeloopError,
    ) -> Result<(), TradeloopError> {
        let error = serde_json::json!({
            "code": error.code(),
            "message": error.to_string(),
        });
        self.append(now, action, details, Some(error))
    }

    fn append(
        &self,
        now: DateTime<Utc>,
        action: &str,
        details: Value,
        error: Option<Value>,
    ) -> Result<(), TradeloopError> {
        let dir = match &self.sink {
            Sink::Null => return Ok(()),
            Sink::Dir(dir) => dir,
        };
        std::fs::create_dir_all(dir)?;

        let record = AuditRecord {
            ts: now,
            source: self.source.clone(),
            action: action.to_string(),
            details,
            error,
        };
        let mut line = serde_json::to_string(&record).map_err(|e| TradeloopError::Data {
            reason: format!("audit record serialization: {e}"),
        })?;
        line.push('\n');

        let path = self.active_path(dir, now)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Current file for `now`'s UTC day; rolls to a numbered sibling once
    /// the size bound is hit.
    fn active_path(&self, dir: &Path, now: DateTime<Utc>) -> Result<PathBuf, TradeloopError> {
        let day = now.format("%Y%m%d");
        let base = dir.join(format!("audit-{day}.jsonl"));
        if self.max_file_bytes == 0 {
            return Ok(base);
        }

        let mut candidate = base;
        let mut index = 0u32;
        loop {
            let size = std::fs::metadata(&candidate).map(|m| m.len()).unwrap_or(0);
            if size < self.max_file_bytes {
                return Ok(candidate);
            }
            index += 1;
            candidate = dir.join(format!("audit-{day}.{index}.jsonl"));
        }
    }
}
