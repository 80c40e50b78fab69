//! JSON strategy store adapter.
//!
//! The whole collection lives in one `strategies.json` document. Writes go
//! to a temp file in the same directory and rename over the original, so a
//! concurrent reader sees either the old or the new document, never a torn
//! one. Variant-name aliases canonicalize on the way in.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::TradeloopError;
use crate::domain::strategy::Strategy;
use crate::ports::store_port::StrategyStorePort;

const STORE_FILE_NAME: &str = "strategies.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    strategies: Vec<Strategy>,
}

pub struct JsonStoreAdapter {
    dir: PathBuf,
}

impl JsonStoreAdapter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.join(STORE_FILE_NAME)
    }

    fn read_document(&self) -> Result<StoreDocument, TradeloopError> {
        let path = self.store_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreDocument::default())
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| TradeloopError::Data {
            reason: format!("failed to parse {}: {}", path.display(), e),
        })
    }

    fn write_document(&self, mut document: StoreDocument) -> Result<(), TradeloopError> {
        std::fs::create_dir_all(&self.dir)?;
        document.strategies.sort_by(|a, b| a.id.cmp(&b.id));

        let body =
            serde_json::to_string_pretty(&document).map_err(|e| TradeloopError::Data {
                reason: format!("strategy serialization: {e}"),
            })?;

        let tmp_path = self
            .dir
            .join(format!(".{}.tmp-{}", STORE_FILE_NAME, std::process::id()));
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(body.as_bytes())?;
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, self.store_path())?;
        Ok(())
    }
}

impl StrategyStorePort for JsonStoreAdapter {
    fn load_all(&self) -> Result<Vec<Strategy>, TradeloopError> {
        Ok(self.read_document()?.strategies)
    }

    fn load(&self, id: &str) -> Result<Strategy, TradeloopError> {
        self.read_document()?
            .strategies
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| TradeloopError::NotFound {
                what: "strategy",
                id: id.to_string(),
            })
    }

    fn upsert(&self, strategy: &Strategy) -> Result<(), TradeloopError> {
        strategy.validate()?;
        let mut document = self.read_document()?;
        // A dormant scheduled strategy is never stored enabled.
        let mut strategy = strategy.clone();
        if strategy.schedule_enabled {
            strategy.enabled = false;
        }
        match document.strategies.iter_mut().find(|s| s.id == strategy.id) {
            Some(existing) => *existing = strategy,
            None => document.strategies.push(strategy),
        }
        self.write_document(document)
    }

    fn delete(&self, id: &str) -> Result<(), TradeloopError> {
        let mut document = self.read_document()?;
        let before = document.strategies.len();
        document.strategies.retain(|s| s.id != id);
        if document.strategies.len() == before {
            return Err(TradeloopError::NotFound {
                what: "strategy",
                id: id.to_string(),
            });
        }
        self.write_document(document)
    }

    fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Strategy>, TradeloopError> {
        let mut active: Vec<Strategy> = self
            .read_document()?
            .strategies
            .into_iter()
            .filter(|s| s.is_active(now))
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}
