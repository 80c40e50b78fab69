//! Cross-process engine lock.
//!
//! A lock file in the configuration directory guarantees one strategy-store
//! writer at a time. Presence of the file means another writer owns the
//! store; the file records who and since when.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::TradeloopError;

const LOCK_FILE_NAME: &str = ".engine.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct EngineLock {
    path: PathBuf,
    released: bool,
}

impl EngineLock {
    pub fn lock_path(dir: &Path) -> PathBuf {
        dir.join(LOCK_FILE_NAME)
    }

    /// Acquire the lock, failing if another owner holds it.
    pub fn acquire(
        dir: &Path,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<EngineLock, TradeloopError> {
        std::fs::create_dir_all(dir)?;
        let path = Self::lock_path(dir);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let info = Self::read_info(dir)?;
                return Err(match info {
                    Some(info) => TradeloopError::LockHeld {
                        owner: info.owner,
                        pid: info.pid,
                    },
                    None => TradeloopError::LockHeld {
                        owner: "unknown".into(),
                        pid: 0,
                    },
                });
            }
            Err(e) => return Err(e.into()),
        };

        let info = LockInfo {
            owner: owner.to_string(),
            pid: std::process::id(),
            started_at: now,
        };
        let body = serde_json::to_string(&info).map_err(|e| TradeloopError::Data {
            reason: format!("lock info serialization: {e}"),
        })?;
        file.write_all(body.as_bytes())?;
        file.sync_data()?;

        Ok(EngineLock {
            path,
            released: false,
        })
    }

    /// Owner info of the current lock file, if any.
    pub fn read_info(dir: &Path) -> Result<Option<LockInfo>, TradeloopError> {
        let path = Self::lock_path(dir);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a lock regardless of owner. The forced-termination path.
    pub fn force_break(dir: &Path) -> Result<(), TradeloopError> {
        let path = Self::lock_path(dir);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn release(mut self) -> Result<(), TradeloopError> {
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
