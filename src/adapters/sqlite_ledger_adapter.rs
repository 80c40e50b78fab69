//! SQLite trade ledger adapter.

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::domain::error::TradeloopError;
use crate::domain::ledger::{DailyActivity, FillRecord};
use crate::domain::order::OrderSide;
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::LedgerPort;

pub struct SqliteLedgerAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedgerAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradeloopError> {
        let db_path =
            config
                .get_string("ledger", "path")
                .ok_or_else(|| TradeloopError::ConfigMissing {
                    section: "ledger".into(),
                    key: "path".into(),
                })?;
        let pool_size = config.get_int("ledger", "pool_size", 2) as u32;
        Self::from_path(&db_path, pool_size)
    }

    pub fn from_path(
        db_path: impl AsRef<std::path::Path>,
        pool_size: u32,
    ) -> Result<Self, TradeloopError> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e: r2d2::Error| TradeloopError::Data {
                reason: e.to_string(),
            })?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    pub fn in_memory() -> Result<Self, TradeloopError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| TradeloopError::Data {
                reason: e.to_string(),
            })?;
        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    fn initialize_schema(&self) -> Result<(), TradeloopError> {
        let conn = self.pool.get().map_err(|e: r2d2::Error| TradeloopError::Data {
            reason: e.to_string(),
        })?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fills (
                order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price REAL NOT NULL,
                realized_pnl REAL,
                strategy_id TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_ts ON fills(ts);
            CREATE INDEX IF NOT EXISTS idx_fills_symbol ON fills(symbol);",
        )
        .map_err(|e: rusqlite::Error| TradeloopError::Data {
            reason: e.to_string(),
        })?;

        Ok(())
    }
}

impl LedgerPort for SqliteLedgerAdapter {
    fn record_fill(&self, fill: &FillRecord) -> Result<(), TradeloopError> {
        let conn = self.pool.get().map_err(|e: r2d2::Error| TradeloopError::Data {
            reason: e.to_string(),
        })?;

        let side = match fill.side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        conn.execute(
            "INSERT OR REPLACE INTO fills
                (order_id, symbol, side, quantity, price, realized_pnl, strategy_id, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fill.order_id,
                fill.symbol,
                side,
                fill.quantity,
                fill.price,
                fill.realized_pnl,
                fill.strategy_id,
                fill.ts.to_rfc3339(),
            ],
        )
        .map_err(|e: rusqlite::Error| TradeloopError::Data {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn daily_activity(&self, now: DateTime<Utc>) -> Result<DailyActivity, TradeloopError> {
        let conn = self.pool.get().map_err(|e: r2d2::Error| TradeloopError::Data {
            reason: e.to_string(),
        })?;

        let day_prefix = format!("{}%", now.format("%Y-%m-%d"));
        let (count, pnl): (u32, Option<f64>) = conn
            .query_row(
                "SELECT COUNT(*), SUM(realized_pnl) FROM fills WHERE ts LIKE ?1",
                params![day_prefix],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e: rusqlite::Error| TradeloopError::Data {
                reason: e.to_string(),
            })?;

        Ok(DailyActivity {
            realized_pnl: pnl.unwrap_or(0.0),
            trade_count: count,
        })
    }
}
