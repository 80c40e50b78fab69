//! Order, quote, account and position value types.
//!
//! Shared by the live broker surface and the historical simulator so the
//! evaluator sees one shape regardless of execution provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::bar::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    TrailingStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses never change again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_final()
    }
}

/// An outgoing order instruction. The client id stays stable across the
/// order's whole life; the broker id arrives once the provider accepts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_strategy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oco_peer_id: Option<String>,
}

impl OrderRequest {
    /// Identity fingerprint used by the duplicate-order check. Prices are
    /// part of the identity: two rungs at different levels are not
    /// duplicates of each other.
    pub fn fingerprint(&self) -> String {
        let price = |p: Option<f64>| p.map_or_else(|| "-".to_string(), |p| format!("{p:.4}"));
        format!(
            "{}:{:?}:{:?}:{}:{}:{}",
            self.symbol,
            self.side,
            self.order_type,
            self.quantity,
            price(self.limit_price),
            price(self.stop_price),
        )
    }
}

/// The broker's view of an order at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail_pct: Option<f64>,
    pub status: OrderStatus,
    pub filled_qty: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<f64>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_strategy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oco_peer_id: Option<String>,
}

impl OrderSnapshot {
    pub fn from_request(request: &OrderRequest, ts: DateTime<Utc>) -> Self {
        OrderSnapshot {
            client_id: request.client_id.clone(),
            broker_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            trail_pct: request.trail_pct,
            status: OrderStatus::Pending,
            filled_qty: 0,
            avg_fill_price: None,
            submitted_at: ts,
            updated_at: ts,
            parent_strategy_id: request.parent_strategy_id.clone(),
            oco_peer_id: request.oco_peer_id.clone(),
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn notional(&self) -> f64 {
        self.avg_fill_price.unwrap_or(0.0) * f64::from(self.filled_qty)
    }
}

/// A market quote. Live providers populate `high`/`low` with `last`; the
/// backtester derives them from the current bar so trailing and trigger
/// logic sees intra-bar extremes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub high: f64,
    pub low: f64,
    pub ts: DateTime<Utc>,
}

impl Quote {
    pub fn from_last(symbol: &str, last: f64, ts: DateTime<Utc>) -> Self {
        Quote {
            symbol: symbol.to_string(),
            bid: last,
            ask: last,
            last,
            high: last,
            low: last,
            ts,
        }
    }

    pub fn from_bar(symbol: &str, bar: &Bar) -> Self {
        Quote {
            symbol: symbol.to_string(),
            bid: bar.close,
            ask: bar.close,
            last: bar.close,
            high: bar.high,
            low: bar.low,
            ts: bar.ts,
        }
    }

    /// Evaluation price: bid/ask midpoint when both sides are quoted,
    /// last otherwise.
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.last
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub cash: f64,
    pub equity: f64,
    pub buying_power: f64,
    pub day_pnl: f64,
    pub day_trade_count: u32,
    pub pattern_day_trader: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed share count; grid strategies can run temporarily short in
    /// simulation.
    pub quantity: i64,
    pub avg_entry_price: f64,
}

impl Position {
    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity as f64 * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.quantity as f64 * (price - self.avg_entry_price)
    }
}
