//! Pre-trade safety gate.
//!
//! A pure function over the proposed order, a snapshot of account state and
//! the policy. Checks run in a fixed order (kill switch, then identity
//! checks, then monetary caps) so refusals are deterministic. Both the live
//! engine and the backtest driver consult the same gate.

use chrono::{DateTime, Utc};

use crate::domain::error::SafetyViolation;
use crate::domain::ledger::DailyActivity;
use crate::domain::order::{AccountSnapshot, OrderRequest, OrderSide, OrderSnapshot, Position};

/// Account equity below which the PDT flag blocks trading.
const PDT_EQUITY_MINIMUM: f64 = 25_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyPolicy {
    pub max_position_notional: f64,
    pub max_position_qty: u32,
    pub daily_loss_limit: f64,
    pub max_daily_trades: u32,
    pub allow_production: bool,
    pub duplicate_window_seconds: i64,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        SafetyPolicy {
            max_position_notional: 25_000.0,
            max_position_qty: 500,
            daily_loss_limit: 1_000.0,
            max_daily_trades: 50,
            allow_production: false,
            duplicate_window_seconds: 120,
        }
    }
}

impl SafetyPolicy {
    /// Effectively unbounded policy for simulations that opt out of caps.
    pub fn unrestricted() -> Self {
        SafetyPolicy {
            max_position_notional: f64::MAX,
            max_position_qty: u32::MAX,
            daily_loss_limit: f64::MAX,
            max_daily_trades: u32::MAX,
            allow_production: true,
            duplicate_window_seconds: 0,
        }
    }
}

/// A previously submitted order, for duplicate detection.
#[derive(Debug, Clone)]
pub struct RecentSubmission {
    pub fingerprint: String,
    pub at: DateTime<Utc>,
}

/// Everything the gate looks at besides the order itself.
pub struct GateInputs<'a> {
    pub account: &'a AccountSnapshot,
    pub position: Option<&'a Position>,
    pub open_orders: &'a [OrderSnapshot],
    pub recent: &'a [RecentSubmission],
    pub daily: DailyActivity,
    /// True when orders would reach a production (real-money) endpoint.
    pub is_production: bool,
    pub now: DateTime<Utc>,
}

/// Proof that the gate approved an order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Approval {
    pub checked_at: DateTime<Utc>,
}

/// Run every check in the fixed order. `price_hint` is the price used to
/// value market orders (limit/stop orders value at their own price).
pub fn check(
    order: &OrderRequest,
    price_hint: f64,
    inputs: &GateInputs,
    policy: &SafetyPolicy,
    kill_switch: bool,
) -> Result<Approval, SafetyViolation> {
    // 1. Kill switch, including the production gate.
    if kill_switch {
        return Err(SafetyViolation::KillSwitchEngaged {
            reason: "kill switch is engaged".into(),
        });
    }
    if inputs.is_production && !policy.allow_production {
        return Err(SafetyViolation::KillSwitchEngaged {
            reason: "production trading is disabled by policy".into(),
        });
    }

    // 2. Identity checks.
    if policy.duplicate_window_seconds > 0 {
        let fingerprint = order.fingerprint();
        for recent in inputs.recent {
            let age = (inputs.now - recent.at).num_seconds();
            if recent.fingerprint == fingerprint
                && age >= 0
                && age < policy.duplicate_window_seconds
            {
                return Err(SafetyViolation::DuplicateOrder {
                    fingerprint,
                    age_seconds: age,
                });
            }
        }
    }
    if inputs.account.pattern_day_trader && inputs.account.equity < PDT_EQUITY_MINIMUM {
        return Err(SafetyViolation::PatternDayTradeBlocked {
            equity: inputs.account.equity,
            minimum: PDT_EQUITY_MINIMUM,
        });
    }

    // 3. Monetary caps, buys only: sells reduce exposure.
    let order_price = order
        .limit_price
        .or(order.stop_price)
        .unwrap_or(price_hint);
    let order_notional = f64::from(order.quantity) * order_price;

    if order.side == OrderSide::Buy {
        let held_qty = inputs.position.map_or(0, |p| p.quantity.max(0) as u32);
        let pending_buy_qty: u32 = inputs
            .open_orders
            .iter()
            .filter(|o| o.symbol == order.symbol && o.side == OrderSide::Buy)
            .map(|o| o.quantity - o.filled_qty)
            .sum();
        let would_be = held_qty + pending_buy_qty + order.quantity;
        if would_be > policy.max_position_qty {
            return Err(SafetyViolation::PositionSizeExceeded {
                would_be,
                limit: policy.max_position_qty,
            });
        }

        let held_notional = inputs
            .position
            .map_or(0.0, |p| p.market_value(price_hint));
        let pending_buy_notional: f64 = inputs
            .open_orders
            .iter()
            .filter(|o| o.symbol == order.symbol && o.side == OrderSide::Buy)
            .map(|o| {
                let price = o.limit_price.or(o.stop_price).unwrap_or(price_hint);
                f64::from(o.quantity - o.filled_qty) * price
            })
            .sum();
        let would_be_notional = held_notional + pending_buy_notional + order_notional;
        if would_be_notional > policy.max_position_notional {
            return Err(SafetyViolation::PositionNotionalExceeded {
                would_be: would_be_notional,
                limit: policy.max_position_notional,
            });
        }
    }

    if inputs.daily.trade_count >= policy.max_daily_trades {
        return Err(SafetyViolation::DailyTradeLimitExceeded {
            count: inputs.daily.trade_count,
            limit: policy.max_daily_trades,
        });
    }

    if inputs.daily.realized_pnl <= -policy.daily_loss_limit {
        return Err(SafetyViolation::DailyLossLimitExceeded {
            day_pnl: inputs.daily.realized_pnl,
            limit: policy.daily_loss_limit,
        });
    }

    if order.side == OrderSide::Buy && order_notional > inputs.account.buying_power {
        return Err(SafetyViolation::InsufficientBuyingPower {
            needed: order_notional,
            available: inputs.account.buying_power,
        });
    }

    Ok(Approval {
        checked_at: inputs.now,
    })
}
