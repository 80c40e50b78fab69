//! Backtest result document and performance metrics.
//!
//! Trades are matched FIFO per symbol at share-lot granularity, so partial
//! exits (scale-out rungs) each produce their own realized pair.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::order::{OrderSide, OrderSnapshot};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const SHARPE_MIN_OBSERVATIONS: usize = 30;

/// How a backtest run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BacktestStatus {
    Completed,
    NoData,
    StrategyRejected { reason: String },
    Interrupted,
}

/// One realized entry/exit pair from FIFO matching.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedTrade {
    pub symbol: String,
    pub quantity: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub exit_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_return: f64,
    pub total_return_pct: f64,
    /// Winners over matched pairs, 0..1.
    pub win_rate: f64,
    /// Gross wins over gross losses; +inf with wins and no losses.
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpe_ratio: Option<f64>,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: String,
    pub symbol: String,
    pub variant: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub initial_cash: f64,
    pub final_equity: f64,
    #[serde(flatten)]
    pub status: BacktestStatus,
    pub metrics: Metrics,
    /// Filled order snapshots in execution order.
    pub trades: Vec<OrderSnapshot>,
    /// `[timestamp, equity]` per bar.
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
}

/// Match filled orders FIFO per symbol. Sells consume the earliest open
/// buy lots; one pair is produced per sell that matched anything.
pub fn matched_trades(filled: &[OrderSnapshot]) -> Vec<MatchedTrade> {
    #[derive(Debug)]
    struct Lot {
        quantity: u32,
        price: f64,
    }

    let mut lots: HashMap<String, VecDeque<Lot>> = HashMap::new();
    let mut pairs = Vec::new();

    for order in filled {
        let price = match order.avg_fill_price {
            Some(price) => price,
            None => continue,
        };
        match order.side {
            OrderSide::Buy => {
                lots.entry(order.symbol.clone())
                    .or_default()
                    .push_back(Lot {
                        quantity: order.filled_qty,
                        price,
                    });
            }
            OrderSide::Sell => {
                let queue = lots.entry(order.symbol.clone()).or_default();
                let mut remaining = order.filled_qty;
                let mut matched_qty = 0u32;
                let mut cost = 0.0;
                while remaining > 0 {
                    let Some(front) = queue.front_mut() else {
                        break;
                    };
                    let take = front.quantity.min(remaining);
                    cost += f64::from(take) * front.price;
                    front.quantity -= take;
                    remaining -= take;
                    matched_qty += take;
                    if front.quantity == 0 {
                        queue.pop_front();
                    }
                }
                if matched_qty > 0 {
                    let proceeds = f64::from(matched_qty) * price;
                    pairs.push(MatchedTrade {
                        symbol: order.symbol.clone(),
                        quantity: matched_qty,
                        entry_price: cost / f64::from(matched_qty),
                        exit_price: price,
                        pnl: proceeds - cost,
                        exit_ts: order.updated_at,
                    });
                }
            }
        }
    }
    pairs
}

/// Compute all metrics from filled orders and the equity curve.
pub fn compute(
    filled: &[OrderSnapshot],
    equity_curve: &[(DateTime<Utc>, f64)],
    initial_cash: f64,
) -> Metrics {
    let final_equity = equity_curve
        .last()
        .map(|&(_, equity)| equity)
        .unwrap_or(initial_cash);
    let total_return = final_equity - initial_cash;
    let total_return_pct = if initial_cash > 0.0 {
        total_return / initial_cash * 100.0
    } else {
        0.0
    };

    let pairs = matched_trades(filled);
    let mut winning_trades = 0usize;
    let mut losing_trades = 0usize;
    let mut gross_wins = 0.0_f64;
    let mut gross_losses = 0.0_f64;
    let mut largest_win = 0.0_f64;
    let mut largest_loss = 0.0_f64;

    for pair in &pairs {
        if pair.pnl > 0.0 {
            winning_trades += 1;
            gross_wins += pair.pnl;
            if pair.pnl > largest_win {
                largest_win = pair.pnl;
            }
        } else if pair.pnl < 0.0 {
            losing_trades += 1;
            gross_losses += pair.pnl.abs();
            if pair.pnl < largest_loss {
                largest_loss = pair.pnl;
            }
        }
    }

    let total_trades = pairs.len();
    let win_rate = if total_trades > 0 {
        winning_trades as f64 / total_trades as f64
    } else {
        0.0
    };
    let profit_factor = if gross_losses > 0.0 {
        gross_wins / gross_losses
    } else if gross_wins > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    let avg_win = if winning_trades > 0 {
        gross_wins / winning_trades as f64
    } else {
        0.0
    };
    let avg_loss = if losing_trades > 0 {
        -(gross_losses / losing_trades as f64)
    } else {
        0.0
    };

    let (max_drawdown, max_drawdown_pct) = compute_drawdown(equity_curve);
    let sharpe_ratio = compute_sharpe(equity_curve);

    Metrics {
        total_return,
        total_return_pct,
        win_rate,
        profit_factor,
        max_drawdown,
        max_drawdown_pct,
        avg_win,
        avg_loss,
        largest_win,
        largest_loss,
        sharpe_ratio,
        total_trades,
        winning_trades,
        losing_trades,
    }
}

/// Largest peak-to-trough decline in dollars, with its percentage of the
/// peak it fell from.
fn compute_drawdown(equity_curve: &[(DateTime<Utc>, f64)]) -> (f64, f64) {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    let mut max_dd_pct = 0.0_f64;

    for &(_, equity) in equity_curve {
        if equity > peak {
            peak = equity;
        }
        let dd = peak - equity;
        if dd > max_dd {
            max_dd = dd;
            max_dd_pct = if peak > 0.0 { dd / peak * 100.0 } else { 0.0 };
        }
    }
    (max_dd, max_dd_pct)
}

/// Annualized Sharpe from per-bar returns; omitted below the minimum
/// observation count.
fn compute_sharpe(equity_curve: &[(DateTime<Utc>, f64)]) -> Option<f64> {
    if equity_curve.len() < SHARPE_MIN_OBSERVATIONS + 1 {
        return None;
    }
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| {
            let prev = w[0].1;
            if prev > 0.0 {
                (w[1].1 - prev) / prev
            } else {
                0.0
            }
        })
        .collect();

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    if stddev > 0.0 {
        Some(mean / stddev * TRADING_DAYS_PER_YEAR.sqrt())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderRequest, OrderType};
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 16, 0, 0).unwrap()
    }

    fn fill(id: &str, side: OrderSide, qty: u32, price: f64, day: u32) -> OrderSnapshot {
        let mut snapshot = OrderSnapshot::from_request(
            &OrderRequest {
                client_id: id.to_string(),
                symbol: "AAPL".into(),
                side,
                order_type: OrderType::Market,
                quantity: qty,
                limit_price: None,
                stop_price: None,
                trail_pct: None,
                parent_strategy_id: None,
                oco_peer_id: None,
            },
            ts(day),
        );
        snapshot.status = crate::domain::order::OrderStatus::Filled;
        snapshot.filled_qty = qty;
        snapshot.avg_fill_price = Some(price);
        snapshot.updated_at = ts(day);
        snapshot
    }

    fn curve(values: &[f64]) -> Vec<(DateTime<Utc>, f64)> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| (ts(1) + chrono::Duration::days(i as i64), v))
            .collect()
    }

    #[test]
    fn fifo_matches_one_round_trip() {
        let filled = vec![
            fill("b1", OrderSide::Buy, 10, 100.0, 1),
            fill("s1", OrderSide::Sell, 10, 110.0, 2),
        ];
        let pairs = matched_trades(&filled);
        assert_eq!(pairs.len(), 1);
        assert!((pairs[0].pnl - 100.0).abs() < 1e-9);
        assert!((pairs[0].entry_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn fifo_partial_exits_make_one_pair_each() {
        let filled = vec![
            fill("b1", OrderSide::Buy, 30, 100.0, 1),
            fill("s1", OrderSide::Sell, 10, 105.0, 2),
            fill("s2", OrderSide::Sell, 10, 110.0, 3),
            fill("s3", OrderSide::Sell, 10, 115.0, 4),
        ];
        let pairs = matched_trades(&filled);
        assert_eq!(pairs.len(), 3);
        assert!((pairs[0].pnl - 50.0).abs() < 1e-9);
        assert!((pairs[1].pnl - 100.0).abs() < 1e-9);
        assert!((pairs[2].pnl - 150.0).abs() < 1e-9);
    }

    #[test]
    fn fifo_sell_spanning_two_lots_blends_cost() {
        let filled = vec![
            fill("b1", OrderSide::Buy, 10, 100.0, 1),
            fill("b2", OrderSide::Buy, 10, 120.0, 2),
            fill("s1", OrderSide::Sell, 20, 130.0, 3),
        ];
        let pairs = matched_trades(&filled);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].quantity, 20);
        assert!((pairs[0].entry_price - 110.0).abs() < 1e-9);
        assert!((pairs[0].pnl - 400.0).abs() < 1e-9);
    }

    #[test]
    fn unmatched_sell_is_ignored() {
        let filled = vec![fill("s1", OrderSide::Sell, 10, 110.0, 1)];
        assert!(matched_trades(&filled).is_empty());
    }

    #[test]
    fn metrics_single_winner() {
        let filled = vec![
            fill("b1", OrderSide::Buy, 1, 100.0, 1),
            fill("s1", OrderSide::Sell, 1, 110.0, 2),
        ];
        let curve = curve(&[100_000.0, 100_010.0]);
        let metrics = compute(&filled, &curve, 100_000.0);
        assert_eq!(metrics.total_trades, 1);
        assert_eq!(metrics.winning_trades, 1);
        assert!((metrics.total_return - 10.0).abs() < 1e-9);
        assert!((metrics.win_rate - 1.0).abs() < 1e-9);
        assert!(metrics.profit_factor.is_infinite());
        assert!((metrics.largest_win - 10.0).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_balances_wins_and_losses() {
        let filled = vec![
            fill("b1", OrderSide::Buy, 1, 100.0, 1),
            fill("s1", OrderSide::Sell, 1, 110.0, 2),
            fill("b2", OrderSide::Buy, 1, 100.0, 3),
            fill("s2", OrderSide::Sell, 1, 95.0, 4),
        ];
        let metrics = compute(&filled, &curve(&[100.0, 100.0]), 100.0);
        assert!((metrics.profit_factor - 2.0).abs() < 1e-9);
        assert!((metrics.win_rate - 0.5).abs() < 1e-9);
        assert!((metrics.avg_loss + 5.0).abs() < 1e-9);
        assert!((metrics.largest_loss + 5.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let curve = curve(&[100.0, 120.0, 90.0, 110.0]);
        let metrics = compute(&[], &curve, 100.0);
        assert!((metrics.max_drawdown - 30.0).abs() < 1e-9);
        assert!((metrics.max_drawdown_pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn sharpe_omitted_below_minimum_observations() {
        let metrics = compute(&[], &curve(&[100.0; 20]), 100.0);
        assert!(metrics.sharpe_ratio.is_none());
    }

    #[test]
    fn sharpe_present_with_enough_observations() {
        let values: Vec<f64> = (0..40).map(|i| 100.0 + (i % 7) as f64).collect();
        let metrics = compute(&[], &curve(&values), 100.0);
        assert!(metrics.sharpe_ratio.is_some());
    }

    #[test]
    fn flat_curve_has_no_sharpe() {
        let metrics = compute(&[], &curve(&[100.0; 40]), 100.0);
        assert!(metrics.sharpe_ratio.is_none());
    }
}
