//! End-to-end backtest scenarios: every variant driven through the replay
//! driver against hand-built bar sequences with known outcomes.

mod common;

use common::{bar_at, bracket_strategy, flat_bar, scale_out_strategy, trailing_strategy};
use tradeloop::domain::backtest::{run_backtest, BacktestConfig};
use tradeloop::domain::bar::Bar;
use tradeloop::domain::engine::StopFlag;
use tradeloop::domain::metrics::BacktestResult;
use tradeloop::domain::order::OrderSide;
use tradeloop::domain::strategy::{Strategy, VariantParams};

fn run(strategy: &Strategy, bars: &[Bar]) -> BacktestResult {
    run_backtest(strategy, bars, &BacktestConfig::default(), &StopFlag::new()).unwrap()
}

/// Cash conservation: the final equity must equal initial cash plus sell
/// proceeds, minus buy costs, plus open inventory marked to the last close.
fn assert_cash_conserved(result: &BacktestResult, last_close: f64) {
    let mut cash_delta = 0.0;
    let mut open_qty: i64 = 0;
    for trade in &result.trades {
        let notional = trade.avg_fill_price.unwrap() * f64::from(trade.filled_qty);
        match trade.side {
            OrderSide::Buy => {
                cash_delta -= notional;
                open_qty += i64::from(trade.filled_qty);
            }
            OrderSide::Sell => {
                cash_delta += notional;
                open_qty -= i64::from(trade.filled_qty);
            }
        }
    }
    let expected = result.initial_cash + cash_delta + open_qty as f64 * last_close;
    assert!(
        (result.final_equity - expected).abs() < 1e-6,
        "final equity {} != reconstructed {}",
        result.final_equity,
        expected
    );
}

#[test]
fn trailing_stop_single_winner() {
    // Ride 100 -> 120, trail 5%, exit on the fall through 114.
    let bars = vec![
        flat_bar(1, 100.0),
        flat_bar(2, 110.0),
        flat_bar(3, 120.0),
        flat_bar(4, 110.0),
        flat_bar(5, 100.0),
    ];
    let strategy = trailing_strategy("trail001", "AAPL", 1, 5.0);
    let result = run(&strategy, &bars);

    assert!((result.metrics.total_return - 10.0).abs() < 1e-9);
    assert_eq!(result.metrics.winning_trades, 1);
    assert_eq!(result.metrics.total_trades, 1);
    assert!((result.metrics.win_rate - 1.0).abs() < 1e-9);

    // The exit is the one sell, at the bar-4 price of 110.
    let sells: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].avg_fill_price, Some(110.0));

    assert_cash_conserved(&result, 100.0);
}

#[test]
fn bracket_take_profit_first() {
    // Entry at 100, tp 10%, sl 5%. The wide second bar reaches 110 and the
    // stop at 95 stays untouched.
    let bars = vec![
        flat_bar(1, 100.0),
        bar_at(2, 98.0, 112.0, 97.0, 111.0),
        bar_at(3, 110.0, 115.0, 108.0, 114.0),
    ];
    let strategy = bracket_strategy("brkt0001", "AAPL", 1, 10.0, 5.0);
    let result = run(&strategy, &bars);

    assert!((result.metrics.total_return - 10.0).abs() < 1e-9);
    assert_eq!(result.metrics.winning_trades, 1);

    let sells: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].avg_fill_price, Some(110.0));

    assert_cash_conserved(&result, 114.0);
}

#[test]
fn bracket_gap_through_stop_wins() {
    // The bar opens below the stop and also reaches the take-profit; the
    // conservative policy fills the stop at the gapped-down open.
    let bars = vec![flat_bar(1, 100.0), bar_at(2, 92.0, 111.0, 92.0, 110.0)];
    let strategy = bracket_strategy("brkt0002", "AAPL", 1, 10.0, 5.0);
    let result = run(&strategy, &bars);

    assert!((result.metrics.total_return + 8.0).abs() < 1e-9);
    assert_eq!(result.metrics.losing_trades, 1);
    assert!((result.metrics.largest_loss + 8.0).abs() < 1e-9);

    let sells: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].avg_fill_price, Some(92.0));

    assert_cash_conserved(&result, 110.0);
}

#[test]
fn bracket_completion_leaves_no_live_orders() {
    let bars = vec![
        flat_bar(1, 100.0),
        bar_at(2, 98.0, 112.0, 97.0, 111.0),
    ];
    let strategy = bracket_strategy("brkt0003", "AAPL", 1, 10.0, 5.0);
    let result = run(&strategy, &bars);

    // One entry buy, one winning exit; the stop never fills.
    let fills_at_95: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.avg_fill_price == Some(95.0))
        .collect();
    assert!(fills_at_95.is_empty());
    assert!((result.metrics.total_return - 10.0).abs() < 1e-9);
}

#[test]
fn scale_out_fills_rungs_and_sums_quantities() {
    let bars = vec![
        flat_bar(1, 100.0),
        flat_bar(2, 106.0),
        flat_bar(3, 111.0),
        flat_bar(4, 116.0),
    ];
    let strategy = scale_out_strategy(
        "scale001",
        "AAPL",
        30,
        &[(5.0, 1.0 / 3.0), (10.0, 1.0 / 3.0), (15.0, 1.0 / 3.0)],
    );
    let result = run(&strategy, &bars);

    // Each rung sells 10 shares; sells at max(limit, open).
    let sells: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Sell)
        .collect();
    assert_eq!(sells.len(), 3);
    assert!(sells.iter().all(|t| t.filled_qty == 10));
    assert_eq!(
        sells
            .iter()
            .map(|t| t.avg_fill_price.unwrap())
            .collect::<Vec<_>>(),
        vec![106.0, 111.0, 116.0]
    );
    assert_eq!(result.metrics.winning_trades, 3);

    assert_cash_conserved(&result, 116.0);
}

#[test]
fn scale_out_rounding_residue_goes_to_last_rung() {
    let bars = vec![flat_bar(1, 100.0), flat_bar(2, 120.0)];
    let strategy = scale_out_strategy("scale002", "AAPL", 10, &[(5.0, 0.25), (10.0, 0.75)]);
    let result = run(&strategy, &bars);

    let sells: Vec<u32> = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Sell)
        .map(|t| t.filled_qty)
        .collect();
    // Only one rung can fill on the single wide bar; whichever filled, the
    // placed quantities were 2 and 8 (the 2.5/7.5 split rounds toward the
    // last rung).
    assert!(!sells.is_empty());
    assert!(sells.iter().all(|&q| q == 2 || q == 8));
}

#[test]
fn scale_out_never_sells_more_than_the_position() {
    // Four rungs whose fractions each round up individually; a 2-share
    // position must still sell exactly 2 shares in total.
    let bars = vec![
        flat_bar(1, 100.0),
        flat_bar(2, 112.0),
        flat_bar(3, 117.0),
        flat_bar(4, 122.0),
    ];
    let strategy = scale_out_strategy(
        "scale003",
        "AAPL",
        2,
        &[(5.0, 0.3), (10.0, 0.3), (15.0, 0.3), (20.0, 0.1)],
    );
    let result = run(&strategy, &bars);

    let sold: u32 = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Sell)
        .map(|t| t.filled_qty)
        .sum();
    let bought: u32 = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Buy)
        .map(|t| t.filled_qty)
        .sum();
    assert!(sold <= bought);
    assert!(result
        .trades
        .iter()
        .all(|t| t.side == OrderSide::Buy || t.filled_qty > 0));

    assert_cash_conserved(&result, 122.0);
}

#[test]
fn grid_cycles_buy_then_replacement_sell() {
    let mut strategy = Strategy::new(
        "SPY",
        VariantParams::Grid {
            reference_price: 100.0,
            spacing_pct: 5.0,
            levels_per_side: 1,
        },
        5,
        common::base_time(),
    );
    strategy.id = "grid0001".to_string();

    let bars = vec![flat_bar(1, 100.0), flat_bar(2, 94.0), flat_bar(3, 101.0)];
    let result = run(&strategy, &bars);

    // The 95 buy fills at the gapped open 94; the queued replacement sell
    // one rung above (99.75) fills at the 101 open.
    let buys: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Buy)
        .collect();
    let sells: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Sell)
        .collect();
    assert_eq!(buys.len(), 1);
    assert_eq!(buys[0].avg_fill_price, Some(94.0));
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].avg_fill_price, Some(101.0));

    // Grid has no terminal phase: the run ends with the strategy still
    // working its levels.
    assert!((result.metrics.total_return - 35.0).abs() < 1e-9);
    assert_cash_conserved(&result, 101.0);
}

#[test]
fn pullback_trailing_enters_on_dip() {
    let mut strategy = Strategy::new(
        "AAPL",
        VariantParams::PullbackTrailing {
            pullback_pct: 5.0,
            trailing_pct: 5.0,
        },
        1,
        common::base_time(),
    );
    strategy.id = "pull0001".to_string();

    // High reference reaches 110; 104 <= 104.5 triggers the entry; the
    // trailing exit then gives back to 96.
    let bars = vec![
        flat_bar(1, 100.0),
        flat_bar(2, 110.0),
        flat_bar(3, 104.0),
        flat_bar(4, 108.0),
        flat_bar(5, 96.0),
    ];
    let result = run(&strategy, &bars);

    let buys: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Buy)
        .collect();
    assert_eq!(buys[0].avg_fill_price, Some(104.0));
    assert_eq!(result.metrics.losing_trades, 1);
    assert!((result.metrics.largest_loss + 8.0).abs() < 1e-9);
}

#[test]
fn completed_strategy_rearms_for_the_next_round_trip() {
    // Two full trailing cycles inside one replay.
    let bars = vec![
        flat_bar(1, 100.0),
        flat_bar(2, 120.0),
        flat_bar(3, 110.0),
        flat_bar(4, 100.0),
        flat_bar(5, 125.0),
        flat_bar(6, 110.0),
    ];
    let strategy = trailing_strategy("trail002", "AAPL", 1, 5.0);
    let result = run(&strategy, &bars);

    assert!(result.metrics.total_trades >= 2);
    let buys = result
        .trades
        .iter()
        .filter(|t| t.side == OrderSide::Buy)
        .count();
    assert!(buys >= 2, "expected a re-entry after completion");
}

#[test]
fn replay_is_deterministic() {
    let bars = vec![
        flat_bar(1, 100.0),
        bar_at(2, 98.0, 112.0, 97.0, 111.0),
        bar_at(3, 110.0, 115.0, 108.0, 114.0),
        flat_bar(4, 109.0),
        flat_bar(5, 117.0),
    ];
    let strategy = bracket_strategy("brkt0004", "AAPL", 3, 10.0, 5.0);

    let first = run(&strategy, &bars);
    let second = run(&strategy, &bars);

    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(first.equity_curve, second.equity_curve);
    assert_eq!(first.trades, second.trades);
    assert!((first.final_equity - second.final_equity).abs() < f64::EPSILON);
}

#[test]
fn equity_curve_has_one_point_per_bar() {
    let bars = vec![
        flat_bar(1, 100.0),
        flat_bar(2, 110.0),
        flat_bar(3, 105.0),
    ];
    let strategy = trailing_strategy("trail003", "AAPL", 1, 5.0);
    let result = run(&strategy, &bars);

    assert_eq!(result.equity_curve.len(), 3);
    assert_eq!(result.equity_curve[0].0, bars[0].ts);
    // Bar 1: bought 1 @ 100, marked at 100: flat equity.
    assert!((result.equity_curve[0].1 - 100_000.0).abs() < 1e-9);
    // Bar 2: position marked at 110.
    assert!((result.equity_curve[1].1 - 100_010.0).abs() < 1e-9);
}
