//! Backtest driver: deterministic bar replay.
//!
//! Replays a bar sequence through the same evaluator the live engine runs,
//! against the historical broker. Within one bar the evaluator is stepped
//! until it settles so multi-order structures assemble promptly; fills only
//! happen when the next bar is processed. Identical inputs produce
//! identical results.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::audit::AuditLog;
use crate::domain::bar::{self, Bar};
use crate::domain::engine::StopFlag;
use crate::domain::error::TradeloopError;
use crate::domain::evaluator::{self, Action, Step};
use crate::domain::ledger::{FillRecord, MemoryLedger};
use crate::domain::metrics::{self, BacktestResult, BacktestStatus};
use crate::domain::order::{OrderSide, Quote};
use crate::domain::router::OrderRouter;
use crate::domain::safety::{self, GateInputs, SafetyPolicy};
use crate::domain::sim_broker::HistoricalBroker;
use crate::domain::strategy::{Phase, RuntimeState, Strategy};
use crate::ports::ledger_port::LedgerPort;

/// Evaluator steps allowed per bar before the driver moves on.
const SETTLE_LIMIT: usize = 8;

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_cash: f64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Gate policy applied to simulated orders. Unrestricted by default so
    /// plain backtests never trip caps; pass the live policy to rehearse
    /// refusals.
    pub policy: SafetyPolicy,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_cash: 100_000.0,
            start: None,
            end: None,
            policy: SafetyPolicy::unrestricted(),
        }
    }
}

/// Run one strategy over a bar series and produce the result document.
///
/// Missing data and gate refusal of the initial entry come back as
/// structured statuses on the result, never as errors that would lose the
/// partial ledger.
pub fn run_backtest(
    strategy: &Strategy,
    bars: &[Bar],
    config: &BacktestConfig,
    stop: &StopFlag,
) -> Result<BacktestResult, TradeloopError> {
    strategy.validate()?;
    bar::validate_series(bars)?;

    let bars: Vec<Bar> = bars
        .iter()
        .filter(|b| config.start.map_or(true, |start| b.ts >= start))
        .filter(|b| config.end.map_or(true, |end| b.ts <= end))
        .cloned()
        .collect();

    if bars.is_empty() {
        return Ok(empty_result(
            strategy,
            config,
            BacktestStatus::NoData,
            strategy.created_at,
        ));
    }

    let mut broker = HistoricalBroker::new(config.initial_cash);
    broker.load_bars(&strategy.symbol, bars.clone());
    let mut router = OrderRouter::new(broker);
    let ledger = MemoryLedger::new();
    let audit = AuditLog::null();

    let mut working = strategy.clone();
    let mut equity_curve: Vec<(DateTime<Utc>, f64)> = Vec::new();
    let mut status = BacktestStatus::Completed;

    'bars: for bar in &bars {
        if stop.is_set() {
            status = BacktestStatus::Interrupted;
            break;
        }
        let now = bar.ts;
        router.provider_mut().advance_to(now);
        let quote = Quote::from_bar(&strategy.symbol, bar);

        for _ in 0..SETTLE_LIMIT {
            if !working.is_active(now) {
                break;
            }
            let step = evaluator::step(&working, &quote, &router, now);
            let settled = step.action.is_none() && step.note.is_none();
            if let Some(refusal) =
                apply_step(step, &mut working, &mut router, &ledger, &audit, &quote, config, now)?
            {
                status = refusal;
                break 'bars;
            }
            if settled {
                break;
            }
        }

        let account = router.account()?;
        equity_curve.push((now, account.equity));

        match working.phase {
            // Completed mid-replay: re-arm so one run can hold many round
            // trips.
            Phase::Completed => rearm(&mut working, now),
            Phase::Cancelled => break,
            _ => {}
        }
        if working.runtime.quarantined {
            break;
        }
    }

    let filled = router.provider().filled_orders();
    let computed = metrics::compute(&filled, &equity_curve, config.initial_cash);
    let final_equity = equity_curve
        .last()
        .map(|&(_, equity)| equity)
        .unwrap_or(config.initial_cash);
    let start_ts = bars.first().map(|b| b.ts).unwrap_or(strategy.created_at);
    let end_ts = bars.last().map(|b| b.ts).unwrap_or(strategy.created_at);

    debug!(
        symbol = %strategy.symbol,
        bars = bars.len(),
        trades = computed.total_trades,
        final_equity,
        "backtest finished"
    );

    Ok(BacktestResult {
        id: deterministic_result_id(strategy, &bars),
        symbol: strategy.symbol.clone(),
        variant: strategy.params.name().to_string(),
        start: start_ts,
        end: end_ts,
        // Stamped with simulated time so identical replays serialize
        // identically.
        created_at: end_ts,
        initial_cash: config.initial_cash,
        final_equity,
        status,
        metrics: computed,
        trades: filled,
        equity_curve,
    })
}

/// Route one evaluator step through the gate and the historical broker.
/// Returns a terminal status when the gate refuses the initial entry.
#[allow(clippy::too_many_arguments)]
fn apply_step(
    mut step: Step,
    working: &mut Strategy,
    router: &mut OrderRouter<HistoricalBroker>,
    ledger: &MemoryLedger,
    audit: &AuditLog,
    quote: &Quote,
    config: &BacktestConfig,
    now: DateTime<Utc>,
) -> Result<Option<BacktestStatus>, TradeloopError> {
    record_fills(&mut step, router, ledger, now);

    match step.action.take() {
        None => {
            *working = step.strategy;
            Ok(None)
        }
        Some(Action::Submit(request)) => {
            let account = router.account()?;
            let position = router.position(&request.symbol)?;
            let open_orders = router.open_orders(Some(&request.symbol))?;
            let recent =
                router.recent_submissions(now, config.policy.duplicate_window_seconds);
            let inputs = GateInputs {
                account: &account,
                position: position.as_ref(),
                open_orders: &open_orders,
                recent: &recent,
                daily: ledger.daily_activity(now)?,
                is_production: false,
                now,
            };
            if let Err(violation) =
                safety::check(&request, quote.mid(), &inputs, &config.policy, false)
            {
                if step.strategy.runtime.entry_fill_price.is_none() {
                    return Ok(Some(BacktestStatus::StrategyRejected {
                        reason: violation.to_string(),
                    }));
                }
                let mut strategy = step.strategy;
                strategy.runtime.quarantined = true;
                strategy.runtime.last_error = Some(violation.to_string());
                *working = strategy;
                return Ok(None);
            }

            router.submit(&request, audit, now)?;
            *working = step.strategy;
            Ok(None)
        }
        Some(Action::Cancel { client_id }) => {
            match router.cancel(&client_id, audit, now) {
                Ok(()) => {
                    *working = step.strategy;
                }
                Err(e) => {
                    let mut strategy = step.strategy;
                    strategy.runtime.oco_desync = true;
                    strategy.runtime.quarantined = true;
                    strategy.runtime.last_error = Some(e.to_string());
                    *working = strategy;
                }
            }
            Ok(None)
        }
    }
}

fn record_fills(
    step: &mut Step,
    router: &OrderRouter<HistoricalBroker>,
    ledger: &MemoryLedger,
    now: DateTime<Utc>,
) {
    let fills = std::mem::take(&mut step.observed_fills);
    for order_id in fills {
        if step.strategy.runtime.recorded_fills.contains(&order_id) {
            continue;
        }
        let Ok(Some(snapshot)) = router.status(&order_id) else {
            continue;
        };
        let Some(price) = snapshot.avg_fill_price else {
            continue;
        };
        let realized = match snapshot.side {
            OrderSide::Sell => step
                .strategy
                .runtime
                .entry_fill_price
                .map(|entry| (price - entry) * f64::from(snapshot.filled_qty)),
            OrderSide::Buy => None,
        };
        let _ = ledger.record_fill(&FillRecord {
            order_id: order_id.clone(),
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            quantity: snapshot.filled_qty,
            price,
            realized_pnl: realized,
            strategy_id: step.strategy.id.clone(),
            ts: now,
        });
        step.strategy.runtime.recorded_fills.push(order_id);
    }
}

/// Reset a completed strategy for the next round trip, keeping the order
/// sequence so client ids never repeat within a run.
fn rearm(strategy: &mut Strategy, now: DateTime<Utc>) {
    let runtime = &strategy.runtime;
    strategy.runtime = RuntimeState {
        order_seq: runtime.order_seq,
        recorded_fills: runtime.recorded_fills.clone(),
        ..RuntimeState::default()
    };
    strategy.phase = Phase::Pending;
    strategy.touch(now);
}

fn empty_result(
    strategy: &Strategy,
    config: &BacktestConfig,
    status: BacktestStatus,
    ts: DateTime<Utc>,
) -> BacktestResult {
    BacktestResult {
        id: deterministic_result_id(strategy, &[]),
        symbol: strategy.symbol.clone(),
        variant: strategy.params.name().to_string(),
        start: ts,
        end: ts,
        created_at: ts,
        initial_cash: config.initial_cash,
        final_equity: config.initial_cash,
        status,
        metrics: metrics::compute(&[], &[], config.initial_cash),
        trades: Vec::new(),
        equity_curve: Vec::new(),
    }
}

/// Result id derived from the inputs, so identical replays carry identical
/// ids.
fn deterministic_result_id(strategy: &Strategy, bars: &[Bar]) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    let mut mix = |byte: u8| {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    };
    for byte in strategy.id.bytes().chain(strategy.symbol.bytes()) {
        mix(byte);
    }
    for bar in bars {
        for byte in bar.ts.timestamp().to_le_bytes() {
            mix(byte);
        }
        for byte in bar.close.to_le_bytes() {
            mix(byte);
        }
    }
    format!("{hash:016x}")[..8].to_string()
}
