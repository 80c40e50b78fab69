//! Trading engine: the evaluation cycle loop.
//!
//! Single-threaded and cooperative: one pass evaluates every active
//! strategy in id order, routing emitted orders through the safety gate.
//! A per-strategy failure quarantines that strategy and never aborts the
//! loop. The engine holds the cross-process lock for its whole run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::domain::audit::AuditLog;
use crate::domain::error::{BrokerErrorKind, TradeloopError};
use crate::domain::evaluator::{self, Action, Step};
use crate::domain::ledger::FillRecord;
use crate::domain::lock::EngineLock;
use crate::domain::order::{OrderSide, Quote};
use crate::domain::router::OrderRouter;
use crate::domain::safety::{self, GateInputs, SafetyPolicy};
use crate::domain::scheduler;
use crate::domain::strategy::{Phase, Strategy};
use crate::ports::broker_port::BrokerPort;
use crate::ports::clock_port::ClockPort;
use crate::ports::ledger_port::LedgerPort;
use crate::ports::store_port::StrategyStorePort;

/// Bounded retries for a failing bracket peer cancel before declaring the
/// pair desynchronized.
const MAX_OCO_CANCEL_RETRIES: u32 = 3;

/// Cooperative stop signal, checked between strategies and at bar-loop
/// granularity in backtests.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub dry_run: bool,
    /// True when the broker provider reaches a real-money endpoint.
    pub production: bool,
    pub owner: String,
    /// Directory holding the engine lock.
    pub config_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            poll_interval: Duration::from_secs(60),
            dry_run: false,
            production: false,
            owner: format!("tradeloop@{}", std::process::id()),
            config_dir: PathBuf::from("."),
        }
    }
}

pub struct TradingEngine<B: BrokerPort> {
    router: OrderRouter<B>,
    store: Box<dyn StrategyStorePort>,
    ledger: Box<dyn LedgerPort>,
    audit: AuditLog,
    clock: Box<dyn ClockPort>,
    policy: SafetyPolicy,
    config: EngineConfig,
    kill_switch: bool,
    healthy: bool,
    stop: StopFlag,
}

impl<B: BrokerPort> TradingEngine<B> {
    pub fn new(
        broker: B,
        store: Box<dyn StrategyStorePort>,
        ledger: Box<dyn LedgerPort>,
        audit: AuditLog,
        clock: Box<dyn ClockPort>,
        policy: SafetyPolicy,
        config: EngineConfig,
    ) -> Self {
        TradingEngine {
            router: OrderRouter::new(broker),
            store,
            ledger,
            audit,
            clock,
            policy,
            config,
            kill_switch: false,
            healthy: true,
            stop: StopFlag::new(),
        }
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn engage_kill_switch(&mut self) {
        self.kill_switch = true;
        warn!("kill switch engaged, all order flow stops");
    }

    pub fn reset_kill_switch(&mut self) {
        self.kill_switch = false;
        info!("kill switch reset");
    }

    /// Run the cycle loop until the stop flag is set. Holds the engine lock
    /// for the duration; the current cycle always completes before exit.
    pub fn run(&mut self) -> Result<(), TradeloopError> {
        let now = self.clock.now();
        let lock = EngineLock::acquire(&self.config.config_dir, &self.config.owner, now)?;
        info!(
            owner = %self.config.owner,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            dry_run = self.config.dry_run,
            "engine started"
        );
        let _ = self.audit.record(
            now,
            "engine_start",
            serde_json::json!({
                "owner": self.config.owner,
                "dry_run": self.config.dry_run,
            }),
        );

        if let Err(e) = self.reconcile_orders() {
            error!(error = %e, "order reconciliation failed at startup");
        }

        while !self.stop.is_set() {
            let cycle_started = std::time::Instant::now();
            if let Err(e) = self.run_cycle() {
                error!(error = %e, "cycle failed");
            }
            let elapsed = cycle_started.elapsed();
            if let Some(remaining) = self.config.poll_interval.checked_sub(elapsed) {
                self.sleep_interruptibly(remaining);
            }
        }

        let now = self.clock.now();
        let _ = self
            .audit
            .record(now, "engine_stop", serde_json::json!({}));
        info!("engine stopped");
        lock.release()
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let slice = Duration::from_millis(200);
        let mut remaining = total;
        while !self.stop.is_set() && remaining > Duration::ZERO {
            let nap = remaining.min(slice);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }

    /// One pass: activate due schedules, then evaluate every active
    /// strategy in id order.
    pub fn run_cycle(&mut self) -> Result<(), TradeloopError> {
        let now = self.clock.now();
        self.router.provider_mut().refresh()?;
        self.activate_due(now)?;

        if !self.router.is_market_open()? {
            debug!("market closed, skipping cycle");
            return Ok(());
        }

        let strategies = self.store.list_active(now)?;
        debug!(count = strategies.len(), "evaluating active strategies");
        for strategy in strategies {
            if self.stop.is_set() {
                break;
            }
            let id = strategy.id.clone();
            if let Err(e) = self.evaluate_one(strategy) {
                if e.is_transient() {
                    warn!(strategy_id = %id, error = %e, "transient failure, will retry next cycle");
                } else {
                    error!(strategy_id = %id, error = %e, "strategy isolated");
                    self.isolate(&id, &e);
                }
            }
        }
        Ok(())
    }

    fn activate_due(&mut self, now: DateTime<Utc>) -> Result<(), TradeloopError> {
        for mut strategy in self.store.load_all()? {
            if scheduler::activate_if_due(&mut strategy, now) {
                info!(strategy_id = %strategy.id, "scheduled strategy activated");
                self.store.upsert(&strategy)?;
                if self
                    .audit
                    .record(
                        now,
                        "strategy_activated",
                        serde_json::json!({
                            "strategy_id": strategy.id,
                            "symbol": strategy.symbol,
                        }),
                    )
                    .is_err()
                {
                    self.healthy = false;
                }
            }
        }
        Ok(())
    }

    fn evaluate_one(&mut self, strategy: Strategy) -> Result<(), TradeloopError> {
        let now = self.clock.now();
        let quote = self.router.quote(&strategy.symbol)?;
        let step = evaluator::step(&strategy, &quote, &self.router, now);
        if let Some(note) = &step.note {
            info!(strategy_id = %strategy.id, note = %note, "transition");
        }
        self.commit_step(step, &quote, now)
    }

    /// Record fills, route the action through the gate, persist the record.
    /// Shared shape with the backtest driver: the evaluator proposed, here
    /// the engine disposes.
    fn commit_step(
        &mut self,
        mut step: Step,
        quote: &Quote,
        now: DateTime<Utc>,
    ) -> Result<(), TradeloopError> {
        self.record_fills(&mut step, now);

        match step.action.take() {
            None => self.store.upsert(&step.strategy),
            Some(Action::Submit(request)) => {
                if self.config.dry_run {
                    info!(client_id = %request.client_id, "dry run, order not routed");
                    let _ = self.audit.record(
                        now,
                        "submit_order",
                        serde_json::json!({
                            "client_id": request.client_id,
                            "symbol": request.symbol,
                            "dry_run": true,
                        }),
                    );
                    return Ok(());
                }

                let account = self.router.account()?;
                let position = self.router.position(&request.symbol)?;
                let open_orders = self.router.open_orders(Some(&request.symbol))?;
                let recent = self
                    .router
                    .recent_submissions(now, self.policy.duplicate_window_seconds);
                let daily = self.ledger.daily_activity(now)?;
                let inputs = GateInputs {
                    account: &account,
                    position: position.as_ref(),
                    open_orders: &open_orders,
                    recent: &recent,
                    daily,
                    is_production: self.config.production,
                    now,
                };
                if let Err(violation) =
                    safety::check(&request, quote.mid(), &inputs, &self.policy, self.kill_switch)
                {
                    let err = TradeloopError::from(violation);
                    warn!(strategy_id = %step.strategy.id, error = %err, "order refused by safety gate");
                    let _ = self.audit.record_error(
                        now,
                        "order_refused",
                        serde_json::json!({
                            "strategy_id": step.strategy.id,
                            "client_id": request.client_id,
                        }),
                        &err,
                    );
                    let mut strategy = step.strategy;
                    strategy.runtime.quarantined = true;
                    strategy.runtime.last_error = Some(err.to_string());
                    strategy.touch(now);
                    return self.store.upsert(&strategy);
                }

                match self.router.submit(&request, &self.audit, now) {
                    Ok(_) => self.store.upsert(&step.strategy),
                    Err(e) if e.is_transient() => {
                        // Do not persist: the same deterministic client id is
                        // regenerated and resubmitted next cycle.
                        warn!(client_id = %request.client_id, error = %e, "submit failed transiently");
                        Ok(())
                    }
                    Err(e) => {
                        let mut strategy = step.strategy;
                        strategy.runtime.last_error = Some(e.to_string());
                        match strategy.phase {
                            Phase::PositionOpen | Phase::Exiting => {
                                strategy.runtime.quarantined = true;
                                let _ = strategy.transition(Phase::Exiting, now);
                            }
                            _ => {
                                let _ = strategy.transition(Phase::Cancelled, now);
                            }
                        }
                        self.store.upsert(&strategy)?;
                        Err(e)
                    }
                }
            }
            Some(Action::Cancel { client_id }) => {
                match self.router.cancel(&client_id, &self.audit, now) {
                    Ok(()) => {
                        let mut strategy = step.strategy;
                        strategy.runtime.oco_cancel_attempts = 0;
                        self.store.upsert(&strategy)
                    }
                    Err(e) => self.handle_cancel_failure(step.strategy, &client_id, e, now),
                }
            }
        }
    }

    /// Bounded retry for peer cancellation. Transient failures retry on
    /// later cycles; exhaustion or a permanent failure flags the bracket
    /// desynchronized and leaves the strategy for the operator.
    fn handle_cancel_failure(
        &mut self,
        mut strategy: Strategy,
        client_id: &str,
        error: TradeloopError,
        now: DateTime<Utc>,
    ) -> Result<(), TradeloopError> {
        let transient = matches!(
            error,
            TradeloopError::Broker {
                kind: BrokerErrorKind::Transient,
                ..
            }
        );
        strategy.runtime.oco_cancel_attempts += 1;
        let attempts = strategy.runtime.oco_cancel_attempts;

        if transient && attempts <= MAX_OCO_CANCEL_RETRIES {
            warn!(
                strategy_id = %strategy.id,
                client_id,
                attempts,
                "peer cancel failed transiently, will retry"
            );
            strategy.touch(now);
            return self.store.upsert(&strategy);
        }

        let desync = TradeloopError::OcoDesync {
            strategy_id: strategy.id.clone(),
            reason: format!("cancel of {client_id} failed after {attempts} attempts: {error}"),
        };
        error!(strategy_id = %strategy.id, error = %desync, "bracket desync");
        let _ = self.audit.record_error(
            now,
            "oco_desync",
            serde_json::json!({
                "strategy_id": strategy.id,
                "client_id": client_id,
                "attempts": attempts,
            }),
            &desync,
        );
        strategy.runtime.oco_desync = true;
        strategy.runtime.quarantined = true;
        strategy.runtime.last_error = Some(desync.to_string());
        let _ = strategy.transition(Phase::Exiting, now);
        self.store.upsert(&strategy)
    }

    fn record_fills(&mut self, step: &mut Step, now: DateTime<Utc>) {
        let fills = std::mem::take(&mut step.observed_fills);
        for order_id in fills {
            if step.strategy.runtime.recorded_fills.contains(&order_id) {
                continue;
            }
            let Ok(Some(snapshot)) = self.router.status(&order_id) else {
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
            let record = FillRecord {
                order_id: order_id.clone(),
                symbol: snapshot.symbol.clone(),
                side: snapshot.side,
                quantity: snapshot.filled_qty,
                price,
                realized_pnl: realized,
                strategy_id: step.strategy.id.clone(),
                ts: now,
            };
            if let Err(e) = self.ledger.record_fill(&record) {
                warn!(order_id = %order_id, error = %e, "fill not recorded in ledger");
            }
            step.strategy.runtime.recorded_fills.push(order_id);
        }
    }

    /// Re-query orders the store still considers live, so a restart picks
    /// up fills and cancels that happened while the engine was down.
    fn reconcile_orders(&mut self) -> Result<(), TradeloopError> {
        let now = self.clock.now();
        let mut checked = 0usize;
        for strategy in self.store.load_all()? {
            if strategy.is_terminal() {
                continue;
            }
            let mut ids: Vec<String> = Vec::new();
            if let Some(id) = &strategy.runtime.entry_order_id {
                ids.push(id.clone());
            }
            ids.extend(strategy.runtime.exit_order_ids.iter().cloned());
            for id in ids {
                checked += 1;
                match self.router.status(&id) {
                    Ok(Some(snapshot)) => {
                        debug!(order_id = %id, status = ?snapshot.status, "reconciled order")
                    }
                    Ok(None) => warn!(order_id = %id, "order unknown to broker"),
                    Err(e) => warn!(order_id = %id, error = %e, "reconcile query failed"),
                }
            }
        }
        if checked > 0 {
            let _ = self.audit.record(
                now,
                "orders_reconciled",
                serde_json::json!({ "checked": checked }),
            );
        }
        Ok(())
    }

    /// Externally cancel a strategy: flip the phase and cancel its live
    /// orders.
    pub fn cancel_strategy(&mut self, id: &str) -> Result<(), TradeloopError> {
        let now = self.clock.now();
        let mut strategy = self.store.load(id)?;
        if strategy.is_terminal() {
            return Ok(());
        }
        let mut ids: Vec<String> = Vec::new();
        if let Some(entry_id) = &strategy.runtime.entry_order_id {
            ids.push(entry_id.clone());
        }
        ids.extend(strategy.runtime.exit_order_ids.iter().cloned());
        for order_id in ids {
            if let Ok(Some(snapshot)) = self.router.status(&order_id) {
                if snapshot.status.is_live() {
                    if let Err(e) = self.router.cancel(&order_id, &self.audit, now) {
                        warn!(order_id = %order_id, error = %e, "cancel during strategy cancel failed");
                    }
                }
            }
        }
        strategy.runtime.clear_order_refs();
        strategy.transition(Phase::Cancelled, now)?;
        self.store.upsert(&strategy)?;
        let _ = self.audit.record(
            now,
            "strategy_cancelled",
            serde_json::json!({ "strategy_id": id }),
        );
        Ok(())
    }

    fn isolate(&mut self, id: &str, error: &TradeloopError) {
        let now = self.clock.now();
        let Ok(mut strategy) = self.store.load(id) else {
            return;
        };
        strategy.runtime.quarantined = true;
        strategy.runtime.last_error = Some(error.to_string());
        strategy.touch(now);
        if let Err(e) = self.store.upsert(&strategy) {
            error!(strategy_id = %id, error = %e, "failed to persist quarantine");
        }
        let _ = self.audit.record_error(
            now,
            "strategy_isolated",
            serde_json::json!({ "strategy_id": id }),
            error,
        );
    }
}
