#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};

use tradeloop::domain::bar::Bar;
use tradeloop::domain::error::TradeloopError;
use tradeloop::domain::order::{
    AccountSnapshot, OrderRequest, OrderSnapshot, OrderStatus, OrderType, Position, Quote,
};
use tradeloop::domain::strategy::{ScaleRung, Strategy, VariantParams};
use tradeloop::ports::broker_port::BrokerPort;
use tradeloop::ports::clock_port::ClockPort;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap()
}

pub fn bar_at(day: u32, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        ts: Utc.with_ymd_and_hms(2024, 1, day, 16, 0, 0).unwrap(),
        open,
        high,
        low,
        close,
        volume: 10_000,
    }
}

pub fn flat_bar(day: u32, price: f64) -> Bar {
    bar_at(day, price, price, price, price)
}

pub fn trailing_strategy(id: &str, symbol: &str, quantity: u32, trailing_pct: f64) -> Strategy {
    let mut s = Strategy::new(
        symbol,
        VariantParams::TrailingStop { trailing_pct },
        quantity,
        base_time(),
    );
    s.id = id.to_string();
    s
}

pub fn bracket_strategy(id: &str, symbol: &str, quantity: u32, tp: f64, sl: f64) -> Strategy {
    let mut s = Strategy::new(
        symbol,
        VariantParams::Bracket {
            take_profit_pct: tp,
            stop_loss_pct: sl,
        },
        quantity,
        base_time(),
    );
    s.id = id.to_string();
    s
}

pub fn scale_out_strategy(id: &str, symbol: &str, quantity: u32, rungs: &[(f64, f64)]) -> Strategy {
    let mut s = Strategy::new(
        symbol,
        VariantParams::ScaleOut {
            rungs: rungs
                .iter()
                .map(|&(gain_pct, fraction)| ScaleRung { gain_pct, fraction })
                .collect(),
        },
        quantity,
        base_time(),
    );
    s.id = id.to_string();
    s
}

/// A settable clock shared between a test and the engine it drives.
#[derive(Clone)]
pub struct SharedClock(Arc<Mutex<DateTime<Utc>>>);

impl SharedClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        SharedClock(Arc::new(Mutex::new(start)))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl ClockPort for SharedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    pub transient: bool,
    pub message: String,
}

impl ScriptedFailure {
    fn to_error(&self) -> TradeloopError {
        if self.transient {
            TradeloopError::broker_transient(self.message.clone())
        } else {
            TradeloopError::broker_permanent(self.message.clone())
        }
    }
}

pub struct MockState {
    pub prices: HashMap<String, f64>,
    pub orders: BTreeMap<String, OrderSnapshot>,
    pub submissions: Vec<String>,
    pub cancels: Vec<String>,
    pub cancel_script: VecDeque<ScriptedFailure>,
    pub quote_failures: HashMap<String, ScriptedFailure>,
    pub account: AccountSnapshot,
    pub market_open: bool,
    pub now: DateTime<Utc>,
}

/// Scriptable broker for engine tests. Orders accepted on submit stay live
/// until the test fills or the engine cancels them.
#[derive(Clone)]
pub struct MockBroker(Arc<Mutex<MockState>>);

impl MockBroker {
    pub fn new() -> Self {
        MockBroker(Arc::new(Mutex::new(MockState {
            prices: HashMap::new(),
            orders: BTreeMap::new(),
            submissions: Vec::new(),
            cancels: Vec::new(),
            cancel_script: VecDeque::new(),
            quote_failures: HashMap::new(),
            account: AccountSnapshot {
                cash: 1_000_000.0,
                equity: 1_000_000.0,
                buying_power: 1_000_000.0,
                day_pnl: 0.0,
                day_trade_count: 0,
                pattern_day_trader: false,
            },
            market_open: true,
            now: base_time(),
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    pub fn set_market_open(&self, open: bool) {
        self.state().market_open = open;
    }

    pub fn fill_order(&self, client_id: &str, price: f64) {
        let mut state = self.state();
        let order = state
            .orders
            .get_mut(client_id)
            .unwrap_or_else(|| panic!("no order {client_id}"));
        order.status = OrderStatus::Filled;
        order.filled_qty = order.quantity;
        order.avg_fill_price = Some(price);
    }

    pub fn script_cancel_failure(&self, transient: bool, message: &str) {
        self.state().cancel_script.push_back(ScriptedFailure {
            transient,
            message: message.to_string(),
        });
    }

    pub fn script_quote_failure(&self, symbol: &str, transient: bool, message: &str) {
        self.state().quote_failures.insert(
            symbol.to_string(),
            ScriptedFailure {
                transient,
                message: message.to_string(),
            },
        );
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    pub fn cancel_count(&self) -> usize {
        self.state().cancels.len()
    }

    pub fn order(&self, client_id: &str) -> Option<OrderSnapshot> {
        self.state().orders.get(client_id).cloned()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerPort for MockBroker {
    fn account(&self) -> Result<AccountSnapshot, TradeloopError> {
        Ok(self.state().account.clone())
    }

    fn positions(&self) -> Result<Vec<Position>, TradeloopError> {
        Ok(Vec::new())
    }

    fn quote(&self, symbol: &str) -> Result<Quote, TradeloopError> {
        let state = self.state();
        if let Some(failure) = state.quote_failures.get(symbol) {
            return Err(failure.to_error());
        }
        let price = state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| TradeloopError::NoData {
                symbol: symbol.to_string(),
            })?;
        Ok(Quote::from_last(symbol, price, state.now))
    }

    fn submit(&mut self, request: &OrderRequest) -> Result<OrderSnapshot, TradeloopError> {
        let mut state = self.state();
        if let Some(existing) = state.orders.get(&request.client_id) {
            return Ok(existing.clone());
        }
        let now = state.now;
        let mut snapshot = OrderSnapshot::from_request(request, now);
        snapshot.broker_id = Some(format!("mock-{}", state.orders.len() + 1));
        snapshot.status = OrderStatus::Accepted;
        // Market orders fill immediately at the quoted price.
        if request.order_type == OrderType::Market {
            if let Some(price) = state.prices.get(&request.symbol).copied() {
                snapshot.status = OrderStatus::Filled;
                snapshot.filled_qty = snapshot.quantity;
                snapshot.avg_fill_price = Some(price);
            }
        }
        state
            .orders
            .insert(request.client_id.clone(), snapshot.clone());
        state.submissions.push(request.client_id.clone());
        Ok(snapshot)
    }

    fn cancel(&mut self, client_id: &str) -> Result<(), TradeloopError> {
        let mut state = self.state();
        state.cancels.push(client_id.to_string());
        if let Some(failure) = state.cancel_script.pop_front() {
            return Err(failure.to_error());
        }
        let order = state
            .orders
            .get_mut(client_id)
            .ok_or_else(|| TradeloopError::NotFound {
                what: "order",
                id: client_id.to_string(),
            })?;
        if order.status.is_live() {
            order.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    fn status(&self, client_id: &str) -> Result<Option<OrderSnapshot>, TradeloopError> {
        Ok(self.state().orders.get(client_id).cloned())
    }

    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderSnapshot>, TradeloopError> {
        Ok(self
            .state()
            .orders
            .values()
            .filter(|o| o.status.is_live())
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    fn is_market_open(&self) -> Result<bool, TradeloopError> {
        Ok(self.state().market_open)
    }
}
