//! Historical broker: bar-driven fill simulation.
//!
//! Answers the same broker surface as a live adapter, filling orders from
//! OHLCV bars. Per bar and per symbol at most one order fills, and pending
//! orders are processed in a fixed category order (stop triggers, then
//! limit fills, then trailing updates) so scenarios where several orders
//! could fire resolve deterministically and conservatively.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::domain::bar::Bar;
use crate::domain::error::TradeloopError;
use crate::domain::order::{
    AccountSnapshot, OrderRequest, OrderSnapshot, OrderSide, OrderStatus, OrderType, Position,
    Quote,
};
use crate::ports::broker_port::BrokerPort;

/// Per-trade cost adjustments. Zero in v1; the accounting below already
/// routes every fill through them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FillAdjustments {
    pub commission_per_trade: f64,
    pub slippage_pct: f64,
}

impl FillAdjustments {
    fn buy_cost(&self, price: f64, quantity: u32) -> f64 {
        let slipped = price * (1.0 + self.slippage_pct / 100.0);
        slipped * f64::from(quantity) + self.commission_per_trade
    }

    fn sell_proceeds(&self, price: f64, quantity: u32) -> f64 {
        let slipped = price * (1.0 - self.slippage_pct / 100.0);
        slipped * f64::from(quantity) - self.commission_per_trade
    }
}

pub struct HistoricalBroker {
    bars: HashMap<String, Vec<Bar>>,
    cursor: HashMap<String, usize>,
    current_ts: Option<DateTime<Utc>>,
    cash: f64,
    initial_cash: f64,
    positions: HashMap<String, Position>,
    orders: BTreeMap<String, OrderSnapshot>,
    submission_order: Vec<String>,
    trail_marks: HashMap<String, f64>,
    adjustments: FillAdjustments,
    next_broker_id: u64,
    exhausted: bool,
}

impl HistoricalBroker {
    pub fn new(initial_cash: f64) -> Self {
        HistoricalBroker {
            bars: HashMap::new(),
            cursor: HashMap::new(),
            current_ts: None,
            cash: initial_cash,
            initial_cash,
            positions: HashMap::new(),
            orders: BTreeMap::new(),
            submission_order: Vec::new(),
            trail_marks: HashMap::new(),
            adjustments: FillAdjustments::default(),
            next_broker_id: 1,
            exhausted: false,
        }
    }

    pub fn with_adjustments(mut self, adjustments: FillAdjustments) -> Self {
        self.adjustments = adjustments;
        self
    }

    pub fn load_bars(&mut self, symbol: &str, bars: Vec<Bar>) {
        self.cursor.insert(symbol.to_string(), 0);
        self.bars.insert(symbol.to_string(), bars);
    }

    pub fn initial_cash(&self) -> f64 {
        self.initial_cash
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    /// Advance simulated time to `ts` and process pending orders against the
    /// bars that close there.
    pub fn advance_to(&mut self, ts: DateTime<Utc>) {
        self.current_ts = Some(ts);
        for (symbol, bars) in &self.bars {
            let cursor = self.cursor.get_mut(symbol).expect("cursor exists");
            while *cursor + 1 < bars.len() && bars[*cursor + 1].ts <= ts {
                *cursor += 1;
            }
        }
        self.process_pending(ts);
    }

    fn current_bar(&self, symbol: &str) -> Option<&Bar> {
        let bars = self.bars.get(symbol)?;
        let cursor = *self.cursor.get(symbol)?;
        let bar = bars.get(cursor)?;
        // Only a bar that belongs to the current instant can fill orders.
        match self.current_ts {
            Some(ts) if bar.ts == ts => Some(bar),
            _ => None,
        }
    }

    fn latest_close(&self, symbol: &str) -> Option<f64> {
        let bars = self.bars.get(symbol)?;
        let cursor = *self.cursor.get(symbol)?;
        bars.get(cursor).map(|b| b.close)
    }

    /// All filled orders in submission order.
    pub fn filled_orders(&self) -> Vec<OrderSnapshot> {
        self.submission_order
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| o.status == OrderStatus::Filled)
            .cloned()
            .collect()
    }

    fn process_pending(&mut self, ts: DateTime<Utc>) {
        let mut filled_symbols: HashSet<String> = HashSet::new();
        let ids: Vec<String> = self.submission_order.clone();

        // Stop triggers first: the conservative side of a bar that could
        // reach both bracket legs.
        for id in &ids {
            self.try_fill_category(id, OrderType::Stop, &mut filled_symbols, ts);
        }
        for id in &ids {
            self.try_fill_category(id, OrderType::Limit, &mut filled_symbols, ts);
        }
        // Trailing stops update their watermark every bar, then test.
        for id in &ids {
            self.process_trailing(id, &mut filled_symbols, ts);
        }
    }

    fn try_fill_category(
        &mut self,
        id: &str,
        category: OrderType,
        filled_symbols: &mut HashSet<String>,
        ts: DateTime<Utc>,
    ) {
        let Some(order) = self.orders.get(id) else {
            return;
        };
        if order.order_type != category || !order.status.is_live() {
            return;
        }
        if filled_symbols.contains(&order.symbol) {
            return;
        }
        let Some(bar) = self.current_bar(&order.symbol) else {
            return;
        };

        let fill_price = match (order.order_type, order.side) {
            (OrderType::Limit, OrderSide::Buy) => {
                let limit = order.limit_price.unwrap_or(0.0);
                (bar.low <= limit).then(|| limit.min(bar.open))
            }
            (OrderType::Limit, OrderSide::Sell) => {
                let limit = order.limit_price.unwrap_or(f64::MAX);
                (bar.high >= limit).then(|| limit.max(bar.open))
            }
            (OrderType::Stop, OrderSide::Buy) => {
                let stop = order.stop_price.unwrap_or(f64::MAX);
                (bar.high >= stop).then(|| stop.max(bar.open))
            }
            (OrderType::Stop, OrderSide::Sell) => {
                let stop = order.stop_price.unwrap_or(0.0);
                (bar.low <= stop).then(|| stop.min(bar.open))
            }
            _ => None,
        };

        if let Some(price) = fill_price {
            let symbol = order.symbol.clone();
            self.apply_fill(id, price, ts);
            filled_symbols.insert(symbol);
        }
    }

    fn process_trailing(
        &mut self,
        id: &str,
        filled_symbols: &mut HashSet<String>,
        ts: DateTime<Utc>,
    ) {
        let Some(order) = self.orders.get(id) else {
            return;
        };
        if order.order_type != OrderType::TrailingStop || !order.status.is_live() {
            return;
        }
        let symbol = order.symbol.clone();
        let trail_pct = order.trail_pct.unwrap_or(0.0);
        let Some(bar) = self.current_bar(&symbol) else {
            return;
        };
        let (bar_high, bar_low, bar_open) = (bar.high, bar.low, bar.open);

        // Watermark rises with the bar high before the trigger test.
        let mark = self
            .trail_marks
            .entry(id.to_string())
            .or_insert(bar_high);
        if bar_high > *mark {
            *mark = bar_high;
        }
        let threshold = *mark * (1.0 - trail_pct / 100.0);

        if filled_symbols.contains(&symbol) {
            return;
        }
        if bar_low <= threshold {
            self.apply_fill(id, threshold.min(bar_open), ts);
            filled_symbols.insert(symbol);
        }
    }

    fn apply_fill(&mut self, id: &str, price: f64, ts: DateTime<Utc>) {
        let Some(order) = self.orders.get_mut(id) else {
            return;
        };
        order.status = OrderStatus::Filled;
        order.filled_qty = order.quantity;
        order.avg_fill_price = Some(price);
        order.updated_at = ts;

        let (symbol, side, quantity) = (order.symbol.clone(), order.side, order.quantity);
        match side {
            OrderSide::Buy => self.cash -= self.adjustments.buy_cost(price, quantity),
            OrderSide::Sell => self.cash += self.adjustments.sell_proceeds(price, quantity),
        }

        let entry = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position {
                symbol: symbol.clone(),
                quantity: 0,
                avg_entry_price: 0.0,
            });
        match side {
            OrderSide::Buy => {
                let added = i64::from(quantity);
                let prev_value = entry.quantity.max(0) as f64 * entry.avg_entry_price;
                let new_qty = entry.quantity + added;
                if new_qty > 0 {
                    entry.avg_entry_price =
                        (prev_value + added as f64 * price) / new_qty.max(added) as f64;
                }
                entry.quantity = new_qty;
            }
            OrderSide::Sell => {
                entry.quantity -= i64::from(quantity);
            }
        }
        if entry.quantity == 0 {
            self.positions.remove(&symbol);
        }
    }
}

impl BrokerPort for HistoricalBroker {
    /// Replay cadence for paper trading: each engine cycle consumes the
    /// next bar. The backtest driver drives `advance_to` itself instead.
    fn refresh(&mut self) -> Result<(), TradeloopError> {
        let mut next: Option<DateTime<Utc>> = None;
        for (symbol, bars) in &self.bars {
            let cursor = *self.cursor.get(symbol).unwrap_or(&0);
            let index = if self.current_ts.is_none() { 0 } else { cursor + 1 };
            if let Some(bar) = bars.get(index) {
                if self.current_ts.map_or(true, |ts| bar.ts > ts)
                    && next.map_or(true, |n| bar.ts < n)
                {
                    next = Some(bar.ts);
                }
            }
        }
        match next {
            Some(ts) => self.advance_to(ts),
            None => self.exhausted = true,
        }
        Ok(())
    }

    fn account(&self) -> Result<AccountSnapshot, TradeloopError> {
        let positions_value: f64 = self
            .positions
            .values()
            .map(|p| {
                self.latest_close(&p.symbol)
                    .map_or(0.0, |close| p.market_value(close))
            })
            .sum();
        Ok(AccountSnapshot {
            cash: self.cash,
            equity: self.cash + positions_value,
            buying_power: self.cash,
            day_pnl: 0.0,
            day_trade_count: 0,
            pattern_day_trader: false,
        })
    }

    fn positions(&self) -> Result<Vec<Position>, TradeloopError> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    fn quote(&self, symbol: &str) -> Result<Quote, TradeloopError> {
        let bars = self.bars.get(symbol).ok_or_else(|| TradeloopError::NoData {
            symbol: symbol.to_string(),
        })?;
        let cursor = *self.cursor.get(symbol).unwrap_or(&0);
        let bar = bars.get(cursor).ok_or_else(|| TradeloopError::NoData {
            symbol: symbol.to_string(),
        })?;
        Ok(Quote::from_bar(symbol, bar))
    }

    fn submit(&mut self, request: &OrderRequest) -> Result<OrderSnapshot, TradeloopError> {
        if let Some(existing) = self.orders.get(&request.client_id) {
            return Ok(existing.clone());
        }
        let ts = self.current_ts.unwrap_or_else(Utc::now);
        let mut snapshot = OrderSnapshot::from_request(request, ts);
        snapshot.broker_id = Some(format!("sim-{}", self.next_broker_id));
        self.next_broker_id += 1;

        match request.order_type {
            OrderType::Market => {
                let quote = self.quote(&request.symbol)?;
                snapshot.status = OrderStatus::Filled;
                snapshot.filled_qty = snapshot.quantity;
                snapshot.avg_fill_price = Some(quote.last);
                self.orders
                    .insert(request.client_id.clone(), snapshot.clone());
                self.submission_order.push(request.client_id.clone());
                self.apply_fill(&request.client_id, quote.last, ts);
                return Ok(self
                    .orders
                    .get(&request.client_id)
                    .cloned()
                    .expect("order just inserted"));
            }
            OrderType::TrailingStop => {
                let quote = self.quote(&request.symbol)?;
                self.trail_marks
                    .insert(request.client_id.clone(), quote.last);
                snapshot.status = OrderStatus::Accepted;
            }
            OrderType::Limit | OrderType::Stop => {
                snapshot.status = OrderStatus::Accepted;
            }
        }

        self.orders
            .insert(request.client_id.clone(), snapshot.clone());
        self.submission_order.push(request.client_id.clone());
        Ok(snapshot)
    }

    fn cancel(&mut self, client_id: &str) -> Result<(), TradeloopError> {
        let ts = self.current_ts.unwrap_or_else(Utc::now);
        let order = self
            .orders
            .get_mut(client_id)
            .ok_or_else(|| TradeloopError::NotFound {
                what: "order",
                id: client_id.to_string(),
            })?;
        if !order.status.is_live() {
            return Err(TradeloopError::broker_permanent(format!(
                "order {client_id} is {:?}, cannot cancel",
                order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        order.updated_at = ts;
        self.trail_marks.remove(client_id);
        Ok(())
    }

    fn status(&self, client_id: &str) -> Result<Option<OrderSnapshot>, TradeloopError> {
        Ok(self.orders.get(client_id).cloned())
    }

    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderSnapshot>, TradeloopError> {
        Ok(self
            .submission_order
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| o.status.is_live())
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    fn is_market_open(&self) -> Result<bool, TradeloopError> {
        Ok(!self.exhausted)
    }
}
