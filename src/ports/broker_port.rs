//! Broker capability trait.
//!
//! Implemented by live broker adapters and by the historical simulator, so
//! the evaluator behaves identically against either.

use crate::domain::error::TradeloopError;
use crate::domain::order::{AccountSnapshot, OrderRequest, OrderSnapshot, Position, Quote};

pub trait BrokerPort {
    /// Called once at the start of every engine cycle. Pull-based providers
    /// refresh cached state here; the replay provider steps one bar.
    fn refresh(&mut self) -> Result<(), TradeloopError> {
        Ok(())
    }

    fn account(&self) -> Result<AccountSnapshot, TradeloopError>;

    fn positions(&self) -> Result<Vec<Position>, TradeloopError>;

    fn position(&self, symbol: &str) -> Result<Option<Position>, TradeloopError> {
        Ok(self
            .positions()?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }

    fn quote(&self, symbol: &str) -> Result<Quote, TradeloopError>;

    /// Submit an order. Market orders may come back already filled.
    fn submit(&mut self, request: &OrderRequest) -> Result<OrderSnapshot, TradeloopError>;

    fn cancel(&mut self, client_id: &str) -> Result<(), TradeloopError>;

    fn status(&self, client_id: &str) -> Result<Option<OrderSnapshot>, TradeloopError>;

    /// Orders that are not yet in a final status, optionally per symbol.
    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderSnapshot>, TradeloopError>;

    fn is_market_open(&self) -> Result<bool, TradeloopError>;
}

impl<T: BrokerPort + ?Sized> BrokerPort for Box<T> {
    fn refresh(&mut self) -> Result<(), TradeloopError> {
        (**self).refresh()
    }

    fn account(&self) -> Result<AccountSnapshot, TradeloopError> {
        (**self).account()
    }

    fn positions(&self) -> Result<Vec<Position>, TradeloopError> {
        (**self).positions()
    }

    fn position(&self, symbol: &str) -> Result<Option<Position>, TradeloopError> {
        (**self).position(symbol)
    }

    fn quote(&self, symbol: &str) -> Result<Quote, TradeloopError> {
        (**self).quote(symbol)
    }

    fn submit(&mut self, request: &OrderRequest) -> Result<OrderSnapshot, TradeloopError> {
        (**self).submit(request)
    }

    fn cancel(&mut self, client_id: &str) -> Result<(), TradeloopError> {
        (**self).cancel(client_id)
    }

    fn status(&self, client_id: &str) -> Result<Option<OrderSnapshot>, TradeloopError> {
        (**self).status(client_id)
    }

    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderSnapshot>, TradeloopError> {
        (**self).open_orders(symbol)
    }

    fn is_market_open(&self) -> Result<bool, TradeloopError> {
        (**self).is_market_open()
    }
}
