//! Order router: one submit/cancel/query surface over any broker provider.
//!
//! Every state-changing call appends an audit record before it returns.
//! Submits are idempotent on the client order id, so a retried transition
//! can never duplicate an order at the broker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::audit::AuditLog;
use crate::domain::error::TradeloopError;
use crate::domain::evaluator::OrderView;
use crate::domain::order::{
    AccountSnapshot, OrderRequest, OrderSnapshot, Position, Quote,
};
use crate::domain::safety::RecentSubmission;
use crate::ports::broker_port::BrokerPort;

pub struct OrderRouter<B: BrokerPort> {
    broker: B,
    submitted: HashMap<String, OrderSnapshot>,
    recent: Vec<RecentSubmission>,
}

impl<B: BrokerPort> OrderRouter<B> {
    pub fn new(broker: B) -> Self {
        OrderRouter {
            broker,
            submitted: HashMap::new(),
            recent: Vec::new(),
        }
    }

    /// Direct access to the provider, e.g. to advance a simulation.
    pub fn provider(&self) -> &B {
        &self.broker
    }

    pub fn provider_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn account(&self) -> Result<AccountSnapshot, TradeloopError> {
        self.broker.account()
    }

    pub fn position(&self, symbol: &str) -> Result<Option<Position>, TradeloopError> {
        self.broker.position(symbol)
    }

    pub fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderSnapshot>, TradeloopError> {
        self.broker.open_orders(symbol)
    }

    pub fn quote(&self, symbol: &str) -> Result<Quote, TradeloopError> {
        self.broker.quote(symbol)
    }

    pub fn is_market_open(&self) -> Result<bool, TradeloopError> {
        self.broker.is_market_open()
    }

    /// Submissions inside the duplicate-detection window ending at `now`.
    pub fn recent_submissions(&mut self, now: DateTime<Utc>, window_seconds: i64) -> Vec<RecentSubmission> {
        self.recent
            .retain(|r| (now - r.at).num_seconds() < window_seconds.max(0));
        self.recent.clone()
    }

    pub fn submit(
        &mut self,
        request: &OrderRequest,
        audit: &AuditLog,
        now: DateTime<Utc>,
    ) -> Result<OrderSnapshot, TradeloopError> {
        if self.submitted.contains_key(&request.client_id) {
            debug!(client_id = %request.client_id, "duplicate submit, returning existing order");
            return self.refresh(&request.client_id);
        }

        let details = serde_json::json!({
            "client_id": request.client_id,
            "symbol": request.symbol,
            "side": request.side,
            "type": request.order_type,
            "quantity": request.quantity,
            "limit_price": request.limit_price,
            "stop_price": request.stop_price,
            "trail_pct": request.trail_pct,
            "strategy_id": request.parent_strategy_id,
        });

        match self.broker.submit(request) {
            Ok(snapshot) => {
                info!(
                    client_id = %snapshot.client_id,
                    symbol = %snapshot.symbol,
                    status = ?snapshot.status,
                    "order submitted"
                );
                self.submitted
                    .insert(request.client_id.clone(), snapshot.clone());
                self.recent.push(RecentSubmission {
                    fingerprint: request.fingerprint(),
                    at: now,
                });
                if audit.record(now, "submit_order", details).is_err() {
                    warn!("audit append failed for submit_order");
                }
                Ok(snapshot)
            }
            Err(e) => {
                let _ = audit.record_error(now, "submit_order", details, &e);
                Err(e)
            }
        }
    }

    pub fn cancel(
        &mut self,
        client_id: &str,
        audit: &AuditLog,
        now: DateTime<Utc>,
    ) -> Result<(), TradeloopError> {
        let details = serde_json::json!({ "client_id": client_id });
        match self.broker.cancel(client_id) {
            Ok(()) => {
                info!(client_id, "order cancelled");
                if let Ok(Some(snapshot)) = self.broker.status(client_id) {
                    self.submitted.insert(client_id.to_string(), snapshot);
                }
                if audit.record(now, "cancel_order", details).is_err() {
                    warn!("audit append failed for cancel_order");
                }
                Ok(())
            }
            Err(e) => {
                let _ = audit.record_error(now, "cancel_order", details, &e);
                Err(e)
            }
        }
    }

    /// Latest snapshot for a routed order, preferring the broker's view.
    pub fn status(&self, client_id: &str) -> Result<Option<OrderSnapshot>, TradeloopError> {
        match self.broker.status(client_id)? {
            Some(snapshot) => Ok(Some(snapshot)),
            None => Ok(self.submitted.get(client_id).cloned()),
        }
    }

    fn refresh(&mut self, client_id: &str) -> Result<OrderSnapshot, TradeloopError> {
        if let Some(snapshot) = self.broker.status(client_id)? {
            self.submitted.insert(client_id.to_string(), snapshot);
        }
        self.submitted
            .get(client_id)
            .cloned()
            .ok_or_else(|| TradeloopError::NotFound {
                what: "order",
                id: client_id.to_string(),
            })
    }
}

impl<B: BrokerPort> OrderView for OrderRouter<B> {
    fn order(&self, client_id: &str) -> Option<OrderSnapshot> {
        self.status(client_id).ok().flatten()
    }
}
