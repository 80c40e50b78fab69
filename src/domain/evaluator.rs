//! Strategy evaluation: pure per-phase transition logic.
//!
//! One step takes the strategy record, a fresh quote and a read-only view of
//! order state, and returns the updated record plus at most one action. The
//! step never touches the store or the broker itself, which is what makes
//! live and simulated execution behave identically.

use chrono::{DateTime, Utc};

use crate::domain::order::{
    OrderRequest, OrderSide, OrderSnapshot, OrderStatus, OrderType, Quote,
};
use crate::domain::strategy::{GridLevel, Phase, RungState, ScaleRung, Strategy, VariantParams};

/// Read-only order lookup the evaluator consults for fill detection.
pub trait OrderView {
    fn order(&self, client_id: &str) -> Option<OrderSnapshot>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Submit(OrderRequest),
    Cancel { client_id: String },
}

/// Outcome of one evaluation step.
#[derive(Debug, Clone)]
pub struct Step {
    pub strategy: Strategy,
    pub action: Option<Action>,
    /// Human-readable reason for the transition, for logs and audit.
    pub note: Option<String>,
    /// Client ids newly observed filled during this step.
    pub observed_fills: Vec<String>,
}

impl Step {
    fn quiet(strategy: Strategy) -> Self {
        Step {
            strategy,
            action: None,
            note: None,
            observed_fills: Vec::new(),
        }
    }

    fn noted(strategy: Strategy, note: String) -> Self {
        Step {
            strategy,
            action: None,
            note: Some(note),
            observed_fills: Vec::new(),
        }
    }

    fn acting(strategy: Strategy, action: Action, note: String) -> Self {
        Step {
            strategy,
            action: Some(action),
            note: Some(note),
            observed_fills: Vec::new(),
        }
    }
}

/// Evaluate one step for an active strategy.
pub fn step(
    strategy: &Strategy,
    quote: &Quote,
    orders: &dyn OrderView,
    now: DateTime<Utc>,
) -> Step {
    let strategy = strategy.clone();
    match strategy.phase {
        Phase::Pending => evaluate_pending(strategy, quote, now),
        Phase::EntryActive => evaluate_entry_active(strategy, orders, now),
        Phase::PositionOpen => evaluate_position_open(strategy, quote, orders, now),
        Phase::Exiting => evaluate_exiting(strategy, orders, now),
        Phase::Completed | Phase::Cancelled => Step::quiet(strategy),
    }
}

fn order_request(
    strategy: &mut Strategy,
    side: OrderSide,
    order_type: OrderType,
    quantity: u32,
) -> OrderRequest {
    OrderRequest {
        client_id: strategy.next_client_order_id(),
        symbol: strategy.symbol.clone(),
        side,
        order_type,
        quantity,
        limit_price: None,
        stop_price: None,
        trail_pct: None,
        parent_strategy_id: Some(strategy.id.clone()),
        oco_peer_id: None,
    }
}

fn evaluate_pending(mut strategy: Strategy, quote: &Quote, now: DateTime<Utc>) -> Step {
    match strategy.params.clone() {
        VariantParams::PullbackTrailing { pullback_pct, .. } => {
            evaluate_pullback_pending(strategy, quote, pullback_pct, now)
        }
        VariantParams::Grid {
            reference_price,
            spacing_pct,
            levels_per_side,
        } => {
            // Grid strategies hold no single entry; they go straight to
            // level management.
            let mut levels = Vec::new();
            for i in 1..=levels_per_side {
                let offset = f64::from(i) * spacing_pct / 100.0;
                levels.push(GridLevel {
                    price: reference_price * (1.0 - offset),
                    side: OrderSide::Buy,
                    order_id: None,
                    filled: false,
                });
                levels.push(GridLevel {
                    price: reference_price * (1.0 + offset),
                    side: OrderSide::Sell,
                    order_id: None,
                    filled: false,
                });
            }
            strategy.runtime.grid_levels = levels;
            strategy.phase = Phase::PositionOpen;
            strategy.touch(now);
            Step::noted(
                strategy,
                format!(
                    "grid armed: {levels_per_side} levels per side around {reference_price:.2}"
                ),
            )
        }
        _ => {
            let quantity = strategy.quantity;
            let action = match strategy.entry_price {
                Some(limit) => {
                    let mut request =
                        order_request(&mut strategy, OrderSide::Buy, OrderType::Limit, quantity);
                    request.limit_price = Some(limit);
                    request
                }
                None => order_request(&mut strategy, OrderSide::Buy, OrderType::Market, quantity),
            };
            let note = match strategy.entry_price {
                Some(limit) => format!("limit entry at {limit:.2}"),
                None => "market entry".to_string(),
            };
            strategy.runtime.entry_order_id = Some(action.client_id.clone());
            strategy.phase = Phase::EntryActive;
            strategy.touch(now);
            Step::acting(strategy, Action::Submit(action), note)
        }
    }
}

fn evaluate_pullback_pending(
    mut strategy: Strategy,
    quote: &Quote,
    pullback_pct: f64,
    now: DateTime<Utc>,
) -> Step {
    let price = quote.mid();
    let observed_high = quote.high.max(price);

    let Some(reference) = strategy.runtime.pullback_reference else {
        strategy.runtime.pullback_reference = Some(observed_high);
        strategy.touch(now);
        return Step::noted(
            strategy,
            format!("pullback reference set to {observed_high:.2}"),
        );
    };

    if observed_high > reference {
        strategy.runtime.pullback_reference = Some(observed_high);
        strategy.touch(now);
        return Step::noted(
            strategy,
            format!("pullback reference raised to {observed_high:.2}"),
        );
    }

    let threshold = reference * (1.0 - pullback_pct / 100.0);
    if price <= threshold {
        let quantity = strategy.quantity;
        let request = order_request(&mut strategy, OrderSide::Buy, OrderType::Market, quantity);
        strategy.runtime.entry_order_id = Some(request.client_id.clone());
        strategy.phase = Phase::EntryActive;
        strategy.touch(now);
        return Step::acting(
            strategy,
            Action::Submit(request),
            format!("pullback to {price:.2} (<= {threshold:.2}), entering"),
        );
    }

    Step::quiet(strategy)
}

fn evaluate_entry_active(
    mut strategy: Strategy,
    orders: &dyn OrderView,
    now: DateTime<Utc>,
) -> Step {
    let Some(entry_id) = strategy.runtime.entry_order_id.clone() else {
        strategy.runtime.last_error = Some("entry_active without entry order id".into());
        strategy.phase = Phase::Cancelled;
        strategy.touch(now);
        return Step::noted(strategy, "cancelled: entry order id missing".into());
    };

    let Some(snapshot) = orders.order(&entry_id) else {
        // In flight or unknown after a timeout; re-query next step.
        return Step::quiet(strategy);
    };

    match snapshot.status {
        OrderStatus::Filled => {
            let fill_price = snapshot.avg_fill_price.unwrap_or(0.0);
            strategy.runtime.entry_fill_price = Some(fill_price);
            strategy.runtime.high_watermark = Some(fill_price);
            strategy.phase = Phase::PositionOpen;
            strategy.touch(now);
            let mut step = Step::noted(strategy, format!("entry filled at {fill_price:.2}"));
            step.observed_fills.push(entry_id);
            step
        }
        OrderStatus::Cancelled | OrderStatus::Rejected => {
            strategy.runtime.last_error = Some(format!("entry order {:?}", snapshot.status));
            strategy.runtime.clear_order_refs();
            strategy.phase = Phase::Cancelled;
            strategy.touch(now);
            Step::noted(strategy, "cancelled: entry order did not fill".into())
        }
        _ => Step::quiet(strategy),
    }
}

fn evaluate_position_open(
    strategy: Strategy,
    quote: &Quote,
    orders: &dyn OrderView,
    now: DateTime<Utc>,
) -> Step {
    match strategy.params.clone() {
        VariantParams::TrailingStop { trailing_pct }
        | VariantParams::PullbackTrailing { trailing_pct, .. } => {
            evaluate_trailing_open(strategy, quote, trailing_pct, now)
        }
        VariantParams::Bracket {
            take_profit_pct,
            stop_loss_pct,
        } => evaluate_bracket(strategy, orders, take_profit_pct, stop_loss_pct, now),
        VariantParams::ScaleOut { rungs } => evaluate_scale_out(strategy, orders, &rungs, now),
        VariantParams::Grid { spacing_pct, .. } => {
            evaluate_grid(strategy, orders, spacing_pct, now)
        }
    }
}

fn evaluate_trailing_open(
    mut strategy: Strategy,
    quote: &Quote,
    trailing_pct: f64,
    now: DateTime<Utc>,
) -> Step {
    let observed = quote.high.max(quote.mid());
    let watermark = strategy
        .runtime
        .high_watermark
        .or(strategy.runtime.entry_fill_price)
        .unwrap_or(observed);

    if observed > watermark {
        strategy.runtime.high_watermark = Some(observed);
        strategy.touch(now);
        return Step::noted(strategy, format!("high watermark {observed:.2}"));
    }

    if strategy.runtime.exit_order_ids.is_empty() {
        let quantity = strategy.quantity;
        let mut request =
            order_request(&mut strategy, OrderSide::Sell, OrderType::TrailingStop, quantity);
        request.trail_pct = Some(trailing_pct);
        strategy
            .runtime
            .exit_order_ids
            .push(request.client_id.clone());
        strategy.phase = Phase::Exiting;
        strategy.touch(now);
        return Step::acting(
            strategy,
            Action::Submit(request),
            format!("placing {trailing_pct}% trailing stop"),
        );
    }

    Step::quiet(strategy)
}

/// Bracket management, shared by the open and exiting phases.
///
/// The take-profit limit goes in first; the stop-loss only after the
/// take-profit is accepted, so both legs are never simultaneously unprotected
/// at the broker. Whichever leg fills first gets its peer cancelled.
fn evaluate_bracket(
    mut strategy: Strategy,
    orders: &dyn OrderView,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    now: DateTime<Utc>,
) -> Step {
    let Some(entry) = strategy.runtime.entry_fill_price else {
        strategy.runtime.last_error = Some("bracket without entry fill price".into());
        strategy.runtime.quarantined = true;
        strategy.touch(now);
        return Step::noted(strategy, "quarantined: bracket missing entry fill".into());
    };

    let tp_price = entry * (1.0 + take_profit_pct / 100.0);
    let sl_price = entry * (1.0 - stop_loss_pct / 100.0);

    let Some(tp_id) = strategy.runtime.tp_order_id.clone() else {
        let quantity = strategy.quantity;
        let mut request = order_request(&mut strategy, OrderSide::Sell, OrderType::Limit, quantity);
        request.limit_price = Some(tp_price);
        strategy.runtime.tp_order_id = Some(request.client_id.clone());
        strategy
            .runtime
            .exit_order_ids
            .push(request.client_id.clone());
        strategy.phase = Phase::Exiting;
        strategy.touch(now);
        return Step::acting(
            strategy,
            Action::Submit(request),
            format!("placing take-profit at {tp_price:.2}"),
        );
    };

    let Some(tp) = orders.order(&tp_id) else {
        return Step::quiet(strategy);
    };

    let Some(sl_id) = strategy.runtime.sl_order_id.clone() else {
        return match tp.status {
            OrderStatus::Accepted | OrderStatus::Pending | OrderStatus::Partial => {
                let quantity = strategy.quantity;
                let mut request =
                    order_request(&mut strategy, OrderSide::Sell, OrderType::Stop, quantity);
                request.stop_price = Some(sl_price);
                request.oco_peer_id = Some(tp_id);
                strategy.runtime.sl_order_id = Some(request.client_id.clone());
                strategy
                    .runtime
                    .exit_order_ids
                    .push(request.client_id.clone());
                strategy.touch(now);
                Step::acting(
                    strategy,
                    Action::Submit(request),
                    format!("placing stop-loss at {sl_price:.2}"),
                )
            }
            OrderStatus::Filled => {
                // Filled before the stop-loss ever existed; nothing to cancel.
                complete_bracket(strategy, &tp, now)
            }
            OrderStatus::Cancelled | OrderStatus::Rejected => {
                strategy.runtime.last_error =
                    Some(format!("take-profit order {:?}", tp.status));
                strategy.runtime.quarantined = true;
                strategy.touch(now);
                Step::noted(strategy, "quarantined: take-profit leg lost".into())
            }
        };
    };

    let Some(sl) = orders.order(&sl_id) else {
        return Step::quiet(strategy);
    };

    match (tp.status, sl.status) {
        (OrderStatus::Filled, status) if status.is_live() => {
            let note = format!("take-profit filled at {:.2}, cancelling stop-loss", tp
                .avg_fill_price
                .unwrap_or(tp_price));
            let mut step = Step::acting(strategy, Action::Cancel { client_id: sl_id }, note);
            step.observed_fills.push(tp_id);
            step
        }
        (status, OrderStatus::Filled) if status.is_live() => {
            let note = format!("stop-loss filled at {:.2}, cancelling take-profit", sl
                .avg_fill_price
                .unwrap_or(sl_price));
            let mut step = Step::acting(strategy, Action::Cancel { client_id: tp_id }, note);
            step.observed_fills.push(sl_id);
            step
        }
        (OrderStatus::Filled, OrderStatus::Cancelled) => complete_bracket(strategy, &tp, now),
        (OrderStatus::Cancelled, OrderStatus::Filled) => complete_bracket(strategy, &sl, now),
        (OrderStatus::Filled, OrderStatus::Filled) => {
            strategy.runtime.oco_desync = true;
            strategy.runtime.quarantined = true;
            strategy.runtime.last_error = Some("both bracket legs filled".into());
            strategy.touch(now);
            Step::noted(strategy, "quarantined: both bracket legs filled".into())
        }
        _ => Step::quiet(strategy),
    }
}

fn complete_bracket(mut strategy: Strategy, winner: &OrderSnapshot, now: DateTime<Utc>) -> Step {
    let fill_id = winner.client_id.clone();
    let price = winner.avg_fill_price.unwrap_or(0.0);
    strategy.runtime.clear_order_refs();
    strategy.phase = Phase::Completed;
    strategy.touch(now);
    let mut step = Step::noted(strategy, format!("bracket complete at {price:.2}"));
    step.observed_fills.push(fill_id);
    step
}

/// Per-rung sell quantities from `Q * f_i`, rounded by largest remainder so
/// the quantities always sum exactly to `Q`. Remainder ties break toward the
/// last rung.
pub fn rung_quantities(total: u32, rungs: &[ScaleRung]) -> Vec<u32> {
    if rungs.is_empty() {
        return Vec::new();
    }
    let exact: Vec<f64> = rungs
        .iter()
        .map(|r| f64::from(total) * r.fraction)
        .collect();
    let mut quantities: Vec<u32> = exact.iter().map(|e| e.floor() as u32).collect();
    let assigned: u32 = quantities.iter().sum();
    let mut residue = total.saturating_sub(assigned);

    let mut order: Vec<usize> = (0..rungs.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.partial_cmp(&ra)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.cmp(&a))
    });
    for index in order {
        if residue == 0 {
            break;
        }
        quantities[index] += 1;
        residue -= 1;
    }
    if residue > 0 {
        let last = quantities.len() - 1;
        quantities[last] += residue;
    }
    quantities
}

fn evaluate_scale_out(
    mut strategy: Strategy,
    orders: &dyn OrderView,
    rungs: &[ScaleRung],
    now: DateTime<Utc>,
) -> Step {
    let Some(entry) = strategy.runtime.entry_fill_price else {
        strategy.runtime.last_error = Some("scale-out without entry fill price".into());
        strategy.runtime.quarantined = true;
        strategy.touch(now);
        return Step::noted(strategy, "quarantined: scale-out missing entry fill".into());
    };

    // Mark fills first; placement waits for a quiet step.
    let mut newly_filled = Vec::new();
    for rung in &mut strategy.runtime.rungs {
        if rung.filled {
            continue;
        }
        if let Some(snapshot) = orders.order(&rung.order_id) {
            if snapshot.is_filled() {
                rung.filled = true;
                newly_filled.push(rung.order_id.clone());
            }
        }
    }
    if !newly_filled.is_empty() {
        strategy.runtime.rungs_filled += newly_filled.len() as u32;
        let done = strategy.runtime.rungs_filled as usize == rungs.len()
            && strategy.runtime.rungs.len() == rungs.len();
        if done {
            strategy.runtime.clear_order_refs();
            strategy.phase = Phase::Completed;
        }
        strategy.touch(now);
        let note = if done {
            "all rungs filled, scale-out complete".to_string()
        } else {
            format!("{} rung(s) filled", newly_filled.len())
        };
        let mut step = Step::noted(strategy, note);
        step.observed_fills = newly_filled;
        return step;
    }

    // Place the next rung, lowest target first.
    let placed = strategy.runtime.rungs.len();
    if placed < rungs.len() {
        let quantities = rung_quantities(strategy.quantity, rungs);
        let target = entry * (1.0 + rungs[placed].gain_pct / 100.0);
        let quantity = quantities[placed];
        if quantity == 0 {
            // Rounded to nothing: counts as filled so completion is not
            // held up, and no order goes out.
            strategy.runtime.rungs.push(RungState {
                order_id: String::new(),
                quantity: 0,
                target_price: target,
                filled: true,
            });
            strategy.runtime.rungs_filled += 1;
            let done = strategy.runtime.rungs_filled as usize == rungs.len()
                && strategy.runtime.rungs.len() == rungs.len();
            if done {
                strategy.runtime.clear_order_refs();
                strategy.phase = Phase::Completed;
            }
            strategy.touch(now);
            return Step::noted(
                strategy,
                format!("rung {} of {} rounds to zero shares, skipped", placed + 1, rungs.len()),
            );
        }
        let mut request =
            order_request(&mut strategy, OrderSide::Sell, OrderType::Limit, quantity);
        request.limit_price = Some(target);
        strategy.runtime.rungs.push(RungState {
            order_id: request.client_id.clone(),
            quantity,
            target_price: target,
            filled: false,
        });
        strategy
            .runtime
            .exit_order_ids
            .push(request.client_id.clone());
        strategy.phase = Phase::Exiting;
        strategy.touch(now);
        return Step::acting(
            strategy,
            Action::Submit(request),
            format!("placing rung {} of {}: {} @ {:.2}", placed + 1, rungs.len(), quantity, target),
        );
    }

    Step::quiet(strategy)
}

fn evaluate_grid(
    mut strategy: Strategy,
    orders: &dyn OrderView,
    spacing_pct: f64,
    now: DateTime<Utc>,
) -> Step {
    // Mark fills and queue the symmetric replacement one rung away.
    let mut newly_filled = Vec::new();
    let mut replacements = Vec::new();
    for level in &mut strategy.runtime.grid_levels {
        if level.filled {
            continue;
        }
        let Some(order_id) = level.order_id.clone() else {
            continue;
        };
        let Some(snapshot) = orders.order(&order_id) else {
            continue;
        };
        if snapshot.is_filled() {
            level.filled = true;
            newly_filled.push(order_id);
            let (side, price) = match level.side {
                OrderSide::Buy => (OrderSide::Sell, level.price * (1.0 + spacing_pct / 100.0)),
                OrderSide::Sell => (OrderSide::Buy, level.price * (1.0 - spacing_pct / 100.0)),
            };
            replacements.push(GridLevel {
                price,
                side,
                order_id: None,
                filled: false,
            });
        }
    }
    if !newly_filled.is_empty() {
        strategy.runtime.grid_levels.extend(replacements);
        strategy.touch(now);
        let mut step = Step::noted(
            strategy,
            format!("{} grid level(s) filled", newly_filled.len()),
        );
        step.observed_fills = newly_filled;
        return step;
    }

    // Place the next unworked level.
    let unplaced = strategy
        .runtime
        .grid_levels
        .iter()
        .position(|l| l.order_id.is_none() && !l.filled);
    if let Some(index) = unplaced {
        let (price, side) = {
            let level = &strategy.runtime.grid_levels[index];
            (level.price, level.side)
        };
        let quantity = strategy.quantity;
        let mut request = order_request(&mut strategy, side, OrderType::Limit, quantity);
        request.limit_price = Some(price);
        strategy.runtime.grid_levels[index].order_id = Some(request.client_id.clone());
        strategy.touch(now);
        return Step::acting(
            strategy,
            Action::Submit(request),
            format!("placing grid {:?} at {:.2}", side, price),
        );
    }

    Step::quiet(strategy)
}

fn evaluate_exiting(
    mut strategy: Strategy,
    orders: &dyn OrderView,
    now: DateTime<Utc>,
) -> Step {
    match strategy.params.clone() {
        // Brackets keep their two-leg logic through the exiting phase.
        VariantParams::Bracket {
            take_profit_pct,
            stop_loss_pct,
        } => evaluate_bracket(strategy, orders, take_profit_pct, stop_loss_pct, now),
        VariantParams::ScaleOut { rungs } => evaluate_scale_out(strategy, orders, &rungs, now),
        VariantParams::Grid { spacing_pct, .. } => {
            evaluate_grid(strategy, orders, spacing_pct, now)
        }
        VariantParams::TrailingStop { .. } | VariantParams::PullbackTrailing { .. } => {
            let Some(exit_id) = strategy.runtime.exit_order_ids.first().cloned() else {
                strategy.runtime.last_error = Some("exiting without exit order id".into());
                strategy.runtime.quarantined = true;
                strategy.touch(now);
                return Step::noted(strategy, "quarantined: exit order id missing".into());
            };
            let Some(snapshot) = orders.order(&exit_id) else {
                return Step::quiet(strategy);
            };
            match snapshot.status {
                OrderStatus::Filled => {
                    let price = snapshot.avg_fill_price.unwrap_or(0.0);
                    strategy.runtime.clear_order_refs();
                    strategy.phase = Phase::Completed;
                    strategy.touch(now);
                    let mut step =
                        Step::noted(strategy, format!("trailing stop filled at {price:.2}"));
                    step.observed_fills.push(exit_id);
                    step
                }
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    strategy.runtime.last_error =
                        Some(format!("exit order {:?}", snapshot.status));
                    strategy.runtime.quarantined = true;
                    strategy.touch(now);
                    Step::noted(strategy, "quarantined: exit order lost".into())
                }
                _ => Step::quiet(strategy),
            }
        }
    }
}
