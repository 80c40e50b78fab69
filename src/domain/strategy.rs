//! Strategy aggregate: variants, lifecycle phases and runtime state.
//!
//! A strategy manages one position from entry through managed exit. The
//! variant is a tagged record; hyphenated aliases are accepted on read and
//! canonical snake_case names are written back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::TradeloopError;
use crate::domain::order::OrderSide;

/// Lifecycle phase. Advances monotonically; `cancelled` is reachable from
/// any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    EntryActive,
    PositionOpen,
    Exiting,
    Completed,
    Cancelled,
}

impl Phase {
    fn rank(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::EntryActive => 1,
            Phase::PositionOpen => 2,
            Phase::Exiting => 3,
            Phase::Completed => 4,
            Phase::Cancelled => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled)
    }

    /// Forward-only, except that any non-terminal phase may cancel.
    pub fn allows_transition(self, next: Phase) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next == Phase::Cancelled {
            return true;
        }
        next.rank() > self.rank()
    }
}

/// One scale-out rung: sell `fraction` of the position at `gain_pct` above
/// the entry fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRung {
    pub gain_pct: f64,
    pub fraction: f64,
}

/// Variant-specific parameters. Percentages are in percent units (5.0 = 5%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum VariantParams {
    #[serde(alias = "trailing-stop")]
    TrailingStop { trailing_pct: f64 },
    #[serde(alias = "bracket")]
    Bracket {
        take_profit_pct: f64,
        stop_loss_pct: f64,
    },
    #[serde(alias = "scale-out")]
    ScaleOut { rungs: Vec<ScaleRung> },
    #[serde(alias = "grid")]
    Grid {
        reference_price: f64,
        spacing_pct: f64,
        levels_per_side: u32,
    },
    #[serde(alias = "pullback-trailing")]
    PullbackTrailing {
        pullback_pct: f64,
        trailing_pct: f64,
    },
}

impl VariantParams {
    /// Canonical snake_case variant name.
    pub fn name(&self) -> &'static str {
        match self {
            VariantParams::TrailingStop { .. } => "trailing_stop",
            VariantParams::Bracket { .. } => "bracket",
            VariantParams::ScaleOut { .. } => "scale_out",
            VariantParams::Grid { .. } => "grid",
            VariantParams::PullbackTrailing { .. } => "pullback_trailing",
        }
    }
}

/// State of one scale-out rung at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RungState {
    pub order_id: String,
    pub quantity: u32,
    pub target_price: f64,
    pub filled: bool,
}

/// State of one grid level at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: f64,
    pub side: OrderSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub filled: bool,
}

/// Variant-specific runtime state. Cleared order references survive as
/// history on terminal records only where reporting needs them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    /// Monotonic per-strategy order sequence; client order ids derive from it
    /// so replays generate identical ids.
    pub order_seq: u32,
    pub entry_order_id: Option<String>,
    pub entry_fill_price: Option<f64>,
    pub high_watermark: Option<f64>,
    /// Pre-entry reference high for pullback entries.
    pub pullback_reference: Option<f64>,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub exit_order_ids: Vec<String>,
    pub rungs: Vec<RungState>,
    pub rungs_filled: u32,
    pub grid_levels: Vec<GridLevel>,
    pub oco_desync: bool,
    pub oco_cancel_attempts: u32,
    /// Order ids whose fills have already been written to the trade ledger.
    pub recorded_fills: Vec<String>,
    pub quarantined: bool,
    pub last_error: Option<String>,
}

impl RuntimeState {
    /// Drop live order references on termination; fill history stays on the
    /// broker and in the ledger.
    pub fn clear_order_refs(&mut self) {
        self.entry_order_id = None;
        self.tp_order_id = None;
        self.sl_order_id = None;
        self.exit_order_ids.clear();
        for rung in &mut self.rungs {
            if !rung.filled {
                rung.order_id = String::new();
            }
        }
        for level in &mut self.grid_levels {
            if !level.filled {
                level.order_id = None;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub symbol: String,
    #[serde(flatten)]
    pub params: VariantParams,
    pub quantity: u32,
    /// Limit entry price; absent means market entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    pub enabled: bool,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schedule_enabled: bool,
    #[serde(default)]
    pub runtime: RuntimeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Short random identifier, 8 hex chars.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl Strategy {
    pub fn new(symbol: &str, params: VariantParams, quantity: u32, now: DateTime<Utc>) -> Self {
        Strategy {
            id: short_id(),
            symbol: symbol.to_uppercase(),
            params,
            quantity,
            entry_price: None,
            enabled: true,
            phase: Phase::Pending,
            schedule_at: None,
            schedule_enabled: false,
            runtime: RuntimeState::default(),
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Scheduled strategies stay out of evaluation until their time arrives.
    pub fn schedule_pending(&self, now: DateTime<Utc>) -> bool {
        self.schedule_enabled && self.schedule_at.map_or(false, |at| at > now)
    }

    /// Eligible for evaluation this cycle.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !self.is_terminal()
            && !self.runtime.quarantined
            && !self.schedule_pending(now)
    }

    /// Next deterministic client order id for this strategy.
    pub fn next_client_order_id(&mut self) -> String {
        self.runtime.order_seq += 1;
        format!("{}-{}", self.id, self.runtime.order_seq)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Advance the phase, enforcing monotonicity.
    pub fn transition(&mut self, next: Phase, now: DateTime<Utc>) -> Result<(), TradeloopError> {
        if !self.phase.allows_transition(next) {
            return Err(TradeloopError::Validation {
                reason: format!(
                    "strategy {}: illegal phase transition {:?} -> {:?}",
                    self.id, self.phase, next
                ),
            });
        }
        self.phase = next;
        self.touch(now);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TradeloopError> {
        fn invalid(reason: String) -> TradeloopError {
            TradeloopError::Validation { reason }
        }

        if self.symbol.trim().is_empty() {
            return Err(invalid("symbol must not be empty".into()));
        }
        if self.quantity == 0 {
            return Err(invalid("quantity must be positive".into()));
        }
        if let Some(price) = self.entry_price {
            if price <= 0.0 {
                return Err(invalid("entry_price must be positive".into()));
            }
        }
        if self.schedule_enabled && self.schedule_at.is_none() {
            return Err(invalid(
                "schedule_enabled requires schedule_at".into(),
            ));
        }

        match &self.params {
            VariantParams::TrailingStop { trailing_pct } => {
                if *trailing_pct <= 0.0 {
                    return Err(invalid("trailing_pct must be positive".into()));
                }
            }
            VariantParams::Bracket {
                take_profit_pct,
                stop_loss_pct,
            } => {
                if *take_profit_pct <= 0.0 || *stop_loss_pct <= 0.0 {
                    return Err(invalid(
                        "take_profit_pct and stop_loss_pct must be positive".into(),
                    ));
                }
            }
            VariantParams::ScaleOut { rungs } => {
                if rungs.is_empty() {
                    return Err(invalid("scale_out requires at least one rung".into()));
                }
                let mut prev = 0.0;
                let mut total = 0.0;
                for rung in rungs {
                    if rung.gain_pct <= prev {
                        return Err(invalid(
                            "scale_out rungs must have strictly increasing gain_pct".into(),
                        ));
                    }
                    if rung.fraction <= 0.0 {
                        return Err(invalid("scale_out fractions must be positive".into()));
                    }
                    prev = rung.gain_pct;
                    total += rung.fraction;
                }
                if (total - 1.0).abs() > 1e-6 {
                    return Err(invalid(format!(
                        "scale_out fractions must sum to 1, got {total}"
                    )));
                }
            }
            VariantParams::Grid {
                reference_price,
                spacing_pct,
                levels_per_side,
            } => {
                if *reference_price <= 0.0 {
                    return Err(invalid("grid reference_price must be positive".into()));
                }
                if *spacing_pct <= 0.0 {
                    return Err(invalid("grid spacing_pct must be positive".into()));
                }
                if *levels_per_side == 0 {
                    return Err(invalid("grid levels_per_side must be positive".into()));
                }
                if f64::from(*levels_per_side) * spacing_pct >= 100.0 {
                    return Err(invalid(
                        "grid levels would reach non-positive prices".into(),
                    ));
                }
            }
            VariantParams::PullbackTrailing {
                pullback_pct,
                trailing_pct,
            } => {
                if *pullback_pct <= 0.0 || *trailing_pct <= 0.0 {
                    return Err(invalid(
                        "pullback_pct and trailing_pct must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap()
    }

    fn sample_trailing() -> Strategy {
        Strategy::new(
            "aapl",
            VariantParams::TrailingStop { trailing_pct: 5.0 },
            10,
            now(),
        )
    }

    #[test]
    fn new_strategy_defaults() {
        let s = sample_trailing();
        assert_eq!(s.symbol, "AAPL");
        assert_eq!(s.phase, Phase::Pending);
        assert!(s.enabled);
        assert!(!s.schedule_enabled);
        assert_eq!(s.id.len(), 8);
    }

    #[test]
    fn phase_never_regresses() {
        assert!(Phase::Pending.allows_transition(Phase::EntryActive));
        assert!(Phase::EntryActive.allows_transition(Phase::PositionOpen));
        assert!(Phase::PositionOpen.allows_transition(Phase::Exiting));
        assert!(Phase::Exiting.allows_transition(Phase::Completed));
        assert!(!Phase::PositionOpen.allows_transition(Phase::Pending));
        assert!(!Phase::Exiting.allows_transition(Phase::EntryActive));
    }

    #[test]
    fn cancel_reachable_from_non_terminal_only() {
        assert!(Phase::Pending.allows_transition(Phase::Cancelled));
        assert!(Phase::Exiting.allows_transition(Phase::Cancelled));
        assert!(!Phase::Completed.allows_transition(Phase::Cancelled));
        assert!(!Phase::Cancelled.allows_transition(Phase::Pending));
    }

    #[test]
    fn transition_enforces_monotonicity() {
        let mut s = sample_trailing();
        s.transition(Phase::EntryActive, now()).unwrap();
        assert!(s.transition(Phase::Pending, now()).is_err());
        assert_eq!(s.phase, Phase::EntryActive);
    }

    #[test]
    fn schedule_pending_window() {
        let mut s = sample_trailing();
        s.schedule_enabled = true;
        s.schedule_at = Some(now() + chrono::Duration::minutes(5));
        assert!(s.schedule_pending(now()));
        assert!(!s.is_active(now()));
        assert!(!s.schedule_pending(now() + chrono::Duration::minutes(6)));
    }

    #[test]
    fn quarantined_is_not_active() {
        let mut s = sample_trailing();
        s.runtime.quarantined = true;
        assert!(!s.is_active(now()));
    }

    #[test]
    fn client_order_ids_are_deterministic() {
        let mut s = sample_trailing();
        let first = s.next_client_order_id();
        let second = s.next_client_order_id();
        assert_eq!(first, format!("{}-1", s.id));
        assert_eq!(second, format!("{}-2", s.id));
    }

    #[test]
    fn validate_rejects_zero_quantity() {
        let mut s = sample_trailing();
        s.quantity = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_scale_out_fractions() {
        let mut s = Strategy::new(
            "MSFT",
            VariantParams::ScaleOut {
                rungs: vec![
                    ScaleRung {
                        gain_pct: 5.0,
                        fraction: 0.5,
                    },
                    ScaleRung {
                        gain_pct: 10.0,
                        fraction: 0.6,
                    },
                ],
            },
            30,
            now(),
        );
        assert!(s.validate().is_err());

        if let VariantParams::ScaleOut { rungs } = &mut s.params {
            rungs[1].fraction = 0.5;
        }
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validate_grid_spacing() {
        let s = Strategy::new(
            "SPY",
            VariantParams::Grid {
                reference_price: 400.0,
                spacing_pct: 25.0,
                levels_per_side: 4,
            },
            10,
            now(),
        );
        // 4 levels of 25% would hit zero.
        assert!(s.validate().is_err());
    }

    #[test]
    fn variant_aliases_canonicalize() {
        let json = r#"{
            "id": "deadbeef",
            "symbol": "AAPL",
            "variant": "trailing-stop",
            "trailing_pct": 5.0,
            "quantity": 10,
            "enabled": true,
            "phase": "pending",
            "created_at": "2024-01-15T14:30:00Z",
            "updated_at": "2024-01-15T14:30:00Z"
        }"#;
        let s: Strategy = serde_json::from_str(json).unwrap();
        assert_eq!(s.params.name(), "trailing_stop");

        let out = serde_json::to_string(&s).unwrap();
        assert!(out.contains(r#""variant":"trailing_stop""#));
        assert!(!out.contains("trailing-stop"));
    }

    #[test]
    fn round_trip_preserves_runtime_state() {
        let mut s = sample_trailing();
        s.runtime.entry_fill_price = Some(101.5);
        s.runtime.high_watermark = Some(107.0);
        s.runtime.exit_order_ids = vec![format!("{}-2", s.id)];
        s.phase = Phase::Exiting;

        let json = serde_json::to_string(&s).unwrap();
        let back: Strategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
