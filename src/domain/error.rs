//! Domain error types.

/// How a broker failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Network trouble, throttling, 5xx. Safe to retry with backoff.
    Transient,
    /// Auth failure, rejected order. Surface, never retry.
    Permanent,
}

/// A refusal from the pre-trade safety gate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SafetyViolation {
    #[error("kill switch engaged: {reason}")]
    KillSwitchEngaged { reason: String },

    #[error("duplicate of order submitted {age_seconds}s ago: {fingerprint}")]
    DuplicateOrder { fingerprint: String, age_seconds: i64 },

    #[error("pattern day trade blocked: account equity {equity:.2} below {minimum:.2}")]
    PatternDayTradeBlocked { equity: f64, minimum: f64 },

    #[error("position size would reach {would_be} shares, limit {limit}")]
    PositionSizeExceeded { would_be: u32, limit: u32 },

    #[error("position notional would reach {would_be:.2}, limit {limit:.2}")]
    PositionNotionalExceeded { would_be: f64, limit: f64 },

    #[error("daily loss {day_pnl:.2} at or past limit -{limit:.2}")]
    DailyLossLimitExceeded { day_pnl: f64, limit: f64 },

    #[error("daily trade count {count} at limit {limit}")]
    DailyTradeLimitExceeded { count: u32, limit: u32 },

    #[error("insufficient buying power: need {needed:.2}, have {available:.2}")]
    InsufficientBuyingPower { needed: f64, available: f64 },
}

impl SafetyViolation {
    /// Stable machine code for audit records and structured output.
    pub fn code(&self) -> &'static str {
        match self {
            SafetyViolation::KillSwitchEngaged { .. } => "SAFETY_KILL_SWITCH",
            SafetyViolation::DuplicateOrder { .. } => "SAFETY_DUPLICATE_ORDER",
            SafetyViolation::PatternDayTradeBlocked { .. } => "SAFETY_PDT_BLOCKED",
            SafetyViolation::PositionSizeExceeded { .. } => "SAFETY_POSITION_SIZE",
            SafetyViolation::PositionNotionalExceeded { .. } => "SAFETY_POSITION_NOTIONAL",
            SafetyViolation::DailyLossLimitExceeded { .. } => "SAFETY_DAILY_LOSS",
            SafetyViolation::DailyTradeLimitExceeded { .. } => "SAFETY_DAILY_TRADES",
            SafetyViolation::InsufficientBuyingPower { .. } => "SAFETY_BUYING_POWER",
        }
    }
}

/// Top-level error type for tradeloop.
#[derive(Debug, thiserror::Error)]
pub enum TradeloopError {
    #[error("invalid input: {reason}")]
    Validation { reason: String },

    #[error("{what} `{id}` not found")]
    NotFound { what: &'static str, id: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("no bars for {symbol} in the requested range")]
    NoData { symbol: String },

    #[error("broker error ({kind:?}): {reason}")]
    Broker {
        kind: BrokerErrorKind,
        reason: String,
    },

    #[error(transparent)]
    Safety(#[from] SafetyViolation),

    #[error("bracket desync on strategy {strategy_id}: {reason}")]
    OcoDesync { strategy_id: String, reason: String },

    #[error("engine lock held by {owner} (pid {pid})")]
    LockHeld { owner: String, pid: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TradeloopError {
    pub fn broker_transient(reason: impl Into<String>) -> Self {
        TradeloopError::Broker {
            kind: BrokerErrorKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn broker_permanent(reason: impl Into<String>) -> Self {
        TradeloopError::Broker {
            kind: BrokerErrorKind::Permanent,
            reason: reason.into(),
        }
    }

    /// True for failures worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TradeloopError::Broker {
                kind: BrokerErrorKind::Transient,
                ..
            }
        )
    }

    /// Stable machine code carried alongside the human message.
    pub fn code(&self) -> &'static str {
        match self {
            TradeloopError::Validation { .. } => "VALIDATION_ERROR",
            TradeloopError::NotFound { .. } => "NOT_FOUND",
            TradeloopError::ConfigParse { .. }
            | TradeloopError::ConfigMissing { .. }
            | TradeloopError::ConfigInvalid { .. } => "CONFIGURATION_ERROR",
            TradeloopError::Data { .. } => "DATA_ERROR",
            TradeloopError::NoData { .. } => "NO_DATA",
            TradeloopError::Broker {
                kind: BrokerErrorKind::Transient,
                ..
            } => "BROKER_TRANSIENT",
            TradeloopError::Broker {
                kind: BrokerErrorKind::Permanent,
                ..
            } => "BROKER_PERMANENT",
            TradeloopError::Safety(v) => v.code(),
            TradeloopError::OcoDesync { .. } => "OCO_DESYNC",
            TradeloopError::LockHeld { .. } => "ENGINE_LOCK_HELD",
            TradeloopError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<&TradeloopError> for std::process::ExitCode {
    fn from(err: &TradeloopError) -> Self {
        let code: u8 = match err {
            TradeloopError::Io(_) => 1,
            TradeloopError::ConfigParse { .. }
            | TradeloopError::ConfigMissing { .. }
            | TradeloopError::ConfigInvalid { .. } => 2,
            TradeloopError::Data { .. } | TradeloopError::NoData { .. } => 3,
            TradeloopError::LockHeld { .. } => 4,
            TradeloopError::Broker { .. } | TradeloopError::OcoDesync { .. } => 5,
            TradeloopError::Validation { .. } | TradeloopError::NotFound { .. } => 6,
            TradeloopError::Safety(_) => 7,
        };
        std::process::ExitCode::from(code)
    }
}
