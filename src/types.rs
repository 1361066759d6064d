//! Core data types shared by the signal engine and the simulator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Growth-curve fit for one instrument on one analysis date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub instrument: String,
    /// Last date of the analysis window.
    pub window_end_date: NaiveDate,
    /// Growth exponent `b` of `a·exp(b·x) + c`.
    pub growth_rate: f64,
    /// Coefficient of determination in log space.
    pub fit_quality: f64,
    /// Optional raw auxiliary value (volume divergence) for the same window.
    #[serde(default)]
    pub auxiliary: Option<f64>,
}

/// Cross-sectionally normalized values for one instrument on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSignal {
    pub instrument: String,
    pub date: NaiveDate,
    pub z_growth: f64,
    pub z_quality: f64,
    #[serde(default)]
    pub z_auxiliary: Option<f64>,
}

/// Direction of a signal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Enter,
    Exit,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Enter => write!(f, "ENTER"),
            EventKind::Exit => write!(f, "EXIT"),
        }
    }
}

/// Why a signal event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventReason {
    /// Opening entry on the first horizon date.
    Initial,
    /// Critical time closer than the sell trigger.
    Signal,
    /// Fixed delay after the exit elapsed.
    ReEntryTimer,
    /// Drawdown followed by consecutive rising observations.
    ReEntryRecovery,
    /// Unconditional liquidation on the final horizon date.
    Horizon,
}

/// A discrete buy/sell event for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub instrument: String,
    pub date: NaiveDate,
    pub kind: EventKind,
    pub reason: EventReason,
}

impl SignalEvent {
    pub fn new(
        instrument: impl Into<String>,
        date: NaiveDate,
        kind: EventKind,
        reason: EventReason,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            date,
            kind,
            reason,
        }
    }

    pub fn enter(instrument: impl Into<String>, date: NaiveDate, reason: EventReason) -> Self {
        Self::new(instrument, date, EventKind::Enter, reason)
    }

    pub fn exit(instrument: impl Into<String>, date: NaiveDate, reason: EventReason) -> Self {
        Self::new(instrument, date, EventKind::Exit, reason)
    }

    /// True for events produced by the state machine rather than the
    /// opening entry or the horizon liquidation.
    pub fn is_policy_driven(&self) -> bool {
        !matches!(self.reason, EventReason::Initial | EventReason::Horizon)
    }
}

/// Open long position held by the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub open_date: NaiveDate,
    pub quantity: f64,
    pub entry_price: f64,
    /// Cash spent including the entry fee.
    pub cost_basis: f64,
    pub entry_fee: f64,
}

impl Position {
    pub fn market_value(&self, current_price: f64) -> f64 {
        self.quantity * current_price
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.market_value(current_price) - self.cost_basis
    }
}

/// A closed Enter→Exit cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTrip {
    pub instrument: String,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Entry plus exit fees.
    pub fees: f64,
    /// Net proceeds minus cost basis.
    pub net_pnl: f64,
}

impl RoundTrip {
    pub fn is_win(&self) -> bool {
        self.net_pnl > 0.0
    }

    pub fn return_pct(&self) -> f64 {
        let cost = self.quantity * self.entry_price;
        if cost > 0.0 {
            self.net_pnl / cost * 100.0
        } else {
            0.0
        }
    }

    pub fn holding_days(&self) -> i64 {
        (self.exit_date - self.entry_date).num_days()
    }
}

/// Portfolio snapshot after all events of one date were applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
    pub cash: f64,
    pub positions_value: f64,
    /// Fraction of equity held in open positions.
    pub exposure: f64,
    /// Fees charged on this date.
    pub fees: f64,
    /// Mark-to-market change of positions carried into this date.
    pub market_pnl: f64,
    pub drawdown: f64,
    pub drawdown_pct: f64,
}

/// Pipeline stage a soft failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    GrowthFit,
    Normalize,
    CriticalTime,
    Policy,
    Simulation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::GrowthFit => "growth-fit",
            Stage::Normalize => "normalize",
            Stage::CriticalTime => "critical-time",
            Stage::Policy => "policy",
            Stage::Simulation => "simulation",
        };
        f.write_str(name)
    }
}

/// Reason a stage produced no value.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    #[error("window of {len} samples does not exceed smoothing width {width}")]
    WindowTooShort { len: usize, width: usize },

    #[error("input contains non-finite or non-positive values")]
    NonPositiveInput,

    #[error("solver did not converge")]
    NonConvergence,

    #[error("non-finite residuals")]
    NonFiniteResidual,

    #[error("only {available} valid instruments in cross-section")]
    InsufficientCrossSection { available: usize },

    #[error("cross-section has zero variance")]
    ZeroVariance,

    #[error("missing data: {0}")]
    MissingData(String),

    #[error("only {converged} of {attempts} fits converged")]
    Unreliable { converged: usize, attempts: usize },

    #[error("{0}")]
    NoOpEvent(String),

    #[error("{0}")]
    Failed(String),
}

/// A soft failure attributed to a stage.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{stage} skipped: {reason}")]
pub struct Skip {
    pub stage: Stage,
    pub reason: SkipReason,
}

impl Skip {
    pub fn new(stage: Stage, reason: SkipReason) -> Self {
        Self { stage, reason }
    }
}

/// Outcome of a single pipeline stage.
pub type StageResult<T> = std::result::Result<T, Skip>;

/// A skip recorded against an instrument and date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub instrument: Option<String>,
    pub date: Option<NaiveDate>,
    pub skip: Skip,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_round_trip_stats() {
        let trip = RoundTrip {
            instrument: "AAA".to_string(),
            entry_date: day(2),
            exit_date: day(12),
            quantity: 10.0,
            entry_price: 100.0,
            exit_price: 110.0,
            fees: 2.0,
            net_pnl: 98.0,
        };
        assert!(trip.is_win());
        assert!((trip.return_pct() - 9.8).abs() < 1e-9);
        assert_eq!(trip.holding_days(), 10);
    }

    #[test]
    fn test_position_pnl() {
        let position = Position {
            instrument: "AAA".to_string(),
            open_date: day(1),
            quantity: 9.9,
            entry_price: 100.0,
            cost_basis: 1000.0,
            entry_fee: 10.0,
        };
        assert!((position.market_value(110.0) - 1089.0).abs() < 1e-9);
        assert!((position.unrealized_pnl(110.0) - 89.0).abs() < 1e-9);
    }

    #[test]
    fn test_policy_driven_events() {
        assert!(SignalEvent::exit("AAA", day(3), EventReason::Signal).is_policy_driven());
        assert!(!SignalEvent::exit("AAA", day(3), EventReason::Horizon).is_policy_driven());
        assert!(!SignalEvent::enter("AAA", day(1), EventReason::Initial).is_policy_driven());
    }

    #[test]
    fn test_skip_display() {
        let skip = Skip::new(
            Stage::CriticalTime,
            SkipReason::Unreliable {
                converged: 2,
                attempts: 7,
            },
        );
        assert_eq!(
            skip.to_string(),
            "critical-time skipped: only 2 of 7 fits converged"
        );
    }
}
