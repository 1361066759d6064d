//! Per-instrument decision policy.
//!
//! On every analysis date the policy combines the normalized growth,
//! quality and auxiliary values into a 0–100 composite score and compares
//! it with a threshold that regime signals may shift. Once the last
//! `hysteresis_depth` scores all qualify, the critical-time model is
//! consulted and an exit is emitted when the predicted critical time is
//! close enough. After an exit the policy waits for a re-entry condition.
//!
//! ```text
//!            qualifying              history full
//!   Idle ─────────────────▶ Watching ───────────────▶ Armed
//!    ▲  ◀── non-qualifying ───┘  ▲                     │
//!    │                           └── far / unavailable ┤
//!    │                                                 │ near
//!    └───────────── re-entry ──────── ExitPending ◀────┘
//! ```
//!
//! The policy reads only what it is handed in [`PolicyInput`]; normalized
//! values for other instruments never reach it.

use crate::data::{ordinal, trailing_mean, window_ending_at};
use crate::error::{BubbleError, Result};
use crate::lppl::{CriticalTimeEstimate, CriticalTimeModel};
use crate::types::{
    EventKind, EventReason, NormalizedSignal, SignalEvent, Skip, SkipReason, SkipRecord, Stage,
    StageResult,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Weights of the composite score components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalWeights {
    #[serde(default = "default_growth_weight")]
    pub growth: f64,
    #[serde(default = "default_quality_weight")]
    pub quality: f64,
    /// Weight of the auxiliary (volume divergence) value. Zero disables it.
    #[serde(default)]
    pub auxiliary: f64,
}

fn default_growth_weight() -> f64 {
    0.5
}
fn default_quality_weight() -> f64 {
    0.5
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            growth: default_growth_weight(),
            quality: default_quality_weight(),
            auxiliary: 0.0,
        }
    }
}

impl SignalWeights {
    pub fn new(growth: f64, quality: f64, auxiliary: f64) -> Self {
        Self {
            growth,
            quality,
            auxiliary,
        }
    }

    pub fn sum(&self) -> f64 {
        self.growth + self.quality + self.auxiliary
    }

    pub fn uses_auxiliary(&self) -> bool {
        self.auxiliary != 0.0
    }
}

/// How the score history reacts to a non-qualifying analysis date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HysteresisMode {
    /// Clear the history; qualifying dates must be consecutive.
    #[default]
    Reset,
    /// Keep earlier qualifying scores and drop only the current one.
    Slide,
}

/// Which re-entry heuristics are active after an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReEntryMode {
    /// Fixed delay only.
    Timer,
    /// Drawdown followed by consecutive rises only.
    Recovery,
    /// Whichever fires first.
    #[default]
    FirstOf,
}

/// Re-entry parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReEntryConfig {
    #[serde(default)]
    pub mode: ReEntryMode,
    /// Observations after the exit at which re-entry is forced.
    #[serde(default = "default_days_after_exit")]
    pub days_after_exit: usize,
    /// Drawdown from the exit price that arms the recovery heuristic.
    #[serde(default = "default_drawdown_fraction")]
    pub drawdown_fraction: f64,
    /// Consecutive rising observations required after the drawdown.
    #[serde(default = "default_recovery_days")]
    pub recovery_days: usize,
}

fn default_days_after_exit() -> usize {
    60
}
fn default_drawdown_fraction() -> f64 {
    0.10
}
fn default_recovery_days() -> usize {
    3
}

impl Default for ReEntryConfig {
    fn default() -> Self {
        Self {
            mode: ReEntryMode::default(),
            days_after_exit: default_days_after_exit(),
            drawdown_fraction: default_drawdown_fraction(),
            recovery_days: default_recovery_days(),
        }
    }
}

/// Threshold shifts driven by valuation and macro series.
///
/// A positive shift raises the threshold (harder to qualify), a negative
/// shift lowers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// Observations in the valuation ratio's trailing average.
    #[serde(default = "default_valuation_lookback")]
    pub valuation_lookback: usize,
    #[serde(default = "default_step")]
    pub valuation_step: f64,
    #[serde(default = "default_macro_high")]
    pub macro_high: f64,
    #[serde(default = "default_macro_low")]
    pub macro_low: f64,
    #[serde(default = "default_step")]
    pub macro_step: f64,
}

fn default_valuation_lookback() -> usize {
    252
}
fn default_step() -> f64 {
    5.0
}
fn default_macro_high() -> f64 {
    30.0
}
fn default_macro_low() -> f64 {
    15.0
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            valuation_lookback: default_valuation_lookback(),
            valuation_step: default_step(),
            macro_high: default_macro_high(),
            macro_low: default_macro_low(),
            macro_step: default_step(),
        }
    }
}

/// Configuration of the decision policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Composite score a date must exceed to qualify (0–100).
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Number of qualifying scores required before arming.
    #[serde(default = "default_hysteresis_depth")]
    pub hysteresis_depth: usize,
    #[serde(default)]
    pub hysteresis_mode: HysteresisMode,
    /// Exit when the critical time is fewer than this many days away.
    #[serde(default = "default_sell_trigger_days")]
    pub sell_trigger_days: f64,
    /// Emit an entry on the first date so the run starts invested.
    #[serde(default = "default_enter_at_start")]
    pub enter_at_start: bool,
    #[serde(default)]
    pub weights: SignalWeights,
    #[serde(default)]
    pub reentry: ReEntryConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
}

fn default_threshold() -> f64 {
    60.0
}
fn default_hysteresis_depth() -> usize {
    1
}
fn default_sell_trigger_days() -> f64 {
    30.0
}
fn default_enter_at_start() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            hysteresis_depth: default_hysteresis_depth(),
            hysteresis_mode: HysteresisMode::default(),
            sell_trigger_days: default_sell_trigger_days(),
            enter_at_start: default_enter_at_start(),
            weights: SignalWeights::default(),
            reentry: ReEntryConfig::default(),
            regime: RegimeConfig::default(),
        }
    }
}

impl PolicyConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_hysteresis(mut self, depth: usize, mode: HysteresisMode) -> Self {
        self.hysteresis_depth = depth;
        self.hysteresis_mode = mode;
        self
    }

    pub fn with_weights(mut self, weights: SignalWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_reentry(mut self, reentry: ReEntryConfig) -> Self {
        self.reentry = reentry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.threshold) {
            return Err(BubbleError::ConfigError(format!(
                "policy.threshold must be within 0..=100, got {}",
                self.threshold
            )));
        }
        if self.hysteresis_depth == 0 {
            return Err(BubbleError::ConfigError(
                "policy.hysteresis_depth must be at least 1".to_string(),
            ));
        }
        if !self.sell_trigger_days.is_finite() {
            return Err(BubbleError::ConfigError(
                "policy.sell_trigger_days must be finite".to_string(),
            ));
        }
        let w = &self.weights;
        if [w.growth, w.quality, w.auxiliary].iter().any(|v| !v.is_finite()) {
            return Err(BubbleError::ConfigError("weights must be finite".to_string()));
        }
        if !(self.reentry.drawdown_fraction > 0.0 && self.reentry.drawdown_fraction < 1.0) {
            return Err(BubbleError::ConfigError(format!(
                "reentry.drawdown_fraction must be within (0, 1), got {}",
                self.reentry.drawdown_fraction
            )));
        }
        if self.regime.macro_low > self.regime.macro_high {
            return Err(BubbleError::ConfigError(
                "regime.macro_low must not exceed regime.macro_high".to_string(),
            ));
        }
        Ok(())
    }
}

/// Map normalized values onto the 0–100 composite scale.
///
/// The weighted sum is centered at 50 with three standard deviations
/// spanning ±50, then clamped.
pub fn composite_score(signal: &NormalizedSignal, weights: &SignalWeights) -> StageResult<f64> {
    let mut composite = weights.growth * signal.z_growth + weights.quality * signal.z_quality;
    if weights.uses_auxiliary() {
        let z = signal.z_auxiliary.ok_or_else(|| {
            Skip::new(
                Stage::Policy,
                SkipReason::MissingData("auxiliary signal".to_string()),
            )
        })?;
        composite += weights.auxiliary * z;
    }
    Ok((50.0 + composite * 50.0 / 3.0).clamp(0.0, 100.0))
}

/// Threshold shift on `index` from the optional regime series.
pub fn threshold_shift(
    index: usize,
    regime: &RegimeConfig,
    valuation: Option<&[f64]>,
    macro_indicator: Option<&[f64]>,
) -> StageResult<f64> {
    let mut shift = 0.0;

    if let Some(values) = valuation {
        let value = value_at(values, index, "valuation ratio")?;
        if let Some(mean) = trailing_mean(values, index, regime.valuation_lookback) {
            if value > mean {
                shift -= regime.valuation_step;
            } else if value < mean {
                shift += regime.valuation_step;
            }
        }
    }

    if let Some(values) = macro_indicator {
        let value = value_at(values, index, "macro indicator")?;
        if value >= regime.macro_high {
            shift -= regime.macro_step;
        } else if value <= regime.macro_low {
            shift += regime.macro_step;
        }
    }

    Ok(shift)
}

fn value_at(values: &[f64], index: usize, name: &str) -> StageResult<f64> {
    values
        .get(index)
        .copied()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Skip::new(Stage::Policy, SkipReason::MissingData(name.to_string())))
}

/// Policy state of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PolicyState {
    #[default]
    Idle,
    Watching,
    Armed,
    ExitPending,
}

/// Everything the policy needs for one instrument.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub instrument: &'a str,
    pub dates: &'a [NaiveDate],
    pub prices: &'a [f64],
    /// Indices of the analysis dates into `dates`.
    pub analysis_indices: &'a [usize],
    /// This instrument's normalized values keyed by date.
    pub signals: &'a BTreeMap<NaiveDate, NormalizedSignal>,
    /// Length of the price window handed to the critical-time model.
    pub window: usize,
    pub valuation: Option<&'a [f64]>,
    pub macro_indicator: Option<&'a [f64]>,
}

/// Diagnostics for one evaluated analysis date.
///
/// A date that arms the policy records two steps: an `Armed` step before
/// the critical-time model runs, then the state it resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStep {
    pub date: NaiveDate,
    pub score: f64,
    pub threshold: f64,
    pub qualifying: bool,
    pub state: PolicyState,
}

/// Output of a policy run over one instrument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRun {
    pub instrument: String,
    pub events: Vec<SignalEvent>,
    pub steps: Vec<PolicyStep>,
    pub skips: Vec<SkipRecord>,
    pub estimates: Vec<(NaiveDate, CriticalTimeEstimate)>,
}

impl PolicyRun {
    /// Event kind per input date, `None` on dates without an event.
    pub fn event_series(&self, dates: &[NaiveDate]) -> Vec<Option<EventKind>> {
        let by_date: BTreeMap<NaiveDate, EventKind> =
            self.events.iter().map(|e| (e.date, e.kind)).collect();
        dates.iter().map(|d| by_date.get(d).copied()).collect()
    }

    /// Events emitted by the state machine itself.
    pub fn policy_events(&self) -> impl Iterator<Item = &SignalEvent> {
        self.events.iter().filter(|e| e.is_policy_driven())
    }
}

/// Bookkeeping between an exit and the following re-entry.
#[derive(Debug, Clone)]
struct ExitMark {
    index: usize,
    price: f64,
    drawdown_hit: bool,
    up_days: usize,
}

impl ExitMark {
    fn new(index: usize, price: f64) -> Self {
        Self {
            index,
            price,
            drawdown_hit: false,
            up_days: 0,
        }
    }

    fn check(&mut self, index: usize, prices: &[f64], config: &ReEntryConfig) -> Option<EventReason> {
        let price = prices[index];
        let mut recovered = false;

        if matches!(config.mode, ReEntryMode::Recovery | ReEntryMode::FirstOf) {
            if self.drawdown_hit {
                if index > 0 && price > prices[index - 1] {
                    self.up_days += 1;
                } else {
                    self.up_days = 0;
                }
                recovered = self.up_days >= config.recovery_days;
            } else if price <= self.price * (1.0 - config.drawdown_fraction) {
                self.drawdown_hit = true;
                self.up_days = 0;
            }
        }

        let timer = matches!(config.mode, ReEntryMode::Timer | ReEntryMode::FirstOf)
            && index - self.index >= config.days_after_exit;

        if recovered {
            Some(EventReason::ReEntryRecovery)
        } else if timer {
            Some(EventReason::ReEntryTimer)
        } else {
            None
        }
    }
}

/// The decision state machine.
#[derive(Debug, Clone, Default)]
pub struct SignalPolicy {
    config: PolicyConfig,
}

impl SignalPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        if (config.weights.sum() - 1.0).abs() > 1e-6 {
            warn!(
                "Signal weights sum to {:.4}, not 1; composite scores will be rescaled",
                config.weights.sum()
            );
        }
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Run the policy over one instrument's full horizon.
    pub fn run(&self, input: &PolicyInput<'_>, model: &dyn CriticalTimeModel) -> StageResult<PolicyRun> {
        let n = input.dates.len();
        let misaligned = input.prices.len() != n
            || input.valuation.is_some_and(|v| v.len() != n)
            || input.macro_indicator.is_some_and(|v| v.len() != n);
        if misaligned {
            return Err(Skip::new(
                Stage::Policy,
                SkipReason::Failed(format!("inputs for {} are not aligned to the dates", input.instrument)),
            ));
        }

        let mut run = PolicyRun {
            instrument: input.instrument.to_string(),
            ..Default::default()
        };
        if n == 0 {
            return Ok(run);
        }

        let analysis: BTreeSet<usize> = input.analysis_indices.iter().copied().collect();
        let depth = self.config.hysteresis_depth.max(1);
        let mut state = PolicyState::Idle;
        let mut history: VecDeque<f64> = VecDeque::with_capacity(depth);
        let mut exit_mark: Option<ExitMark> = None;
        let last = n - 1;

        for (i, &date) in input.dates.iter().enumerate() {
            if i == last {
                run.events
                    .push(SignalEvent::exit(input.instrument, date, EventReason::Horizon));
                break;
            }
            if i == 0 && self.config.enter_at_start {
                run.events
                    .push(SignalEvent::enter(input.instrument, date, EventReason::Initial));
            }

            if state == PolicyState::ExitPending {
                if let Some(mark) = exit_mark.as_mut() {
                    if let Some(reason) = mark.check(i, input.prices, &self.config.reentry) {
                        debug!("{}: re-entry on {} ({:?})", input.instrument, date, reason);
                        run.events
                            .push(SignalEvent::enter(input.instrument, date, reason));
                        state = PolicyState::Idle;
                        exit_mark = None;
                    }
                }
                continue;
            }

            if !analysis.contains(&i) {
                continue;
            }

            let evaluated = self.evaluate(input, i);
            let (score, threshold) = match evaluated {
                Ok(values) => values,
                Err(skip) => {
                    debug!("{}: {} on {}", input.instrument, skip, date);
                    run.skips.push(SkipRecord {
                        instrument: Some(input.instrument.to_string()),
                        date: Some(date),
                        skip,
                    });
                    continue;
                }
            };

            let qualifying = score > threshold;
            if qualifying {
                history.push_back(score);
                while history.len() > depth {
                    history.pop_front();
                }
                state = PolicyState::Watching;

                if history.len() >= depth {
                    run.steps.push(PolicyStep {
                        date,
                        score,
                        threshold,
                        qualifying,
                        state: PolicyState::Armed,
                    });
                    state = match self.estimate(input, i, model) {
                        Ok(estimate) => {
                            let near = estimate.days_to_critical < self.config.sell_trigger_days;
                            debug!(
                                "{}: critical time {:.1} days out on {}",
                                input.instrument, estimate.days_to_critical, date
                            );
                            run.estimates.push((date, estimate));
                            if near {
                                run.events
                                    .push(SignalEvent::exit(input.instrument, date, EventReason::Signal));
                                history.clear();
                                exit_mark = Some(ExitMark::new(i, input.prices[i]));
                                PolicyState::ExitPending
                            } else {
                                PolicyState::Watching
                            }
                        }
                        Err(skip) => {
                            run.skips.push(SkipRecord {
                                instrument: Some(input.instrument.to_string()),
                                date: Some(date),
                                skip,
                            });
                            PolicyState::Watching
                        }
                    };
                }
            } else {
                if self.config.hysteresis_mode == HysteresisMode::Reset {
                    history.clear();
                }
                state = PolicyState::Idle;
            }

            run.steps.push(PolicyStep {
                date,
                score,
                threshold,
                qualifying,
                state,
            });
        }

        Ok(run)
    }

    fn evaluate(&self, input: &PolicyInput<'_>, index: usize) -> StageResult<(f64, f64)> {
        let date = input.dates[index];
        let signal = input.signals.get(&date).ok_or_else(|| {
            Skip::new(
                Stage::Policy,
                SkipReason::MissingData("normalized signal".to_string()),
            )
        })?;
        let score = composite_score(signal, &self.config.weights)?;
        let shift = threshold_shift(
            index,
            &self.config.regime,
            input.valuation,
            input.macro_indicator,
        )?;
        Ok((score, self.config.threshold + shift))
    }

    fn estimate(
        &self,
        input: &PolicyInput<'_>,
        index: usize,
        model: &dyn CriticalTimeModel,
    ) -> StageResult<CriticalTimeEstimate> {
        let prices = window_ending_at(input.prices, index, input.window).ok_or_else(|| {
            Skip::new(
                Stage::CriticalTime,
                SkipReason::WindowTooShort {
                    len: index + 1,
                    width: input.window,
                },
            )
        })?;
        let start = index + 1 - prices.len();
        let ordinals: Vec<i64> = input.dates[start..=index].iter().map(|d| ordinal(*d)).collect();
        let log_prices: Vec<f64> = prices.iter().map(|p| p.ln()).collect();
        model.estimate(&ordinals, &log_prices)
    }
}
