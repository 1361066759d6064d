//! Signal-generation pipeline.
//!
//! Prices are fitted on every analysis date, the fits are normalized per
//! date across the whole universe, and only then does each instrument's
//! policy run over its own slice of the normalized panel. Fitting and
//! policy evaluation run in parallel per instrument; the normalization
//! step between them is the only point where instruments meet.

use crate::data::{analysis_indices, window_ending_at, SeriesTable};
use crate::error::{BubbleError, Result};
use crate::growth::{GrowthConfig, GrowthCurveFitter};
use crate::lppl::{CriticalTimeEstimator, CriticalTimeModel, LpplConfig, MIN_POINTS};
use crate::normalize::{CrossSectionalNormalizer, NormalizedPanel, NormalizerConfig};
use crate::policy::{PolicyConfig, PolicyInput, PolicyRun, SignalPolicy};
use crate::types::{EventKind, FitResult, SignalEvent, SkipRecord};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Configuration for the full signal pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Length of each analysis window in observations.
    pub model_window: usize,
    /// Observations between consecutive analysis dates.
    pub stride: usize,
    #[serde(default)]
    pub growth: GrowthConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub critical_time: LpplConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Fit and evaluate instruments on the rayon pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_parallel() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_window: 120,
            stride: 30,
            growth: GrowthConfig::default(),
            normalizer: NormalizerConfig::default(),
            critical_time: LpplConfig::default(),
            policy: PolicyConfig::default(),
            parallel: true,
        }
    }
}

impl EngineConfig {
    pub fn with_window(mut self, model_window: usize, stride: usize) -> Self {
        self.model_window = model_window;
        self.stride = stride;
        self
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_critical_time(mut self, critical_time: LpplConfig) -> Self {
        self.critical_time = critical_time;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stride == 0 {
            return Err(BubbleError::ConfigError(
                "signal.stride must be at least 1".to_string(),
            ));
        }
        let min_window = (self.growth.smoothing_width + 3).max(MIN_POINTS);
        if self.model_window < min_window {
            return Err(BubbleError::ConfigError(format!(
                "signal.model_window must be at least {}, got {}",
                min_window, self.model_window
            )));
        }
        self.critical_time.validate()?;
        self.policy.validate()?;
        let reach = self.critical_time.tc_horizon * (self.model_window - 1) as f64;
        if reach <= self.policy.sell_trigger_days {
            return Err(BubbleError::ConfigError(format!(
                "critical_time.tc_horizon reaches {:.1} days past a {}-observation window, \
                 which never exceeds policy.sell_trigger_days = {}",
                reach, self.model_window, self.policy.sell_trigger_days
            )));
        }
        Ok(())
    }
}

/// Date-aligned inputs for one pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct SignalInputs<'a> {
    pub prices: &'a SeriesTable,
    /// Trading volume per instrument on the same date index.
    pub volume: Option<&'a SeriesTable>,
    /// Market-wide valuation ratio aligned to the price dates.
    pub valuation: Option<&'a [f64]>,
    /// Market-wide macro indicator aligned to the price dates.
    pub macro_indicator: Option<&'a [f64]>,
}

impl<'a> SignalInputs<'a> {
    pub fn new(prices: &'a SeriesTable) -> Self {
        Self {
            prices,
            volume: None,
            valuation: None,
            macro_indicator: None,
        }
    }

    pub fn with_volume(mut self, volume: &'a SeriesTable) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_valuation(mut self, valuation: &'a [f64]) -> Self {
        self.valuation = Some(valuation);
        self
    }

    pub fn with_macro_indicator(mut self, macro_indicator: &'a [f64]) -> Self {
        self.macro_indicator = Some(macro_indicator);
        self
    }

    /// Check that every table and series shares the price date index.
    pub fn validate(&self) -> Result<()> {
        self.prices.validate_prices()?;
        let n = self.prices.len();
        if let Some(volume) = self.volume {
            if volume.dates() != self.prices.dates() {
                return Err(BubbleError::InvalidInput(
                    "volume table is not aligned to the price dates".to_string(),
                ));
            }
        }
        for (name, series) in [("valuation", self.valuation), ("macro", self.macro_indicator)] {
            if let Some(values) = series {
                if values.len() != n {
                    return Err(BubbleError::InvalidInput(format!(
                        "{} series has {} values for {} dates",
                        name,
                        values.len(),
                        n
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalReport {
    pub dates: Vec<NaiveDate>,
    pub analysis_indices: Vec<usize>,
    pub fits: Vec<FitResult>,
    pub panel: NormalizedPanel,
    pub runs: BTreeMap<String, PolicyRun>,
    /// Soft failures from fitting and normalization.
    pub skips: Vec<SkipRecord>,
    /// Instruments whose policy could not run at all.
    pub failures: Vec<SkipRecord>,
}

impl SignalReport {
    /// All events ordered by date, then instrument.
    pub fn events(&self) -> Vec<SignalEvent> {
        let mut events: Vec<SignalEvent> = self
            .runs
            .values()
            .flat_map(|run| run.events.iter().cloned())
            .collect();
        events.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.instrument.cmp(&b.instrument)));
        events
    }

    pub fn events_for(&self, instrument: &str) -> &[SignalEvent] {
        self.runs
            .get(instrument)
            .map(|run| run.events.as_slice())
            .unwrap_or(&[])
    }

    /// Event kind per date for one instrument.
    pub fn event_series(&self, instrument: &str) -> Option<Vec<Option<EventKind>>> {
        self.runs
            .get(instrument)
            .map(|run| run.event_series(&self.dates))
    }

    /// Skips from every stage, including those raised inside the policy.
    pub fn all_skips(&self) -> impl Iterator<Item = &SkipRecord> {
        self.skips
            .iter()
            .chain(self.runs.values().flat_map(|run| run.skips.iter()))
    }
}

/// Log price change minus log change of mean volume between the two
/// halves of a window.
///
/// Positive values mean price rose faster than participation.
pub fn volume_divergence(prices: &[f64], volume: &[f64]) -> Option<f64> {
    if prices.len() != volume.len() || prices.len() < 4 {
        return None;
    }
    let (first, last) = (prices[0], prices[prices.len() - 1]);
    if !(first > 0.0 && last > 0.0) {
        return None;
    }
    let half = volume.len() / 2;
    let early = volume[..half].iter().sum::<f64>() / half as f64;
    let late = volume[half..].iter().sum::<f64>() / (volume.len() - half) as f64;
    if !(early > 0.0 && late > 0.0) {
        return None;
    }
    let divergence = (last / first).ln() - (late / early).ln();
    divergence.is_finite().then_some(divergence)
}

/// Fits, normalizes and runs the policy for every instrument.
pub struct SignalEngine {
    config: EngineConfig,
    model: Box<dyn CriticalTimeModel>,
}

impl SignalEngine {
    pub fn new(config: EngineConfig) -> Self {
        let model = Box::new(CriticalTimeEstimator::new(config.critical_time.clone()));
        Self { config, model }
    }

    /// Replace the critical-time model.
    pub fn with_model(mut self, model: Box<dyn CriticalTimeModel>) -> Self {
        self.model = model;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Indices of the analysis dates for a table of `len` dates.
    pub fn analysis_indices(&self, len: usize) -> Vec<usize> {
        analysis_indices(len, self.config.model_window, self.config.stride)
    }

    /// Fit every instrument on every analysis date.
    pub fn fit_panel(&self, inputs: &SignalInputs<'_>) -> (Vec<FitResult>, Vec<SkipRecord>) {
        let fitter = GrowthCurveFitter::new(self.config.growth.clone());
        let indices = self.analysis_indices(inputs.prices.len());
        let with_volume = self.config.policy.weights.uses_auxiliary();

        let fit_instrument = |name: &str| -> (Vec<FitResult>, Vec<SkipRecord>) {
            let mut fits = Vec::new();
            let mut skips = Vec::new();
            let Some(prices) = inputs.prices.get(name) else {
                return (fits, skips);
            };
            let volume = inputs
                .volume
                .filter(|_| with_volume)
                .and_then(|table| table.get(name));

            for &end in &indices {
                let date = inputs.prices.dates()[end];
                let Some(window) = window_ending_at(prices, end, self.config.model_window) else {
                    continue;
                };
                match fitter.fit_at(name, date, window) {
                    Ok(mut fit) => {
                        fit.auxiliary = volume
                            .and_then(|v| window_ending_at(v, end, self.config.model_window))
                            .and_then(|v| volume_divergence(window, v));
                        fits.push(fit);
                    }
                    Err(skip) => {
                        debug!("{}: {} on {}", name, skip, date);
                        skips.push(SkipRecord {
                            instrument: Some(name.to_string()),
                            date: Some(date),
                            skip,
                        });
                    }
                }
            }
            (fits, skips)
        };

        let instruments = inputs.prices.instruments();
        let per_instrument: Vec<(Vec<FitResult>, Vec<SkipRecord>)> = if self.config.parallel {
            instruments.par_iter().map(|name| fit_instrument(*name)).collect()
        } else {
            instruments.iter().map(|name| fit_instrument(*name)).collect()
        };

        let mut fits = Vec::new();
        let mut skips = Vec::new();
        for (f, s) in per_instrument {
            fits.extend(f);
            skips.extend(s);
        }
        (fits, skips)
    }

    /// Run the whole pipeline.
    pub fn run(&self, inputs: &SignalInputs<'_>) -> Result<SignalReport> {
        self.config.validate()?;
        inputs.validate()?;

        let dates = inputs.prices.dates().to_vec();
        let indices = self.analysis_indices(dates.len());
        info!(
            "Generating signals: {} instruments, {} dates, {} analysis dates",
            inputs.prices.num_instruments(),
            dates.len(),
            indices.len()
        );

        let (fits, mut skips) = self.fit_panel(inputs);
        let normalizer = CrossSectionalNormalizer::new(self.config.normalizer.clone());
        let panel = normalizer.normalize_panel(&fits);
        skips.extend(panel.skipped().iter().cloned());

        let policy = SignalPolicy::new(self.config.policy.clone());
        let model = self.model.as_ref();

        let run_instrument = |name: &str| {
            let prices = inputs.prices.get(name).unwrap_or(&[]);
            let signals = panel.slice_for(name);
            let input = PolicyInput {
                instrument: name,
                dates: &dates,
                prices,
                analysis_indices: &indices,
                signals: &signals,
                window: self.config.model_window,
                valuation: inputs.valuation,
                macro_indicator: inputs.macro_indicator,
            };
            (name.to_string(), policy.run(&input, model))
        };

        let instruments = inputs.prices.instruments();
        let outcomes: Vec<_> = if self.config.parallel {
            instruments.par_iter().map(|name| run_instrument(*name)).collect()
        } else {
            instruments.iter().map(|name| run_instrument(*name)).collect()
        };

        let mut runs = BTreeMap::new();
        let mut failures = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(run) => {
                    runs.insert(name, run);
                }
                Err(skip) => {
                    warn!("Policy failed for {}: {}", name, skip);
                    failures.push(SkipRecord {
                        instrument: Some(name),
                        date: None,
                        skip,
                    });
                }
            }
        }

        let report = SignalReport {
            dates,
            analysis_indices: indices,
            fits,
            panel,
            runs,
            skips,
            failures,
        };
        info!(
            "Signals complete: {} fits, {} events, {} skips, {} failures",
            report.fits.len(),
            report.events().len(),
            report.all_skips().count(),
            report.failures.len()
        );
        Ok(report)
    }
}
