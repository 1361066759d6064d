//! Brute-force parameter sweeps.
//!
//! A sweep maps the signal-to-simulation path over the Cartesian product of
//! instrument partitions and parameter combinations. Every task is a pure
//! function of its inputs, so tasks run on the rayon pool without shared
//! state, and the reduction (top-K by return or Sharpe) happens once all
//! tasks have finished.
//!
//! ```ignore
//! use bubblescope::sweep::{ParameterGrid, ParameterRange, SweepConfig, SweepRunner};
//!
//! let grid = ParameterGrid::new()
//!     .add_parameter("threshold", ParameterRange::linear(55.0, 70.0, 4))
//!     .add_parameter("hysteresis_depth", ParameterRange::discrete_int(vec![1, 3]));
//! let outcome = SweepRunner::new(SweepConfig::default()).run(&prices, &[], &grid)?;
//! for record in outcome.top_by_sharpe(5) {
//!     println!("{:?} -> {:.2}", record.params, record.sharpe);
//! }
//! ```

use crate::analytics::PerformanceReport;
use crate::data::SeriesTable;
use crate::error::{BubbleError, Result};
use crate::lppl::{CriticalTimeModel, LpplConfig};
use crate::metadata::{compute_config_hash, RunMetadata};
use crate::signals::{EngineConfig, SignalEngine, SignalInputs};
use crate::simulator::{PortfolioSimulator, SimulationConfig};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// How to generate the values of one swept parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterRange {
    /// `steps` evenly spaced values from `start` to `end`.
    Linear { start: f64, end: f64, steps: usize },
    /// `steps` values evenly spaced in log space.
    Logarithmic { start: f64, end: f64, steps: usize },
    /// Explicit values.
    Discrete { values: Vec<f64> },
}

impl ParameterRange {
    pub fn linear(start: f64, end: f64, steps: usize) -> Self {
        Self::Linear { start, end, steps }
    }

    pub fn logarithmic(start: f64, end: f64, steps: usize) -> Self {
        Self::Logarithmic { start, end, steps }
    }

    pub fn discrete(values: Vec<f64>) -> Self {
        Self::Discrete { values }
    }

    pub fn discrete_int(values: Vec<i64>) -> Self {
        Self::Discrete {
            values: values.into_iter().map(|v| v as f64).collect(),
        }
    }

    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::Linear { start, end, steps } => spaced(*start, *end, *steps),
            Self::Logarithmic { start, end, steps } => spaced(start.ln(), end.ln(), *steps)
                .into_iter()
                .map(f64::exp)
                .collect(),
            Self::Discrete { values } => values.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Linear { steps, .. } | Self::Logarithmic { steps, .. } => *steps,
            Self::Discrete { values } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn spaced(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (steps as f64 - 1.0);
            (0..steps).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Named parameter ranges whose Cartesian product forms the sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    pub parameters: BTreeMap<String, ParameterRange>,
}

impl ParameterGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(mut self, name: impl Into<String>, range: ParameterRange) -> Self {
        self.parameters.insert(name.into(), range);
        self
    }

    pub fn num_combinations(&self) -> usize {
        self.parameters.values().map(ParameterRange::len).product()
    }

    /// Every combination, in lexicographic order of parameter name.
    ///
    /// An empty grid yields one empty combination (the base configuration).
    pub fn combinations(&self) -> Vec<BTreeMap<String, f64>> {
        let mut combinations = vec![BTreeMap::new()];
        for (name, range) in &self.parameters {
            let values = range.values();
            combinations = combinations
                .into_iter()
                .flat_map(|current| {
                    values.iter().map(move |value| {
                        let mut next = current.clone();
                        next.insert(name.clone(), *value);
                        next
                    })
                })
                .collect();
        }
        combinations
    }
}

/// A named subset of instruments simulated together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub instruments: Vec<String>,
}

impl Partition {
    pub fn new(name: impl Into<String>, instruments: Vec<String>) -> Self {
        Self {
            name: name.into(),
            instruments,
        }
    }

    /// Every instrument of a table.
    pub fn all(table: &SeriesTable) -> Self {
        Self::new(
            "all",
            table.instruments().into_iter().map(str::to_string).collect(),
        )
    }
}

/// Group instruments by sector label, one partition per sector.
pub fn partitions_by_sector(sectors: &BTreeMap<String, String>) -> Vec<Partition> {
    let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (instrument, sector) in sectors {
        grouped
            .entry(sector.as_str())
            .or_default()
            .push(instrument.clone());
    }
    grouped
        .into_iter()
        .map(|(sector, instruments)| Partition::new(sector, instruments))
        .collect()
}

/// Set one named parameter on the engine or simulation configuration.
pub fn apply_parameter(
    engine: &mut EngineConfig,
    simulation: &mut SimulationConfig,
    name: &str,
    value: f64,
) -> Result<()> {
    if !value.is_finite() {
        return Err(BubbleError::ConfigError(format!(
            "sweep parameter {} must be finite",
            name
        )));
    }
    let count = || {
        if value < 0.0 || value.fract() != 0.0 {
            Err(BubbleError::ConfigError(format!(
                "sweep parameter {} must be a non-negative integer, got {}",
                name, value
            )))
        } else {
            Ok(value as usize)
        }
    };

    let policy = &mut engine.policy;
    match name {
        "threshold" => policy.threshold = value,
        "hysteresis_depth" => policy.hysteresis_depth = count()?,
        "sell_trigger_days" => policy.sell_trigger_days = value,
        "days_after_exit" => policy.reentry.days_after_exit = count()?,
        "drawdown_fraction" => policy.reentry.drawdown_fraction = value,
        "recovery_days" => policy.reentry.recovery_days = count()?,
        "weight_growth" => policy.weights.growth = value,
        "weight_quality" => policy.weights.quality = value,
        "weight_auxiliary" => policy.weights.auxiliary = value,
        "valuation_step" => policy.regime.valuation_step = value,
        "macro_step" => policy.regime.macro_step = value,
        "model_window" => engine.model_window = count()?,
        "stride" => engine.stride = count()?,
        "attempts" => engine.critical_time.attempts = count()?,
        "max_searches" => engine.critical_time.max_searches = count()?,
        "fee_rate" => simulation.fee_rate = value,
        "initial_capital" => simulation.initial_capital = value,
        _ => {
            return Err(BubbleError::ConfigError(format!(
                "unknown sweep parameter: {}",
                name
            )))
        }
    }
    Ok(())
}

fn default_show_progress() -> bool {
    true
}

fn default_top_k() -> usize {
    10
}

/// Base configuration every sweep task starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Draw a progress bar on stderr.
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
    /// Records kept by the summary log line.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            simulation: SimulationConfig::default(),
            show_progress: true,
            top_k: 10,
        }
    }
}

/// Result of one (partition, parameter set) task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRecord {
    pub task_index: usize,
    pub partition: String,
    pub params: BTreeMap<String, f64>,
    /// SHA-256 of the parameter set.
    pub params_hash: String,
    pub total_return_pct: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown_pct: f64,
    pub trade_count: usize,
    pub final_equity: f64,
    /// Policy-driven events (initial entries and horizon exits excluded).
    pub signal_events: usize,
}

/// A task that could not produce a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepFailure {
    pub task_index: usize,
    pub partition: String,
    pub params: BTreeMap<String, f64>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub metadata: RunMetadata,
    /// Successful records in task order.
    pub records: Vec<SweepRecord>,
    pub failures: Vec<SweepFailure>,
}

impl SweepOutcome {
    pub fn top_by_return(&self, k: usize) -> Vec<&SweepRecord> {
        self.top_by(k, |r| r.total_return_pct)
    }

    pub fn top_by_sharpe(&self, k: usize) -> Vec<&SweepRecord> {
        self.top_by(k, |r| r.sharpe)
    }

    /// Highest `k` records by `metric`; ties keep task order, NaN never ranks.
    fn top_by(&self, k: usize, metric: impl Fn(&SweepRecord) -> f64) -> Vec<&SweepRecord> {
        let mut ranked: Vec<&SweepRecord> = self
            .records
            .iter()
            .filter(|r| !metric(r).is_nan())
            .collect();
        ranked.sort_by(|a, b| {
            metric(b)
                .total_cmp(&metric(a))
                .then(a.task_index.cmp(&b.task_index))
        });
        ranked.truncate(k);
        ranked
    }
}

type ModelFactory = Arc<dyn Fn(&LpplConfig) -> Box<dyn CriticalTimeModel> + Send + Sync>;

struct SweepTask {
    index: usize,
    partition: Partition,
    params: BTreeMap<String, f64>,
}

/// Runs every task of a sweep on the rayon pool.
pub struct SweepRunner {
    config: SweepConfig,
    model_factory: Option<ModelFactory>,
}

impl SweepRunner {
    pub fn new(config: SweepConfig) -> Self {
        Self {
            config,
            model_factory: None,
        }
    }

    /// Build the critical-time model of each task with `factory`.
    pub fn with_model_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&LpplConfig) -> Box<dyn CriticalTimeModel> + Send + Sync + 'static,
    {
        self.model_factory = Some(Arc::new(factory));
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run every (partition, combination) pair of the sweep.
    ///
    /// An empty `partitions` slice sweeps the whole table as one partition.
    /// Failed tasks are recorded in [`SweepOutcome::failures`] without
    /// stopping the others.
    pub fn run(
        &self,
        table: &SeriesTable,
        partitions: &[Partition],
        grid: &ParameterGrid,
    ) -> Result<SweepOutcome> {
        if table.is_empty() || table.num_instruments() == 0 {
            return Err(BubbleError::NoData);
        }
        table.validate_prices()?;

        let partitions = if partitions.is_empty() {
            vec![Partition::all(table)]
        } else {
            partitions.to_vec()
        };
        for partition in &partitions {
            if let Some(missing) = partition
                .instruments
                .iter()
                .find(|name| !table.contains(name))
            {
                return Err(BubbleError::InvalidInput(format!(
                    "partition {} names unknown instrument {}",
                    partition.name, missing
                )));
            }
        }

        let combinations = grid.combinations();
        let tasks: Vec<SweepTask> = partitions
            .iter()
            .flat_map(|partition| {
                combinations.iter().map(move |params| (partition, params))
            })
            .enumerate()
            .map(|(index, (partition, params))| SweepTask {
                index,
                partition: partition.clone(),
                params: params.clone(),
            })
            .collect();

        let metadata = RunMetadata::new(&(&self.config, grid, &partitions));
        info!(
            "Sweep {}: {} partitions x {} combinations = {} tasks",
            metadata.run_id,
            partitions.len(),
            combinations.len(),
            tasks.len()
        );

        let progress = if self.config.show_progress {
            let pb = ProgressBar::new(tasks.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        let results: Vec<std::result::Result<SweepRecord, SweepFailure>> = tasks
            .par_iter()
            .map(|task| {
                let result = self.run_task(table, task).map_err(|e| {
                    warn!(
                        "Sweep task {} ({}) failed: {}",
                        task.index, task.partition.name, e
                    );
                    SweepFailure {
                        task_index: task.index,
                        partition: task.partition.name.clone(),
                        params: task.params.clone(),
                        error: e.to_string(),
                    }
                });
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
                result
            })
            .collect();

        if let Some(pb) = progress {
            pb.finish_with_message("Sweep complete");
        }

        let (records, failures): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.is_ok());
        let outcome = SweepOutcome {
            metadata,
            records: records.into_iter().filter_map(|r| r.ok()).collect(),
            failures: failures.into_iter().filter_map(|r| r.err()).collect(),
        };

        info!(
            "Sweep finished: {} records, {} failures",
            outcome.records.len(),
            outcome.failures.len()
        );
        if let Some(best) = outcome.top_by_sharpe(self.config.top_k).first() {
            info!(
                "Best by Sharpe: task {} ({}) sharpe {:.3}, return {:.2}%",
                best.task_index, best.partition, best.sharpe, best.total_return_pct
            );
        }
        Ok(outcome)
    }

    fn run_task(&self, table: &SeriesTable, task: &SweepTask) -> Result<SweepRecord> {
        let mut engine_config = self.config.engine.clone();
        let mut simulation = self.config.simulation.clone();
        for (name, value) in &task.params {
            apply_parameter(&mut engine_config, &mut simulation, name, *value)?;
        }
        engine_config.validate()?;
        simulation.validate()?;

        let prices = table.subset(&task.partition.instruments)?;
        let mut engine = SignalEngine::new(engine_config);
        if let Some(factory) = &self.model_factory {
            let model = factory(&engine.config().critical_time);
            engine = engine.with_model(model);
        }
        let report = engine.run(&SignalInputs::new(&prices))?;
        let events = report.events();
        let signal_events = events.iter().filter(|e| e.is_policy_driven()).count();

        let result = PortfolioSimulator::new(simulation).run(&prices, &events)?;
        let performance = PerformanceReport::from_simulation(&result);

        Ok(SweepRecord {
            task_index: task.index,
            partition: task.partition.name.clone(),
            params_hash: compute_config_hash(&task.params),
            params: task.params.clone(),
            total_return_pct: performance.total_return_pct,
            sharpe: performance.sharpe,
            sortino: performance.sortino,
            max_drawdown_pct: performance.max_drawdown_pct,
            trade_count: performance.trade_count,
            final_equity: performance.final_equity,
            signal_events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::daily_dates;
    use crate::lppl::CriticalTimeEstimate;
    use crate::types::{Skip, SkipReason, Stage, StageResult};
    use chrono::NaiveDate;

    struct Unavailable;

    impl CriticalTimeModel for Unavailable {
        fn estimate(&self, _: &[i64], _: &[f64]) -> StageResult<CriticalTimeEstimate> {
            Err(Skip::new(Stage::CriticalTime, SkipReason::NonConvergence))
        }
    }

    fn table() -> SeriesTable {
        let dates = daily_dates(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(), 90);
        let rising: Vec<f64> = (0..90).map(|i| 100.0 * (0.004 * i as f64).exp()).collect();
        let falling: Vec<f64> = (0..90).map(|i| 100.0 * (-0.002 * i as f64).exp()).collect();
        let wavy: Vec<f64> = (0..90)
            .map(|i| 100.0 + 5.0 * (i as f64 / 7.0).sin())
            .collect();
        SeriesTable::from_columns(
            dates,
            [("AAA", rising), ("BBB", falling), ("CCC", wavy)],
        )
        .unwrap()
    }

    fn runner() -> SweepRunner {
        let config = SweepConfig {
            engine: EngineConfig::default().with_window(40, 15),
            show_progress: false,
            ..SweepConfig::default()
        };
        SweepRunner::new(config).with_model_factory(|_| Box::new(Unavailable))
    }

    #[test]
    fn test_parameter_range_values() {
        assert_eq!(ParameterRange::linear(1.0, 3.0, 3).values(), vec![1.0, 2.0, 3.0]);
        assert_eq!(ParameterRange::linear(5.0, 9.0, 1).values(), vec![5.0]);
        let log = ParameterRange::logarithmic(1.0, 100.0, 3).values();
        assert!((log[1] - 10.0).abs() < 1e-9);
        assert_eq!(ParameterRange::discrete_int(vec![1, 3]).values(), vec![1.0, 3.0]);
        assert!(ParameterRange::discrete(vec![]).is_empty());
    }

    #[test]
    fn test_grid_combinations() {
        let grid = ParameterGrid::new()
            .add_parameter("threshold", ParameterRange::discrete(vec![55.0, 60.0]))
            .add_parameter("hysteresis_depth", ParameterRange::discrete_int(vec![1, 2, 3]));
        let combinations = grid.combinations();
        assert_eq!(combinations.len(), 6);
        assert_eq!(grid.num_combinations(), 6);
        assert_eq!(combinations[0]["hysteresis_depth"], 1.0);
        assert_eq!(combinations[0]["threshold"], 55.0);
        assert_eq!(combinations[1]["threshold"], 60.0);

        assert_eq!(ParameterGrid::new().combinations(), vec![BTreeMap::new()]);
    }

    #[test]
    fn test_partitions_by_sector() {
        let sectors: BTreeMap<String, String> = [
            ("AAA", "tech"),
            ("BBB", "energy"),
            ("CCC", "tech"),
        ]
        .into_iter()
        .map(|(i, s)| (i.to_string(), s.to_string()))
        .collect();
        let partitions = partitions_by_sector(&sectors);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].name, "energy");
        assert_eq!(partitions[1].instruments, vec!["AAA", "CCC"]);
    }

    #[test]
    fn test_apply_parameter() {
        let mut engine = EngineConfig::default();
        let mut simulation = SimulationConfig::default();
        apply_parameter(&mut engine, &mut simulation, "threshold", 70.0).unwrap();
        apply_parameter(&mut engine, &mut simulation, "recovery_days", 5.0).unwrap();
        apply_parameter(&mut engine, &mut simulation, "fee_rate", 0.002).unwrap();
        assert_eq!(engine.policy.threshold, 70.0);
        assert_eq!(engine.policy.reentry.recovery_days, 5);
        assert_eq!(simulation.fee_rate, 0.002);

        assert!(apply_parameter(&mut engine, &mut simulation, "leverage", 2.0).is_err());
        assert!(apply_parameter(&mut engine, &mut simulation, "stride", 2.5).is_err());
        assert!(apply_parameter(&mut engine, &mut simulation, "attempts", -1.0).is_err());
    }

    #[test]
    fn test_sweep_runs_every_task() {
        let grid = ParameterGrid::new()
            .add_parameter("threshold", ParameterRange::discrete(vec![50.0, 90.0]))
            .add_parameter("fee_rate", ParameterRange::discrete(vec![0.0, 0.01]));
        let partitions = vec![
            Partition::new("ab", vec!["AAA".into(), "BBB".into()]),
            Partition::new("abc", vec!["AAA".into(), "BBB".into(), "CCC".into()]),
        ];
        let outcome = runner().run(&table(), &partitions, &grid).unwrap();

        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.records.len(), 8);
        for (i, record) in outcome.records.iter().enumerate() {
            assert_eq!(record.task_index, i);
            assert_eq!(record.params_hash.len(), 64);
            // the critical-time model never answers, so no policy exits
            assert_eq!(record.signal_events, 0);
        }
        // identical parameters hash identically across partitions
        assert_eq!(outcome.records[0].params_hash, outcome.records[4].params_hash);
        assert_ne!(outcome.records[0].params_hash, outcome.records[1].params_hash);
    }

    #[test]
    fn test_top_k_ranking() {
        let grid = ParameterGrid::new()
            .add_parameter("fee_rate", ParameterRange::discrete(vec![0.02, 0.0, 0.01]));
        let partitions = vec![Partition::new("a", vec!["AAA".into()])];
        let outcome = runner().run(&table(), &partitions, &grid).unwrap();

        let top = outcome.top_by_return(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].params["fee_rate"], 0.0);
        assert_eq!(top[1].params["fee_rate"], 0.01);
        assert!(top[0].total_return_pct >= top[1].total_return_pct);
        assert_eq!(outcome.top_by_sharpe(10).len(), 3);
    }

    #[test]
    fn test_failed_tasks_are_isolated() {
        let grid = ParameterGrid::new()
            .add_parameter("model_window", ParameterRange::discrete(vec![2.0, 40.0]));
        let outcome = runner().run(&table(), &[], &grid).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].params["model_window"], 2.0);
    }

    #[test]
    fn test_unknown_partition_instrument() {
        let partitions = vec![Partition::new("x", vec!["ZZZ".into()])];
        let result = runner().run(&table(), &partitions, &ParameterGrid::new());
        assert!(matches!(result, Err(BubbleError::InvalidInput(_))));
    }
}
