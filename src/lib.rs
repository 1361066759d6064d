//! Bubblescope - bubble detection signals and an event-driven portfolio simulator.
//!
//! # Overview
//!
//! Bubblescope turns a date-aligned table of prices into discrete Enter/Exit
//! events and simulates a portfolio that follows them:
//!
//! - **Growth fits**: a 3-parameter exponential fitted to each smoothed window
//!   gives a growth rate and a fit quality
//! - **Cross-sectional normalization**: growth and quality are z-scored across
//!   instruments on every analysis date
//! - **Critical time**: the median of several log-periodic power-law fits
//!   estimates how far away the end of a bubble is
//! - **Policy**: a composite score with threshold, hysteresis and re-entry rules
//!   decides when to sell and when to buy back
//! - **Simulation**: a fee-aware portfolio replays the events chronologically
//! - **Sweeps**: grid search over policy parameters and instrument partitions
//!
//! # Quick Start
//!
//! ```no_run
//! use bubblescope::{
//!     data::{load_table_csv, TableConfig},
//!     PerformanceReport, PortfolioSimulator, SignalEngine, SignalInputs,
//!     EngineConfig, SimulationConfig,
//! };
//!
//! let prices = load_table_csv("data/prices.csv", &TableConfig::default()).unwrap();
//!
//! let engine = SignalEngine::new(EngineConfig::default());
//! let report = engine.run(&SignalInputs::new(&prices)).unwrap();
//!
//! let simulator = PortfolioSimulator::new(SimulationConfig::default());
//! let result = simulator.run(&prices, &report.events()).unwrap();
//!
//! let performance = PerformanceReport::from_simulation(&result);
//! println!("Return: {:.2}%", performance.total_return_pct);
//! println!("Sharpe: {:.2}", performance.sharpe);
//! ```
//!
//! # Modules
//!
//! - [`types`]: Fit results, signals, events, positions and stage results
//! - [`data`]: Series tables, CSV loading, smoothing and window sampling
//! - [`growth`]: Exponential growth-curve fitting
//! - [`normalize`]: Per-date cross-sectional z-scores
//! - [`lppl`]: Log-periodic power-law fits and critical-time estimation
//! - [`policy`]: Composite score and the per-instrument state machine
//! - [`signals`]: The full signal pipeline across instruments
//! - [`portfolio`]: Cash, positions, fees and the equity curve
//! - [`simulator`]: Chronological event replay
//! - [`analytics`]: Performance metrics and benchmark comparison
//! - [`sweep`]: Parallel parameter sweeps
//! - [`config`]: TOML configuration file support
//! - [`metadata`]: Hashes, checksums and run ids
//! - [`logging`]: Tracing subscriber setup

pub mod analytics;
pub mod config;
pub mod data;
pub mod error;
pub mod growth;
pub mod logging;
pub mod lppl;
pub mod metadata;
pub mod normalize;
pub mod policy;
pub mod portfolio;
pub mod signals;
pub mod simulator;
pub mod sweep;
pub mod types;

// Re-exports for convenience
pub use analytics::{BenchmarkMetrics, PerformanceReport};
pub use config::BubbleFileConfig;
pub use data::SeriesTable;
pub use error::{BubbleError, Result};
pub use growth::{GrowthConfig, GrowthCurveFitter};
pub use lppl::{CriticalTimeEstimate, CriticalTimeEstimator, CriticalTimeModel, LpplConfig};
pub use normalize::{CrossSectionalNormalizer, NormalizedPanel, NormalizerConfig};
pub use policy::{PolicyConfig, SignalPolicy, SignalWeights};
pub use portfolio::Portfolio;
pub use signals::{EngineConfig, SignalEngine, SignalInputs, SignalReport};
pub use simulator::{PortfolioSimulator, SimulationConfig, SimulationResult};
pub use sweep::{ParameterGrid, ParameterRange, SweepConfig, SweepOutcome, SweepRunner};
pub use types::{
    EventKind, EventReason, FitResult, NormalizedSignal, SignalEvent, Skip, SkipReason, Stage,
    StageResult,
};
