//! Configuration file support.
//!
//! Loads signal, policy, simulation and sweep settings from TOML files.
//! Every field has a default, so a file only needs the values it changes.

use crate::data::TableConfig;
use crate::error::{BubbleError, Result};
use crate::growth::GrowthConfig;
use crate::lppl::LpplConfig;
use crate::normalize::{NormalizerConfig, ZeroVariancePolicy};
use crate::policy::{HysteresisMode, PolicyConfig, ReEntryConfig, RegimeConfig, SignalWeights};
use crate::portfolio::{Allocation, FeeSchedule};
use crate::signals::EngineConfig;
use crate::simulator::SimulationConfig;
use crate::sweep::{partitions_by_sector, ParameterGrid, ParameterRange, Partition, SweepConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BubbleFileConfig {
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub signal: SignalSettings,
    #[serde(default)]
    pub weights: SignalWeights,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub reentry: ReEntryConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub critical_time: LpplConfig,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub sweep: SweepSettings,
}

/// Input table locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    /// Wide CSV of prices (date column, one column per instrument).
    pub prices: Option<String>,
    /// Optional wide CSV of volumes with the same layout.
    pub volume: Option<String>,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}
fn default_delimiter() -> char {
    ','
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            prices: None,
            volume: None,
            date_format: default_date_format(),
            delimiter: default_delimiter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSettings {
    #[serde(default = "default_model_window")]
    pub model_window: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default = "default_smoothing_width")]
    pub smoothing_width: usize,
    #[serde(default)]
    pub zero_variance: ZeroVariancePolicy,
    #[serde(default = "default_true")]
    pub parallel: bool,
}

fn default_model_window() -> usize {
    120
}
fn default_stride() -> usize {
    30
}
fn default_smoothing_width() -> usize {
    GrowthConfig::default().smoothing_width
}
fn default_true() -> bool {
    true
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            model_window: default_model_window(),
            stride: default_stride(),
            smoothing_width: default_smoothing_width(),
            zero_variance: ZeroVariancePolicy::default(),
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_hysteresis_depth")]
    pub hysteresis_depth: usize,
    #[serde(default)]
    pub hysteresis_mode: HysteresisMode,
    #[serde(default = "default_sell_trigger_days")]
    pub sell_trigger_days: f64,
    #[serde(default = "default_true")]
    pub enter_at_start: bool,
}

fn default_threshold() -> f64 {
    PolicyConfig::default().threshold
}
fn default_hysteresis_depth() -> usize {
    PolicyConfig::default().hysteresis_depth
}
fn default_sell_trigger_days() -> f64 {
    PolicyConfig::default().sell_trigger_days
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            hysteresis_depth: default_hysteresis_depth(),
            hysteresis_mode: HysteresisMode::default(),
            sell_trigger_days: default_sell_trigger_days(),
            enter_at_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    /// Proportional fee per trade (0.001 = 0.1%).
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default)]
    pub fee_schedule: FeeSchedule,
    #[serde(default)]
    pub allocation: Allocation,
    #[serde(default = "default_trading_days")]
    pub trading_days: f64,
    #[serde(default)]
    pub risk_free_rate: f64,
}

fn default_capital() -> f64 {
    SimulationConfig::default().initial_capital
}
fn default_fee_rate() -> f64 {
    SimulationConfig::default().fee_rate
}
fn default_trading_days() -> f64 {
    SimulationConfig::default().trading_days
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            initial_capital: default_capital(),
            fee_rate: default_fee_rate(),
            fee_schedule: FeeSchedule::default(),
            allocation: Allocation::default(),
            trading_days: default_trading_days(),
            risk_free_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    #[serde(default = "default_true")]
    pub show_progress: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Values to try per parameter name.
    #[serde(default)]
    pub parameters: BTreeMap<String, Vec<f64>>,
    /// Instrument to sector label; one partition per sector.
    #[serde(default)]
    pub sectors: BTreeMap<String, String>,
}

fn default_top_k() -> usize {
    10
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            show_progress: true,
            top_k: default_top_k(),
            parameters: BTreeMap::new(),
            sectors: BTreeMap::new(),
        }
    }
}

impl BubbleFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| BubbleError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Signal pipeline configuration, validated.
    pub fn to_engine_config(&self) -> Result<EngineConfig> {
        let growth = GrowthConfig {
            smoothing_width: self.signal.smoothing_width,
            ..GrowthConfig::default()
        };
        let policy = PolicyConfig {
            threshold: self.policy.threshold,
            hysteresis_depth: self.policy.hysteresis_depth,
            hysteresis_mode: self.policy.hysteresis_mode,
            sell_trigger_days: self.policy.sell_trigger_days,
            enter_at_start: self.policy.enter_at_start,
            weights: self.weights,
            reentry: self.reentry.clone(),
            regime: self.regime.clone(),
        };
        let config = EngineConfig {
            model_window: self.signal.model_window,
            stride: self.signal.stride,
            growth,
            normalizer: NormalizerConfig {
                zero_variance: self.signal.zero_variance,
            },
            critical_time: self.critical_time.clone(),
            policy,
            parallel: self.signal.parallel,
        };
        config.validate()?;
        Ok(config)
    }

    /// Simulator configuration, validated.
    pub fn to_simulation_config(&self) -> Result<SimulationConfig> {
        let settings = &self.simulation;
        let config = SimulationConfig {
            initial_capital: settings.initial_capital,
            fee_rate: settings.fee_rate,
            fee_schedule: settings.fee_schedule,
            allocation: settings.allocation,
            trading_days: settings.trading_days,
            risk_free_rate: settings.risk_free_rate,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_sweep_config(&self) -> Result<SweepConfig> {
        Ok(SweepConfig {
            engine: self.to_engine_config()?,
            simulation: self.to_simulation_config()?,
            show_progress: self.sweep.show_progress,
            top_k: self.sweep.top_k,
        })
    }

    /// Swept parameters; an empty table sweeps only the base configuration.
    pub fn parameter_grid(&self) -> ParameterGrid {
        self.sweep
            .parameters
            .iter()
            .fold(ParameterGrid::new(), |grid, (name, values)| {
                grid.add_parameter(name.clone(), ParameterRange::discrete(values.clone()))
            })
    }

    pub fn partitions(&self) -> Vec<Partition> {
        partitions_by_sector(&self.sweep.sectors)
    }

    pub fn table_config(&self) -> Result<TableConfig> {
        if !self.data.delimiter.is_ascii() {
            return Err(BubbleError::ConfigError(format!(
                "data.delimiter must be an ASCII character, got {:?}",
                self.data.delimiter
            )));
        }
        Ok(TableConfig {
            date_format: self.data.date_format.clone(),
            delimiter: self.data.delimiter as u8,
            ..TableConfig::default()
        })
    }

    /// A commented example configuration file.
    pub fn example() -> String {
        r#"# Bubble signal configuration

[data]
prices = "data/prices.csv"
# volume = "data/volume.csv"
date_format = "%Y-%m-%d"
delimiter = ","

[signal]
model_window = 120     # observations per analysis window
stride = 30            # observations between analysis dates
smoothing_width = 5
zero_variance = "zero" # or "skip"

[weights]
growth = 0.5
quality = 0.5
auxiliary = 0.0        # volume divergence; needs a volume table

[policy]
threshold = 60.0
hysteresis_depth = 1
hysteresis_mode = "reset" # or "slide"
sell_trigger_days = 30.0
enter_at_start = true

[reentry]
mode = "first_of"      # "timer", "recovery" or "first_of"
days_after_exit = 60
drawdown_fraction = 0.10
recovery_days = 3

[regime]
valuation_lookback = 252
valuation_step = 5.0
macro_high = 30.0
macro_low = 15.0
macro_step = 5.0

[critical_time]
attempts = 7
max_searches = 25
seed = 42
tc_horizon = 1.0       # tc range past the window, as a fraction of its span

[simulation]
initial_capital = 100000.0
fee_rate = 0.001
fee_schedule = "entry_and_exit" # or "entry_only"
allocation = "equal_weight"     # or "all_cash"
trading_days = 252.0
risk_free_rate = 0.0

[sweep]
show_progress = true
top_k = 10

[sweep.parameters]
threshold = [55.0, 60.0, 65.0]
hysteresis_depth = [1.0, 3.0]

# [sweep.sectors]
# AAA = "tech"
# BBB = "energy"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ReEntryMode;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_example() {
        let config = BubbleFileConfig::parse(&BubbleFileConfig::example()).unwrap();
        assert_eq!(config.data.prices.as_deref(), Some("data/prices.csv"));
        assert_eq!(config.signal.model_window, 120);
        assert_eq!(config.reentry.mode, ReEntryMode::FirstOf);
        assert_eq!(config.simulation.allocation, Allocation::EqualWeight);
        assert_eq!(config.parameter_grid().num_combinations(), 6);

        let engine = config.to_engine_config().unwrap();
        assert_eq!(engine, EngineConfig::default());
        assert_eq!(config.to_simulation_config().unwrap(), SimulationConfig::default());
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = BubbleFileConfig::parse("[policy]\nthreshold = 70.0\n").unwrap();
        let engine = config.to_engine_config().unwrap();
        assert_eq!(engine.policy.threshold, 70.0);
        assert_eq!(engine.policy.hysteresis_depth, 1);
        assert_eq!(engine.model_window, 120);
        assert!(config.partitions().is_empty());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = BubbleFileConfig::parse("[signal]\nstride = 0\n").unwrap();
        assert!(matches!(
            config.to_engine_config(),
            Err(BubbleError::ConfigError(_))
        ));

        let config = BubbleFileConfig::parse("[simulation]\nfee_rate = 1.5\n").unwrap();
        assert!(config.to_simulation_config().is_err());

        assert!(BubbleFileConfig::parse("[policy]\nhysteresis_mode = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = BubbleFileConfig::default();
        config.policy.threshold = 65.0;
        config.sweep.sectors.insert("AAA".to_string(), "tech".to_string());
        config
            .sweep
            .parameters
            .insert("fee_rate".to_string(), vec![0.0, 0.001]);

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        let loaded = BubbleFileConfig::load(file.path()).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded.partitions().len(), 1);
    }

    #[test]
    fn test_table_config() {
        let config = BubbleFileConfig::parse("[data]\ndelimiter = \";\"\n").unwrap();
        assert_eq!(config.table_config().unwrap().delimiter, b';');
    }
}
