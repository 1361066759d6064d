//! Event-driven portfolio simulation.
//!
//! Dates are processed strictly in order. On each date the positions
//! carried from the previous date are marked to market first, then that
//! date's exits and entries are applied (exits first, each group sorted by
//! instrument), then an equity point is recorded. The simulator is a pure
//! function of its inputs.

use crate::data::SeriesTable;
use crate::error::{BubbleError, Result};
use crate::portfolio::{Allocation, CostModel, FeeSchedule, Portfolio};
use crate::types::{
    EquityPoint, EventKind, Position, RoundTrip, SignalEvent, Skip, SkipReason, SkipRecord, Stage,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Configuration for the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub initial_capital: f64,
    /// Proportional fee per trade.
    pub fee_rate: f64,
    #[serde(default)]
    pub fee_schedule: FeeSchedule,
    #[serde(default)]
    pub allocation: Allocation,
    /// Trading days per year used to annualize ratios.
    #[serde(default = "default_trading_days")]
    pub trading_days: f64,
    /// Annual risk-free rate for Sharpe and Sortino.
    #[serde(default)]
    pub risk_free_rate: f64,
}

fn default_trading_days() -> f64 {
    252.0
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            fee_rate: 0.001,
            fee_schedule: FeeSchedule::default(),
            allocation: Allocation::default(),
            trading_days: default_trading_days(),
            risk_free_rate: 0.0,
        }
    }
}

impl SimulationConfig {
    pub fn with_capital(mut self, initial_capital: f64) -> Self {
        self.initial_capital = initial_capital;
        self
    }

    pub fn with_fees(mut self, fee_rate: f64, fee_schedule: FeeSchedule) -> Self {
        self.fee_rate = fee_rate;
        self.fee_schedule = fee_schedule;
        self
    }

    pub fn with_allocation(mut self, allocation: Allocation) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn cost_model(&self) -> CostModel {
        CostModel::new(self.fee_rate, self.fee_schedule)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.initial_capital > 0.0 && self.initial_capital.is_finite()) {
            return Err(BubbleError::ConfigError(format!(
                "simulation.initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(BubbleError::ConfigError(format!(
                "simulation.fee_rate must be within [0, 1), got {}",
                self.fee_rate
            )));
        }
        if !(self.trading_days > 0.0) {
            return Err(BubbleError::ConfigError(
                "simulation.trading_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output of one simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub config: SimulationConfig,
    pub instruments: Vec<String>,
    pub equity_curve: Vec<EquityPoint>,
    pub round_trips: Vec<RoundTrip>,
    /// Positions still open after the last date.
    pub open_positions: Vec<Position>,
    /// Events that changed the portfolio.
    pub applied_events: Vec<SignalEvent>,
    /// Double entries and exits without a position.
    pub ignored_events: usize,
    /// One record per ignored event.
    pub skips: Vec<SkipRecord>,
    pub total_fees: f64,
    pub final_equity: f64,
}

impl SimulationResult {
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.equity_curve.iter().map(|p| p.date).collect()
    }

    pub fn total_return_pct(&self) -> f64 {
        (self.final_equity - self.config.initial_capital) / self.config.initial_capital * 100.0
    }
}

/// Replays signal events against a price table.
#[derive(Debug, Clone, Default)]
pub struct PortfolioSimulator {
    config: SimulationConfig,
}

impl PortfolioSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run the simulation.
    ///
    /// Events naming an unknown instrument or a date outside the price
    /// index are rejected before anything is simulated.
    pub fn run(&self, prices: &SeriesTable, events: &[SignalEvent]) -> Result<SimulationResult> {
        self.config.validate()?;
        prices.validate_prices()?;

        let mut by_index: BTreeMap<usize, Vec<&SignalEvent>> = BTreeMap::new();
        for event in events {
            if !prices.contains(&event.instrument) {
                return Err(BubbleError::InvalidInput(format!(
                    "event for unknown instrument '{}'",
                    event.instrument
                )));
            }
            let index = prices.index_of(event.date).ok_or_else(|| {
                BubbleError::InvalidInput(format!(
                    "event for {} on {} is outside the price index",
                    event.instrument, event.date
                ))
            })?;
            by_index.entry(index).or_default().push(event);
        }
        for day_events in by_index.values_mut() {
            day_events.sort_by(|a, b| {
                exit_first(a.kind)
                    .cmp(&exit_first(b.kind))
                    .then_with(|| a.instrument.cmp(&b.instrument))
            });
        }

        let instruments: Vec<String> = prices.instruments().iter().map(|s| s.to_string()).collect();
        let slice = self.config.initial_capital / instruments.len() as f64;
        let mut portfolio = Portfolio::with_cost_model(self.config.initial_capital, self.config.cost_model());
        let mut applied = Vec::new();
        let mut skips = Vec::new();
        let mut previous: BTreeMap<String, f64> = BTreeMap::new();

        for (t, &date) in prices.dates().iter().enumerate() {
            let current: BTreeMap<String, f64> = instruments
                .iter()
                .filter_map(|name| prices.get(name).map(|col| (name.clone(), col[t])))
                .collect();

            let market_pnl: f64 = portfolio
                .positions()
                .iter()
                .map(|(name, pos)| {
                    let now = current.get(name).copied().unwrap_or(pos.entry_price);
                    let before = previous.get(name).copied().unwrap_or(now);
                    pos.quantity * (now - before)
                })
                .sum();

            for event in by_index.get(&t).into_iter().flatten() {
                let price = current.get(&event.instrument).copied().unwrap_or(f64::NAN);
                let holding = portfolio.has_position(&event.instrument);
                let changed = match event.kind {
                    EventKind::Exit => portfolio.close(&event.instrument, date, price).is_some(),
                    EventKind::Enter => {
                        let budget = match self.config.allocation {
                            Allocation::AllCash => portfolio.cash,
                            Allocation::EqualWeight => slice,
                        };
                        portfolio.open(&event.instrument, date, price, budget)
                    }
                };
                if changed {
                    applied.push((*event).clone());
                } else {
                    let why = match (event.kind, holding) {
                        (EventKind::Exit, _) => "exit without an open position",
                        (EventKind::Enter, true) => "entry while already holding",
                        (EventKind::Enter, false) => "entry without cash to deploy",
                    };
                    skips.push(SkipRecord {
                        instrument: Some(event.instrument.clone()),
                        date: Some(date),
                        skip: Skip::new(Stage::Simulation, SkipReason::NoOpEvent(why.to_string())),
                    });
                }
            }

            let point = portfolio.record_equity(date, &current, market_pnl);
            debug!("{}: equity {:.2}, exposure {:.3}", date, point.equity, point.exposure);
            previous = current;
        }

        let final_equity = portfolio
            .equity_curve()
            .last()
            .map(|p| p.equity)
            .unwrap_or(self.config.initial_capital);

        info!(
            "Simulation complete: {} instruments, {} round trips, {} ignored events, final equity {:.2}",
            instruments.len(),
            portfolio.round_trips().len(),
            skips.len(),
            final_equity
        );

        Ok(SimulationResult {
            config: self.config.clone(),
            instruments,
            equity_curve: portfolio.equity_curve().to_vec(),
            round_trips: portfolio.round_trips().to_vec(),
            open_positions: portfolio.positions().values().cloned().collect(),
            applied_events: applied,
            ignored_events: skips.len(),
            skips,
            total_fees: portfolio.total_fees(),
            final_equity,
        })
    }
}

fn exit_first(kind: EventKind) -> u8 {
    match kind {
        EventKind::Exit => 0,
        EventKind::Enter => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::daily_dates;
    use crate::types::EventReason;

    fn dates() -> Vec<NaiveDate> {
        daily_dates(NaiveDate::from_ymd_opt(2023, 1, 2).unwrap(), 5)
    }

    fn table() -> SeriesTable {
        SeriesTable::from_columns(
            dates(),
            [
                ("AAA", vec![100.0, 110.0, 121.0, 110.0, 100.0]),
                ("BBB", vec![50.0, 50.0, 50.0, 50.0, 50.0]),
            ],
        )
        .unwrap()
    }

    fn simulator(fee: f64, allocation: Allocation) -> PortfolioSimulator {
        PortfolioSimulator::new(
            SimulationConfig::default()
                .with_capital(10_000.0)
                .with_fees(fee, FeeSchedule::EntryAndExit)
                .with_allocation(allocation),
        )
    }

    #[test]
    fn test_equal_weight_allocation() {
        let d = dates();
        let events = vec![
            SignalEvent::enter("AAA", d[0], EventReason::Initial),
            SignalEvent::enter("BBB", d[0], EventReason::Initial),
        ];
        let result = simulator(0.0, Allocation::EqualWeight).run(&table(), &events).unwrap();
        let first = &result.equity_curve[0];
        assert!((first.cash).abs() < 1e-9);
        assert!((first.exposure - 1.0).abs() < 1e-12);
        // AAA holds 50 units: +500 on day 2.
        assert!((result.equity_curve[1].equity - 10_500.0).abs() < 1e-9);
        assert!((result.equity_curve[1].market_pnl - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_exits_apply_before_entries() {
        let d = dates();
        let events = vec![
            SignalEvent::enter("AAA", d[0], EventReason::Initial),
            SignalEvent::enter("BBB", d[2], EventReason::ReEntryTimer),
            SignalEvent::exit("AAA", d[2], EventReason::Signal),
        ];
        let result = simulator(0.0, Allocation::AllCash).run(&table(), &events).unwrap();
        // AAA sold at 121 before BBB bought with all of the proceeds.
        let point = &result.equity_curve[2];
        assert!((point.equity - 12_100.0).abs() < 1e-9);
        assert!(point.cash.abs() < 1e-9);
        assert_eq!(result.applied_events.len(), 3);
        assert_eq!(result.round_trips.len(), 1);
    }

    #[test]
    fn test_noop_events_are_counted() {
        let d = dates();
        let events = vec![
            SignalEvent::exit("AAA", d[0], EventReason::Signal),
            SignalEvent::enter("AAA", d[1], EventReason::ReEntryTimer),
            SignalEvent::enter("AAA", d[2], EventReason::ReEntryTimer),
        ];
        let result = simulator(0.001, Allocation::EqualWeight).run(&table(), &events).unwrap();
        assert_eq!(result.ignored_events, 2);
        assert_eq!(result.skips.len(), 2);
        assert!(result.skips.iter().all(|r| r.skip.stage == Stage::Simulation));
        assert_eq!(result.skips[0].date, Some(d[0]));
        assert_eq!(
            result.skips[1].skip.reason,
            SkipReason::NoOpEvent("entry while already holding".to_string())
        );
        assert_eq!(result.open_positions.len(), 1);
        assert!(result.equity_curve.iter().all(|p| p.cash >= 0.0));
    }

    #[test]
    fn test_accounting_identity() {
        let d = dates();
        let events = vec![
            SignalEvent::enter("AAA", d[0], EventReason::Initial),
            SignalEvent::enter("BBB", d[1], EventReason::Initial),
            SignalEvent::exit("AAA", d[3], EventReason::Signal),
            SignalEvent::exit("BBB", d[4], EventReason::Horizon),
        ];
        let result = simulator(0.003, Allocation::EqualWeight).run(&table(), &events).unwrap();
        let mut prior = 10_000.0;
        for point in &result.equity_curve {
            let expected = prior + point.market_pnl - point.fees;
            assert!((point.equity - expected).abs() < 1e-6, "{} vs {}", point.equity, expected);
            prior = point.equity;
        }
        assert!(result.open_positions.is_empty());
        assert!((result.final_equity - result.equity_curve[4].cash).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_unknown_instrument_and_date() {
        let d = dates();
        let sim = simulator(0.0, Allocation::EqualWeight);
        let unknown = vec![SignalEvent::enter("ZZZ", d[0], EventReason::Initial)];
        assert!(matches!(sim.run(&table(), &unknown), Err(BubbleError::InvalidInput(_))));

        let late = d[4] + chrono::Duration::days(10);
        let outside = vec![SignalEvent::enter("AAA", late, EventReason::Initial)];
        assert!(matches!(sim.run(&table(), &outside), Err(BubbleError::InvalidInput(_))));
    }

    #[test]
    fn test_no_events_keeps_cash() {
        let result = simulator(0.01, Allocation::AllCash).run(&table(), &[]).unwrap();
        assert_eq!(result.final_equity, 10_000.0);
        assert!(result.equity_curve.iter().all(|p| p.exposure == 0.0));
    }
}
