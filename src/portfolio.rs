//! Portfolio state, fees and position tracking.

use crate::types::{EquityPoint, Position, RoundTrip};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Which side of a round trip pays the proportional fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSchedule {
    /// Same proportional fee on entry and exit.
    #[default]
    EntryAndExit,
    /// Fee on entry only.
    EntryOnly,
}

/// How much cash an entry deploys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    /// All available cash.
    AllCash,
    /// `initial_capital / n_instruments`, capped by available cash.
    #[default]
    EqualWeight,
}

/// Configuration for trade execution costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Fee as a fraction of trade value.
    pub fee_rate: f64,
    #[serde(default)]
    pub schedule: FeeSchedule,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            fee_rate: 0.001, // 10 bps
            schedule: FeeSchedule::EntryAndExit,
        }
    }
}

impl CostModel {
    /// Create a zero-cost model.
    pub fn zero() -> Self {
        Self {
            fee_rate: 0.0,
            schedule: FeeSchedule::EntryAndExit,
        }
    }

    pub fn new(fee_rate: f64, schedule: FeeSchedule) -> Self {
        Self { fee_rate, schedule }
    }

    pub fn entry_fee(&self, trade_value: f64) -> f64 {
        trade_value * self.fee_rate
    }

    pub fn exit_fee(&self, trade_value: f64) -> f64 {
        match self.schedule {
            FeeSchedule::EntryAndExit => trade_value * self.fee_rate,
            FeeSchedule::EntryOnly => 0.0,
        }
    }
}

/// Cash, open positions and the resulting equity curve.
///
/// Cash and quantities never go negative: entries spend at most the
/// available cash and exits always liquidate in full.
#[derive(Debug, Clone)]
pub struct Portfolio {
    /// Available cash.
    pub cash: f64,
    pub initial_capital: f64,
    positions: BTreeMap<String, Position>,
    round_trips: Vec<RoundTrip>,
    equity_curve: Vec<EquityPoint>,
    cost_model: CostModel,
    peak_equity: f64,
    /// Fees charged since the last recorded equity point.
    pending_fees: f64,
    total_fees: f64,
}

impl Portfolio {
    /// Create a new portfolio with initial capital.
    pub fn new(initial_capital: f64) -> Self {
        Self::with_cost_model(initial_capital, CostModel::default())
    }

    /// Create a portfolio with a custom cost model.
    pub fn with_cost_model(initial_capital: f64, cost_model: CostModel) -> Self {
        Self {
            cash: initial_capital,
            initial_capital,
            positions: BTreeMap::new(),
            round_trips: Vec::new(),
            equity_curve: Vec::new(),
            cost_model,
            peak_equity: initial_capital,
            pending_fees: 0.0,
            total_fees: 0.0,
        }
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    /// Open a position with up to `budget` of cash.
    ///
    /// Returns `false` without touching state when a position is already
    /// open or nothing can be bought.
    pub fn open(&mut self, instrument: &str, date: NaiveDate, price: f64, budget: f64) -> bool {
        if self.positions.contains_key(instrument) {
            debug!("{}: already holding, entry on {} ignored", instrument, date);
            return false;
        }
        let budget = budget.min(self.cash);
        if !(budget > 0.0 && price > 0.0 && price.is_finite()) {
            debug!("{}: no cash to deploy on {}", instrument, date);
            return false;
        }

        let fee = self.cost_model.entry_fee(budget);
        let quantity = (budget - fee) / price;
        self.cash -= budget;
        self.record_fee(fee);
        self.positions.insert(
            instrument.to_string(),
            Position {
                instrument: instrument.to_string(),
                open_date: date,
                quantity,
                entry_price: price,
                cost_basis: budget,
                entry_fee: fee,
            },
        );
        true
    }

    /// Liquidate a position in full.
    ///
    /// Returns `None` when nothing is held.
    pub fn close(&mut self, instrument: &str, date: NaiveDate, price: f64) -> Option<RoundTrip> {
        let Some(position) = self.positions.remove(instrument) else {
            debug!("{}: nothing held, exit on {} ignored", instrument, date);
            return None;
        };

        let proceeds = position.quantity * price;
        let fee = self.cost_model.exit_fee(proceeds);
        self.cash += proceeds - fee;
        self.record_fee(fee);

        let trip = RoundTrip {
            instrument: position.instrument,
            entry_date: position.open_date,
            exit_date: date,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price: price,
            fees: position.entry_fee + fee,
            net_pnl: proceeds - fee - position.cost_basis,
        };
        self.round_trips.push(trip.clone());
        Some(trip)
    }

    fn record_fee(&mut self, fee: f64) {
        self.pending_fees += fee;
        self.total_fees += fee;
    }

    /// Mark-to-market value of all open positions.
    pub fn positions_value(&self, prices: &BTreeMap<String, f64>) -> f64 {
        self.positions
            .iter()
            .map(|(name, pos)| pos.market_value(prices.get(name).copied().unwrap_or(pos.entry_price)))
            .sum()
    }

    pub fn equity(&self, prices: &BTreeMap<String, f64>) -> f64 {
        self.cash + self.positions_value(prices)
    }

    /// Record an equity point for `date`.
    ///
    /// `market_pnl` is the mark-to-market change of positions carried into
    /// the date; fees charged since the previous point are attached here.
    pub fn record_equity(
        &mut self,
        date: NaiveDate,
        prices: &BTreeMap<String, f64>,
        market_pnl: f64,
    ) -> &EquityPoint {
        let positions_value = self.positions_value(prices);
        let equity = self.cash + positions_value;
        self.peak_equity = self.peak_equity.max(equity);

        let drawdown = self.peak_equity - equity;
        let drawdown_pct = if self.peak_equity > 0.0 {
            drawdown / self.peak_equity * 100.0
        } else {
            0.0
        };
        let exposure = if equity > 0.0 {
            positions_value / equity
        } else {
            0.0
        };

        self.equity_curve.push(EquityPoint {
            date,
            equity,
            cash: self.cash,
            positions_value,
            exposure,
            fees: self.pending_fees,
            market_pnl,
            drawdown,
            drawdown_pct,
        });
        self.pending_fees = 0.0;
        &self.equity_curve[self.equity_curve.len() - 1]
    }

    pub fn position(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn has_position(&self, instrument: &str) -> bool {
        self.positions.contains_key(instrument)
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn round_trips(&self) -> &[RoundTrip] {
        &self.round_trips
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn total_fees(&self) -> f64 {
        self.total_fees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn prices(p: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("AAA".to_string(), p)])
    }

    #[test]
    fn test_open_charges_entry_fee() {
        let mut portfolio = Portfolio::with_cost_model(10_000.0, CostModel::new(0.01, FeeSchedule::EntryAndExit));
        assert!(portfolio.open("AAA", day(1), 100.0, 5_000.0));

        let position = portfolio.position("AAA").unwrap();
        assert!((position.quantity - 49.5).abs() < 1e-9);
        assert!((portfolio.cash - 5_000.0).abs() < 1e-9);
        assert!((portfolio.equity(&prices(100.0)) - 9_950.0).abs() < 1e-9);
    }

    #[test]
    fn test_double_entry_is_noop() {
        let mut portfolio = Portfolio::new(10_000.0);
        assert!(portfolio.open("AAA", day(1), 100.0, 5_000.0));
        let cash = portfolio.cash;
        assert!(!portfolio.open("AAA", day(2), 90.0, 5_000.0));
        assert_eq!(portfolio.cash, cash);
        assert_eq!(portfolio.positions().len(), 1);
    }

    #[test]
    fn test_budget_capped_by_cash() {
        let mut portfolio = Portfolio::with_cost_model(1_000.0, CostModel::zero());
        assert!(portfolio.open("AAA", day(1), 10.0, 5_000.0));
        assert_eq!(portfolio.cash, 0.0);
        assert!(!portfolio.open("BBB", day(1), 10.0, 5_000.0));
    }

    #[test]
    fn test_round_trip_with_exit_fee() {
        let mut portfolio = Portfolio::with_cost_model(10_000.0, CostModel::new(0.01, FeeSchedule::EntryAndExit));
        portfolio.open("AAA", day(1), 100.0, 10_000.0);
        let trip = portfolio.close("AAA", day(5), 110.0).unwrap();

        // 99 units bought, sold for 10_890 less a 108.9 fee.
        assert!((trip.quantity - 99.0).abs() < 1e-9);
        assert!((trip.fees - 208.9).abs() < 1e-9);
        assert!((trip.net_pnl - 781.1).abs() < 1e-9);
        assert!((portfolio.cash - 10_781.1).abs() < 1e-9);
        assert!(!portfolio.has_position("AAA"));
    }

    #[test]
    fn test_entry_only_round_trip_at_flat_price() {
        let mut portfolio = Portfolio::with_cost_model(10_000.0, CostModel::new(0.002, FeeSchedule::EntryOnly));
        portfolio.open("AAA", day(1), 50.0, 10_000.0);
        portfolio.close("AAA", day(9), 50.0);
        assert!((portfolio.cash - 10_000.0 * (1.0 - 0.002)).abs() < 1e-9);
    }

    #[test]
    fn test_exit_without_position_is_noop() {
        let mut portfolio = Portfolio::new(10_000.0);
        assert!(portfolio.close("AAA", day(1), 100.0).is_none());
        assert_eq!(portfolio.cash, 10_000.0);
        assert!(portfolio.round_trips().is_empty());
    }

    #[test]
    fn test_record_equity_tracks_exposure_and_fees() {
        let mut portfolio = Portfolio::with_cost_model(10_000.0, CostModel::new(0.01, FeeSchedule::EntryAndExit));
        portfolio.open("AAA", day(1), 100.0, 5_000.0);
        let point = portfolio.record_equity(day(1), &prices(100.0), 0.0).clone();
        assert!((point.fees - 50.0).abs() < 1e-9);
        assert!((point.exposure - 4_950.0 / 9_950.0).abs() < 1e-12);

        let point = portfolio.record_equity(day(2), &prices(90.0), -495.0).clone();
        assert_eq!(point.fees, 0.0);
        assert!((point.equity - 9_455.0).abs() < 1e-9);
        assert!(point.drawdown_pct > 0.0);
    }
}
