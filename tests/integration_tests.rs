//! Integration tests for the signal pipeline and the simulator.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::NaiveDate;
use tempfile::NamedTempFile;

use bubblescope::analytics::PerformanceReport;
use bubblescope::data::{analysis_indices, daily_dates, load_table_csv, SeriesTable};
use bubblescope::lppl::{CriticalTimeEstimate, CriticalTimeModel, LpplConfig};
use bubblescope::normalize::{NormalizerConfig, ZeroVariancePolicy};
use bubblescope::policy::{PolicyConfig, PolicyInput, ReEntryConfig, SignalPolicy};
use bubblescope::portfolio::{Allocation, FeeSchedule};
use bubblescope::signals::{EngineConfig, SignalEngine, SignalInputs};
use bubblescope::simulator::{PortfolioSimulator, SimulationConfig};
use bubblescope::types::{
    EventKind, EventReason, NormalizedSignal, SignalEvent, Skip, SkipReason, Stage, StageResult,
};
use bubblescope::BubbleFileConfig;

const DAYS: usize = 250;

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 3).unwrap()
}

/// Smooth super-exponential rise, then a 20% decline over the last 10 days.
fn rising_then_falling() -> Vec<f64> {
    let mut prices: Vec<f64> = (0..DAYS - 10)
        .map(|i| (100.0_f64.ln() + 0.25 * ((0.012 * i as f64).exp() - 1.0)).exp())
        .collect();
    let peak = prices[DAYS - 11];
    prices.extend((1..=10).map(|k| peak * (1.0 - 0.02 * k as f64)));
    prices
}

fn two_instrument_table() -> SeriesTable {
    SeriesTable::from_columns(
        daily_dates(start(), DAYS),
        [("FLAT", vec![100.0; DAYS]), ("RISE", rising_then_falling())],
    )
    .unwrap()
}

fn scenario_engine() -> SignalEngine {
    let critical_time = LpplConfig {
        max_iterations: 300,
        ..LpplConfig::default().with_attempts(3).with_max_searches(3)
    };
    let policy = PolicyConfig::default()
        .with_threshold(60.0)
        .with_reentry(ReEntryConfig {
            days_after_exit: 300,
            ..ReEntryConfig::default()
        });
    SignalEngine::new(
        EngineConfig::default()
            .with_window(60, 30)
            .with_policy(policy)
            .with_critical_time(critical_time),
    )
}

fn count(events: &[SignalEvent], kind: EventKind) -> usize {
    events
        .iter()
        .filter(|e| e.is_policy_driven() && e.kind == kind)
        .count()
}

/// A critical-time model that always answers with the same distance.
struct FixedDistance(f64);

impl CriticalTimeModel for FixedDistance {
    fn estimate(&self, _ordinals: &[i64], _log_prices: &[f64]) -> StageResult<CriticalTimeEstimate> {
        Ok(CriticalTimeEstimate {
            days_to_critical: self.0,
            critical_ordinal: self.0,
            converged: 1,
            attempts: 1,
            attempt_days: vec![self.0],
        })
    }
}

struct Unavailable;

impl CriticalTimeModel for Unavailable {
    fn estimate(&self, _ordinals: &[i64], _log_prices: &[f64]) -> StageResult<CriticalTimeEstimate> {
        Err(Skip::new(Stage::CriticalTime, SkipReason::NonConvergence))
    }
}

#[test]
fn test_end_to_end_rise_and_flat_control() {
    let prices = two_instrument_table();
    let report = scenario_engine().run(&SignalInputs::new(&prices)).unwrap();

    assert!(report.failures.is_empty());
    assert_eq!(report.analysis_indices, analysis_indices(DAYS, 60, 30));

    let rise = report.events_for("RISE");
    assert!(count(rise, EventKind::Exit) <= 1);
    assert!(count(rise, EventKind::Enter) <= count(rise, EventKind::Exit));

    // A steady rise gives no reason to sell early: any exit belongs to the
    // late rise or the decline, never to the first analysis dates.
    let dates = prices.dates();
    for event in rise.iter().filter(|e| e.is_policy_driven() && e.kind == EventKind::Exit) {
        assert!(event.date >= dates[179], "early exit on {}", event.date);
    }
    // No accepted attempt sits on the far end of the tc range (59 days).
    for (date, estimate) in &report.runs["RISE"].estimates {
        for days in &estimate.attempt_days {
            assert!(*days < 58.9, "{}: attempt pinned at {:.3} days", date, days);
        }
    }

    let flat = report.events_for("FLAT");
    assert_eq!(count(flat, EventKind::Exit), 0);
    assert_eq!(count(flat, EventKind::Enter), 0);

    // Bookends: initial entry and forced horizon exit for both instruments.
    let last = prices.last_date().unwrap();
    for name in ["FLAT", "RISE"] {
        let events = report.events_for(name);
        assert_eq!(events.first().map(|e| e.reason), Some(EventReason::Initial));
        let horizon = events.last().unwrap();
        assert_eq!(horizon.kind, EventKind::Exit);
        assert_eq!(horizon.reason, EventReason::Horizon);
        assert_eq!(horizon.date, last);

        let series = report.event_series(name).unwrap();
        assert_eq!(series.len(), DAYS);
        assert_eq!(series[DAYS - 1], Some(EventKind::Exit));
    }

    // The flat control alone, entry fee only: one round trip costs one fee.
    let flat_prices = prices.subset(&["FLAT"]).unwrap();
    let config = SimulationConfig::default()
        .with_capital(100_000.0)
        .with_fees(0.001, FeeSchedule::EntryOnly)
        .with_allocation(Allocation::AllCash);
    let result = PortfolioSimulator::new(config)
        .run(&flat_prices, flat)
        .unwrap();
    assert_eq!(result.round_trips.len(), 1);
    assert!((result.final_equity - 100_000.0 * (1.0 - 0.001)).abs() < 1e-6);

    // Both instruments together end fully liquidated.
    let result = PortfolioSimulator::new(SimulationConfig::default())
        .run(&prices, &report.events())
        .unwrap();
    assert!(result.open_positions.is_empty());
    assert!(result.equity_curve.iter().all(|p| p.cash >= 0.0));
    let performance = PerformanceReport::from_simulation(&result).with_benchmark(&prices, &result);
    assert_eq!(performance.trade_count, result.round_trips.len());
    assert!(performance.benchmark.is_some());
    assert!(performance.max_drawdown_pct >= 0.0);
}

#[test]
fn test_recovery_reentry_fires_before_timer() {
    let dates = daily_dates(start(), 200);
    let mut prices = vec![100.0; 200];
    for (offset, price) in [97.6, 95.2, 92.8, 90.4, 88.0].iter().enumerate() {
        prices[101 + offset] = *price;
    }
    for price in prices.iter_mut().take(110).skip(106) {
        *price = 88.0;
    }
    prices[110] = 89.0;
    prices[111] = 90.0;
    for price in prices.iter_mut().skip(112) {
        *price = 91.0;
    }

    let exit_date = dates[100];
    let mut signals = BTreeMap::new();
    signals.insert(
        exit_date,
        NormalizedSignal {
            instrument: "AAA".to_string(),
            date: exit_date,
            z_growth: 2.0,
            z_quality: 2.0,
            z_auxiliary: None,
        },
    );
    let reentry = ReEntryConfig {
        days_after_exit: 30,
        drawdown_fraction: 0.10,
        recovery_days: 3,
        ..ReEntryConfig::default()
    };
    let policy = SignalPolicy::new(PolicyConfig::default().with_reentry(reentry));
    let input = PolicyInput {
        instrument: "AAA",
        dates: &dates,
        prices: &prices,
        analysis_indices: &[100],
        signals: &signals,
        window: 60,
        valuation: None,
        macro_indicator: None,
    };
    let run = policy.run(&input, &FixedDistance(5.0)).unwrap();

    let policy_events: Vec<&SignalEvent> = run.policy_events().collect();
    assert_eq!(policy_events.len(), 2);
    assert_eq!(policy_events[0].kind, EventKind::Exit);
    assert_eq!(policy_events[0].date, exit_date);
    assert_eq!(policy_events[1].kind, EventKind::Enter);
    assert_eq!(policy_events[1].date, dates[112]);
    assert_eq!(policy_events[1].reason, EventReason::ReEntryRecovery);

    // The simulator follows: out of the market between day 100 and day 112.
    let table = SeriesTable::from_columns(dates.clone(), [("AAA", prices.clone())]).unwrap();
    let result = PortfolioSimulator::new(SimulationConfig::default().with_allocation(Allocation::AllCash))
        .run(&table, &run.events)
        .unwrap();
    assert_eq!(result.round_trips.len(), 2);
    assert_eq!(result.equity_curve[105].exposure, 0.0);
    assert!(result.equity_curve[112].exposure > 0.99);
}

#[test]
fn test_degenerate_cross_section() {
    let dates = daily_dates(start(), 120);
    let rising = rising_then_falling();
    let series = &rising[..120];
    let prices = SeriesTable::from_columns(
        dates,
        ["AAA", "BBB", "CCC"].map(|name| (name, series.to_vec())),
    )
    .unwrap();

    let engine = SignalEngine::new(EngineConfig::default().with_window(40, 20))
        .with_model(Box::new(FixedDistance(1.0)));
    let report = engine.run(&SignalInputs::new(&prices)).unwrap();

    assert!(!report.panel.is_empty());
    for date in report.panel.dates() {
        for signal in report.panel.on(date).unwrap() {
            assert_eq!(signal.z_growth, 0.0);
            assert_eq!(signal.z_quality, 0.0);
        }
    }
    // A neutral score of 50 never crosses the threshold.
    for name in ["AAA", "BBB", "CCC"] {
        assert_eq!(report.events_for(name).iter().filter(|e| e.is_policy_driven()).count(), 0);
    }

    let mut config = EngineConfig::default().with_window(40, 20);
    config.normalizer = NormalizerConfig {
        zero_variance: ZeroVariancePolicy::Skip,
    };
    let report = SignalEngine::new(config)
        .with_model(Box::new(FixedDistance(1.0)))
        .run(&SignalInputs::new(&prices))
        .unwrap();
    assert!(report.panel.is_empty());
    assert!(report
        .skips
        .iter()
        .any(|r| matches!(r.skip.reason, SkipReason::ZeroVariance)));
}

#[test]
fn test_forced_exit_closes_everything() {
    let prices = two_instrument_table();
    let engine = scenario_engine().with_model(Box::new(Unavailable));
    let report = engine.run(&SignalInputs::new(&prices)).unwrap();

    for name in ["FLAT", "RISE"] {
        let events = report.events_for(name);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].reason, EventReason::Horizon);
    }

    let result = PortfolioSimulator::new(SimulationConfig::default())
        .run(&prices, &report.events())
        .unwrap();
    assert!(result.open_positions.is_empty());
    let last = result.equity_curve.last().unwrap();
    assert_eq!(last.positions_value, 0.0);
    assert!((last.equity - last.cash).abs() < 1e-9);
}

#[test]
fn test_pipeline_from_files() {
    let mut csv = NamedTempFile::new().unwrap();
    writeln!(csv, "date,AAA,BBB,CCC").unwrap();
    for (i, date) in daily_dates(start(), 90).iter().enumerate() {
        let x = i as f64;
        writeln!(
            csv,
            "{},{:.4},{:.4},{:.4}",
            date.format("%Y-%m-%d"),
            100.0 * (0.01 * x).exp(),
            100.0 + 3.0 * (x / 5.0).sin(),
            100.0 * (-0.002 * x).exp()
        )
        .unwrap();
    }
    csv.flush().unwrap();

    let mut toml = NamedTempFile::new().unwrap();
    write!(
        toml,
        "[signal]\nmodel_window = 40\nstride = 15\n\n[simulation]\nfee_rate = 0.002\n"
    )
    .unwrap();
    toml.flush().unwrap();

    let file_config = BubbleFileConfig::load(toml.path()).unwrap();
    let prices = load_table_csv(csv.path(), &file_config.table_config().unwrap()).unwrap();
    assert_eq!(prices.num_instruments(), 3);

    let engine = SignalEngine::new(file_config.to_engine_config().unwrap())
        .with_model(Box::new(Unavailable));
    let report = engine.run(&SignalInputs::new(&prices)).unwrap();
    assert_eq!(report.analysis_indices, analysis_indices(90, 40, 15));
    assert!(!report.fits.is_empty());

    let simulation = file_config.to_simulation_config().unwrap();
    let result = PortfolioSimulator::new(simulation)
        .run(&prices, &report.events())
        .unwrap();
    assert!(result.total_fees > 0.0);
    assert_eq!(result.equity_curve.len(), 90);
}
