//! Performance analytics for simulated portfolios.

use crate::data::SeriesTable;
use crate::simulator::SimulationResult;
use crate::types::{EquityPoint, RoundTrip};
use serde::{Deserialize, Serialize};

/// Benchmark comparison metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    /// Benchmark name (e.g., "equal-weight").
    pub benchmark_name: String,
    /// Jensen's alpha - annualized excess return above what beta explains.
    pub alpha: f64,
    /// Portfolio beta - sensitivity to benchmark movements.
    pub beta: f64,
    /// Tracking error - annualized standard deviation of excess returns.
    pub tracking_error: f64,
    /// Information ratio - annualized excess return per unit of tracking error.
    pub information_ratio: f64,
    /// Correlation coefficient with benchmark (-1 to 1).
    pub correlation: f64,
    /// Upside capture ratio - percentage of benchmark gains captured.
    pub up_capture: f64,
    /// Downside capture ratio - percentage of benchmark losses captured.
    pub down_capture: f64,
    /// Benchmark total return for the period.
    pub benchmark_return_pct: f64,
    /// Excess return (portfolio return - benchmark return).
    pub excess_return_pct: f64,
}

impl BenchmarkMetrics {
    /// Calculate benchmark comparison metrics from aligned return series.
    ///
    /// # Arguments
    /// * `benchmark_name` - Name of the benchmark
    /// * `portfolio_returns` - Daily portfolio returns (as decimals, e.g., 0.01 for 1%)
    /// * `benchmark_returns` - Daily benchmark returns (as decimals)
    /// * `risk_free_rate` - Annual risk-free rate (as decimal, e.g., 0.05 for 5%)
    /// * `trading_days` - Periods per year
    ///
    /// Both return series must be aligned (same dates, same length).
    pub fn calculate(
        benchmark_name: impl Into<String>,
        portfolio_returns: &[f64],
        benchmark_returns: &[f64],
        risk_free_rate: f64,
        trading_days: f64,
    ) -> Option<Self> {
        if portfolio_returns.is_empty()
            || benchmark_returns.is_empty()
            || portfolio_returns.len() != benchmark_returns.len()
        {
            return None;
        }

        let n = portfolio_returns.len() as f64;
        let port_mean: f64 = portfolio_returns.iter().sum::<f64>() / n;
        let bench_mean: f64 = benchmark_returns.iter().sum::<f64>() / n;

        // Beta: Cov(portfolio, benchmark) / Var(benchmark)
        let covariance: f64 = portfolio_returns
            .iter()
            .zip(benchmark_returns.iter())
            .map(|(p, b)| (p - port_mean) * (b - bench_mean))
            .sum::<f64>()
            / n;
        let bench_variance: f64 = benchmark_returns
            .iter()
            .map(|b| (b - bench_mean).powi(2))
            .sum::<f64>()
            / n;
        let port_variance: f64 = portfolio_returns
            .iter()
            .map(|p| (p - port_mean).powi(2))
            .sum::<f64>()
            / n;

        let beta = if bench_variance > 0.0 {
            covariance / bench_variance
        } else {
            0.0
        };

        let annualized_port_return = (1.0 + port_mean).powf(trading_days) - 1.0;
        let annualized_bench_return = (1.0 + bench_mean).powf(trading_days) - 1.0;
        let alpha = (annualized_port_return - risk_free_rate)
            - beta * (annualized_bench_return - risk_free_rate);

        let port_std = port_variance.sqrt();
        let bench_std = bench_variance.sqrt();
        let correlation = if port_std > 0.0 && bench_std > 0.0 {
            covariance / (port_std * bench_std)
        } else {
            0.0
        };

        let excess_returns: Vec<f64> = portfolio_returns
            .iter()
            .zip(benchmark_returns.iter())
            .map(|(p, b)| p - b)
            .collect();
        let excess_mean: f64 = excess_returns.iter().sum::<f64>() / n;
        let tracking_error_daily: f64 = (excess_returns
            .iter()
            .map(|e| (e - excess_mean).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();
        let tracking_error = tracking_error_daily * trading_days.sqrt() * 100.0;

        let information_ratio = if tracking_error > 0.0 {
            (excess_mean * trading_days * 100.0) / tracking_error
        } else {
            0.0
        };

        let (up_capture, down_capture) =
            Self::calculate_capture_ratios(portfolio_returns, benchmark_returns);

        let portfolio_total_return = compound(portfolio_returns);
        let benchmark_total_return = compound(benchmark_returns);

        Some(Self {
            benchmark_name: benchmark_name.into(),
            alpha: alpha * 100.0,
            beta,
            tracking_error,
            information_ratio,
            correlation,
            up_capture,
            down_capture,
            benchmark_return_pct: benchmark_total_return * 100.0,
            excess_return_pct: (portfolio_total_return - benchmark_total_return) * 100.0,
        })
    }

    /// Calculate upside and downside capture ratios.
    fn calculate_capture_ratios(portfolio_returns: &[f64], benchmark_returns: &[f64]) -> (f64, f64) {
        let capture = |keep: fn(f64) -> bool| {
            let (port, bench) = portfolio_returns
                .iter()
                .zip(benchmark_returns.iter())
                .filter(|(_, b)| keep(**b))
                .fold((0.0, 0.0), |(p_acc, b_acc), (p, b)| (p_acc + p, b_acc + b));
            if bench != 0.0 {
                port / bench * 100.0
            } else {
                100.0
            }
        };
        (capture(|b| b > 0.0), capture(|b| b < 0.0))
    }
}

/// Equal-weight buy-and-hold value of a price table, starting at 1.0.
pub fn equal_weight_benchmark(prices: &SeriesTable) -> Vec<f64> {
    let columns: Vec<&[f64]> = prices
        .instruments()
        .into_iter()
        .filter_map(|name| prices.get(name))
        .filter(|col| col.first().is_some_and(|p| *p > 0.0))
        .collect();
    if columns.is_empty() {
        return Vec::new();
    }
    let weight = 1.0 / columns.len() as f64;
    (0..prices.len())
        .map(|t| columns.iter().map(|col| weight * col[t] / col[0]).sum())
        .collect()
}

/// Simple returns of a value series.
pub fn returns_from_values(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

/// Daily returns of an equity curve, the first measured from the
/// starting capital so first-day fees are included.
pub fn daily_returns(initial_capital: f64, equity_curve: &[EquityPoint]) -> Vec<f64> {
    returns_from_values(&equity_values(initial_capital, equity_curve))
}

fn equity_values(initial_capital: f64, equity_curve: &[EquityPoint]) -> Vec<f64> {
    std::iter::once(initial_capital)
        .chain(equity_curve.iter().map(|p| p.equity))
        .collect()
}

/// Running compounded return after each period.
pub fn cumulative_returns(returns: &[f64]) -> Vec<f64> {
    let mut growth = 1.0;
    returns
        .iter()
        .map(|r| {
            growth *= 1.0 + r;
            growth - 1.0
        })
        .collect()
}

fn compound(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

/// Largest peak-to-trough decline of a value series, in percent.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for v in values {
        peak = peak.max(*v);
        if peak > 0.0 {
            worst = worst.max((peak - v) / peak * 100.0);
        }
    }
    worst
}

/// Annualized Sharpe ratio (population standard deviation).
pub fn sharpe_ratio(returns: &[f64], trading_days: f64, risk_free_rate: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let rf = risk_free_rate / trading_days;
    let excess: Vec<f64> = returns.iter().map(|r| r - rf).collect();
    let mean: f64 = excess.iter().sum::<f64>() / excess.len() as f64;
    let variance: f64 = excess.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / excess.len() as f64;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        return 0.0;
    }

    (mean / std_dev) * trading_days.sqrt()
}

/// Annualized Sortino ratio.
///
/// Infinite when there is no downside and the mean is positive.
pub fn sortino_ratio(returns: &[f64], trading_days: f64, risk_free_rate: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let rf = risk_free_rate / trading_days;
    let excess: Vec<f64> = returns.iter().map(|r| r - rf).collect();
    let mean: f64 = excess.iter().sum::<f64>() / excess.len() as f64;

    let downside: Vec<f64> = excess.iter().filter(|&&r| r < 0.0).copied().collect();
    if downside.is_empty() {
        return if mean > 0.0 { f64::INFINITY } else { 0.0 };
    }

    let downside_variance: f64 = downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64;
    let downside_dev = downside_variance.sqrt();
    if downside_dev == 0.0 {
        return 0.0;
    }

    (mean / downside_dev) * trading_days.sqrt()
}

/// Percentage of round trips with positive net P&L.
pub fn win_rate(trips: &[RoundTrip]) -> f64 {
    if trips.is_empty() {
        return 0.0;
    }
    trips.iter().filter(|t| t.is_win()).count() as f64 / trips.len() as f64 * 100.0
}

/// Gross wins over gross losses.
pub fn profit_factor(trips: &[RoundTrip]) -> f64 {
    let gross_wins: f64 = trips.iter().map(|t| t.net_pnl).filter(|p| *p > 0.0).sum();
    let gross_losses: f64 = trips
        .iter()
        .map(|t| t.net_pnl)
        .filter(|p| *p < 0.0)
        .map(f64::abs)
        .sum();
    if gross_losses > 0.0 {
        gross_wins / gross_losses
    } else if gross_wins > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Each period's return divided by the exposure held over it.
///
/// Entry `t` pairs the return from point `t` to `t + 1` with the exposure
/// at point `t`; periods without exposure are `None`.
pub fn exposure_adjusted_returns(equity_curve: &[EquityPoint]) -> Vec<Option<f64>> {
    equity_curve
        .windows(2)
        .map(|w| {
            let exposure = w[0].exposure;
            if exposure > 0.0 && w[0].equity != 0.0 {
                Some((w[1].equity - w[0].equity) / w[0].equity / exposure)
            } else {
                None
            }
        })
        .collect()
}

/// Named scalar metrics and series of one simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown_pct: f64,
    /// Mean fraction of equity held in positions.
    pub average_exposure: f64,
    /// Closed round trips.
    pub trade_count: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_fees: f64,
    pub ignored_events: usize,
    pub daily_returns: Vec<f64>,
    pub cumulative_returns: Vec<f64>,
    pub exposure: Vec<f64>,
    pub exposure_adjusted_returns: Vec<Option<f64>>,
    #[serde(default)]
    pub benchmark: Option<BenchmarkMetrics>,
}

impl PerformanceReport {
    pub fn from_simulation(result: &SimulationResult) -> Self {
        let curve = &result.equity_curve;
        let config = &result.config;
        let values = equity_values(config.initial_capital, curve);
        let returns = returns_from_values(&values);
        let exposure: Vec<f64> = curve.iter().map(|p| p.exposure).collect();
        let average_exposure = if exposure.is_empty() {
            0.0
        } else {
            exposure.iter().sum::<f64>() / exposure.len() as f64
        };

        Self {
            initial_capital: config.initial_capital,
            final_equity: result.final_equity,
            total_return_pct: result.total_return_pct(),
            sharpe: sharpe_ratio(&returns, config.trading_days, config.risk_free_rate),
            sortino: sortino_ratio(&returns, config.trading_days, config.risk_free_rate),
            max_drawdown_pct: max_drawdown(&values),
            average_exposure,
            trade_count: result.round_trips.len(),
            win_rate: win_rate(&result.round_trips),
            profit_factor: profit_factor(&result.round_trips),
            total_fees: result.total_fees,
            ignored_events: result.ignored_events,
            cumulative_returns: cumulative_returns(&returns),
            daily_returns: returns,
            exposure,
            exposure_adjusted_returns: exposure_adjusted_returns(curve),
            benchmark: None,
        }
    }

    /// Compare against an equal-weight buy-and-hold of `prices`.
    ///
    /// The benchmark is bought at the first close, so its first return is zero.
    pub fn with_benchmark(mut self, prices: &SeriesTable, result: &SimulationResult) -> Self {
        let values: Vec<f64> = std::iter::once(1.0)
            .chain(equal_weight_benchmark(prices))
            .collect();
        let benchmark_returns = returns_from_values(&values);
        self.benchmark = BenchmarkMetrics::calculate(
            "equal-weight",
            &self.daily_returns,
            &benchmark_returns,
            result.config.risk_free_rate,
            result.config.trading_days,
        );
        self
    }
}
