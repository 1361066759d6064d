//! Critical-time estimation with the log-periodic power-law (LPPL) model.
//!
//! The model is
//!
//! ```text
//! ln p(t) = A + B·dt^m + C1·dt^m·cos(ω·ln dt) + C2·dt^m·sin(ω·ln dt),   dt = |tc − t|
//! ```
//!
//! For fixed nonlinear parameters `(tc, m, ω)` the linear ones
//! `(A, B, C1, C2)` are solved exactly by least squares, so the search runs
//! over three dimensions only. Each search is a Nelder–Mead simplex started
//! from a random seed; a single fit is notoriously sensitive to that seed,
//! so [`CriticalTimeEstimator`] repeats the fit with independent seeds and
//! reports the median critical time.
//!
//! # Example
//!
//! ```ignore
//! use bubblescope::lppl::{CriticalTimeEstimator, LpplConfig};
//!
//! let estimator = CriticalTimeEstimator::new(LpplConfig::default());
//! let estimate = estimator.estimate(&ordinals, &log_prices)?;
//! println!("{:.1} days to critical time", estimate.days_to_critical);
//! ```

use crate::error::{BubbleError, Result};
use crate::types::{Skip, SkipReason, Stage, StageResult};
use nalgebra::{DMatrix, DVector, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Minimum number of observations for a fit.
pub const MIN_POINTS: usize = 10;

const INITIAL_STEP: f64 = 0.05;
const DT_FLOOR: f64 = 1e-8;
const SEED_M: (f64, f64) = (0.1, 0.9);
const SEED_OMEGA: (f64, f64) = (2.0, 15.0);
/// Fraction of the tc range next to either bound where a fit counts as pinned.
const TC_EDGE: f64 = 1e-3;

/// Configuration for LPPL fitting and aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LpplConfig {
    /// Independent fit attempts aggregated by the median.
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    /// Random restarts one attempt may use before giving up.
    #[serde(default = "default_max_searches")]
    pub max_searches: usize,
    /// Simplex iterations per search.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Base seed; attempt seeds derive from it and the window's last date.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// How far before the last observation tc may lie, as a fraction of the window span.
    #[serde(default = "default_tc_lead")]
    pub tc_lead: f64,
    /// How far past the last observation tc may lie, as a fraction of the window span.
    #[serde(default = "default_tc_horizon")]
    pub tc_horizon: f64,
    #[serde(default = "default_m_bounds")]
    pub m_bounds: (f64, f64),
    #[serde(default = "default_omega_bounds")]
    pub omega_bounds: (f64, f64),
    /// Relative tolerance on the simplex objective spread.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Run attempts on the rayon pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_attempts() -> usize {
    7
}
fn default_max_searches() -> usize {
    25
}
fn default_max_iterations() -> usize {
    1000
}
fn default_seed() -> u64 {
    42
}
fn default_tc_lead() -> f64 {
    0.2
}
fn default_tc_horizon() -> f64 {
    1.0
}
fn default_m_bounds() -> (f64, f64) {
    (0.01, 0.99)
}
fn default_omega_bounds() -> (f64, f64) {
    (1.0, 50.0)
}
fn default_tolerance() -> f64 {
    1e-8
}
fn default_parallel() -> bool {
    true
}

impl Default for LpplConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            max_searches: default_max_searches(),
            max_iterations: default_max_iterations(),
            seed: default_seed(),
            tc_lead: default_tc_lead(),
            tc_horizon: default_tc_horizon(),
            m_bounds: default_m_bounds(),
            omega_bounds: default_omega_bounds(),
            tolerance: default_tolerance(),
            parallel: default_parallel(),
        }
    }
}

impl LpplConfig {
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_max_searches(mut self, max_searches: usize) -> Self {
        self.max_searches = max_searches;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(BubbleError::ConfigError(
                "critical_time.attempts must be at least 1".to_string(),
            ));
        }
        if self.max_searches == 0 || self.max_iterations == 0 {
            return Err(BubbleError::ConfigError(
                "critical_time search budgets must be positive".to_string(),
            ));
        }
        if !(self.tc_lead >= 0.0 && self.tc_horizon > 0.0) {
            return Err(BubbleError::ConfigError(
                "critical_time tc range must extend past the last observation".to_string(),
            ));
        }
        let (m_lo, m_hi) = self.m_bounds;
        if !(0.0 < m_lo && m_lo < m_hi && m_hi <= 1.0) {
            return Err(BubbleError::ConfigError(format!(
                "critical_time.m_bounds must satisfy 0 < lo < hi <= 1, got ({}, {})",
                m_lo, m_hi
            )));
        }
        let (w_lo, w_hi) = self.omega_bounds;
        if !(0.0 < w_lo && w_lo < w_hi) {
            return Err(BubbleError::ConfigError(format!(
                "critical_time.omega_bounds must satisfy 0 < lo < hi, got ({}, {})",
                w_lo, w_hi
            )));
        }
        Ok(())
    }
}

/// A fully parameterized LPPL curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LpplModel {
    pub tc: f64,
    pub m: f64,
    pub omega: f64,
    pub a: f64,
    pub b: f64,
    pub c1: f64,
    pub c2: f64,
}

impl LpplModel {
    pub fn evaluate(&self, t: f64) -> f64 {
        let [f, g, h] = basis(t, self.tc, self.m, self.omega);
        self.a + self.b * f + self.c1 * g + self.c2 * h
    }

    /// Solve the linear parameters for fixed `(tc, m, ω)`.
    ///
    /// Returns the model and its sum of squared residuals, or `None` when
    /// the least-squares problem has no finite solution.
    pub fn solve_linear(t: &[f64], y: &[f64], tc: f64, m: f64, omega: f64) -> Option<(Self, f64)> {
        if t.len() != y.len() || t.len() < 4 {
            return None;
        }
        let mut design = DMatrix::<f64>::zeros(t.len(), 4);
        for (i, ti) in t.iter().enumerate() {
            let [f, g, h] = basis(*ti, tc, m, omega);
            design[(i, 0)] = 1.0;
            design[(i, 1)] = f;
            design[(i, 2)] = g;
            design[(i, 3)] = h;
        }
        let rhs = DVector::from_column_slice(y);
        let coef = design.clone().svd(true, true).solve(&rhs, 1e-12).ok()?;
        if coef.iter().any(|c| !c.is_finite()) {
            return None;
        }
        let sse = (&design * &coef - &rhs).norm_squared();
        if !sse.is_finite() {
            return None;
        }
        let model = Self {
            tc,
            m,
            omega,
            a: coef[0],
            b: coef[1],
            c1: coef[2],
            c2: coef[3],
        };
        Some((model, sse))
    }
}

fn basis(t: f64, tc: f64, m: f64, omega: f64) -> [f64; 3] {
    let dt = (tc - t).abs().max(DT_FLOOR);
    let f = dt.powf(m);
    let phase = omega * dt.ln();
    [f, f * phase.cos(), f * phase.sin()]
}

/// Box constraints of the nonlinear search `(tc, m, ω)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchBounds {
    pub lower: Vector3<f64>,
    pub upper: Vector3<f64>,
}

impl SearchBounds {
    pub fn for_window(t_first: f64, t_last: f64, config: &LpplConfig) -> Self {
        let span = (t_last - t_first).max(1.0);
        Self {
            lower: Vector3::new(
                t_last - config.tc_lead * span,
                config.m_bounds.0,
                config.omega_bounds.0,
            ),
            upper: Vector3::new(
                t_last + config.tc_horizon * span,
                config.m_bounds.1,
                config.omega_bounds.1,
            ),
        }
    }

    /// Whether `tc` sits on, or within `TC_EDGE` of, either end of its range.
    pub fn on_tc_edge(&self, tc: f64) -> bool {
        let u = (tc - self.lower[0]) / self.width()[0];
        u <= TC_EDGE || u >= 1.0 - TC_EDGE
    }

    fn width(&self) -> Vector3<f64> {
        (self.upper - self.lower).map(|w| w.max(1e-12))
    }

    fn to_unit(&self, x: &Vector3<f64>) -> Vector3<f64> {
        (x - self.lower).component_div(&self.width())
    }

    fn from_unit(&self, u: &Vector3<f64>) -> Vector3<f64> {
        self.lower + u.component_mul(&self.width())
    }
}

/// Result of one converged LPPL search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LpplFit {
    pub model: LpplModel,
    pub sse: f64,
    pub iterations: usize,
}

/// Single LPPL fits by seeded Nelder–Mead search.
#[derive(Debug, Clone, Default)]
pub struct LpplFitter {
    config: LpplConfig,
}

impl LpplFitter {
    pub fn new(config: LpplConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LpplConfig {
        &self.config
    }

    /// Fit once, drawing up to `max_searches` random seeds until a search
    /// converges.
    pub fn fit_once<R: Rng>(&self, t: &[f64], y: &[f64], rng: &mut R) -> StageResult<LpplFit> {
        check_inputs(t, y)?;
        let (t_first, t_last) = (t[0], t[t.len() - 1]);
        let bounds = SearchBounds::for_window(t_first, t_last, &self.config);
        let span = (t_last - t_first).max(1.0);

        for search in 0..self.config.max_searches.max(1) {
            let tc = lerp(
                t_last - self.config.tc_lead * span,
                t_last + self.config.tc_lead.min(self.config.tc_horizon) * span,
                rng.gen::<f64>(),
            );
            let m = lerp(SEED_M.0, SEED_M.1, rng.gen::<f64>());
            let omega = lerp(SEED_OMEGA.0, SEED_OMEGA.1, rng.gen::<f64>());
            let start = bounds.to_unit(&Vector3::new(tc, m, omega));

            if let Some(fit) = self.search(t, y, &bounds, start) {
                return Ok(fit);
            }
            trace!("LPPL search {} did not converge", search + 1);
        }
        Err(Skip::new(Stage::CriticalTime, SkipReason::NonConvergence))
    }

    /// Run a single search from a given `(tc, m, ω)` start.
    pub fn refine(&self, t: &[f64], y: &[f64], start: [f64; 3]) -> StageResult<LpplFit> {
        check_inputs(t, y)?;
        let bounds = SearchBounds::for_window(t[0], t[t.len() - 1], &self.config);
        let unit = bounds.to_unit(&Vector3::from(start));
        self.search(t, y, &bounds, unit)
            .ok_or_else(|| Skip::new(Stage::CriticalTime, SkipReason::NonConvergence))
    }

    fn search(&self, t: &[f64], y: &[f64], bounds: &SearchBounds, start: Vector3<f64>) -> Option<LpplFit> {
        let objective = |u: &Vector3<f64>| -> f64 {
            if u.iter().any(|v| !(0.0..=1.0).contains(v)) {
                return f64::INFINITY;
            }
            let x = bounds.from_unit(u);
            LpplModel::solve_linear(t, y, x[0], x[1], x[2]).map_or(f64::INFINITY, |(_, sse)| sse)
        };

        let start = start.map(|v| v.clamp(0.0, 1.0));
        let outcome = nelder_mead(
            objective,
            start,
            self.config.max_iterations,
            self.config.tolerance,
        );
        if !outcome.converged || !outcome.value.is_finite() {
            return None;
        }
        let x = bounds.from_unit(&outcome.point);
        if bounds.on_tc_edge(x[0]) {
            trace!("LPPL search pinned to the tc bound at {:.3}", x[0]);
            return None;
        }
        let (model, sse) = LpplModel::solve_linear(t, y, x[0], x[1], x[2])?;
        Some(LpplFit {
            model,
            sse,
            iterations: outcome.iterations,
        })
    }
}

fn check_inputs(t: &[f64], y: &[f64]) -> StageResult<()> {
    if t.len() != y.len() {
        return Err(Skip::new(
            Stage::CriticalTime,
            SkipReason::MissingData(format!("{} times for {} values", t.len(), y.len())),
        ));
    }
    if t.len() < MIN_POINTS {
        return Err(Skip::new(
            Stage::CriticalTime,
            SkipReason::WindowTooShort {
                len: t.len(),
                width: MIN_POINTS,
            },
        ));
    }
    if t.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(Skip::new(Stage::CriticalTime, SkipReason::NonPositiveInput));
    }
    Ok(())
}

fn lerp(lo: f64, hi: f64, u: f64) -> f64 {
    lo + (hi - lo) * u
}

struct SimplexOutcome {
    point: Vector3<f64>,
    value: f64,
    iterations: usize,
    converged: bool,
}

/// Nelder–Mead minimization on the unit cube.
fn nelder_mead<F>(f: F, start: Vector3<f64>, max_iterations: usize, tolerance: f64) -> SimplexOutcome
where
    F: Fn(&Vector3<f64>) -> f64,
{
    const REFLECT: f64 = 1.0;
    const EXPAND: f64 = 2.0;
    const CONTRACT: f64 = 0.5;
    const SHRINK: f64 = 0.5;
    const XATOL: f64 = 1e-6;
    const FATOL: f64 = 1e-12;

    let eval = |p: &Vector3<f64>| {
        let v = f(p);
        if v.is_nan() {
            f64::INFINITY
        } else {
            v
        }
    };

    let mut simplex: Vec<(Vector3<f64>, f64)> = Vec::with_capacity(4);
    simplex.push((start, eval(&start)));
    for i in 0..3 {
        let mut p = start;
        p[i] = if p[i] + INITIAL_STEP <= 1.0 {
            p[i] + INITIAL_STEP
        } else {
            p[i] - INITIAL_STEP
        };
        simplex.push((p, eval(&p)));
    }

    let mut iterations = 0;
    let mut converged = false;
    loop {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let (best_point, best) = simplex[0];

        let f_spread = simplex[1..]
            .iter()
            .map(|(_, v)| (v - best).abs())
            .fold(0.0, f64::max);
        let x_spread = simplex[1..]
            .iter()
            .map(|(p, _)| (p - best_point).amax())
            .fold(0.0, f64::max);
        if f_spread <= FATOL + tolerance * best.abs() && x_spread <= XATOL {
            converged = best.is_finite();
            break;
        }
        if iterations >= max_iterations {
            break;
        }
        iterations += 1;

        let centroid = (simplex[0].0 + simplex[1].0 + simplex[2].0) / 3.0;
        let (worst_point, worst) = simplex[3];

        let reflected = centroid + REFLECT * (centroid - worst_point);
        let fr = eval(&reflected);

        if fr < best {
            let expanded = centroid + EXPAND * (reflected - centroid);
            let fe = eval(&expanded);
            simplex[3] = if fe < fr { (expanded, fe) } else { (reflected, fr) };
        } else if fr < simplex[2].1 {
            simplex[3] = (reflected, fr);
        } else {
            let contracted = if fr < worst {
                centroid + CONTRACT * (reflected - centroid)
            } else {
                centroid + CONTRACT * (worst_point - centroid)
            };
            let fc = eval(&contracted);
            if fc < fr.min(worst) {
                simplex[3] = (contracted, fc);
            } else {
                for vertex in simplex.iter_mut().skip(1) {
                    let p = best_point + SHRINK * (vertex.0 - best_point);
                    *vertex = (p, eval(&p));
                }
            }
        }
    }

    SimplexOutcome {
        point: simplex[0].0,
        value: simplex[0].1,
        iterations,
        converged,
    }
}

/// Median of a set of values, independent of their order.
///
/// Even counts average the two middle values. Returns `None` for an empty
/// set.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Aggregate per-attempt critical times.
///
/// Only converged attempts contribute; fewer than a strict majority makes
/// the estimate unreliable.
pub fn aggregate(outcomes: &[Option<f64>]) -> StageResult<f64> {
    let converged: Vec<f64> = outcomes.iter().flatten().copied().collect();
    if converged.is_empty() {
        return Err(Skip::new(Stage::CriticalTime, SkipReason::NonConvergence));
    }
    if converged.len() * 2 <= outcomes.len() {
        return Err(Skip::new(
            Stage::CriticalTime,
            SkipReason::Unreliable {
                converged: converged.len(),
                attempts: outcomes.len(),
            },
        ));
    }
    median(&converged).ok_or_else(|| Skip::new(Stage::CriticalTime, SkipReason::NonConvergence))
}

/// Median-of-N critical time for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalTimeEstimate {
    /// Days from the window's last observation to the median critical
    /// time. Non-positive means the critical time has already passed.
    pub days_to_critical: f64,
    /// Median critical time as a (fractional) ordinal day.
    pub critical_ordinal: f64,
    pub converged: usize,
    pub attempts: usize,
    /// Days to critical time of every converged attempt, in attempt order.
    pub attempt_days: Vec<f64>,
}

/// Anything that can estimate the distance to a critical time.
pub trait CriticalTimeModel: Send + Sync {
    /// Estimate from ordinal days and matching log prices.
    fn estimate(&self, ordinals: &[i64], log_prices: &[f64]) -> StageResult<CriticalTimeEstimate>;
}

/// Repeats LPPL fits with independent seeds and takes the median.
#[derive(Debug, Clone, Default)]
pub struct CriticalTimeEstimator {
    fitter: LpplFitter,
}

impl CriticalTimeEstimator {
    pub fn new(config: LpplConfig) -> Self {
        Self {
            fitter: LpplFitter::new(config),
        }
    }

    pub fn config(&self) -> &LpplConfig {
        self.fitter.config()
    }

    fn run_attempt(&self, t: &[f64], y: &[f64], anchor: i64, index: usize) -> Option<f64> {
        let mut rng = StdRng::seed_from_u64(attempt_seed(self.config().seed, anchor, index));
        match self.fitter.fit_once(t, y, &mut rng) {
            Ok(fit) => Some(fit.model.tc),
            Err(skip) => {
                trace!("LPPL attempt {} failed: {}", index, skip);
                None
            }
        }
    }
}

impl CriticalTimeModel for CriticalTimeEstimator {
    fn estimate(&self, ordinals: &[i64], log_prices: &[f64]) -> StageResult<CriticalTimeEstimate> {
        let (Some(&first), Some(&last)) = (ordinals.first(), ordinals.last()) else {
            return Err(Skip::new(
                Stage::CriticalTime,
                SkipReason::WindowTooShort {
                    len: 0,
                    width: MIN_POINTS,
                },
            ));
        };
        let t: Vec<f64> = ordinals.iter().map(|o| (o - first) as f64).collect();
        check_inputs(&t, log_prices)?;

        let attempts = self.config().attempts.max(1);
        let outcomes: Vec<Option<f64>> = if self.config().parallel {
            (0..attempts)
                .into_par_iter()
                .map(|i| self.run_attempt(&t, log_prices, last, i))
                .collect()
        } else {
            (0..attempts)
                .map(|i| self.run_attempt(&t, log_prices, last, i))
                .collect()
        };

        let t_last = (last - first) as f64;
        let median_tc = match aggregate(&outcomes) {
            Ok(tc) => tc,
            Err(skip) => {
                debug!("Critical time unavailable at ordinal {}: {}", last, skip);
                return Err(skip);
            }
        };
        let attempt_days: Vec<f64> = outcomes.iter().flatten().map(|tc| tc - t_last).collect();

        Ok(CriticalTimeEstimate {
            days_to_critical: median_tc - t_last,
            critical_ordinal: first as f64 + median_tc,
            converged: attempt_days.len(),
            attempts,
            attempt_days,
        })
    }
}

/// Seed for one attempt, independent of scheduling order.
fn attempt_seed(base: u64, anchor: i64, index: usize) -> u64 {
    let mut z = base
        ^ (anchor as u64).rotate_left(32)
        ^ (index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
