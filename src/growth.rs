//! Exponential growth-curve fitting.
//!
//! Each analysis window is smoothed with a short trailing moving average,
//! shifted by one and log-transformed, then fitted with
//! `y = a·exp(b·x) + c` by Levenberg–Marquardt, where `x` is the sample
//! index inside the smoothed window. The growth exponent `b` and the
//! log-space `r²` feed the cross-sectional normalizer.

use crate::data::rolling_mean;
use crate::types::{FitResult, Skip, SkipReason, Stage, StageResult};
use chrono::NaiveDate;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Configuration for the growth-curve fitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthConfig {
    /// Width of the trailing moving average applied before fitting.
    pub smoothing_width: usize,
    /// Maximum Levenberg–Marquardt iterations.
    pub max_iterations: usize,
    /// Relative tolerance on parameter steps and cost reduction.
    pub tolerance: f64,
    /// Starting point `(a, b, c)`.
    pub initial: [f64; 3],
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            smoothing_width: 5,
            max_iterations: 400,
            tolerance: 1e-10,
            initial: [1.0, 0.01, 1.0],
        }
    }
}

/// Parameters and quality of a growth-curve fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    /// Coefficient of determination against the log-space curve.
    pub r_squared: f64,
    pub iterations: usize,
}

impl GrowthFit {
    pub fn predict(&self, x: f64) -> f64 {
        self.a * (self.b * x).exp() + self.c
    }
}

/// Fits the three-parameter exponential to price windows.
#[derive(Debug, Clone, Default)]
pub struct GrowthCurveFitter {
    config: GrowthConfig,
}

impl GrowthCurveFitter {
    pub fn new(config: GrowthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GrowthConfig {
        &self.config
    }

    /// Fit a raw (unsmoothed) price window.
    pub fn fit(&self, window: &[f64]) -> StageResult<GrowthFit> {
        let width = self.config.smoothing_width.max(1);
        if window.len() <= width {
            return Err(skip(SkipReason::WindowTooShort {
                len: window.len(),
                width,
            }));
        }
        if window.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(skip(SkipReason::NonPositiveInput));
        }

        let y: Vec<f64> = rolling_mean(window, width)
            .into_iter()
            .map(|v| (v + 1.0).ln())
            .collect();
        self.fit_log_series(&y)
    }

    /// Fit a window and tag the result with its instrument and end date.
    pub fn fit_at(
        &self,
        instrument: &str,
        window_end_date: NaiveDate,
        window: &[f64],
    ) -> StageResult<FitResult> {
        let fit = self.fit(window)?;
        Ok(FitResult {
            instrument: instrument.to_string(),
            window_end_date,
            growth_rate: fit.b,
            fit_quality: fit.r_squared,
            auxiliary: None,
        })
    }

    /// Fit an already log-transformed series.
    pub fn fit_log_series(&self, y: &[f64]) -> StageResult<GrowthFit> {
        if y.len() < 3 {
            return Err(skip(SkipReason::WindowTooShort {
                len: y.len(),
                width: 3,
            }));
        }
        let x: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
        let [a, b, c] = self.config.initial;
        let mut params = Vector3::new(a, b, c);

        let mut cost = sum_squares(&x, y, &params).ok_or_else(|| skip(SkipReason::NonFiniteResidual))?;
        let mut lambda = 1e-3;
        let tol = self.config.tolerance;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < self.config.max_iterations {
            iterations += 1;

            let (jtj, jtr) = normal_equations(&x, y, &params);
            if cost <= f64::EPSILON * y.len() as f64 {
                converged = true;
                break;
            }

            let mut accepted = false;
            while lambda < 1e16 {
                let mut damped = jtj;
                for i in 0..3 {
                    damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
                }
                let Some(step) = damped.lu().solve(&jtr) else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate = params + step;
                match sum_squares(&x, y, &candidate) {
                    Some(new_cost) if new_cost < cost => {
                        let step_small = step.norm() <= tol * (params.norm() + tol);
                        let cost_small = cost - new_cost <= tol * cost;
                        params = candidate;
                        cost = new_cost;
                        lambda = (lambda / 10.0).max(1e-12);
                        accepted = true;
                        if step_small || cost_small {
                            converged = true;
                        }
                        break;
                    }
                    _ => lambda *= 10.0,
                }
            }

            if converged {
                break;
            }
            if !accepted {
                // No descent direction left: a stationary point if the
                // gradient vanishes.
                converged = jtr.amax() <= 1e-8 * (1.0 + cost);
                break;
            }
        }

        if !converged {
            return Err(skip(SkipReason::NonConvergence));
        }
        if !params.iter().all(|p| p.is_finite()) {
            return Err(skip(SkipReason::NonFiniteResidual));
        }

        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let ss_tot: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
        // A constant series leaves nothing to explain.
        let r_squared = if ss_tot <= 1e-15 { 0.0 } else { 1.0 - cost / ss_tot };

        Ok(GrowthFit {
            a: params[0],
            b: params[1],
            c: params[2],
            r_squared,
            iterations,
        })
    }
}

fn skip(reason: SkipReason) -> Skip {
    Skip::new(Stage::GrowthFit, reason)
}

fn sum_squares(x: &[f64], y: &[f64], p: &Vector3<f64>) -> Option<f64> {
    let mut total = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let r = yi - (p[0] * (p[1] * xi).exp() + p[2]);
        total += r * r;
    }
    total.is_finite().then_some(total)
}

fn normal_equations(x: &[f64], y: &[f64], p: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let mut jtj = Matrix3::zeros();
    let mut jtr = Vector3::zeros();
    for (xi, yi) in x.iter().zip(y) {
        let e = (p[1] * xi).exp();
        let j = Vector3::new(e, p[0] * xi * e, 1.0);
        let r = yi - (p[0] * e + p[2]);
        jtj += j * j.transpose();
        jtr += j * r;
    }
    (jtj, jtr)
}
