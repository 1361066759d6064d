//! Cross-sectional normalization of fit results.
//!
//! Values are z-scored against every instrument with a valid fit on the
//! same analysis date, never against other dates. Growth rate, fit quality
//! and the optional auxiliary value are normalized independently.

use crate::types::{FitResult, NormalizedSignal, Skip, SkipReason, SkipRecord, Stage, StageResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// What to do when a cross-section has zero variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroVariancePolicy {
    /// Every instrument gets a z-score of 0.
    #[default]
    Zero,
    /// The date is excluded.
    Skip,
}

/// Configuration for the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default)]
    pub zero_variance: ZeroVariancePolicy,
}

/// Z-scores fit results within one analysis date.
#[derive(Debug, Clone, Default)]
pub struct CrossSectionalNormalizer {
    config: NormalizerConfig,
}

impl CrossSectionalNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    /// Normalize the fits that share `date`.
    ///
    /// Fits with non-finite growth or quality are excluded. Fewer than two
    /// remaining fits skip the date.
    pub fn normalize(&self, date: NaiveDate, fits: &[FitResult]) -> StageResult<Vec<NormalizedSignal>> {
        let valid: Vec<&FitResult> = fits
            .iter()
            .filter(|f| {
                f.window_end_date == date && f.growth_rate.is_finite() && f.fit_quality.is_finite()
            })
            .collect();

        if valid.len() < 2 {
            return Err(Skip::new(
                Stage::Normalize,
                SkipReason::InsufficientCrossSection {
                    available: valid.len(),
                },
            ));
        }

        let growth: Vec<f64> = valid.iter().map(|f| f.growth_rate).collect();
        let quality: Vec<f64> = valid.iter().map(|f| f.fit_quality).collect();
        let z_growth = self.zscores_or_policy(&growth)?;
        let z_quality = self.zscores_or_policy(&quality)?;
        let z_aux = self.auxiliary_zscores(&valid);

        Ok(valid
            .iter()
            .enumerate()
            .map(|(i, fit)| NormalizedSignal {
                instrument: fit.instrument.clone(),
                date,
                z_growth: z_growth[i],
                z_quality: z_quality[i],
                z_auxiliary: z_aux.as_ref().and_then(|z| z[i]),
            })
            .collect())
    }

    /// Normalize every analysis date found in `fits`.
    ///
    /// The returned panel is complete before any policy reads it.
    pub fn normalize_panel(&self, fits: &[FitResult]) -> NormalizedPanel {
        let mut by_date: BTreeMap<NaiveDate, Vec<FitResult>> = BTreeMap::new();
        for fit in fits {
            by_date
                .entry(fit.window_end_date)
                .or_default()
                .push(fit.clone());
        }

        let mut panel = NormalizedPanel::default();
        for (date, cross_section) in by_date {
            match self.normalize(date, &cross_section) {
                Ok(signals) => {
                    panel.by_date.insert(date, signals);
                }
                Err(skip) => {
                    debug!("Normalization skipped on {}: {}", date, skip);
                    panel.skipped.push(SkipRecord {
                        instrument: None,
                        date: Some(date),
                        skip,
                    });
                }
            }
        }
        panel
    }

    fn zscores_or_policy(&self, values: &[f64]) -> StageResult<Vec<f64>> {
        match zscores(values) {
            Some(z) => Ok(z),
            None => match self.config.zero_variance {
                ZeroVariancePolicy::Zero => Ok(vec![0.0; values.len()]),
                ZeroVariancePolicy::Skip => {
                    Err(Skip::new(Stage::Normalize, SkipReason::ZeroVariance))
                }
            },
        }
    }

    fn auxiliary_zscores(&self, valid: &[&FitResult]) -> Option<Vec<Option<f64>>> {
        let present: Vec<(usize, f64)> = valid
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.auxiliary.filter(|v| v.is_finite()).map(|v| (i, v)))
            .collect();
        if present.len() < 2 {
            return None;
        }
        let values: Vec<f64> = present.iter().map(|(_, v)| *v).collect();
        let z = match zscores(&values) {
            Some(z) => z,
            None if self.config.zero_variance == ZeroVariancePolicy::Zero => {
                vec![0.0; values.len()]
            }
            None => return None,
        };
        let mut out = vec![None; valid.len()];
        for ((i, _), zi) in present.iter().zip(z) {
            out[*i] = Some(zi);
        }
        Some(out)
    }
}

/// Sample z-scores (n − 1 denominator).
///
/// Returns `None` for fewer than two values or zero variance.
pub fn zscores(values: &[f64]) -> Option<Vec<f64>> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if !std_dev.is_finite() || std_dev <= f64::EPSILON * mean.abs().max(1.0) {
        return None;
    }
    Some(values.iter().map(|v| (v - mean) / std_dev).collect())
}

/// Normalized signals for every analysis date.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedPanel {
    by_date: BTreeMap<NaiveDate, Vec<NormalizedSignal>>,
    skipped: Vec<SkipRecord>,
}

impl NormalizedPanel {
    /// Dates that were normalized.
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.by_date.keys().copied().collect()
    }

    pub fn on(&self, date: NaiveDate) -> Option<&[NormalizedSignal]> {
        self.by_date.get(&date).map(Vec::as_slice)
    }

    pub fn get(&self, instrument: &str, date: NaiveDate) -> Option<&NormalizedSignal> {
        self.by_date
            .get(&date)?
            .iter()
            .find(|s| s.instrument == instrument)
    }

    /// All normalized values of one instrument keyed by date.
    pub fn slice_for(&self, instrument: &str) -> BTreeMap<NaiveDate, NormalizedSignal> {
        self.by_date
            .iter()
            .filter_map(|(date, signals)| {
                signals
                    .iter()
                    .find(|s| s.instrument == instrument)
                    .map(|s| (*date, s.clone()))
            })
            .collect()
    }

    /// Dates excluded by the normalizer.
    pub fn skipped(&self) -> &[SkipRecord] {
        &self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 6, 30).unwrap()
    }

    fn fit(name: &str, growth: f64, quality: f64) -> FitResult {
        FitResult {
            instrument: name.to_string(),
            window_end_date: date(),
            growth_rate: growth,
            fit_quality: quality,
            auxiliary: None,
        }
    }

    fn mean_std(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var.sqrt())
    }

    #[test]
    fn test_zscores_have_unit_sample_variance() {
        let normalizer = CrossSectionalNormalizer::default();
        let fits = vec![
            fit("AAA", 0.01, 0.9),
            fit("BBB", 0.03, 0.5),
            fit("CCC", -0.02, 0.7),
            fit("DDD", 0.05, 0.95),
        ];
        let signals = normalizer.normalize(date(), &fits).unwrap();
        let (mean, std) = mean_std(&signals.iter().map(|s| s.z_growth).collect::<Vec<_>>());
        assert!(mean.abs() < 1e-12);
        assert!((std - 1.0).abs() < 1e-12);
        let (mean, std) = mean_std(&signals.iter().map(|s| s.z_quality).collect::<Vec<_>>());
        assert!(mean.abs() < 1e-12);
        assert!((std - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_instrument_is_skipped() {
        let normalizer = CrossSectionalNormalizer::default();
        let err = normalizer.normalize(date(), &[fit("AAA", 0.01, 0.9)]).unwrap_err();
        assert_eq!(err.reason, SkipReason::InsufficientCrossSection { available: 1 });
    }

    #[test]
    fn test_invalid_fits_are_excluded() {
        let normalizer = CrossSectionalNormalizer::default();
        let fits = vec![
            fit("AAA", 0.01, 0.9),
            fit("BBB", f64::NAN, 0.5),
            fit("CCC", 0.02, 0.7),
        ];
        let signals = normalizer.normalize(date(), &fits).unwrap();
        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.instrument != "BBB"));
    }

    #[test]
    fn test_zero_variance_defaults_to_zero() {
        let normalizer = CrossSectionalNormalizer::default();
        let fits = vec![fit("AAA", 0.02, 0.9), fit("BBB", 0.02, 0.5), fit("CCC", 0.02, 0.7)];
        let signals = normalizer.normalize(date(), &fits).unwrap();
        assert!(signals.iter().all(|s| s.z_growth == 0.0));
        assert!(signals.iter().any(|s| s.z_quality != 0.0));
    }

    #[test]
    fn test_zero_variance_skip_policy() {
        let normalizer = CrossSectionalNormalizer::new(NormalizerConfig {
            zero_variance: ZeroVariancePolicy::Skip,
        });
        let fits = vec![fit("AAA", 0.02, 0.9), fit("BBB", 0.02, 0.5)];
        let err = normalizer.normalize(date(), &fits).unwrap_err();
        assert_eq!(err.reason, SkipReason::ZeroVariance);
    }

    #[test]
    fn test_auxiliary_normalized_when_present() {
        let normalizer = CrossSectionalNormalizer::default();
        let mut fits = vec![fit("AAA", 0.01, 0.9), fit("BBB", 0.03, 0.5), fit("CCC", 0.02, 0.4)];
        fits[0].auxiliary = Some(1.0);
        fits[1].auxiliary = Some(3.0);
        let signals = normalizer.normalize(date(), &fits).unwrap();
        assert!(signals[0].z_auxiliary.unwrap() < 0.0);
        assert!(signals[1].z_auxiliary.unwrap() > 0.0);
        assert!(signals[2].z_auxiliary.is_none());
    }

    #[test]
    fn test_panel_never_mixes_dates() {
        let normalizer = CrossSectionalNormalizer::default();
        let other = date().succ_opt().unwrap();
        let mut late = fit("AAA", 0.5, 0.1);
        late.window_end_date = other;
        let fits = vec![fit("AAA", 0.01, 0.9), fit("BBB", 0.03, 0.5), late];

        let panel = normalizer.normalize_panel(&fits);
        assert_eq!(panel.dates(), vec![date()]);
        assert_eq!(panel.skipped().len(), 1);
        assert_eq!(panel.skipped()[0].date, Some(other));
        assert!(panel.get("AAA", date()).is_some());
        assert_eq!(panel.slice_for("BBB").len(), 1);
    }
}
