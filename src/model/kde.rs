//! Gaussian kernel density estimate used as a novelty detector.
//!
//! Scores are log densities. The outlier threshold is the `contamination`
//! quantile of the training scores, so roughly that fraction of the
//! training set falls on the outlier side.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use tracing::{debug, info};

use super::NoveltyDetector;
use crate::error::ModelError;

/// Bandwidth selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Bandwidth {
    /// `sigma * n^(-1 / (d + 4))`
    #[default]
    Scott,
    /// `sigma * (n * (d + 2) / 4)^(-1 / (d + 4))`
    Silverman,
    Value(f64),
}

impl Bandwidth {
    /// Resolves the rule against training data. `sigma` is the mean
    /// per-feature standard deviation, or 1 for constant data.
    pub fn resolve(&self, x: &Array2<f64>) -> f64 {
        let n = x.nrows().max(1) as f64;
        let d = x.ncols() as f64;
        let sigma = {
            let s = x.std_axis(Axis(0), 0.0).mean().unwrap_or(0.0);
            if s > 0.0 {
                s
            } else {
                1.0
            }
        };
        match self {
            Self::Scott => sigma * n.powf(-1.0 / (d + 4.0)),
            Self::Silverman => sigma * (n * (d + 2.0) / 4.0).powf(-1.0 / (d + 4.0)),
            Self::Value(h) => *h,
        }
    }
}

impl std::str::FromStr for Bandwidth {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scott" => Ok(Self::Scott),
            "silverman" => Ok(Self::Silverman),
            other => match other.parse::<f64>() {
                Ok(h) if h > 0.0 => Ok(Self::Value(h)),
                _ => Err(ModelError::InvalidParameter {
                    name: "bandwidth",
                    reason: format!(
                        "expected 'scott', 'silverman' or a positive number, got '{}'",
                        s
                    ),
                }),
            },
        }
    }
}

impl std::fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scott => write!(f, "scott"),
            Self::Silverman => write!(f, "silverman"),
            Self::Value(h) => write!(f, "{}", h),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KdeParams {
    pub bandwidth: Bandwidth,
    /// Expected outlier fraction of the training data, in [0, 0.5).
    pub contamination: f64,
}

impl Default for KdeParams {
    fn default() -> Self {
        Self {
            bandwidth: Bandwidth::Scott,
            contamination: 0.1,
        }
    }
}

impl KdeParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if !(0.0..0.5).contains(&self.contamination) {
            return Err(ModelError::InvalidParameter {
                name: "contamination",
                reason: format!("must be in [0, 0.5), got {}", self.contamination),
            });
        }
        if let Bandwidth::Value(h) = self.bandwidth {
            if !(h > 0.0) {
                return Err(ModelError::InvalidParameter {
                    name: "bandwidth",
                    reason: format!("must be positive, got {}", h),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedKde {
    pub samples: Array2<f64>,
    pub bandwidth: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelDensity {
    params: KdeParams,
    fitted: Option<FittedKde>,
}

impl KernelDensity {
    pub const NAME: &'static str = "KDE";

    pub fn new(params: KdeParams) -> Result<Self, ModelError> {
        params.validate()?;
        Ok(Self {
            params,
            fitted: None,
        })
    }

    fn log_density(samples: &Array2<f64>, bandwidth: f64, x: &Array2<f64>) -> Array1<f64> {
        let n = samples.nrows() as f64;
        let d = samples.ncols() as f64;
        let log_norm = n.ln() + d * (bandwidth * (2.0 * std::f64::consts::PI).sqrt()).ln();
        let inv_two_h2 = 1.0 / (2.0 * bandwidth * bandwidth);

        x.outer_iter()
            .map(|row| {
                let exponents: Vec<f64> = samples
                    .outer_iter()
                    .map(|s| {
                        let dist2: f64 = s.iter().zip(row.iter()).map(|(a, b)| (a - b).powi(2)).sum();
                        -dist2 * inv_two_h2
                    })
                    .collect();
                log_sum_exp(&exponents) - log_norm
            })
            .collect()
    }

    fn require_fitted(&self, x: &Array2<f64>) -> Result<&FittedKde, ModelError> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| ModelError::NotFitted(Self::NAME.into()))?;
        if x.ncols() != fitted.samples.ncols() {
            return Err(ModelError::DimensionMismatch {
                expected: fitted.samples.ncols(),
                actual: x.ncols(),
            });
        }
        Ok(fitted)
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

impl NoveltyDetector for KernelDensity {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn fit(&mut self, x: &Array2<f64>) -> Result<(), ModelError> {
        self.params.validate()?;
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(ModelError::EmptyInput("training matrix"));
        }

        let bandwidth = self.params.bandwidth.resolve(x);
        debug!(
            "Fitting {} on {}x{} (bandwidth={:.6})",
            Self::NAME,
            x.nrows(),
            x.ncols(),
            bandwidth
        );

        let scores = Self::log_density(x, bandwidth, x);
        let threshold = if self.params.contamination > 0.0 {
            Data::new(scores.to_vec()).quantile(self.params.contamination)
        } else {
            scores.iter().copied().fold(f64::INFINITY, f64::min)
        };

        info!(
            "{} fitted on {} samples, bandwidth={:.6}, threshold={:.6}",
            Self::NAME,
            x.nrows(),
            bandwidth,
            threshold
        );

        self.fitted = Some(FittedKde {
            samples: x.clone(),
            bandwidth,
            threshold,
        });
        Ok(())
    }

    fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        let fitted = self.require_fitted(x)?;
        Ok(Self::log_density(&fitted.samples, fitted.bandwidth, x) - fitted.threshold)
    }

    fn score_samples(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        let fitted = self.require_fitted(x)?;
        Ok(Self::log_density(&fitted.samples, fitted.bandwidth, x))
    }

    fn n_features(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.samples.ncols())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn line() -> Array2<f64> {
        Array2::from_shape_fn((21, 1), |(i, _)| i as f64 * 0.1)
    }

    #[test]
    fn test_single_point_density() {
        let samples = array![[0.0]];
        let log_p = KernelDensity::log_density(&samples, 1.0, &array![[0.0]]);
        let expected = -(2.0 * std::f64::consts::PI).sqrt().ln();
        assert!((log_p[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_log_sum_exp_is_stable() {
        let values = [-1000.0, -1000.0];
        assert!((log_sum_exp(&values) - (-1000.0 + 2f64.ln())).abs() < 1e-9);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_scott_bandwidth() {
        let x = array![[0.0], [2.0]];
        // sigma = 1, n = 2, d = 1
        let h = Bandwidth::Scott.resolve(&x);
        assert!((h - 2f64.powf(-0.2)).abs() < 1e-12);
    }

    #[test]
    fn test_contamination_sets_training_outlier_fraction() {
        let x = line();
        let mut kde = KernelDensity::new(KdeParams {
            bandwidth: Bandwidth::Value(0.2),
            contamination: 0.2,
        })
        .unwrap();
        kde.fit(&x).unwrap();

        let predicted = kde.predict(&x).unwrap();
        let outliers = predicted.iter().filter(|p| **p == -1).count();
        assert!(outliers > 0 && outliers <= 5, "outliers = {}", outliers);
        // The ends of the segment are the least dense
        assert_eq!(predicted[0], -1);
        assert_eq!(predicted[10], 1);
    }

    #[test]
    fn test_far_point_is_outlier() {
        let mut kde = KernelDensity::new(KdeParams::default()).unwrap();
        kde.fit(&line()).unwrap();

        let predicted = kde.predict(&array![[1.0], [50.0]]).unwrap();
        assert_eq!(predicted.to_vec(), vec![1, -1]);
    }

    #[test]
    fn test_invalid_contamination() {
        let err = KernelDensity::new(KdeParams {
            contamination: 0.7,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ModelError::InvalidParameter {
                name: "contamination",
                ..
            }
        ));
    }
}
