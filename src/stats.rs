//! Descriptive statistics shared by the flow and feature stages.
//!
//! # Conventions
//!
//! For a series of timestamps [t₀, t₁, ..., tₙ] the inter-arrival times are
//! Δᵢ = tᵢ - tᵢ₋₁ for i ∈ [1, n], expressed in seconds.
//!
//! Standard deviations are population deviations (divide by n), so a flow
//! with a single value has a deviation of 0 rather than an undefined one.
//! Quantiles interpolate linearly between the closest ranks: for sorted
//! values x₀..xₙ₋₁ and h = (n-1)q the result is x⌊h⌋ + (h-⌊h⌋)(x⌊h⌋₊₁ - x⌊h⌋).
//! Feature widths and subflow intervals are derived from them.

use statrs::statistics::{Data, Distribution, Max, Min, OrderStatistics};

use crate::error::FeatureError;

/// Statistical summary for a set of values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryStatistics {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
}

/// Calculates a summary for a set of values. Empty input yields zeros.
pub fn summarize(values: &[f64]) -> SummaryStatistics {
    if values.is_empty() {
        return SummaryStatistics::default();
    }

    let mut data = Data::new(values.to_vec());
    let mean = data.mean().unwrap_or(0.0);
    let n = values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    SummaryStatistics {
        mean,
        std_dev: variance.sqrt(),
        min: data.min(),
        max: data.max(),
        q1: data.lower_quartile(),
        median: data.median(),
        q3: data.upper_quartile(),
    }
}

/// Returns the `q` quantile of `values`.
pub fn quantile(values: &[f64], q: f64) -> Result<f64, FeatureError> {
    if !(0.0..=1.0).contains(&q) {
        return Err(FeatureError::InvalidQuantile(q));
    }
    if values.is_empty() {
        return Err(FeatureError::NoFlows);
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let h = (sorted.len() - 1) as f64 * q;
    let lower = h.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    Ok(sorted[lower] + (h - lower as f64) * (sorted[upper] - sorted[lower]))
}

/// Converts timestamps (seconds) to inter-arrival deltas (seconds).
pub fn timestamps_to_deltas(timestamps: &[f64]) -> Vec<f64> {
    if timestamps.len() < 2 {
        return Vec::new();
    }

    timestamps
        .windows(2)
        .map(|window| window[1] - window[0])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_calculation() {
        let values = vec![100.0, 200.0, 300.0, 400.0, 500.0];
        let stats = summarize(&values);

        assert!((stats.mean - 300.0).abs() < 1e-9);
        assert!((stats.min - 100.0).abs() < 1e-9);
        assert!((stats.max - 500.0).abs() < 1e-9);
        assert!((stats.median - 300.0).abs() < 1e-9);
        // Population deviation of 100..500 step 100
        assert!((stats.std_dev - 141.421_356).abs() < 1e-4);
        assert!(stats.q1 <= stats.median && stats.median <= stats.q3);
    }

    #[test]
    fn test_summary_single_value() {
        let stats = summarize(&[42.0]);
        assert_eq!(stats.mean, 42.0);
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.min, 42.0);
        assert_eq!(stats.max, 42.0);
    }

    #[test]
    fn test_summary_empty() {
        assert_eq!(summarize(&[]), SummaryStatistics::default());
    }

    #[test]
    fn test_quantile_bounds() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&values, 0.0).unwrap(), 1.0);
        assert_eq!(quantile(&values, 1.0).unwrap(), 5.0);
        assert_eq!(quantile(&values, 0.5).unwrap(), 3.0);
        assert!(quantile(&values, 1.5).is_err());
        assert!(quantile(&[], 0.5).is_err());
    }

    #[test]
    fn test_quantile_interpolates_between_ranks() {
        assert!((quantile(&[1.0, 2.0, 3.0, 4.0], 0.9).unwrap() - 3.7).abs() < 1e-12);
        assert!((quantile(&[4.0, 1.0, 3.0, 2.0], 0.25).unwrap() - 1.75).abs() < 1e-12);
        assert_eq!(quantile(&[7.0], 0.9).unwrap(), 7.0);

        // A single long flow does not drag the 0.9 quantile to the maximum
        let mut counts = vec![2.0; 9];
        counts.push(20.0);
        assert!((quantile(&counts, 0.9).unwrap() - 3.8).abs() < 1e-12);
    }

    #[test]
    fn test_timestamps_to_deltas() {
        let deltas = timestamps_to_deltas(&[10.0, 11.0, 11.5, 13.0]);
        assert_eq!(deltas, vec![1.0, 0.5, 1.5]);
    }

    #[test]
    fn test_timestamps_to_deltas_short() {
        assert!(timestamps_to_deltas(&[]).is_empty());
        assert!(timestamps_to_deltas(&[1.0]).is_empty());
    }
}
