//! Evaluation metrics against ground-truth labels (0 normal, 1 abnormal).

use ndarray::Array1;

use crate::error::ModelError;
use crate::labels::ABNORMAL;

fn check_lengths(labels: &Array1<u8>, other: usize) -> Result<(), ModelError> {
    if labels.is_empty() {
        return Err(ModelError::EmptyInput("labels"));
    }
    if labels.len() != other {
        return Err(ModelError::LengthMismatch {
            what: "labels and predictions",
            left: labels.len(),
            right: other,
        });
    }
    Ok(())
}

/// ROC AUC of `anomaly_scores` (higher means more anomalous) with the
/// abnormal class as positive. Ties get average ranks.
pub fn roc_auc(labels: &Array1<u8>, anomaly_scores: &Array1<f64>) -> Result<f64, ModelError> {
    check_lengths(labels, anomaly_scores.len())?;

    let n_pos = labels.iter().filter(|l| **l == ABNORMAL).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(ModelError::UndefinedScore {
            metric: "auc".into(),
            reason: "labels contain a single class".into(),
        });
    }

    let mut order: Vec<usize> = (0..anomaly_scores.len()).collect();
    order.sort_by(|&a, &b| anomaly_scores[a].total_cmp(&anomaly_scores[b]));

    // 1-based ranks, averaged across ties
    let mut ranks = vec![0.0; order.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len()
            && anomaly_scores[order[end + 1]] == anomaly_scores[order[start]]
        {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = rank;
        }
        start = end + 1;
    }

    let pos_rank_sum: f64 = labels
        .iter()
        .zip(ranks.iter())
        .filter(|(l, _)| **l == ABNORMAL)
        .map(|(_, r)| r)
        .sum();
    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Ok((pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// F1 of the abnormal class. `predictions` use -1 for outliers.
pub fn f1(labels: &Array1<u8>, predictions: &Array1<i8>) -> Result<f64, ModelError> {
    check_lengths(labels, predictions.len())?;

    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
    for (&label, &pred) in labels.iter().zip(predictions.iter()) {
        match (label == ABNORMAL, pred == -1) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
            (false, false) => {}
        }
    }

    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        return Err(ModelError::UndefinedScore {
            metric: "f1".into(),
            reason: "no abnormal labels and no outlier predictions".into(),
        });
    }
    Ok(2.0 * tp as f64 / denom as f64)
}

/// Fraction of flows whose prediction agrees with the label.
pub fn accuracy(labels: &Array1<u8>, predictions: &Array1<i8>) -> Result<f64, ModelError> {
    check_lengths(labels, predictions.len())?;

    let correct = labels
        .iter()
        .zip(predictions.iter())
        .filter(|(&label, &pred)| (label == ABNORMAL) == (pred == -1))
        .count();
    Ok(correct as f64 / labels.len() as f64)
}
