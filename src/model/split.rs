//! Reproducible train/test partitioning.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::error::ModelError;

/// Output of [`train_test_split`]. Label partitions are present when labels
/// were supplied.
#[derive(Debug, Clone)]
pub struct Split {
    pub x_train: Array2<f64>,
    pub x_test: Array2<f64>,
    pub y_train: Option<Array1<u8>>,
    pub y_test: Option<Array1<u8>>,
}

/// Shuffles rows with `StdRng::seed_from_u64(random_state)` and takes the
/// first `ceil(test_size * n)` as the test partition.
pub fn train_test_split(
    features: &Array2<f64>,
    labels: Option<&Array1<u8>>,
    test_size: f64,
    random_state: u64,
) -> Result<Split, ModelError> {
    let n = features.nrows();
    if n == 0 {
        return Err(ModelError::EmptyInput("feature matrix"));
    }
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(ModelError::InvalidParameter {
            name: "test_size",
            reason: format!("must be in (0, 1), got {}", test_size),
        });
    }
    if let Some(labels) = labels {
        if labels.len() != n {
            return Err(ModelError::LengthMismatch {
                what: "features and labels",
                left: n,
                right: labels.len(),
            });
        }
    }

    let n_test = (test_size * n as f64).ceil() as usize;
    if n_test >= n {
        return Err(ModelError::InvalidParameter {
            name: "test_size",
            reason: format!("{} samples leave no training rows at test_size={}", n, test_size),
        });
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(random_state);
    indices.shuffle(&mut rng);
    let (test_idx, train_idx) = indices.split_at(n_test);

    debug!(
        "Split {} rows into {} train / {} test (seed {})",
        n,
        train_idx.len(),
        test_idx.len(),
        random_state
    );

    Ok(Split {
        x_train: features.select(Axis(0), train_idx),
        x_test: features.select(Axis(0), test_idx),
        y_train: labels.map(|y| y.select(Axis(0), train_idx)),
        y_test: labels.map(|y| y.select(Axis(0), test_idx)),
    })
}
