//! Novelty detectors and the training wrapper around them.
//!
//! A detector learns from normal traffic only. Its decision function is
//! non-negative for inliers and negative for outliers; [`Model`] fits it,
//! evaluates it on a labelled partition and records a [`TrainHistory`].

pub mod kde;
pub mod kernel;
pub mod metrics;
pub mod ocsvm;
pub mod split;

use std::time::Instant;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifact::Artifact;
use crate::error::ModelError;
use crate::features::FeatureSchema;

pub use kde::{Bandwidth, KdeParams, KernelDensity};
pub use kernel::{Gamma, KernelType};
pub use ocsvm::{OcsvmParams, OneClassSvm};
pub use split::train_test_split;

/// Prediction for an inlier.
pub const INLIER: i8 = 1;
/// Prediction for an outlier.
pub const OUTLIER: i8 = -1;

/// A detector fitted on normal samples only.
pub trait NoveltyDetector {
    fn name(&self) -> &str;

    fn fit(&mut self, x: &Array2<f64>) -> Result<(), ModelError>;

    /// Signed distance to the decision boundary; negative for outliers.
    fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError>;

    /// Normality score; higher means more normal.
    fn score_samples(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError>;

    /// `+1` for inliers, `-1` for outliers.
    fn predict(&self, x: &Array2<f64>) -> Result<Array1<i8>, ModelError> {
        Ok(self
            .decision_function(x)?
            .mapv(|d| if d >= 0.0 { INLIER } else { OUTLIER }))
    }

    /// Input width seen at fit time.
    fn n_features(&self) -> Option<usize>;
}

/// Every detector that can be persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Detector {
    Ocsvm(OneClassSvm),
    Kde(KernelDensity),
}

impl Detector {
    fn inner(&self) -> &dyn NoveltyDetector {
        match self {
            Self::Ocsvm(d) => d,
            Self::Kde(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn NoveltyDetector {
        match self {
            Self::Ocsvm(d) => d,
            Self::Kde(d) => d,
        }
    }
}

impl From<OneClassSvm> for Detector {
    fn from(d: OneClassSvm) -> Self {
        Self::Ocsvm(d)
    }
}

impl From<KernelDensity> for Detector {
    fn from(d: KernelDensity) -> Self {
        Self::Kde(d)
    }
}

impl NoveltyDetector for Detector {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn fit(&mut self, x: &Array2<f64>) -> Result<(), ModelError> {
        self.inner_mut().fit(x)
    }

    fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        self.inner().decision_function(x)
    }

    fn score_samples(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        self.inner().score_samples(x)
    }

    fn n_features(&self) -> Option<usize> {
        self.inner().n_features()
    }
}

/// Metric computed by [`Model::test`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMetric {
    #[default]
    Auc,
    F1,
    Accuracy,
}

impl std::str::FromStr for ScoreMetric {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auc" | "roc_auc" => Ok(Self::Auc),
            "f1" => Ok(Self::F1),
            "accuracy" | "acc" => Ok(Self::Accuracy),
            _ => Err(ModelError::InvalidParameter {
                name: "score_metric",
                reason: format!("unknown metric '{}'", s),
            }),
        }
    }
}

impl std::fmt::Display for ScoreMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auc => write!(f, "auc"),
            Self::F1 => write!(f, "f1"),
            Self::Accuracy => write!(f, "accuracy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelConfig {
    pub score_metric: ScoreMetric,
    pub random_state: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            score_metric: ScoreMetric::Auc,
            random_state: 42,
        }
    }
}

/// What happened during training and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainHistory {
    pub detector: String,
    pub score_metric: ScoreMetric,
    pub random_state: u64,
    pub n_train: usize,
    pub n_test: usize,
    pub n_features: usize,
    pub train_time_secs: f64,
    pub test_time_secs: f64,
    pub score: Option<f64>,
    pub trained_at: Option<DateTime<Utc>>,
}

impl TrainHistory {
    fn new(detector: &str, config: &ModelConfig) -> Self {
        Self {
            detector: detector.to_string(),
            score_metric: config.score_metric,
            random_state: config.random_state,
            n_train: 0,
            n_test: 0,
            n_features: 0,
            train_time_secs: 0.0,
            test_time_secs: 0.0,
            score: None,
            trained_at: None,
        }
    }
}

/// Trains and evaluates one detector, keeping its history.
#[derive(Debug, Clone)]
pub struct Model {
    detector: Detector,
    config: ModelConfig,
    history: TrainHistory,
}

impl Model {
    pub fn new(detector: impl Into<Detector>, config: ModelConfig) -> Self {
        let detector = detector.into();
        let history = TrainHistory::new(detector.name(), &config);
        Self {
            detector,
            config,
            history,
        }
    }

    /// Fits the detector on `x_train`.
    pub fn train(&mut self, x_train: &Array2<f64>) -> Result<(), ModelError> {
        let start = Instant::now();
        self.detector.fit(x_train)?;
        let elapsed = start.elapsed().as_secs_f64();

        self.history.n_train = x_train.nrows();
        self.history.n_features = x_train.ncols();
        self.history.train_time_secs = elapsed;
        self.history.trained_at = Some(Utc::now());
        self.history.score = None;

        info!(
            "Trained {} on {} samples in {:.3}s",
            self.detector.name(),
            x_train.nrows(),
            elapsed
        );
        Ok(())
    }

    /// Scores the fitted detector on a labelled partition and returns the
    /// configured metric.
    pub fn test(&mut self, x_test: &Array2<f64>, y_test: &Array1<u8>) -> Result<f64, ModelError> {
        if x_test.nrows() == 0 {
            return Err(ModelError::EmptyInput("test matrix"));
        }
        if x_test.nrows() != y_test.len() {
            return Err(ModelError::LengthMismatch {
                what: "test features and labels",
                left: x_test.nrows(),
                right: y_test.len(),
            });
        }

        let start = Instant::now();
        let decision = self.detector.decision_function(x_test)?;
        let score = match self.config.score_metric {
            ScoreMetric::Auc => metrics::roc_auc(y_test, &decision.mapv(|d| -d))?,
            ScoreMetric::F1 | ScoreMetric::Accuracy => {
                let predictions = decision.mapv(|d| if d >= 0.0 { INLIER } else { OUTLIER });
                if self.config.score_metric == ScoreMetric::F1 {
                    metrics::f1(y_test, &predictions)?
                } else {
                    metrics::accuracy(y_test, &predictions)?
                }
            }
        };
        let elapsed = start.elapsed().as_secs_f64();

        self.history.n_test = x_test.nrows();
        self.history.test_time_secs = elapsed;
        self.history.score = Some(score);

        info!(
            "Tested {} on {} samples in {:.3}s: {}={:.4}",
            self.detector.name(),
            x_test.nrows(),
            elapsed,
            self.config.score_metric,
            score
        );
        Ok(score)
    }

    /// Score of the last [`Model::test`] run.
    pub fn score(&self) -> Option<f64> {
        self.history.score
    }

    pub fn history(&self) -> &TrainHistory {
        &self.history
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn into_parts(self) -> (Detector, TrainHistory) {
        (self.detector, self.history)
    }
}

/// A fitted detector persisted with its history and the feature layout it
/// was trained on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub detector: Detector,
    pub history: TrainHistory,
    pub schema: Option<FeatureSchema>,
}

impl ModelArtifact {
    pub fn new(model: Model, schema: Option<FeatureSchema>) -> Self {
        let (detector, history) = model.into_parts();
        Self {
            detector,
            history,
            schema,
        }
    }
}

impl Artifact for ModelArtifact {
    const KIND: &'static str = "model";
}
