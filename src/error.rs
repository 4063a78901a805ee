//! Domain-specific error types for flowguard.
//!
//! Uses `thiserror` for the typed errors of each stage; the binary wraps
//! them with `anyhow` context at the I/O boundaries.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading a capture file.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to open capture file '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unrecognised capture format in '{path}': {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("Failed to parse capture block: {0}")]
    Parse(String),

    #[error("Failed to spawn reader thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Reader thread panicked")]
    ReaderPanicked,
}

/// Errors that can occur during feature extraction.
#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("No flows to extract features from")]
    NoFlows,

    #[error("Unknown feature type: {0}")]
    UnknownFeatureType(String),

    #[error("Feature dimension resolved to zero for {0}")]
    ZeroDimension(String),

    #[error("Invalid quantile {0}, expected a value in [0, 1]")]
    InvalidQuantile(f64),

    #[error("Feature matrix shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Dataset rows do not line up: {rows}x{cols} features (schema width {width}), {labels} labels, {keys} flow keys")]
    Misaligned {
        rows: usize,
        cols: usize,
        width: usize,
        labels: usize,
        keys: usize,
    },
}

/// Errors that can occur while loading or applying ground-truth labels.
#[derive(Error, Debug)]
pub enum LabelError {
    #[error("Failed to read label file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Invalid label row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },
}

/// Errors that can occur while persisting or restoring artifacts.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode artifact: {0}")]
    Encode(String),

    #[error("Failed to decode artifact: {0}")]
    Decode(String),

    #[error("Unsupported artifact format version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Artifact holds a {found} but a {expected} was requested")]
    KindMismatch { found: String, expected: String },

    #[error("Artifact checksum mismatch (expected {expected}, computed {computed})")]
    Checksum { expected: String, computed: String },
}

/// Errors that can occur while fitting or evaluating a detector.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Detector '{0}' has not been fitted")]
    NotFitted(String),

    #[error("Empty input: {0}")]
    EmptyInput(&'static str),

    #[error("Feature dimension mismatch (model expects {expected}, got {actual})")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Length mismatch between {what}: {left} vs {right}")]
    LengthMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Score '{metric}' is undefined: {reason}")]
    UndefinedScore { metric: String, reason: String },
}

/// Errors raised when pipeline stages are driven out of order.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("'{stage}' requires '{requires}' to run first")]
    StageOrder {
        stage: &'static str,
        requires: &'static str,
    },
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
