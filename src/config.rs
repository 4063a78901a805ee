//! Configuration Module
//!
//! Provides TOML-based configuration for flowguard.
//! Configuration is optional - CLI arguments can override file settings.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::export::OutputFormat;
use crate::features::FeatureType;
use crate::model::{
    Bandwidth, Detector, Gamma, KdeParams, KernelDensity, KernelType, ModelConfig, OcsvmParams,
    OneClassSvm, ScoreMetric,
};
use crate::parser::ParserConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub features: FeaturesConfig,
    pub model: ModelSettings,
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Generates a default configuration file content
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if self.capture.flow_pkts_thres == 0 {
            anyhow::bail!("flow_pkts_thres must be greater than 0");
        }
        if let Some(q) = self.capture.q_interval {
            if !unit.contains(&q) {
                anyhow::bail!("q_interval must be between 0.0 and 1.0");
            }
        }
        if !(self.capture.tcp_timeout_secs > 0.0 && self.capture.udp_timeout_secs > 0.0) {
            anyhow::bail!("flow timeouts must be greater than 0");
        }
        if self.capture.channel_size == 0 {
            anyhow::bail!("channel_size must be greater than 0");
        }
        if !unit.contains(&self.features.q_iat) {
            anyhow::bail!("q_iat must be between 0.0 and 1.0");
        }
        if !(self.model.test_size > 0.0 && self.model.test_size < 1.0) {
            anyhow::bail!("test_size must be between 0.0 and 1.0 (exclusive)");
        }
        self.model.ocsvm_params().validate()?;
        self.model.kde_params().validate()?;
        Ok(())
    }

    /// Session settings for the capture stages
    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig {
            flow_pkts_thres: self.capture.flow_pkts_thres,
            random_state: self.capture.random_state,
            max_flows: self.capture.max_flows,
            tcp_timeout_secs: self.capture.tcp_timeout_secs,
            udp_timeout_secs: self.capture.udp_timeout_secs,
            q_iat: self.features.q_iat,
            channel_size: self.capture.channel_size,
        }
    }
}

/// Capture and flow assembly configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Minimum packets for a flow to be kept (inclusive)
    pub flow_pkts_thres: usize,
    /// Quantile of flow durations used as the subflow interval (None = no split)
    pub q_interval: Option<f64>,
    /// Idle gap in seconds that ends a TCP flow
    pub tcp_timeout_secs: f64,
    /// Idle gap in seconds that ends a UDP flow
    pub udp_timeout_secs: f64,
    /// Channel buffer size for packet events
    pub channel_size: usize,
    /// Keep at most this many flows (0 = all)
    pub max_flows: usize,
    /// Seed for flow subsampling
    pub random_state: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            flow_pkts_thres: 2,
            q_interval: Some(0.9),
            tcp_timeout_secs: 600.0,
            udp_timeout_secs: 600.0,
            channel_size: 10_000,
            max_flows: 0,
            random_state: 42,
        }
    }
}

/// Feature extraction configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Feature scheme (IAT, SIZE, IAT_SIZE, STATS, SAMP_NUM, SAMP_SIZE)
    #[serde(with = "display_fromstr")]
    pub feature_type: FeatureType,
    /// Replace each row with its DFT magnitudes
    pub fft: bool,
    /// Prepend TCP flag counts and mean TTL
    pub header: bool,
    /// Quantile of packet counts that fixes sequence widths
    pub q_iat: f64,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            feature_type: FeatureType::Iat,
            fft: false,
            header: false,
            q_iat: 0.9,
        }
    }
}

/// Which novelty detector to train
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    #[default]
    Ocsvm,
    Kde,
}

impl std::str::FromStr for DetectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ocsvm" => Ok(Self::Ocsvm),
            "kde" => Ok(Self::Kde),
            _ => Err(format!("Unknown detector: {}", s)),
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ocsvm => write!(f, "ocsvm"),
            Self::Kde => write!(f, "kde"),
        }
    }
}

/// Detector and evaluation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelSettings {
    pub detector: DetectorKind,
    /// OCSVM kernel (linear, poly, rbf, sigmoid)
    #[serde(with = "display_fromstr")]
    pub kernel: KernelType,
    /// OCSVM nu in (0, 1]
    pub nu: f64,
    /// OCSVM kernel coefficient (scale, auto or a number)
    #[serde(with = "display_fromstr")]
    pub gamma: Gamma,
    pub degree: u32,
    pub coef0: f64,
    /// SMO stopping tolerance
    pub tol: f64,
    /// SMO iteration cap (None = solver default)
    pub max_iter: Option<usize>,
    /// Kernel rows kept in the solver cache
    pub cache_rows: usize,
    /// KDE bandwidth (scott, silverman or a number)
    #[serde(with = "display_fromstr")]
    pub bandwidth: Bandwidth,
    /// KDE expected outlier fraction
    pub contamination: f64,
    pub score_metric: ScoreMetric,
    /// Held-out fraction for testing
    pub test_size: f64,
    /// Seed for the train/test split
    pub random_state: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            detector: DetectorKind::Ocsvm,
            kernel: KernelType::Rbf,
            nu: 0.5,
            gamma: Gamma::Scale,
            degree: 3,
            coef0: 0.0,
            tol: 1e-3,
            max_iter: None,
            cache_rows: 512,
            bandwidth: Bandwidth::Scott,
            contamination: 0.1,
            score_metric: ScoreMetric::Auc,
            test_size: 0.33,
            random_state: 42,
        }
    }
}

impl ModelSettings {
    pub fn ocsvm_params(&self) -> OcsvmParams {
        OcsvmParams {
            kernel: self.kernel,
            nu: self.nu,
            gamma: self.gamma,
            degree: self.degree,
            coef0: self.coef0,
            tol: self.tol,
            max_iter: self.max_iter,
            cache_rows: self.cache_rows,
            random_state: self.random_state,
        }
    }

    pub fn kde_params(&self) -> KdeParams {
        KdeParams {
            bandwidth: self.bandwidth,
            contamination: self.contamination,
        }
    }

    /// Builds the configured, unfitted detector
    pub fn build_detector(&self) -> Result<Detector, ModelError> {
        Ok(match self.detector {
            DetectorKind::Ocsvm => OneClassSvm::new(self.ocsvm_params())?.into(),
            DetectorKind::Kde => KernelDensity::new(self.kde_params())?.into(),
        })
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            score_metric: self.score_metric,
            random_state: self.random_state,
        }
    }
}

/// Output-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format (text, json, jsonl)
    #[serde(with = "display_fromstr")]
    pub format: OutputFormat,
    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            verbose: false,
        }
    }
}

/// Serde as the value's `Display` / `FromStr` text
mod display_fromstr {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
