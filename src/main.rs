//! flowguard: flow features and one-class novelty detection for packet captures.
//!
//! Reads a pcap file, groups packets into flows, turns each flow into a
//! fixed-width feature vector and trains a detector on normal traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   extract   │────>│   dataset   │────>│    train    │────>│    model    │
//! │ (pcap+csv)  │     │  artifact   │     │ (OCSVM/KDE) │     │  artifact   │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                                                                    │
//!                                          ┌─────────────┐           │
//!                                          │  classify   │<──────────┘
//!                                          │   (pcap)    │
//!                                          └─────────────┘
//! ```
//!
//! - **extract**: reader thread feeding an async flow assembler, then labels
//!   and features
//! - **train**: seeded split, fit on a blocking worker, score, persist
//! - **classify**: reuse the stored feature layout and predict per flow

mod artifact;
mod capture;
mod config;
mod error;
mod export;
mod features;
mod flow;
mod labels;
mod model;
mod parser;
mod stats;
#[cfg(test)]
mod testutil;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ndarray::Axis;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::artifact::{dump_data, load_data};
use crate::config::{Config, DetectorKind};
use crate::export::{
    export_report, ClassificationReport, ExtractionReport, FlowPrediction, LabelCounts,
    OutputFormat, TrainingReport,
};
use crate::features::FeatureType;
use crate::labels::NORMAL;
use crate::model::{train_test_split, Gamma, KernelType, Model, ModelArtifact, NoveltyDetector, ScoreMetric};
use crate::parser::{CaptureSession, Dataset};

/// flowguard: novelty detection over network flows.
#[derive(Parser, Debug)]
#[command(name = "flowguard")]
#[command(author = "Security Team")]
#[command(version = "0.1.0")]
#[command(about = "Extract flow features from pcaps and train one-class novelty detectors")]
#[command(long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (writes to stderr).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format: text, json, jsonl.
    #[arg(short, long, global = true)]
    format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Turn a pcap into a feature dataset.
    Extract {
        /// Path to the pcap or pcapng file.
        #[arg(short, long)]
        pcap: PathBuf,

        /// CSV of ground-truth labels keyed by 5-tuple.
        #[arg(short, long)]
        labels: Option<PathBuf>,

        /// Where to write the dataset artifact.
        #[arg(short, long)]
        out: PathBuf,

        /// Feature scheme: IAT, SIZE, IAT_SIZE, STATS, SAMP_NUM, SAMP_SIZE.
        #[arg(short = 't', long)]
        feature_type: Option<FeatureType>,

        /// Replace each row with its DFT magnitudes (`--fft false` overrides the config).
        #[arg(long, num_args = 0..=1, default_missing_value = "true")]
        fft: Option<bool>,

        /// Prepend TCP flag counts and mean TTL (`--header false` overrides the config).
        #[arg(long, num_args = 0..=1, default_missing_value = "true")]
        header: Option<bool>,

        /// Quantile of flow durations used to cut subflows.
        #[arg(short, long)]
        q_interval: Option<f64>,

        /// Keep whole flows instead of cutting subflows.
        #[arg(long, conflicts_with = "q_interval")]
        no_interval: bool,

        /// Minimum packets per flow.
        #[arg(long)]
        flow_pkts_thres: Option<usize>,

        /// Keep at most this many flows, sampled with the random state.
        #[arg(long)]
        max_flows: Option<usize>,

        /// Seed for flow subsampling.
        #[arg(long)]
        random_state: Option<u64>,
    },

    /// Train and evaluate a detector on a dataset.
    Train {
        /// Dataset artifact written by `extract`.
        #[arg(short, long)]
        dataset: PathBuf,

        /// Where to write the model artifact.
        #[arg(short, long)]
        out: PathBuf,

        /// Detector: ocsvm, kde.
        #[arg(long)]
        detector: Option<DetectorKind>,

        /// OCSVM kernel: linear, poly, rbf, sigmoid.
        #[arg(long)]
        kernel: Option<KernelType>,

        /// OCSVM nu in (0, 1].
        #[arg(long)]
        nu: Option<f64>,

        /// OCSVM gamma: scale, auto or a positive number.
        #[arg(long)]
        gamma: Option<Gamma>,

        /// Metric on the test partition: auc, f1, accuracy.
        #[arg(long)]
        score_metric: Option<ScoreMetric>,

        /// Held-out fraction.
        #[arg(long)]
        test_size: Option<f64>,

        /// Seed for the train/test split.
        #[arg(long)]
        random_state: Option<u64>,

        /// Fit only on training rows labelled normal.
        #[arg(long)]
        normal_only: bool,
    },

    /// Predict inlier/outlier for every flow of a pcap.
    Classify {
        /// Path to the pcap or pcapng file.
        #[arg(short, long)]
        pcap: PathBuf,

        /// Model artifact written by `train`.
        #[arg(short, long)]
        model: PathBuf,

        /// Quantile of flow durations used to cut subflows.
        #[arg(short, long)]
        q_interval: Option<f64>,

        /// Keep whole flows instead of cutting subflows.
        #[arg(long, conflicts_with = "q_interval")]
        no_interval: bool,
    },

    /// Print a default configuration file.
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig = cli.command {
        println!("{}", Config::generate_default());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(format) = cli.format {
        config.output.format = format;
    }

    // Initialize logging
    let log_level = if cli.verbose || config.output.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Extract {
            pcap,
            labels,
            out,
            feature_type,
            fft,
            header,
            q_interval,
            no_interval,
            flow_pkts_thres,
            max_flows,
            random_state,
        } => {
            override_features(&mut config, feature_type, fft, header);
            if q_interval.is_some() {
                config.capture.q_interval = q_interval;
            }
            if no_interval {
                config.capture.q_interval = None;
            }
            if let Some(v) = flow_pkts_thres {
                config.capture.flow_pkts_thres = v;
            }
            if let Some(v) = max_flows {
                config.capture.max_flows = v;
            }
            if let Some(v) = random_state {
                config.capture.random_state = v;
            }
            config.validate()?;
            run_extract(&config, &pcap, labels.as_deref(), &out).await
        }

        Commands::Train {
            dataset,
            out,
            detector,
            kernel,
            nu,
            gamma,
            score_metric,
            test_size,
            random_state,
            normal_only,
        } => {
            let m = &mut config.model;
            if let Some(v) = detector {
                m.detector = v;
            }
            if let Some(v) = kernel {
                m.kernel = v;
            }
            if let Some(v) = nu {
                m.nu = v;
            }
            if let Some(v) = gamma {
                m.gamma = v;
            }
            if let Some(v) = score_metric {
                m.score_metric = v;
            }
            if let Some(v) = test_size {
                m.test_size = v;
            }
            if let Some(v) = random_state {
                m.random_state = v;
            }
            config.validate()?;
            run_train(&config, &dataset, &out, normal_only).await
        }

        Commands::Classify {
            pcap,
            model,
            q_interval,
            no_interval,
        } => {
            if q_interval.is_some() {
                config.capture.q_interval = q_interval;
            }
            if no_interval {
                config.capture.q_interval = None;
            }
            config.validate()?;
            run_classify(&config, &pcap, &model).await
        }

        Commands::InitConfig => Ok(()),
    }
}

/// Applies feature flags given on the command line over the loaded config.
fn override_features(
    config: &mut Config,
    feature_type: Option<FeatureType>,
    fft: Option<bool>,
    header: Option<bool>,
) {
    if let Some(v) = feature_type {
        config.features.feature_type = v;
    }
    if let Some(v) = fft {
        config.features.fft = v;
    }
    if let Some(v) = header {
        config.features.header = v;
    }
}

async fn run_extract(
    config: &Config,
    pcap: &Path,
    label_file: Option<&Path>,
    out: &Path,
) -> Result<()> {
    info!("Extracting {} features from {}", config.features.feature_type, pcap.display());

    let mut session = CaptureSession::new(pcap, config.parser_config())?;
    let n_flows = session.pcap2flows(config.capture.q_interval).await?.len();
    if n_flows == 0 {
        bail!("No flows with at least {} packets in {}", config.capture.flow_pkts_thres, pcap.display());
    }

    if let Some(path) = label_file {
        session.label_flows(path)?;
    }
    let label_counts = session.labels().map(|labels| LabelCounts::from_labels(labels));
    let packets = session.read_stats().map_or(0, |s| s.packets_read);

    let shape = session
        .flow2features(
            config.features.feature_type,
            config.features.fft,
            config.features.header,
        )?
        .dim();
    let schema = session
        .schema()
        .map(|s| s.to_string())
        .unwrap_or_default();
    let timings = session.timings().clone();

    let dataset = session.into_dataset()?;
    dump_data(&dataset, out).with_context(|| format!("Failed to save dataset to {}", out.display()))?;

    let report = ExtractionReport::new(
        pcap,
        out,
        packets,
        n_flows,
        shape,
        schema,
        label_counts,
        timings,
        Utc::now(),
    );
    println!("{}", export_report(&report, config.output.format));
    Ok(())
}

async fn run_train(config: &Config, dataset_path: &Path, out: &Path, normal_only: bool) -> Result<()> {
    let dataset: Dataset = load_data(dataset_path)
        .with_context(|| format!("Failed to load dataset from {}", dataset_path.display()))?;
    dataset.validate()?;
    let labels = dataset
        .labels
        .as_ref()
        .context("Dataset has no labels; re-run extract with --labels")?;

    let settings = &config.model;
    let split = train_test_split(
        &dataset.features,
        Some(labels),
        settings.test_size,
        settings.random_state,
    )?;
    let (y_train, y_test) = match (split.y_train, split.y_test) {
        (Some(train), Some(test)) => (train, test),
        _ => bail!("Split lost its labels"),
    };

    let x_train = if normal_only {
        let rows: Vec<usize> = y_train
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == NORMAL)
            .map(|(i, _)| i)
            .collect();
        if rows.is_empty() {
            bail!("No normal rows in the training partition");
        }
        info!("Training on {} normal rows of {}", rows.len(), y_train.len());
        split.x_train.select(Axis(0), &rows)
    } else {
        split.x_train
    };
    let x_test = split.x_test;

    let mut model = Model::new(settings.build_detector()?, settings.model_config());
    let model = tokio::task::spawn_blocking(move || -> Result<Model> {
        model.train(&x_train)?;
        if let Err(e) = model.test(&x_test, &y_test) {
            warn!("Evaluation skipped: {}", e);
        }
        Ok(model)
    })
    .await
    .context("Training task failed")??;

    match model.score() {
        Some(score) => info!(
            "{} trained, {} on test partition: {:.4}",
            model.detector().name(),
            settings.score_metric,
            score
        ),
        None => info!("{} trained without a test score", model.detector().name()),
    }

    let history = model.history().clone();
    let artifact = ModelArtifact::new(model, Some(dataset.schema.clone()));
    dump_data(&artifact, out).with_context(|| format!("Failed to save model to {}", out.display()))?;

    let report = TrainingReport::new(dataset_path, out, history);
    println!("{}", export_report(&report, config.output.format));
    Ok(())
}

async fn run_classify(config: &Config, pcap: &Path, model_path: &Path) -> Result<()> {
    let artifact: ModelArtifact = load_data(model_path)
        .with_context(|| format!("Failed to load model from {}", model_path.display()))?;
    let schema = artifact
        .schema
        .clone()
        .context("Model artifact carries no feature schema")?;
    info!(
        "Classifying {} with {} ({})",
        pcap.display(),
        artifact.detector.name(),
        schema
    );

    let mut session = CaptureSession::new(pcap, config.parser_config())?;
    if session.pcap2flows(config.capture.q_interval).await?.is_empty() {
        bail!("No flows with at least {} packets in {}", config.capture.flow_pkts_thres, pcap.display());
    }
    let features = session.flow2features_with_dim(&schema)?.clone();

    let detector = artifact.detector;
    let (detector, decision) = tokio::task::spawn_blocking(move || {
        let decision = detector.decision_function(&features);
        (detector, decision)
    })
    .await
    .context("Classification task failed")?;
    let decision = decision?;

    let keys = session.flows().unwrap_or_default().iter().map(|f| &f.key);
    let predictions: Vec<FlowPrediction> = keys
        .zip(decision.iter())
        .map(|(key, &d)| {
            let prediction = if d >= 0.0 { model::INLIER } else { model::OUTLIER };
            FlowPrediction::new(key, prediction, d)
        })
        .collect();

    let report = ClassificationReport::new(pcap, detector.name(), predictions, Utc::now());
    println!("{}", export_report(&report, config.output.format));
    Ok(())
}
