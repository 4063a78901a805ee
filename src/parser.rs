//! Capture session: one pcap file driven through flows, labels and features.
//!
//! # Pipeline
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ PcapReader  │────>│ collect_    │────>│ label_flows │────>│ Feature-    │
//! │ (pcap file) │ ch  │ flows       │     │ (csv join)  │     │ Extractor   │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!     Thread              Async              Sync                Sync
//! ```
//!
//! Stages must run in order: `pcap2flows`, then optionally `label_flows`,
//! then `flow2features`. Each stage records its wall-clock time.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::capture::{FlowKey, PcapReader, ReadConfig, ReadStats};
use crate::error::{CaptureError, FeatureError, PipelineError, Result};
use crate::features::{FeatureExtractor, FeatureMatrix, FeatureSchema, FeatureType};
use crate::flow::{collect_flows, flows_duration_quantile, flows_to_subflows, Flow, FlowConfig};
use crate::labels::{self, LabelTable};

/// Settings for a capture session.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Minimum packets per flow (inclusive).
    pub flow_pkts_thres: usize,
    /// Seed for flow subsampling.
    pub random_state: u64,
    /// Keep at most this many flows (0 = all).
    pub max_flows: usize,
    pub tcp_timeout_secs: f64,
    pub udp_timeout_secs: f64,
    /// Quantile of packet counts used for sequence feature widths.
    pub q_iat: f64,
    /// Channel buffer between the reader thread and the flow assembler.
    pub channel_size: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            flow_pkts_thres: 2,
            random_state: 42,
            max_flows: 0,
            tcp_timeout_secs: 600.0,
            udp_timeout_secs: 600.0,
            q_iat: 0.9,
            channel_size: 10_000,
        }
    }
}

/// Wall-clock seconds spent in each stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub pcap2flows: Option<f64>,
    pub label_flows: Option<f64>,
    pub flow2features: Option<f64>,
}

impl StageTimings {
    pub fn total(&self) -> f64 {
        [self.pcap2flows, self.label_flows, self.flow2features]
            .iter()
            .flatten()
            .sum()
    }
}

/// Features, labels and the flows they came from, persisted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub features: Array2<f64>,
    pub labels: Option<Array1<u8>>,
    pub schema: FeatureSchema,
    pub flow_keys: Vec<FlowKey>,
}

impl Dataset {
    /// Checks that labels and flow keys line up with feature rows.
    pub fn validate(&self) -> std::result::Result<(), FeatureError> {
        let (rows, cols) = self.features.dim();
        let width = self.schema.width();
        let labels = self.labels.as_ref().map_or(rows, |l| l.len());
        let keys = self.flow_keys.len();
        if cols != width || labels != rows || keys != rows {
            return Err(FeatureError::Misaligned {
                rows,
                cols,
                width,
                labels,
                keys,
            });
        }
        Ok(())
    }
}

impl Artifact for Dataset {
    const KIND: &'static str = "dataset";
}

/// One pcap file and the results of each stage run on it.
pub struct CaptureSession {
    path: PathBuf,
    config: ParserConfig,
    flows: Option<Vec<Flow>>,
    labels: Option<Array1<u8>>,
    features: Option<FeatureMatrix>,
    read_stats: Option<ReadStats>,
    timings: StageTimings,
}

impl CaptureSession {
    pub fn new(path: impl AsRef<Path>, config: ParserConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(CaptureError::NotFound(path).into());
        }
        if !(0.0..=1.0).contains(&config.q_iat) {
            return Err(FeatureError::InvalidQuantile(config.q_iat).into());
        }
        if config.flow_pkts_thres == 0 {
            bail!("flow_pkts_thres must be at least 1");
        }

        Ok(Self {
            path,
            config,
            flows: None,
            labels: None,
            features: None,
            read_stats: None,
            timings: StageTimings::default(),
        })
    }

    /// Reads the capture into flows. With `q_interval`, each flow is further
    /// cut into windows as long as that quantile of flow durations.
    pub async fn pcap2flows(&mut self, q_interval: Option<f64>) -> Result<&[Flow]> {
        let start = Instant::now();

        let reader = PcapReader::new(
            &self.path,
            ReadConfig {
                channel_size: self.config.channel_size,
                ..Default::default()
            },
        );
        let (rx, handle) = reader.start()?;
        let flow_config = FlowConfig {
            flow_pkts_thres: self.config.flow_pkts_thres,
            tcp_timeout_secs: self.config.tcp_timeout_secs,
            udp_timeout_secs: self.config.udp_timeout_secs,
        };
        let mut flows = collect_flows(rx, flow_config).await;

        // The channel is closed, so the reader has returned or is returning
        let stats = tokio::task::spawn_blocking(move || handle.join())
            .await
            .context("Failed to join reader task")?
            .map_err(|_| CaptureError::ReaderPanicked)??;
        info!(
            "Read {} packets from {} ({} decoded, {} skipped)",
            stats.packets_read,
            self.path.display(),
            stats.events_sent,
            stats.packets_skipped
        );
        self.read_stats = Some(stats);

        if self.config.max_flows > 0 && flows.len() > self.config.max_flows {
            flows = subsample(flows, self.config.max_flows, self.config.random_state);
        }

        if let Some(q) = q_interval {
            if flows.is_empty() {
                warn!("No flows to split into intervals");
            } else {
                let interval = flows_duration_quantile(&flows, q)?;
                debug!("Interval from q_interval={}: {:.4}s", q, interval);
                flows = flows_to_subflows(flows, interval, self.config.flow_pkts_thres);
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        self.timings.pcap2flows = Some(elapsed);
        info!("pcap2flows: {} flows, tot_time: {:.3}s", flows.len(), elapsed);

        // Earlier labels and features describe a different flow set
        self.labels = None;
        self.features = None;
        Ok(self.flows.insert(flows).as_slice())
    }

    /// Joins ground-truth labels from a CSV file onto the flows.
    pub fn label_flows(&mut self, label_file: &Path) -> Result<&Array1<u8>> {
        let flows = self.flows.as_ref().ok_or(PipelineError::StageOrder {
            stage: "label_flows",
            requires: "pcap2flows",
        })?;

        let start = Instant::now();
        let table = LabelTable::load(label_file)?;
        let labels = labels::label_flows(flows, &table);

        let elapsed = start.elapsed().as_secs_f64();
        self.timings.label_flows = Some(elapsed);
        info!("label_flows: {} labels, tot_time: {:.3}s", labels.len(), elapsed);

        Ok(self.labels.insert(labels))
    }

    /// Extracts one feature row per flow, resolving the width from the data.
    pub fn flow2features(
        &mut self,
        feat_type: FeatureType,
        fft: bool,
        header: bool,
    ) -> Result<&Array2<f64>> {
        let extractor = FeatureExtractor::new(feat_type)
            .fft(fft)
            .header(header)
            .q_iat(self.config.q_iat);
        self.run_extractor("flow2features", extractor)
    }

    /// Extracts features at a fixed layout, so rows line up with a model
    /// trained on another capture.
    pub fn flow2features_with_dim(&mut self, schema: &FeatureSchema) -> Result<&Array2<f64>> {
        self.run_extractor("flow2features_with_dim", FeatureExtractor::from_schema(schema))
    }

    fn run_extractor(
        &mut self,
        stage: &'static str,
        extractor: FeatureExtractor,
    ) -> Result<&Array2<f64>> {
        let flows = self.flows.as_ref().ok_or(PipelineError::StageOrder {
            stage,
            requires: "pcap2flows",
        })?;

        let start = Instant::now();
        let matrix = extractor.extract(flows)?;

        let elapsed = start.elapsed().as_secs_f64();
        self.timings.flow2features = Some(elapsed);
        info!(
            "{}: {}x{} ({}), tot_time: {:.3}s",
            stage,
            matrix.features.nrows(),
            matrix.features.ncols(),
            matrix.schema,
            elapsed
        );

        Ok(&self.features.insert(matrix).features)
    }

    pub fn flows(&self) -> Option<&[Flow]> {
        self.flows.as_deref()
    }

    pub fn labels(&self) -> Option<&Array1<u8>> {
        self.labels.as_ref()
    }

    #[allow(dead_code)] // Available for callers that keep the session
    pub fn features(&self) -> Option<&Array2<f64>> {
        self.features.as_ref().map(|m| &m.features)
    }

    pub fn schema(&self) -> Option<&FeatureSchema> {
        self.features.as_ref().map(|m| &m.schema)
    }

    pub fn read_stats(&self) -> Option<&ReadStats> {
        self.read_stats.as_ref()
    }

    pub fn timings(&self) -> &StageTimings {
        &self.timings
    }

    /// Packages features, labels and flow keys for persistence.
    pub fn into_dataset(self) -> Result<Dataset> {
        let matrix = self.features.ok_or(PipelineError::StageOrder {
            stage: "into_dataset",
            requires: "flow2features",
        })?;
        let flow_keys = self
            .flows
            .unwrap_or_default()
            .into_iter()
            .map(|f| f.key)
            .collect();

        let dataset = Dataset {
            features: matrix.features,
            labels: self.labels,
            schema: matrix.schema,
            flow_keys,
        };
        dataset.validate()?;
        Ok(dataset)
    }
}

/// Keeps `n` flows chosen with a seeded RNG, preserving capture order.
fn subsample(flows: Vec<Flow>, n: usize, random_state: u64) -> Vec<Flow> {
    let total = flows.len();
    let mut rng = StdRng::seed_from_u64(random_state);
    let mut keep = rand::seq::index::sample(&mut rng, total, n).into_vec();
    keep.sort_unstable();

    let mut keep = keep.into_iter().peekable();
    let sampled: Vec<Flow> = flows
        .into_iter()
        .enumerate()
        .filter_map(|(i, flow)| {
            if keep.peek() == Some(&i) {
                keep.next();
                Some(flow)
            } else {
                None
            }
        })
        .collect();

    info!("Subsampled {} of {} flows (seed {})", sampled.len(), total, random_state);
    sampled
}
