//! Export Module
//!
//! Renders the result of each command as text, pretty JSON or JSON Lines
//! so runs can be compared or fed to other tooling.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capture::FlowKey;
use crate::labels::ABNORMAL;
use crate::model::{TrainHistory, OUTLIER};
use crate::parser::StageTimings;

/// Output format for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonLines, // One JSON object per line (JSONL)
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" => Ok(Self::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::JsonLines => write!(f, "jsonl"),
        }
    }
}

/// A command result that can be exported.
pub trait Report: Serialize {
    fn to_text(&self) -> String;

    /// JSON Lines records. Defaults to the whole report on one line.
    fn to_json_lines(&self) -> Vec<String> {
        vec![to_json_line(self)]
    }
}

fn to_json_line<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Exports a report in the specified format
pub fn export_report<R: Report>(report: &R, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => report.to_text(),
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e)),
        OutputFormat::JsonLines => report.to_json_lines().join("\n"),
    }
}

/// Label counts of a dataset
#[derive(Debug, Clone, Serialize)]
pub struct LabelCounts {
    pub normal: usize,
    pub abnormal: usize,
}

impl LabelCounts {
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a u8>) -> Self {
        let (mut normal, mut abnormal) = (0, 0);
        for label in labels {
            if *label == ABNORMAL {
                abnormal += 1;
            } else {
                normal += 1;
            }
        }
        Self { normal, abnormal }
    }
}

/// Result of `extract`
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub version: &'static str,
    pub timestamp: String,
    pub pcap: String,
    pub output: String,
    pub packets: usize,
    pub flows: usize,
    pub rows: usize,
    pub cols: usize,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelCounts>,
    pub timings: StageTimings,
}

impl ExtractionReport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pcap: &Path,
        output: &Path,
        packets: usize,
        flows: usize,
        shape: (usize, usize),
        schema: String,
        labels: Option<LabelCounts>,
        timings: StageTimings,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            version: "1.0",
            timestamp: timestamp.to_rfc3339(),
            pcap: pcap.display().to_string(),
            output: output.display().to_string(),
            packets,
            flows,
            rows: shape.0,
            cols: shape.1,
            schema,
            labels,
            timings,
        }
    }
}

impl Report for ExtractionReport {
    fn to_text(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!(
            "--- Extraction Report ---\nTime: {}\nCapture: {} ({} packets)\nFlows: {}\nFeatures: {}x{} ({})\n",
            self.timestamp, self.pcap, self.packets, self.flows, self.rows, self.cols, self.schema
        ));
        if let Some(labels) = &self.labels {
            output.push_str(&format!(
                "Labels: {} normal, {} abnormal\n",
                labels.normal, labels.abnormal
            ));
        }
        output.push_str(&format_timings(&self.timings));
        output.push_str(&format!("Saved: {}\n", self.output));
        output
    }
}

fn format_timings(timings: &StageTimings) -> String {
    let stage = |secs: Option<f64>| match secs {
        Some(s) => format!("{:.3}s", s),
        None => "skipped".to_string(),
    };
    format!(
        "pcap2flows: {} | label_flows: {} | flow2features: {} | tot_time: {:.3}s\n",
        stage(timings.pcap2flows),
        stage(timings.label_flows),
        stage(timings.flow2features),
        timings.total()
    )
}

/// Result of `train`
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub version: &'static str,
    pub dataset: String,
    pub model: String,
    pub history: TrainHistory,
}

impl TrainingReport {
    pub fn new(dataset: &Path, model: &Path, history: TrainHistory) -> Self {
        Self {
            version: "1.0",
            dataset: dataset.display().to_string(),
            model: model.display().to_string(),
            history,
        }
    }
}

impl Report for TrainingReport {
    fn to_text(&self) -> String {
        let h = &self.history;
        let score = match h.score {
            Some(s) => format!("{:.4}", s),
            None => "N/A".to_string(),
        };
        format!(
            "--- Training Report ---\nDetector: {}\nDataset: {}\nTrain/Test: {} / {} rows, {} features\n\
             Train time: {:.3}s\nTest time: {:.3}s\n{}: {}\nSaved: {}\n",
            h.detector,
            self.dataset,
            h.n_train,
            h.n_test,
            h.n_features,
            h.train_time_secs,
            h.test_time_secs,
            h.score_metric,
            score,
            self.model
        )
    }
}

/// Prediction for one flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowPrediction {
    pub flow_key: String,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub protocol: String,
    pub prediction: i8,
    pub decision: f64,
}

impl FlowPrediction {
    pub fn new(key: &FlowKey, prediction: i8, decision: f64) -> Self {
        Self {
            flow_key: key.to_string(),
            src_ip: key.src_ip.to_string(),
            src_port: key.src_port,
            dst_ip: key.dst_ip.to_string(),
            dst_port: key.dst_port,
            protocol: key.protocol.to_string(),
            prediction,
            decision,
        }
    }
}

/// Result of `classify`
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationReport {
    pub version: &'static str,
    pub timestamp: String,
    pub pcap: String,
    pub detector: String,
    pub total_flows: usize,
    pub outlier_count: usize,
    pub flows: Vec<FlowPrediction>,
}

impl ClassificationReport {
    pub fn new(
        pcap: &Path,
        detector: &str,
        flows: Vec<FlowPrediction>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            version: "1.0",
            timestamp: timestamp.to_rfc3339(),
            pcap: pcap.display().to_string(),
            detector: detector.to_string(),
            total_flows: flows.len(),
            outlier_count: flows.iter().filter(|f| f.prediction == OUTLIER).count(),
            flows,
        }
    }
}

impl Report for ClassificationReport {
    fn to_text(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!(
            "--- Classification Report ---\nTime: {}\nCapture: {}\nDetector: {}\nFlows: {}\nOutliers: {}\n",
            self.timestamp, self.pcap, self.detector, self.total_flows, self.outlier_count
        ));

        if !self.flows.is_empty() {
            output.push('\n');
            output.push_str(&format!(
                "{:<60} {:>8} {:>12}\n",
                "Flow", "Result", "Decision"
            ));
            output.push_str(&"-".repeat(82));
            output.push('\n');
            for flow in &self.flows {
                let result = if flow.prediction == OUTLIER {
                    "OUTLIER"
                } else {
                    "normal"
                };
                output.push_str(&format!(
                    "{:<60} {:>8} {:>12.6}\n",
                    flow.flow_key, result, flow.decision
                ));
            }
        }

        output
    }

    /// Summary line followed by one line per flow
    fn to_json_lines(&self) -> Vec<String> {
        let summary = serde_json::json!({
            "type": "summary",
            "timestamp": self.timestamp,
            "pcap": self.pcap,
            "detector": self.detector,
            "total_flows": self.total_flows,
            "outlier_count": self.outlier_count,
        });

        let mut lines = vec![to_json_line(&summary)];
        lines.extend(self.flows.iter().map(|flow| to_json_line(flow)));
        lines
    }
}
