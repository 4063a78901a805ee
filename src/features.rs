//! Feature extraction: turns flows into fixed-width numeric rows.
//!
//! # Schemes
//!
//! - `IAT`: inter-arrival times of the first packets.
//! - `SIZE`: sizes of the first packets.
//! - `IAT_SIZE`: both of the above, concatenated.
//! - `STATS`: 12 flow statistics (see [`STATS_NAMES`]).
//! - `SAMP_NUM` / `SAMP_SIZE`: packet counts / bytes per fixed time window.
//!
//! Sequence schemes share a width `n`, the floor of the `q_iat` quantile of
//! per-flow packet counts. Rows are truncated or zero-padded to that width
//! (`IAT` uses `n - 1`). The resolved width is stored in the
//! [`FeatureSchema`] so that later captures can be encoded identically.

use std::f64::consts::PI;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::tcp_flags;
use crate::error::FeatureError;
use crate::flow::Flow;
use crate::stats::{quantile, summarize};

/// Names of the `STATS` columns, in order.
pub const STATS_NAMES: [&str; 12] = [
    "duration",
    "pkts_rate",
    "bytes_rate",
    "mean",
    "std",
    "q1",
    "q2",
    "q3",
    "min",
    "max",
    "num_pkts",
    "num_bytes",
];

/// Number of header values prepended when `header` is enabled:
/// eight TCP flag counts followed by the mean TTL.
pub const HEADER_WIDTH: usize = 9;

/// Feature extraction scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureType {
    Iat,
    Size,
    IatSize,
    Stats,
    SampNum,
    SampSize,
}

impl FeatureType {
    /// True for schemes whose width follows the packet-count quantile.
    fn is_sequence(&self) -> bool {
        !matches!(self, Self::Stats)
    }
}

impl std::str::FromStr for FeatureType {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "IAT" => Ok(Self::Iat),
            "SIZE" => Ok(Self::Size),
            "IAT_SIZE" => Ok(Self::IatSize),
            "STATS" => Ok(Self::Stats),
            "SAMP_NUM" => Ok(Self::SampNum),
            "SAMP_SIZE" => Ok(Self::SampSize),
            _ => Err(FeatureError::UnknownFeatureType(s.to_string())),
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iat => write!(f, "IAT"),
            Self::Size => write!(f, "SIZE"),
            Self::IatSize => write!(f, "IAT_SIZE"),
            Self::Stats => write!(f, "STATS"),
            Self::SampNum => write!(f, "SAMP_NUM"),
            Self::SampSize => write!(f, "SAMP_SIZE"),
        }
    }
}

/// Everything needed to reproduce a feature layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub feature_type: FeatureType,
    pub fft: bool,
    pub header: bool,
    /// Packet-count width `n` of sequence schemes (12 for `STATS`).
    pub dim: usize,
    /// Window length in seconds for the sampling schemes.
    pub sampling_rate: Option<f64>,
}

impl FeatureSchema {
    /// Width of one feature row.
    pub fn width(&self) -> usize {
        let base = match self.feature_type {
            FeatureType::Iat => self.dim.saturating_sub(1),
            FeatureType::IatSize => (2 * self.dim).saturating_sub(1),
            FeatureType::Stats => STATS_NAMES.len(),
            FeatureType::Size | FeatureType::SampNum | FeatureType::SampSize => self.dim,
        };
        if self.header {
            base + HEADER_WIDTH
        } else {
            base
        }
    }
}

impl std::fmt::Display for FeatureSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (width {}, fft={}, header={})",
            self.feature_type,
            self.width(),
            self.fft,
            self.header
        )
    }
}

/// Features of a run, one row per flow.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub features: Array2<f64>,
    pub schema: FeatureSchema,
}

/// Configurable extractor for a feature scheme.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    feature_type: FeatureType,
    fft: bool,
    header: bool,
    q_iat: f64,
    fixed: Option<FeatureSchema>,
}

impl FeatureExtractor {
    pub fn new(feature_type: FeatureType) -> Self {
        Self {
            feature_type,
            fft: false,
            header: false,
            q_iat: 0.9,
            fixed: None,
        }
    }

    /// Builds an extractor that reproduces an existing layout exactly.
    pub fn from_schema(schema: &FeatureSchema) -> Self {
        Self {
            feature_type: schema.feature_type,
            fft: schema.fft,
            header: schema.header,
            q_iat: 0.9,
            fixed: Some(schema.clone()),
        }
    }

    pub fn fft(mut self, fft: bool) -> Self {
        self.fft = fft;
        self
    }

    pub fn header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    pub fn q_iat(mut self, q_iat: f64) -> Self {
        self.q_iat = q_iat;
        self
    }

    /// Resolves the layout for this set of flows.
    fn resolve_schema(&self, flows: &[Flow]) -> Result<FeatureSchema, FeatureError> {
        if let Some(schema) = &self.fixed {
            return Ok(schema.clone());
        }

        let dim = if self.feature_type.is_sequence() {
            let counts: Vec<f64> = flows.iter().map(|f| f.packet_count() as f64).collect();
            quantile(&counts, self.q_iat)?.floor() as usize
        } else {
            STATS_NAMES.len()
        };

        let sampling_rate = match self.feature_type {
            FeatureType::SampNum | FeatureType::SampSize if dim > 0 => {
                let durations: Vec<f64> = flows.iter().map(Flow::duration_secs).collect();
                Some(quantile(&durations, self.q_iat)? / dim as f64)
            }
            _ => None,
        };

        Ok(FeatureSchema {
            feature_type: self.feature_type,
            fft: self.fft,
            header: self.header,
            dim,
            sampling_rate,
        })
    }

    /// Extracts one row per flow.
    pub fn extract(&self, flows: &[Flow]) -> Result<FeatureMatrix, FeatureError> {
        if flows.is_empty() {
            return Err(FeatureError::NoFlows);
        }

        let schema = self.resolve_schema(flows)?;
        let width = schema.width();
        if width == header_len(&schema) {
            return Err(FeatureError::ZeroDimension(schema.feature_type.to_string()));
        }
        debug!("Resolved feature schema: {}", schema);

        let mut flat = Vec::with_capacity(flows.len() * width);
        for flow in flows {
            let mut row = if schema.header {
                header_row(flow).to_vec()
            } else {
                Vec::with_capacity(width)
            };
            let mut body = body_row(flow, &schema);
            if schema.fft {
                body = dft_magnitudes(&body);
            }
            row.extend(body);
            flat.extend(row);
        }

        let features = Array2::from_shape_vec((flows.len(), width), flat)?;
        info!(
            "Extracted {}x{} {} features",
            features.nrows(),
            features.ncols(),
            schema.feature_type
        );

        Ok(FeatureMatrix { features, schema })
    }
}

fn header_len(schema: &FeatureSchema) -> usize {
    if schema.header {
        HEADER_WIDTH
    } else {
        0
    }
}

/// Scheme-specific part of a row.
fn body_row(flow: &Flow, schema: &FeatureSchema) -> Vec<f64> {
    let n = schema.dim;
    match schema.feature_type {
        FeatureType::Iat => fix_width(&flow.iats_secs(), n.saturating_sub(1)),
        FeatureType::Size => fix_width(&flow.sizes(), n),
        FeatureType::IatSize => {
            let mut row = fix_width(&flow.iats_secs(), n.saturating_sub(1));
            row.extend(fix_width(&flow.sizes(), n));
            row
        }
        FeatureType::Stats => stats_row(flow),
        FeatureType::SampNum => sampled_row(flow, n, schema.sampling_rate.unwrap_or(0.0), false),
        FeatureType::SampSize => sampled_row(flow, n, schema.sampling_rate.unwrap_or(0.0), true),
    }
}

/// Truncates or zero-pads to `width`.
fn fix_width(values: &[f64], width: usize) -> Vec<f64> {
    let mut row: Vec<f64> = values.iter().copied().take(width).collect();
    row.resize(width, 0.0);
    row
}

fn stats_row(flow: &Flow) -> Vec<f64> {
    let sizes = flow.sizes();
    let summary = summarize(&sizes);
    let duration = flow.duration_secs();
    let num_pkts = flow.packet_count() as f64;
    let num_bytes = flow.total_bytes() as f64;
    let (pkts_rate, bytes_rate) = if duration > 0.0 {
        (num_pkts / duration, num_bytes / duration)
    } else {
        (0.0, 0.0)
    };

    vec![
        duration,
        pkts_rate,
        bytes_rate,
        summary.mean,
        summary.std_dev,
        summary.q1,
        summary.median,
        summary.q3,
        summary.min,
        summary.max,
        num_pkts,
        num_bytes,
    ]
}

/// Packet counts (or bytes) in `dim` windows of `rate` seconds from the
/// first packet. A packet exactly on the closing edge belongs to the last
/// window; packets past it are ignored.
fn sampled_row(flow: &Flow, dim: usize, rate: f64, by_bytes: bool) -> Vec<f64> {
    let mut row = vec![0.0; dim];
    let Some(start) = flow.packets.first().map(|p| p.timestamp_secs()) else {
        return row;
    };
    let end = rate * dim as f64;

    for packet in &flow.packets {
        let offset = packet.timestamp_secs() - start;
        let bin = if rate > 0.0 {
            let bin = (offset / rate).floor() as usize;
            if bin >= dim && offset - end <= 1e-9 {
                dim.saturating_sub(1)
            } else {
                bin
            }
        } else {
            0
        };
        if let Some(slot) = row.get_mut(bin) {
            *slot += if by_bytes {
                f64::from(packet.packet_size)
            } else {
                1.0
            };
        }
    }
    row
}

/// TCP flag counts (FIN, SYN, RST, PSH, ACK, URG, ECE, CWR) and mean TTL.
fn header_row(flow: &Flow) -> [f64; HEADER_WIDTH] {
    let mut row = [0.0; HEADER_WIDTH];
    for packet in &flow.packets {
        for (i, bit) in tcp_flags::ALL.iter().enumerate() {
            if packet.tcp_flags & bit != 0 {
                row[i] += 1.0;
            }
        }
        row[8] += f64::from(packet.ttl);
    }
    if !flow.packets.is_empty() {
        row[8] /= flow.packets.len() as f64;
    }
    row
}

/// Magnitudes of the discrete Fourier transform, same length as the input.
///
/// Direct O(n²) evaluation. Rows are at most `2 * dim - 1` wide, with `dim`
/// a packet-count quantile, which in practice stays in the tens.
fn dft_magnitudes(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    (0..n)
        .map(|k| {
            let (re, im) = values.iter().enumerate().fold((0.0, 0.0), |(re, im), (j, x)| {
                let angle = -2.0 * PI * (k * j) as f64 / n as f64;
                (re + x * angle.cos(), im + x * angle.sin())
            });
            (re * re + im * im).sqrt()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::capture::{FlowKey, PacketEvent, Protocol};

    fn flow(times: &[f64], size: u32, flags: u8) -> Flow {
        let key = FlowKey::new(
            "192.168.1.10".parse().unwrap(),
            1234,
            "10.0.0.1".parse().unwrap(),
            80,
            Protocol::Tcp,
        );
        let events: Vec<PacketEvent> = times
            .iter()
            .map(|t| PacketEvent {
                flow_key: key.clone(),
                timestamp: DateTime::from_timestamp(t.floor() as i64, ((t - t.floor()) * 1e9).round() as u32)
                    .unwrap(),
                packet_size: size,
                ttl: 64,
                tcp_flags: flags,
            })
            .collect();
        let mut iter = events.into_iter();
        let mut flow = Flow::new(iter.next().unwrap());
        for e in iter {
            flow.add_event(e);
        }
        flow
    }

    #[test]
    fn test_feature_type_parse() {
        assert_eq!("iat".parse::<FeatureType>().unwrap(), FeatureType::Iat);
        assert_eq!("IAT_SIZE".parse::<FeatureType>().unwrap(), FeatureType::IatSize);
        assert_eq!("samp-num".parse::<FeatureType>().unwrap(), FeatureType::SampNum);
        assert!("bogus".parse::<FeatureType>().is_err());
        assert_eq!(FeatureType::SampSize.to_string(), "SAMP_SIZE");
    }

    #[test]
    fn test_iat_features_fixed_width() {
        let flows = vec![
            flow(&[0.0, 1.0, 2.0, 3.0], 100, 0),
            flow(&[0.0, 0.5, 1.0, 1.5], 100, 0),
        ];
        let matrix = FeatureExtractor::new(FeatureType::Iat).extract(&flows).unwrap();

        // Every flow has 4 packets, so the width is 3 inter-arrival times
        assert_eq!(matrix.features.dim(), (2, 3));
        assert_eq!(matrix.schema.dim, 4);
        assert!((matrix.features[[0, 0]] - 1.0).abs() < 1e-6);
        assert!((matrix.features[[1, 2]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_width_ignores_single_long_flow() {
        let mut flows: Vec<Flow> = (0..9).map(|_| flow(&[0.0, 1.0], 100, 0)).collect();
        let long: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        flows.push(flow(&long, 100, 0));

        // 0.9 quantile of nine 2s and one 20 is 3.8
        let matrix = FeatureExtractor::new(FeatureType::Iat).extract(&flows).unwrap();
        assert_eq!(matrix.schema.dim, 3);
        assert_eq!(matrix.features.dim(), (10, 2));
        assert!((matrix.features[[9, 1]] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_fix_width_pads_and_truncates() {
        assert_eq!(fix_width(&[1.0, 2.0], 4), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(fix_width(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
    }

    #[test]
    fn test_schema_replay_pads_shorter_flows() {
        let schema = FeatureSchema {
            feature_type: FeatureType::Size,
            fft: false,
            header: false,
            dim: 5,
            sampling_rate: None,
        };
        let flows = vec![flow(&[0.0, 1.0], 60, 0)];
        let matrix = FeatureExtractor::from_schema(&schema).extract(&flows).unwrap();

        assert_eq!(matrix.features.dim(), (1, 5));
        assert_eq!(matrix.features.row(0).to_vec(), vec![60.0, 60.0, 0.0, 0.0, 0.0]);
        assert_eq!(matrix.schema, schema);
    }

    #[test]
    fn test_iat_size_width() {
        let flows = vec![flow(&[0.0, 1.0, 2.0], 100, 0)];
        let matrix = FeatureExtractor::new(FeatureType::IatSize).extract(&flows).unwrap();
        assert_eq!(matrix.features.ncols(), 5);
        assert_eq!(matrix.schema.width(), 5);
        assert_eq!(matrix.features[[0, 2]], 100.0);
    }

    #[test]
    fn test_stats_features() {
        let flows = vec![flow(&[0.0, 1.0, 2.0, 4.0], 100, 0)];
        let matrix = FeatureExtractor::new(FeatureType::Stats).extract(&flows).unwrap();
        let row = matrix.features.row(0);

        assert_eq!(row.len(), STATS_NAMES.len());
        assert!((row[0] - 4.0).abs() < 1e-6); // duration
        assert!((row[1] - 1.0).abs() < 1e-6); // 4 packets over 4s
        assert!((row[2] - 100.0).abs() < 1e-6); // 400 bytes over 4s
        assert_eq!(row[3], 100.0);
        assert_eq!(row[4], 0.0);
        assert_eq!(row[10], 4.0);
        assert_eq!(row[11], 400.0);
    }

    #[test]
    fn test_sampled_features() {
        let flows = vec![
            flow(&[0.0, 0.1, 0.2, 2.5], 10, 0),
            flow(&[0.0, 1.0, 2.0, 3.0], 10, 0),
        ];
        let matrix = FeatureExtractor::new(FeatureType::SampNum)
            .q_iat(1.0)
            .extract(&flows)
            .unwrap();

        // dim = 4 packets, duration quantile 3.0s -> 0.75s windows
        assert_eq!(matrix.features.dim(), (2, 4));
        assert_eq!(matrix.features.row(0).to_vec(), vec![3.0, 0.0, 0.0, 1.0]);
        assert_eq!(matrix.features.row(1).to_vec(), vec![1.0, 1.0, 1.0, 1.0]);

        let bytes = FeatureExtractor::new(FeatureType::SampSize)
            .q_iat(1.0)
            .extract(&flows)
            .unwrap();
        assert_eq!(bytes.features.row(0).to_vec(), vec![30.0, 0.0, 0.0, 10.0]);
    }

    #[test]
    fn test_header_features_prepended() {
        let flags = tcp_flags::SYN | tcp_flags::ACK;
        let flows = vec![flow(&[0.0, 1.0, 2.0], 100, flags)];
        let matrix = FeatureExtractor::new(FeatureType::Size)
            .header(true)
            .extract(&flows)
            .unwrap();
        let row = matrix.features.row(0);

        assert_eq!(row.len(), HEADER_WIDTH + 3);
        assert_eq!(row[0], 0.0); // FIN
        assert_eq!(row[1], 3.0); // SYN
        assert_eq!(row[4], 3.0); // ACK
        assert_eq!(row[8], 64.0); // mean TTL
        assert_eq!(row[9], 100.0);
    }

    #[test]
    fn test_fft_magnitudes() {
        let mags = dft_magnitudes(&[1.0, 1.0, 1.0, 1.0]);
        assert!((mags[0] - 4.0).abs() < 1e-9);
        for m in &mags[1..] {
            assert!(m.abs() < 1e-9);
        }

        let flows = vec![flow(&[0.0, 1.0, 2.0], 100, 0)];
        let matrix = FeatureExtractor::new(FeatureType::Size)
            .fft(true)
            .extract(&flows)
            .unwrap();
        assert!((matrix.features[[0, 0]] - 300.0).abs() < 1e-6);
    }

    #[test]
    fn test_extract_errors() {
        assert!(matches!(
            FeatureExtractor::new(FeatureType::Iat).extract(&[]),
            Err(FeatureError::NoFlows)
        ));

        // One packet per flow leaves no inter-arrival time
        let flows = vec![flow(&[0.0], 100, 0)];
        assert!(matches!(
            FeatureExtractor::new(FeatureType::Iat).extract(&flows),
            Err(FeatureError::ZeroDimension(_))
        ));
    }
}
