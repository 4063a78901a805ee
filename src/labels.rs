//! Ground-truth labels joined to flows by 5-tuple.
//!
//! The label file is a CSV with a header row:
//!
//! ```text
//! src_ip,src_port,dst_ip,dst_port,protocol,label
//! 192.168.1.10,51000,10.0.0.1,443,tcp,normal
//! ```
//!
//! A flow matches a row in either direction. Flows without a row are
//! labelled normal.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use ndarray::Array1;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::capture::{FlowKey, Protocol};
use crate::error::LabelError;
use crate::flow::Flow;

pub const NORMAL: u8 = 0;
pub const ABNORMAL: u8 = 1;

#[derive(Debug, Deserialize)]
struct LabelRecord {
    src_ip: String,
    src_port: u16,
    dst_ip: String,
    dst_port: u16,
    protocol: String,
    label: String,
}

/// Parses a label value: `0`, `normal` and `benign` are normal,
/// any other non-empty value is abnormal.
pub fn parse_label(value: &str) -> Option<u8> {
    match value.trim().to_lowercase().as_str() {
        "" => None,
        "0" | "normal" | "benign" => Some(NORMAL),
        _ => Some(ABNORMAL),
    }
}

fn parse_protocol(value: &str) -> Option<Protocol> {
    match value.trim().to_lowercase().as_str() {
        "tcp" => Some(Protocol::Tcp),
        "udp" => Some(Protocol::Udp),
        other => other.parse::<u8>().ok().map(Protocol::from_number),
    }
}

/// Lookup table from flow key to label.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    labels: HashMap<FlowKey, u8>,
}

impl LabelTable {
    /// Loads a label CSV.
    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let read_err = |source| LabelError::Read {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(read_err)?;

        let mut table = Self::default();
        for (idx, record) in reader.deserialize::<LabelRecord>().enumerate() {
            // Row numbers count the header as row 1
            let row = idx + 2;
            let record = record.map_err(read_err)?;
            let (key, label) = Self::parse_record(&record, row)?;
            if let Some(previous) = table.labels.insert(key.clone(), label) {
                if previous != label {
                    warn!("Conflicting labels for {}, keeping row {}", key, row);
                }
            }
        }

        info!("Loaded {} labels from {}", table.len(), path.display());
        Ok(table)
    }

    fn parse_record(record: &LabelRecord, row: usize) -> Result<(FlowKey, u8), LabelError> {
        let invalid = |reason: String| LabelError::InvalidRow { row, reason };

        let src_ip: IpAddr = record
            .src_ip
            .parse()
            .map_err(|_| invalid(format!("bad src_ip '{}'", record.src_ip)))?;
        let dst_ip: IpAddr = record
            .dst_ip
            .parse()
            .map_err(|_| invalid(format!("bad dst_ip '{}'", record.dst_ip)))?;
        let protocol = parse_protocol(&record.protocol)
            .ok_or_else(|| invalid(format!("bad protocol '{}'", record.protocol)))?;
        let label = parse_label(&record.label).ok_or_else(|| invalid("empty label".into()))?;

        Ok((
            FlowKey::new(src_ip, record.src_port, dst_ip, record.dst_port, protocol),
            label,
        ))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Label for a flow key, trying the reverse direction second.
    pub fn label_for(&self, key: &FlowKey) -> Option<u8> {
        self.labels
            .get(key)
            .or_else(|| self.labels.get(&key.reversed()))
            .copied()
    }
}

/// Labels each flow in order. Unmatched flows are normal.
pub fn label_flows(flows: &[Flow], table: &LabelTable) -> Array1<u8> {
    let mut unmatched = 0usize;
    let labels: Vec<u8> = flows
        .iter()
        .map(|flow| {
            table.label_for(&flow.key).unwrap_or_else(|| {
                debug!("No label for {}", flow.key);
                unmatched += 1;
                NORMAL
            })
        })
        .collect();

    let abnormal = labels.iter().filter(|l| **l == ABNORMAL).count();
    info!(
        "Labelled {} flows: {} abnormal, {} unmatched (treated as normal)",
        labels.len(),
        abnormal,
        unmatched
    );

    Array1::from(labels)
}
