//! Flow assembly - the consumer side of flow ingestion.
//!
//! Packet events are grouped by 5-tuple in first-seen order. A flow is cut
//! when the idle gap between two of its packets exceeds the protocol timeout,
//! and only flows with at least `flow_pkts_thres` packets survive.
//!
//! The interval heuristic then bounds every flow to windows whose length is
//! a quantile of the observed flow durations, so that long-lived flows are
//! represented by comparable slices instead of one very long record.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::{FlowKey, PacketEvent, Protocol};
use crate::error::FeatureError;
use crate::stats::{quantile, timestamps_to_deltas};

/// A flow: packets sharing a key, in capture order.
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,
    pub packets: Vec<PacketEvent>,
}

impl Flow {
    pub fn new(event: PacketEvent) -> Self {
        Self {
            key: event.flow_key.clone(),
            packets: vec![event],
        }
    }

    pub fn add_event(&mut self, event: PacketEvent) {
        self.packets.push(event);
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Packet timestamps in seconds.
    pub fn timestamps_secs(&self) -> Vec<f64> {
        self.packets.iter().map(PacketEvent::timestamp_secs).collect()
    }

    /// Inter-arrival times in seconds.
    pub fn iats_secs(&self) -> Vec<f64> {
        timestamps_to_deltas(&self.timestamps_secs())
    }

    /// Packet sizes in bytes.
    pub fn sizes(&self) -> Vec<f64> {
        self.packets.iter().map(|p| f64::from(p.packet_size)).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.packets.iter().map(|p| u64::from(p.packet_size)).sum()
    }

    /// Time between first and last packet in seconds.
    pub fn duration_secs(&self) -> f64 {
        match (self.packets.first(), self.packets.last()) {
            (Some(first), Some(last)) => last.timestamp_secs() - first.timestamp_secs(),
            _ => 0.0,
        }
    }
}

/// Configuration for flow assembly.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Minimum packets for a flow to be kept (inclusive).
    pub flow_pkts_thres: usize,
    /// Idle gap (seconds) that ends a TCP flow.
    pub tcp_timeout_secs: f64,
    /// Idle gap (seconds) that ends a UDP or other flow.
    pub udp_timeout_secs: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            flow_pkts_thres: 2,
            tcp_timeout_secs: 600.0,
            udp_timeout_secs: 600.0,
        }
    }
}

impl FlowConfig {
    fn timeout_for(&self, protocol: Protocol) -> f64 {
        match protocol {
            Protocol::Tcp => self.tcp_timeout_secs,
            _ => self.udp_timeout_secs,
        }
    }
}

/// Groups packet events into flows.
pub struct FlowAssembler {
    config: FlowConfig,
    flows: Vec<Flow>,
    /// Index of the currently open flow for each key.
    open: HashMap<FlowKey, usize>,
    events_processed: u64,
}

impl FlowAssembler {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            flows: Vec::new(),
            open: HashMap::new(),
            events_processed: 0,
        }
    }

    /// Processes a single packet event.
    pub fn process_event(&mut self, event: PacketEvent) {
        self.events_processed += 1;
        let timeout = self.config.timeout_for(event.flow_key.protocol);

        if let Some(&idx) = self.open.get(&event.flow_key) {
            let flow = &mut self.flows[idx];
            let gap = flow
                .packets
                .last()
                .map(|last| event.timestamp_secs() - last.timestamp_secs())
                .unwrap_or(0.0);

            if gap <= timeout {
                flow.add_event(event);
                return;
            }
            debug!("Flow {} idle for {:.1}s, starting a new flow", flow.key, gap);
        }

        self.open.insert(event.flow_key.clone(), self.flows.len());
        self.flows.push(Flow::new(event));
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Returns all flows meeting the packet threshold, in first-seen order.
    pub fn finish(self) -> Vec<Flow> {
        let total = self.flows.len();
        let thres = self.config.flow_pkts_thres;
        let flows: Vec<Flow> = self
            .flows
            .into_iter()
            .filter(|f| f.packet_count() >= thres)
            .collect();

        info!(
            "Assembled {} flows from {} events ({} below threshold {})",
            flows.len(),
            self.events_processed,
            total - flows.len(),
            thres
        );
        flows
    }
}

/// Async task body: drains the channel and returns the assembled flows.
pub async fn collect_flows(mut rx: mpsc::Receiver<PacketEvent>, config: FlowConfig) -> Vec<Flow> {
    let mut assembler = FlowAssembler::new(config);

    while let Some(event) = rx.recv().await {
        assembler.process_event(event);
    }

    debug!("Packet channel closed after {} events", assembler.events_processed());
    assembler.finish()
}

/// Returns the `q` quantile of flow durations (seconds).
pub fn flows_duration_quantile(flows: &[Flow], q: f64) -> Result<f64, FeatureError> {
    let durations: Vec<f64> = flows.iter().map(Flow::duration_secs).collect();
    quantile(&durations, q)
}

/// Splits every flow into consecutive windows of `interval` seconds measured
/// from its first packet, keeping windows with at least `flow_pkts_thres`
/// packets.
pub fn flows_to_subflows(flows: Vec<Flow>, interval: f64, flow_pkts_thres: usize) -> Vec<Flow> {
    if !(interval > 0.0) {
        warn!("Non-positive interval {:.4}s, keeping flows unsplit", interval);
        return flows;
    }

    let before = flows.len();
    let mut subflows = Vec::new();

    for flow in flows {
        let start = match flow.packets.first() {
            Some(first) => first.timestamp_secs(),
            None => continue,
        };

        let mut current: Option<(i64, Flow)> = None;
        for packet in flow.packets {
            let window = ((packet.timestamp_secs() - start) / interval).floor() as i64;
            match current.as_mut() {
                Some((w, sub)) if *w == window => sub.add_event(packet),
                _ => {
                    if let Some((_, done)) = current.take() {
                        if done.packet_count() >= flow_pkts_thres {
                            subflows.push(done);
                        }
                    }
                    current = Some((window, Flow::new(packet)));
                }
            }
        }
        if let Some((_, done)) = current {
            if done.packet_count() >= flow_pkts_thres {
                subflows.push(done);
            }
        }
    }

    info!(
        "Split {} flows into {} subflows (interval {:.4}s)",
        before,
        subflows.len(),
        interval
    );
    subflows
}
