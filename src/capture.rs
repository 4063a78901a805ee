//! Packet capture module - the producer side of flow ingestion.
//!
//! Reads pcap and pcapng files in a dedicated thread and extracts the
//! per-packet metadata (FlowKey, timestamp, wire length, TTL, TCP flags)
//! needed downstream. Container decoding is done by `pcap-parser`, header
//! slicing by `etherparse`.

use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_parser::{Block, PcapBlockOwned, PcapError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::CaptureError;

/// Unique identifier for a network flow.
/// Composed of the classic 5-tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            protocol,
        }
    }

    /// Returns the key of the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.protocol
        )
    }
}

/// Transport layer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl Protocol {
    /// Maps an IP protocol number to a Protocol.
    pub fn from_number(number: u8) -> Self {
        match number {
            6 => Self::Tcp,
            17 => Self::Udp,
            n => Self::Other(n),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Other(n) => write!(f, "PROTO:{}", n),
        }
    }
}

/// TCP flag bits as laid out in the TCP header.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    /// All flags in header bit order.
    pub const ALL: [u8; 8] = [FIN, SYN, RST, PSH, ACK, URG, ECE, CWR];
}

/// Minimal metadata extracted from each packet.
/// This is what gets sent over the channel to the flow assembler.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub flow_key: FlowKey,
    pub timestamp: DateTime<Utc>,
    /// Length on the wire (not the captured length).
    pub packet_size: u32,
    /// IPv4 TTL or IPv6 hop limit.
    pub ttl: u8,
    /// TCP flags byte, 0 for non-TCP packets.
    pub tcp_flags: u8,
}

impl PacketEvent {
    /// Timestamp as fractional seconds since the epoch.
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp.timestamp() as f64
            + f64::from(self.timestamp.timestamp_subsec_nanos()) * 1e-9
    }
}

/// Link-layer framing of captured packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// BSD loopback: 4-byte address family before the IP header.
    Null,
    /// Raw IPv4 or IPv6 without link header.
    RawIp,
    /// Linux cooked capture (16-byte header).
    LinuxSll,
    Unsupported(i32),
}

impl LinkType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Null,
            1 => Self::Ethernet,
            101 | 228 | 229 => Self::RawIp,
            113 => Self::LinuxSll,
            other => Self::Unsupported(other),
        }
    }
}

/// Parses a raw frame and extracts flow metadata.
/// Returns None if the frame cannot be parsed, is not IP-based, or is a
/// non-initial IP fragment whose ports are unknown.
pub fn parse_packet(
    data: &[u8],
    link_type: LinkType,
    timestamp: DateTime<Utc>,
    wire_len: u32,
) -> Option<PacketEvent> {
    let sliced = match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkType::Null => SlicedPacket::from_ip(data.get(4..)?).ok()?,
        LinkType::LinuxSll => SlicedPacket::from_ip(data.get(16..)?).ok()?,
        LinkType::Unsupported(_) => return None,
    };

    let (src_ip, dst_ip, ttl, ip_number) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                IpAddr::from(header.source()),
                IpAddr::from(header.destination()),
                header.ttl(),
                header.protocol().0,
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::from(header.source()),
                IpAddr::from(header.destination()),
                header.hop_limit(),
                header.next_header().0,
            )
        }
        _ => return None,
    };

    let (src_port, dst_port, protocol, flags) = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            let mut flags = 0u8;
            for (set, bit) in [
                (tcp.fin(), tcp_flags::FIN),
                (tcp.syn(), tcp_flags::SYN),
                (tcp.rst(), tcp_flags::RST),
                (tcp.psh(), tcp_flags::PSH),
                (tcp.ack(), tcp_flags::ACK),
                (tcp.urg(), tcp_flags::URG),
                (tcp.ece(), tcp_flags::ECE),
                (tcp.cwr(), tcp_flags::CWR),
            ] {
                if set {
                    flags |= bit;
                }
            }
            (
                tcp.source_port(),
                tcp.destination_port(),
                Protocol::Tcp,
                flags,
            )
        }
        Some(TransportSlice::Udp(udp)) => {
            (udp.source_port(), udp.destination_port(), Protocol::Udp, 0)
        }
        Some(_) => (0, 0, Protocol::from_number(ip_number), 0),
        None => match Protocol::from_number(ip_number) {
            // Fragment without a transport header
            Protocol::Tcp | Protocol::Udp => return None,
            other => (0, 0, other, 0),
        },
    };

    let flow_key = FlowKey::new(src_ip, src_port, dst_ip, dst_port, protocol);

    trace!("Parsed: {} size={} flags={:#04x}", flow_key, wire_len, flags);

    Some(PacketEvent {
        flow_key,
        timestamp,
        packet_size: wire_len,
        ttl,
        tcp_flags: flags,
    })
}

/// Configuration for reading a capture file.
#[derive(Debug, Clone)]
pub struct ReadConfig {
    /// Channel buffer size for packet events.
    pub channel_size: usize,
    /// Maximum packets to read (0 = unlimited).
    pub max_packets: usize,
    /// Read buffer capacity handed to the pcap parser.
    pub buffer_size: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            channel_size: 10_000,
            max_packets: 0,
            buffer_size: 1 << 18,
        }
    }
}

/// Statistics from reading a capture file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub packets_read: usize,
    pub events_sent: usize,
    pub packets_skipped: usize,
}

/// Handle to the reader thread, resolving to its statistics.
pub type ReaderHandle = JoinHandle<Result<ReadStats, CaptureError>>;

/// Capture file reader.
/// Runs in a dedicated thread and sends PacketEvents to the flow assembler.
pub struct PcapReader {
    path: PathBuf,
    config: ReadConfig,
}

impl PcapReader {
    pub fn new(path: impl AsRef<Path>, config: ReadConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
        }
    }

    /// Starts reading in a background thread.
    /// Returns a receiver for PacketEvents and the thread handle.
    pub fn start(self) -> Result<(mpsc::Receiver<PacketEvent>, ReaderHandle), CaptureError> {
        if !self.path.exists() {
            return Err(CaptureError::NotFound(self.path));
        }

        let (tx, rx) = mpsc::channel(self.config.channel_size.max(1));
        let path = self.path.clone();
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("pcap-reader".into())
            .spawn(move || {
                let result = read_capture(&path, &tx, &config);
                if let Err(e) = &result {
                    warn!("Reader thread error: {}", e);
                }
                debug!("Reader thread terminated");
                result
            })?;

        Ok((rx, handle))
    }
}

/// Link type and timestamp unit of one pcapng interface.
#[derive(Debug, Clone, Copy)]
struct Interface {
    link_type: LinkType,
    units_per_sec: u64,
}

impl Interface {
    fn new(link_code: i32, tsresol: u8) -> Self {
        Self {
            link_type: LinkType::from_code(link_code),
            units_per_sec: units_per_second(tsresol),
        }
    }
}

/// Decodes the pcapng `if_tsresol` option into timestamp units per second.
fn units_per_second(tsresol: u8) -> u64 {
    let exponent = u32::from(tsresol & 0x7f);
    let units = if tsresol & 0x80 == 0 {
        10u64.checked_pow(exponent)
    } else {
        1u64.checked_shl(exponent)
    };
    units.filter(|u| *u > 0).unwrap_or(1_000_000)
}

fn timestamp_from_units(ts: u64, units_per_sec: u64) -> Option<DateTime<Utc>> {
    let secs = ts / units_per_sec;
    let frac = ts % units_per_sec;
    let nanos = (u128::from(frac) * 1_000_000_000 / u128::from(units_per_sec)) as u32;
    DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
}

/// Reads a capture file, parsing packets and sending PacketEvents.
fn read_capture(
    path: &Path,
    tx: &mpsc::Sender<PacketEvent>,
    config: &ReadConfig,
) -> Result<ReadStats, CaptureError> {
    let file = File::open(path).map_err(|source| CaptureError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut reader =
        pcap_parser::create_reader(config.buffer_size, file).map_err(|e| CaptureError::Format {
            path: path.to_path_buf(),
            reason: format!("{:?}", e),
        })?;

    info!("Reading capture file: {}", path.display());

    let mut stats = ReadStats::default();
    // Legacy pcap: (link type, nanosecond precision)
    let mut legacy: Option<(LinkType, bool)> = None;
    let mut interfaces: Vec<Interface> = Vec::new();
    let mut stalled = false;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                stalled = false;
                let decoded = match block {
                    PcapBlockOwned::LegacyHeader(header) => {
                        let nanos = matches!(header.magic_number, 0xa1b2_3c4d | 0x4d3c_b2a1);
                        legacy = Some((LinkType::from_code(header.network.0), nanos));
                        debug!("Legacy pcap header: linktype={} nanos={}", header.network.0, nanos);
                        None
                    }
                    PcapBlockOwned::Legacy(packet) => {
                        let (link_type, nanos) = legacy.unwrap_or((LinkType::Ethernet, false));
                        let sub = if nanos {
                            packet.ts_usec
                        } else {
                            packet.ts_usec.saturating_mul(1000)
                        };
                        let ts = DateTime::from_timestamp(i64::from(packet.ts_sec), sub);
                        let caplen = (packet.caplen as usize).min(packet.data.len());
                        Some(ts.and_then(|ts| {
                            parse_packet(&packet.data[..caplen], link_type, ts, packet.origlen)
                        }))
                    }
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        interfaces.clear();
                        None
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        interfaces.push(Interface::new(idb.linktype.0, idb.if_tsresol));
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        match interfaces.get(epb.if_id as usize) {
                            Some(interface) => {
                                let ts = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                                let caplen = (epb.caplen as usize).min(epb.data.len());
                                Some(
                                    timestamp_from_units(ts, interface.units_per_sec).and_then(
                                        |ts| {
                                            parse_packet(
                                                &epb.data[..caplen],
                                                interface.link_type,
                                                ts,
                                                epb.origlen,
                                            )
                                        },
                                    ),
                                )
                            }
                            None => {
                                warn!("Packet references unknown interface {}", epb.if_id);
                                Some(None)
                            }
                        }
                    }
                    // Simple packet blocks carry no timestamp
                    PcapBlockOwned::NG(Block::SimplePacket(_)) => Some(None),
                    PcapBlockOwned::NG(_) => None,
                };
                reader.consume(offset);

                let Some(event) = decoded else {
                    continue;
                };
                stats.packets_read += 1;

                match event {
                    Some(event) => {
                        if tx.blocking_send(event).is_err() {
                            debug!("Receiver dropped, stopping read");
                            break;
                        }
                        stats.events_sent += 1;
                    }
                    None => stats.packets_skipped += 1,
                }

                if config.max_packets > 0 && stats.packets_read >= config.max_packets {
                    info!("Reached max packets limit: {}", config.max_packets);
                    break;
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                if stalled {
                    warn!("Capture file is truncated, stopping read");
                    break;
                }
                stalled = true;
                reader
                    .refill()
                    .map_err(|e| CaptureError::Parse(format!("{:?}", e)))?;
            }
            Err(e) => return Err(CaptureError::Parse(format!("{:?}", e))),
        }
    }

    info!(
        "Read complete: {} packets, {} events sent, {} skipped",
        stats.packets_read, stats.events_sent, stats.packets_skipped
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, FrameSpec};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_flow_key_equality() {
        let key1 = FlowKey::new(
            "192.168.1.1".parse().unwrap(),
            40000,
            "10.0.0.1".parse().unwrap(),
            443,
            Protocol::Tcp,
        );
        let key2 = key1.clone();
        let key3 = FlowKey::new(
            "192.168.1.1".parse().unwrap(),
            40001,
            "10.0.0.1".parse().unwrap(),
            443,
            Protocol::Tcp,
        );

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_flow_key_display_and_reverse() {
        let key = FlowKey::new(
            "192.168.1.1".parse().unwrap(),
            40000,
            "10.0.0.1".parse().unwrap(),
            443,
            Protocol::Tcp,
        );

        assert_eq!(key.to_string(), "192.168.1.1:40000 -> 10.0.0.1:443 (TCP)");

        let rev = key.reversed();
        assert_eq!(rev.src_port, 443);
        assert_eq!(rev.dst_ip, key.src_ip);
        assert_eq!(rev.reversed(), key);
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(format!("{}", Protocol::Tcp), "TCP");
        assert_eq!(format!("{}", Protocol::Udp), "UDP");
        assert_eq!(format!("{}", Protocol::Other(1)), "PROTO:1");
        assert_eq!(Protocol::from_number(17), Protocol::Udp);
        assert_eq!(Protocol::from_number(47), Protocol::Other(47));
    }

    #[test]
    fn test_parse_tcp_frame() {
        let frame = testutil::frame(&FrameSpec::tcp("192.168.1.10", 51000, "10.0.0.1", 443).syn());
        let event = parse_packet(&frame, LinkType::Ethernet, ts(100), frame.len() as u32).unwrap();

        assert_eq!(event.flow_key.protocol, Protocol::Tcp);
        assert_eq!(event.flow_key.src_port, 51000);
        assert_eq!(event.flow_key.dst_port, 443);
        assert_eq!(event.ttl, 64);
        assert_eq!(event.tcp_flags & tcp_flags::SYN, tcp_flags::SYN);
        assert_eq!(event.tcp_flags & tcp_flags::ACK, 0);
        assert_eq!(event.packet_size, frame.len() as u32);
    }

    #[test]
    fn test_parse_udp_frame() {
        let frame = testutil::frame(&FrameSpec::udp("192.168.1.10", 5353, "10.0.0.53", 53));
        let event = parse_packet(&frame, LinkType::Ethernet, ts(5), 99).unwrap();

        assert_eq!(event.flow_key.protocol, Protocol::Udp);
        assert_eq!(event.flow_key.dst_port, 53);
        assert_eq!(event.tcp_flags, 0);
        assert_eq!(event.packet_size, 99);
    }

    #[test]
    fn test_parse_raw_ip_frame() {
        let frame = testutil::raw_ip_frame(&FrameSpec::udp("10.1.1.1", 1000, "10.2.2.2", 2000));
        let event = parse_packet(&frame, LinkType::RawIp, ts(1), frame.len() as u32).unwrap();
        assert_eq!(event.flow_key.src_port, 1000);
        assert!(parse_packet(&frame, LinkType::Unsupported(147), ts(1), 0).is_none());
    }

    #[test]
    fn test_parse_linux_cooked_frame() {
        let ip = testutil::raw_ip_frame(&FrameSpec::tcp("10.1.1.1", 1000, "10.2.2.2", 22));
        // packet type, ARPHRD_ETHER, address length, address, protocol
        let mut frame = vec![0x00, 0x00, 0x00, 0x01, 0x00, 0x06];
        frame.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]);
        frame.extend_from_slice(&[0x08, 0x00]);
        assert_eq!(frame.len(), 16);
        frame.extend_from_slice(&ip);

        let event = parse_packet(&frame, LinkType::from_code(113), ts(1), frame.len() as u32).unwrap();
        assert_eq!(event.flow_key.protocol, Protocol::Tcp);
        assert_eq!(event.flow_key.src_ip, "10.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(event.flow_key.dst_port, 22);

        // Shorter than the cooked header
        assert!(parse_packet(&frame[..10], LinkType::LinuxSll, ts(1), 10).is_none());
    }

    #[test]
    fn test_parse_null_loopback_frame() {
        let ip = testutil::raw_ip_frame(&FrameSpec::udp("127.0.0.1", 5000, "127.0.0.1", 6000));
        // AF_INET in host byte order
        let mut frame = 2u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&ip);

        let event = parse_packet(&frame, LinkType::from_code(0), ts(1), frame.len() as u32).unwrap();
        assert_eq!(event.flow_key.protocol, Protocol::Udp);
        assert_eq!(event.flow_key.src_port, 5000);
        assert_eq!(event.flow_key.dst_port, 6000);

        assert!(parse_packet(&frame[..3], LinkType::Null, ts(1), 3).is_none());
    }

    #[test]
    fn test_parse_non_ip_frame() {
        // Ethernet header announcing ARP followed by junk
        let mut frame = vec![0xffu8; 12];
        frame.extend_from_slice(&[0x08, 0x06]);
        frame.extend_from_slice(&[0u8; 28]);
        assert!(parse_packet(&frame, LinkType::Ethernet, ts(1), 42).is_none());
    }

    #[test]
    fn test_units_per_second() {
        assert_eq!(units_per_second(6), 1_000_000);
        assert_eq!(units_per_second(9), 1_000_000_000);
        assert_eq!(units_per_second(0x80 | 10), 1024);
    }

    #[test]
    fn test_timestamp_from_units() {
        let ts = timestamp_from_units(1_500_250_000, 1_000_000).unwrap();
        assert_eq!(ts.timestamp(), 1500);
        assert_eq!(ts.timestamp_subsec_micros(), 250_000);
    }

    #[tokio::test]
    async fn test_reader_legacy_pcap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        let spec = FrameSpec::tcp("192.168.1.10", 51000, "10.0.0.1", 443);
        testutil::write_pcap(
            &path,
            &[
                (1.0, testutil::frame(&spec)),
                (1.5, testutil::frame(&spec)),
                (2.0, vec![0u8; 10]),
            ],
        );

        let (mut rx, handle) = PcapReader::new(&path, ReadConfig::default()).start().unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let stats = handle.join().unwrap().unwrap();

        assert_eq!(events.len(), 2);
        assert!((events[1].timestamp_secs() - 1.5).abs() < 1e-6);
        assert_eq!(
            stats,
            ReadStats {
                packets_read: 3,
                events_sent: 2,
                packets_skipped: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_reader_pcapng() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcapng");
        let spec = FrameSpec::udp("192.168.1.10", 5353, "10.0.0.53", 53);
        testutil::write_pcapng(
            &path,
            &[(10.25, testutil::frame(&spec)), (11.0, testutil::frame(&spec))],
        );

        let (mut rx, handle) = PcapReader::new(&path, ReadConfig::default()).start().unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        handle.join().unwrap().unwrap();

        assert_eq!(events.len(), 2);
        assert!((events[0].timestamp_secs() - 10.25).abs() < 1e-6);
        assert_eq!(events[0].flow_key.protocol, Protocol::Udp);
    }

    #[tokio::test]
    async fn test_reader_pcapng_nanosecond_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture-ns.pcapng");
        let spec = FrameSpec::tcp("192.168.1.10", 51000, "10.0.0.1", 443);
        testutil::write_pcapng_with_tsresol(
            &path,
            9,
            &[
                (10_250_000_123, testutil::frame(&spec)),
                (11_000_000_001, testutil::frame(&spec)),
            ],
        );

        let (mut rx, handle) = PcapReader::new(&path, ReadConfig::default()).start().unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        handle.join().unwrap().unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp.timestamp(), 10);
        assert_eq!(events[0].timestamp.timestamp_subsec_nanos(), 250_000_123);
        assert_eq!(events[1].timestamp.timestamp(), 11);
        assert_eq!(events[1].timestamp.timestamp_subsec_nanos(), 1);
    }

    #[test]
    fn test_reader_missing_file() {
        let result = PcapReader::new("/nonexistent/capture.pcap", ReadConfig::default()).start();
        assert!(matches!(result, Err(CaptureError::NotFound(_))));
    }
}
