//! Fixtures for tests: synthetic frames and capture files.

use std::fs::File;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

use etherparse::PacketBuilder;

const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub tcp: bool,
    pub syn: bool,
    pub fin: bool,
    pub ttl: u8,
    pub payload_len: usize,
}

impl FrameSpec {
    pub fn tcp(src: &str, src_port: u16, dst: &str, dst_port: u16) -> Self {
        Self {
            src: src.parse().expect("valid source address"),
            src_port,
            dst: dst.parse().expect("valid destination address"),
            dst_port,
            tcp: true,
            syn: false,
            fin: false,
            ttl: 64,
            payload_len: 0,
        }
    }

    pub fn udp(src: &str, src_port: u16, dst: &str, dst_port: u16) -> Self {
        Self {
            tcp: false,
            ..Self::tcp(src, src_port, dst, dst_port)
        }
    }

    pub fn syn(mut self) -> Self {
        self.syn = true;
        self
    }

    pub fn fin(mut self) -> Self {
        self.fin = true;
        self
    }

    pub fn payload(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }
}

fn v4(addr: IpAddr) -> [u8; 4] {
    match addr {
        IpAddr::V4(a) => a.octets(),
        IpAddr::V6(_) => panic!("fixtures only build IPv4 frames"),
    }
}

/// Builds an Ethernet II frame from the description.
pub fn frame(spec: &FrameSpec) -> Vec<u8> {
    let payload = vec![0xabu8; spec.payload_len];
    let ip = PacketBuilder::ethernet2(SRC_MAC, DST_MAC).ipv4(v4(spec.src), v4(spec.dst), spec.ttl);
    let mut out = Vec::new();
    if spec.tcp {
        let mut builder = ip.tcp(spec.src_port, spec.dst_port, 1, 65535);
        if spec.syn {
            builder = builder.syn();
        }
        if spec.fin {
            builder = builder.fin();
        }
        builder.write(&mut out, &payload).expect("frame build");
    } else {
        ip.udp(spec.src_port, spec.dst_port)
            .write(&mut out, &payload)
            .expect("frame build");
    }
    out
}

/// Builds a frame without link-layer header (raw IPv4).
pub fn raw_ip_frame(spec: &FrameSpec) -> Vec<u8> {
    let payload = vec![0xabu8; spec.payload_len];
    let ip = PacketBuilder::ipv4(v4(spec.src), v4(spec.dst), spec.ttl);
    let mut out = Vec::new();
    if spec.tcp {
        ip.tcp(spec.src_port, spec.dst_port, 1, 65535)
            .write(&mut out, &payload)
            .expect("frame build");
    } else {
        ip.udp(spec.src_port, spec.dst_port)
            .write(&mut out, &payload)
            .expect("frame build");
    }
    out
}

fn split_ts(ts: f64) -> (u32, u32) {
    let secs = ts.floor();
    let micros = ((ts - secs) * 1e6).round() as u32;
    (secs as u32, micros)
}

/// Writes a little-endian legacy pcap file with Ethernet link type.
pub fn write_pcap(path: &Path, packets: &[(f64, Vec<u8>)]) {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&4u16.to_le_bytes());
    buf.extend_from_slice(&0i32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&65535u32.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());

    for (ts, data) in packets {
        let (secs, micros) = split_ts(*ts);
        buf.extend_from_slice(&secs.to_le_bytes());
        buf.extend_from_slice(&micros.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
    }

    File::create(path)
        .and_then(|mut f| f.write_all(&buf))
        .expect("write pcap fixture");
}

/// Writes a little-endian pcapng file with one Ethernet interface
/// (default microsecond resolution).
pub fn write_pcapng(path: &Path, packets: &[(f64, Vec<u8>)]) {
    let packets: Vec<(u64, Vec<u8>)> = packets
        .iter()
        .map(|(ts, data)| {
            let (secs, micros) = split_ts(*ts);
            (u64::from(secs) * 1_000_000 + u64::from(micros), data.clone())
        })
        .collect();
    write_pcapng_raw(path, None, &packets);
}

/// Writes a pcapng file whose interface carries `if_tsresol`. Timestamps
/// are given in interface units.
pub fn write_pcapng_with_tsresol(path: &Path, tsresol: u8, packets: &[(u64, Vec<u8>)]) {
    write_pcapng_raw(path, Some(tsresol), packets);
}

fn write_pcapng_raw(path: &Path, tsresol: Option<u8>, packets: &[(u64, Vec<u8>)]) {
    let mut buf = Vec::new();

    // Section header block
    buf.extend_from_slice(&0x0A0D_0D0Au32.to_le_bytes());
    buf.extend_from_slice(&28u32.to_le_bytes());
    buf.extend_from_slice(&0x1A2B_3C4Du32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(-1i64).to_le_bytes());
    buf.extend_from_slice(&28u32.to_le_bytes());

    // Interface description block, options are if_tsresol then opt_endofopt
    let mut options = Vec::new();
    if let Some(resol) = tsresol {
        options.extend_from_slice(&9u16.to_le_bytes());
        options.extend_from_slice(&1u16.to_le_bytes());
        options.extend_from_slice(&[resol, 0, 0, 0]);
        options.extend_from_slice(&0u16.to_le_bytes());
        options.extend_from_slice(&0u16.to_le_bytes());
    }
    let idb_len = (20 + options.len()) as u32;
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&idb_len.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&65535u32.to_le_bytes());
    buf.extend_from_slice(&options);
    buf.extend_from_slice(&idb_len.to_le_bytes());

    for (units, data) in packets {
        let units = *units;
        let padded = (data.len() + 3) / 4 * 4;
        let total = (32 + padded) as u32;

        buf.extend_from_slice(&6u32.to_le_bytes());
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&((units >> 32) as u32).to_le_bytes());
        buf.extend_from_slice(&(units as u32).to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
        buf.extend(std::iter::repeat(0u8).take(padded - data.len()));
        buf.extend_from_slice(&total.to_le_bytes());
    }

    File::create(path)
        .and_then(|mut f| f.write_all(&buf))
        .expect("write pcapng fixture");
}
