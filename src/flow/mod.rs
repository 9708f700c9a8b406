//! Flow identity and per-flow accounting.

pub mod table;

use crate::hooks::FlowRecord;
use crate::packet::{sni, Packet, PROTO_TCP, PROTO_UDP};
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

/// Raw payload retained per flow, before hex expansion.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;
const FIRST_SIZES_KEPT: usize = 5;

/// The 5-tuple. Equality defines the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn from_packet(packet: &Packet<'_>) -> Self {
        Self {
            protocol: packet.protocol,
            src: packet.src,
            src_port: packet.src_port,
            dst: packet.dst,
            dst_port: packet.dst_port,
        }
    }

    pub fn local(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src, self.src_port)
    }

    pub fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst, self.dst_port)
    }

    /// `ip:port` of the destination, the form the profile layer keys on.
    pub fn destination_key(&self) -> String {
        format!("{}:{}", self.dst, self.dst_port)
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            PROTO_TCP => "TCP",
            PROTO_UDP => "UDP",
            _ => "IP",
        };
        write!(
            f,
            "{}:{} -> {}:{} [{}]",
            self.src, self.src_port, self.dst, self.dst_port, proto
        )
    }
}

/// Capped byte reservoir with hex and printable views derived on read.
#[derive(Debug, Clone, Default)]
pub struct PayloadCapture {
    bytes: Vec<u8>,
    truncated: bool,
}

impl PayloadCapture {
    pub fn append(&mut self, payload: &[u8]) {
        if payload.is_empty() || self.bytes.len() >= MAX_CAPTURE_BYTES {
            return;
        }
        let room = MAX_CAPTURE_BYTES - self.bytes.len();
        if payload.len() > room {
            self.bytes.extend_from_slice(&payload[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(payload);
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Printable projection: bytes outside ASCII graphic/space become '.'.
    pub fn text(&self) -> String {
        self.bytes
            .iter()
            .map(|&b| {
                if (0x20..0x7F).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect()
    }
}

/// Mutable accounting for one [`FlowKey`].
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Instant,
    pub packets: u64,
    pub bytes: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub first_sizes: SmallVec<[u32; FIRST_SIZES_KEPT]>,
    iat_sum_ms: f64,
    iat_sum_sq_ms: f64,
    last_packet_at: Instant,
    pub closed: bool,
    pub app_uid: i32,
    pub app_name: Option<String>,
    pub sni: Option<String>,
    pub capture: PayloadCapture,
}

impl Flow {
    pub fn new(key: FlowKey, uid: i32) -> Self {
        let now = Instant::now();
        Self {
            key,
            first_seen: Utc::now(),
            last_seen: now,
            packets: 0,
            bytes: 0,
            bytes_in: 0,
            bytes_out: 0,
            first_sizes: SmallVec::new(),
            iat_sum_ms: 0.0,
            iat_sum_sq_ms: 0.0,
            last_packet_at: now,
            closed: false,
            app_uid: uid,
            app_name: None,
            sni: None,
            capture: PayloadCapture::default(),
        }
    }

    /// Account one guest-originated datagram.
    pub fn record_packet(&mut self, packet: &Packet<'_>) {
        let now = Instant::now();
        if self.packets > 0 {
            let gap_ms = now.duration_since(self.last_packet_at).as_secs_f64() * 1000.0;
            self.iat_sum_ms += gap_ms;
            self.iat_sum_sq_ms += gap_ms * gap_ms;
        }
        self.last_packet_at = now;
        self.last_seen = now;
        self.packets += 1;
        self.bytes += packet.total_len as u64;
        self.bytes_in += packet.total_len as u64;
        if self.first_sizes.len() < FIRST_SIZES_KEPT {
            self.first_sizes.push(packet.total_len as u32);
        }
        let payload = packet.payload();
        if self.sni.is_none() && !payload.is_empty() {
            self.sni = sni::extract(payload);
        }
        self.capture.append(payload);
    }

    /// Account bytes flowing back toward the guest.
    pub fn record_response(&mut self, total_len: usize) {
        self.last_seen = Instant::now();
        self.packets += 1;
        self.bytes += total_len as u64;
        self.bytes_out += total_len as u64;
    }

    pub fn duration_ms(&self) -> u64 {
        (Utc::now() - self.first_seen).num_milliseconds().max(0) as u64
    }

    /// Streaming variance of inter-arrival times over the guest direction.
    pub fn iat_variance_ms(&self) -> f64 {
        let intervals = self.packets.saturating_sub(1);
        if intervals == 0 {
            return 0.0;
        }
        let n = intervals as f64;
        let mean = self.iat_sum_ms / n;
        (self.iat_sum_sq_ms / n - mean * mean).max(0.0)
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn to_record(&self) -> FlowRecord {
        FlowRecord {
            start_timestamp_ms: self.first_seen.timestamp_millis(),
            app_uid: self.app_uid,
            app_name: self.app_name.clone(),
            remote_ip: self.key.dst.to_string(),
            remote_port: self.key.dst_port,
            protocol: self.key.protocol,
            bytes: self.bytes,
            packets: self.packets,
            duration_ms: self.duration_ms(),
            sni: self.sni.clone(),
            payload_hex: self.capture.hex(),
            payload_text: self.capture.text(),
        }
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            key: self.key,
            app_uid: self.app_uid,
            app_name: self.app_name.clone(),
            first_seen: self.first_seen,
            packets: self.packets,
            bytes: self.bytes,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            sni: self.sni.clone(),
            closed: self.closed,
        }
    }
}

/// Immutable UI-facing view published by the snapshot task.
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub app_uid: i32,
    pub app_name: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub packets: u64,
    pub bytes: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub sni: Option<String>,
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_udp;

    fn udp_packet_bytes(payload: &[u8]) -> Vec<u8> {
        build_udp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(8, 8, 8, 8),
            40000,
            53,
            payload,
        )
    }

    #[test]
    fn accounting_sums_total_lengths() {
        let buffers: Vec<Vec<u8>> = (0..4).map(|i| udp_packet_bytes(&vec![0u8; 10 * i])).collect();
        let first = Packet::parse(&buffers[0]).unwrap();
        let mut flow = Flow::new(FlowKey::from_packet(&first), -1);
        let mut expected = 0u64;
        for buffer in &buffers {
            let packet = Packet::parse(buffer).unwrap();
            flow.record_packet(&packet);
            expected += packet.total_len as u64;
        }
        assert_eq!(flow.packets, 4);
        assert_eq!(flow.bytes, expected);
        assert_eq!(flow.bytes_in, expected);
        assert_eq!(flow.bytes_out, 0);
        assert_eq!(flow.first_sizes.len(), 4);
    }

    #[test]
    fn directions_sum_to_total() {
        let buffer = udp_packet_bytes(b"query");
        let packet = Packet::parse(&buffer).unwrap();
        let mut flow = Flow::new(FlowKey::from_packet(&packet), -1);
        flow.record_packet(&packet);
        flow.record_response(64);
        assert_eq!(flow.bytes_in + flow.bytes_out, flow.bytes);
        assert_eq!(flow.bytes_out, 64);
        assert_eq!(flow.packets, 2);
    }

    #[test]
    fn first_sizes_capped_at_five() {
        let buffer = udp_packet_bytes(b"x");
        let packet = Packet::parse(&buffer).unwrap();
        let mut flow = Flow::new(FlowKey::from_packet(&packet), -1);
        for _ in 0..9 {
            flow.record_packet(&packet);
        }
        assert_eq!(flow.first_sizes.len(), 5);
    }

    #[test]
    fn sni_detected_once() {
        let hello = crate::packet::sni::build_client_hello("example.org");
        let buffer = build_udp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            40001,
            443,
            &hello,
        );
        let packet = Packet::parse(&buffer).unwrap();
        let mut flow = Flow::new(FlowKey::from_packet(&packet), -1);
        flow.record_packet(&packet);
        assert_eq!(flow.sni.as_deref(), Some("example.org"));

        // Later unrelated payloads must not overwrite it.
        let other = udp_packet_bytes(b"not a hello");
        let other_packet = Packet::parse(&other).unwrap();
        flow.record_packet(&other_packet);
        assert_eq!(flow.sni.as_deref(), Some("example.org"));
    }

    #[test]
    fn iat_variance_needs_two_intervals() {
        let buffer = udp_packet_bytes(b"x");
        let packet = Packet::parse(&buffer).unwrap();
        let mut flow = Flow::new(FlowKey::from_packet(&packet), -1);
        flow.record_packet(&packet);
        assert_eq!(flow.iat_variance_ms(), 0.0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        flow.record_packet(&packet);
        // One interval: mean equals the sample, variance collapses to zero.
        assert!(flow.iat_variance_ms() < 1e-6);
        std::thread::sleep(std::time::Duration::from_millis(15));
        flow.record_packet(&packet);
        assert!(flow.iat_variance_ms() > 0.0);
    }

    #[test]
    fn capture_caps_at_limit() {
        let mut capture = PayloadCapture::default();
        capture.append(&vec![0x41u8; MAX_CAPTURE_BYTES - 10]);
        capture.append(&[0x42u8; 100]);
        assert_eq!(capture.len(), MAX_CAPTURE_BYTES);
        assert!(capture.is_truncated());
        capture.append(b"more");
        assert_eq!(capture.len(), MAX_CAPTURE_BYTES);
    }

    #[test]
    fn capture_views() {
        let mut capture = PayloadCapture::default();
        capture.append(&[0x48, 0x69, 0x00, 0xFF]);
        assert_eq!(capture.hex(), "486900ff");
        assert_eq!(capture.text(), "Hi..");
    }
}
