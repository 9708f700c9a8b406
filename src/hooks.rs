//! External collaborator interfaces.
//!
//! The engine never owns the TUN device, the OS socket-ownership tables, or
//! the storage layer; it talks to all of them through the traits here. Hosts
//! supply implementations at construction time.

use crate::flow::FlowKey;
use serde::Serialize;
use std::io;
use std::net::SocketAddrV4;

/// Returned by [`OwnerResolver::uid_for`] while the OS has not yet mapped
/// the socket to an application.
pub const UNKNOWN_UID: i32 = -1;

/// OS-level mapping from a live 5-tuple to the owning application.
///
/// `app_name` may report a permission denial as a sentinel string such as
/// `"DualApp/WorkProfile:10123"`; the core stores it verbatim and does not
/// retry.
pub trait OwnerResolver: Send + Sync {
    fn uid_for(&self, protocol: u8, local: SocketAddrV4, remote: SocketAddrV4) -> i32;
    fn app_name(&self, uid: i32) -> Option<String>;
}

/// One completed flow, as handed to storage.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRecord {
    pub start_timestamp_ms: i64,
    pub app_uid: i32,
    pub app_name: Option<String>,
    pub remote_ip: String,
    pub remote_port: u16,
    pub protocol: u8,
    pub bytes: u64,
    pub packets: u64,
    pub duration_ms: u64,
    pub sni: Option<String>,
    pub payload_hex: String,
    pub payload_text: String,
}

/// Per-app profile snapshot for storage; the stat fields carry the compact
/// text encodings of the `stats` primitives.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileRecord {
    pub app_uid: i32,
    pub app_name: Option<String>,
    pub flow_count: u64,
    pub first_seen_ms: i64,
    pub last_updated_ms: i64,
    pub maturity: String,
    pub hourly_histogram: String,
    pub inter_flow_interval: String,
    pub bytes_in_ema: String,
    pub bytes_out_ema: String,
    pub duration_stats: String,
    pub destinations: String,
    pub domains: String,
    pub port_frequency: String,
    pub active_days_of_week: u8,
    pub unique_destination_count: u64,
    pub tcp_flow_count: u64,
    pub udp_flow_count: u64,
}

/// One user verdict on an alert.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRecord {
    pub app_uid: i32,
    pub app_name: Option<String>,
    pub verdict: FeedbackVerdict,
    pub original_score: f64,
    pub destination: String,
    pub reasons: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackVerdict {
    Normal,
    Suspicious,
}

/// Storage boundary. Implementations may block; calls only ever arrive on
/// I/O-capable tasks, never on the reactor.
pub trait PersistenceSink: Send + Sync {
    fn record_flows(&self, rows: &[FlowRecord]) -> io::Result<()>;
    fn record_profile(&self, row: &ProfileRecord) -> io::Result<()>;
    fn record_feedback(&self, row: &FeedbackRecord) -> io::Result<()>;
}

/// Emitted once per analyzed flow whose fused score clears the lowest
/// severity threshold. Rate limiting is the sink's problem.
#[derive(Debug, Clone)]
pub struct AnomalyAlert {
    pub severity: crate::anomaly::Severity,
    pub app_name: String,
    pub reasons: Vec<String>,
    pub score: f64,
    pub flow_key: FlowKey,
    pub timestamp_ms: i64,
}

pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: &AnomalyAlert);
}

/// Blocking read side of the TUN descriptor: one call, one IPv4 datagram.
pub trait TunReader: Send {
    fn read_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Blocking write side: one call submits one IPv4 datagram.
pub trait TunWriter: Send {
    fn write_datagram(&mut self, frame: &[u8]) -> io::Result<()>;
}
