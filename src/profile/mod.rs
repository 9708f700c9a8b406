//! Per-application behavioral profiles.

pub mod store;

use crate::hooks::ProfileRecord;
use crate::stats::{BloomFilter, Ema, HourHistogram, RunningStats};
use chrono::{DateTime, Datelike, Timelike, Utc};
use rustc_hash::FxHashMap;

pub const DESTINATION_CAPACITY: usize = 500;
pub const DOMAIN_CAPACITY: usize = 200;
pub const BLOOM_FP_RATE: f64 = 0.01;
const PORT_MAP_CAP: usize = 20;

/// Coarse lifecycle stage gating anomaly confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Maturity {
    Infant,
    Learning,
    Mature,
}

/// Flow-count boundaries between the stages.
#[derive(Debug, Clone, Copy)]
pub struct MaturityThresholds {
    pub learning_at: u64,
    pub mature_at: u64,
}

impl Default for MaturityThresholds {
    fn default() -> Self {
        Self {
            learning_at: 30,
            mature_at: 200,
        }
    }
}

impl Maturity {
    pub fn from_count(count: u64, thresholds: &MaturityThresholds) -> Self {
        if count >= thresholds.mature_at {
            Maturity::Mature
        } else if count >= thresholds.learning_at {
            Maturity::Learning
        } else {
            Maturity::Infant
        }
    }

    pub fn confidence(self) -> f64 {
        match self {
            Maturity::Infant => 0.0,
            Maturity::Learning => 0.5,
            Maturity::Mature => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Maturity::Infant => "infant",
            Maturity::Learning => "learning",
            Maturity::Mature => "mature",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "infant" => Some(Maturity::Infant),
            "learning" => Some(Maturity::Learning),
            "mature" => Some(Maturity::Mature),
            _ => None,
        }
    }
}

/// The per-flow feature vector the analysis path consumes.
#[derive(Debug, Clone)]
pub struct FlowObservation {
    pub timestamp: DateTime<Utc>,
    pub protocol: u8,
    pub destination: String,
    pub dst_port: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets: u64,
    pub duration_ms: u64,
    pub sni: Option<String>,
}

impl FlowObservation {
    pub fn from_flow(flow: &crate::flow::Flow) -> Self {
        Self {
            timestamp: flow.first_seen,
            protocol: flow.key.protocol,
            destination: flow.key.destination_key(),
            dst_port: flow.key.dst_port,
            bytes_in: flow.bytes_in,
            bytes_out: flow.bytes_out,
            packets: flow.packets,
            duration_ms: flow.duration_ms(),
            sni: flow.sni.clone(),
        }
    }
}

/// Streaming behavioral summary for one application.
#[derive(Debug, Clone)]
pub struct AppProfile {
    pub app_uid: i32,
    pub app_name: Option<String>,
    pub flow_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub maturity: Maturity,
    pub hourly: HourHistogram,
    pub inter_flow_interval: RunningStats,
    last_flow_at_ms: Option<i64>,
    pub active_days_of_week: u8,
    pub bytes_in_ema: Ema,
    pub bytes_out_ema: Ema,
    pub duration_stats: RunningStats,
    pub destinations: BloomFilter,
    pub unique_destination_count: u64,
    pub domains: BloomFilter,
    pub port_frequency: FxHashMap<u16, u32>,
    pub tcp_flow_count: u64,
    pub udp_flow_count: u64,
    pub uses_tcp: bool,
    pub uses_udp: bool,
}

impl AppProfile {
    pub fn new(app_uid: i32, app_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            app_uid,
            app_name,
            flow_count: 0,
            first_seen: now,
            last_updated: now,
            maturity: Maturity::Infant,
            hourly: HourHistogram::new(),
            inter_flow_interval: RunningStats::new(),
            last_flow_at_ms: None,
            active_days_of_week: 0,
            bytes_in_ema: Ema::default(),
            bytes_out_ema: Ema::default(),
            duration_stats: RunningStats::new(),
            destinations: BloomFilter::new(DESTINATION_CAPACITY, BLOOM_FP_RATE),
            unique_destination_count: 0,
            domains: BloomFilter::new(DOMAIN_CAPACITY, BLOOM_FP_RATE),
            port_frequency: FxHashMap::default(),
            tcp_flow_count: 0,
            udp_flow_count: 0,
            uses_tcp: false,
            uses_udp: false,
        }
    }

    /// Fold one analyzed flow into the profile. Callers hold the per-app
    /// lock; scoring must happen before this runs.
    pub fn update(&mut self, obs: &FlowObservation, thresholds: &MaturityThresholds) {
        self.flow_count += 1;

        let hour = obs.timestamp.hour() as usize;
        let day = obs.timestamp.weekday().num_days_from_sunday() as u8;
        self.hourly.record(hour);

        let now_ms = obs.timestamp.timestamp_millis();
        if let Some(prev_ms) = self.last_flow_at_ms {
            let gap = (now_ms - prev_ms).max(0) as f64;
            self.inter_flow_interval.update(gap);
        }
        self.last_flow_at_ms = Some(now_ms);

        self.bytes_in_ema.update(obs.bytes_in as f64);
        self.bytes_out_ema.update(obs.bytes_out as f64);
        self.duration_stats.update(obs.duration_ms as f64);

        if self.destinations.add_and_check_new(&obs.destination) {
            self.unique_destination_count += 1;
        }
        if let Some(sni) = obs.sni.as_deref() {
            self.domains.add(sni);
        }

        *self.port_frequency.entry(obs.dst_port).or_insert(0) += 1;
        if self.port_frequency.len() > PORT_MAP_CAP {
            if let Some((&victim, _)) = self
                .port_frequency
                .iter()
                .min_by_key(|(port, count)| (**count, **port))
            {
                self.port_frequency.remove(&victim);
            }
        }

        if obs.protocol == crate::packet::PROTO_TCP {
            self.tcp_flow_count += 1;
            self.uses_tcp = true;
        } else if obs.protocol == crate::packet::PROTO_UDP {
            self.udp_flow_count += 1;
            self.uses_udp = true;
        }

        self.maturity = Maturity::from_count(self.flow_count, thresholds);
        self.active_days_of_week |= 1 << day;
        self.last_updated = obs.timestamp;
    }

    /// Typical share of traffic flowing guest -> remote, from the EMAs.
    pub fn typical_upload_ratio(&self) -> f64 {
        let total = self.bytes_in_ema.value() + self.bytes_out_ema.value();
        if total <= 0.0 {
            0.0
        } else {
            self.bytes_out_ema.value() / total
        }
    }

    pub fn day_active(&self, day: u8) -> bool {
        day < 7 && self.active_days_of_week & (1 << day) != 0
    }

    pub fn knows_port(&self, port: u16) -> bool {
        self.port_frequency.contains_key(&port)
    }

    pub fn to_row(&self) -> ProfileRecord {
        let mut ports: Vec<(u16, u32)> = self
            .port_frequency
            .iter()
            .map(|(port, count)| (*port, *count))
            .collect();
        ports.sort_unstable();
        let port_frequency = ports
            .iter()
            .map(|(port, count)| format!("{port}:{count}"))
            .collect::<Vec<_>>()
            .join(",");
        ProfileRecord {
            app_uid: self.app_uid,
            app_name: self.app_name.clone(),
            flow_count: self.flow_count,
            first_seen_ms: self.first_seen.timestamp_millis(),
            last_updated_ms: self.last_updated.timestamp_millis(),
            maturity: self.maturity.as_str().to_string(),
            hourly_histogram: self.hourly.to_text(),
            inter_flow_interval: self.inter_flow_interval.to_text(),
            bytes_in_ema: self.bytes_in_ema.to_text(),
            bytes_out_ema: self.bytes_out_ema.to_text(),
            duration_stats: self.duration_stats.to_text(),
            destinations: self.destinations.to_text(),
            domains: self.domains.to_text(),
            port_frequency,
            active_days_of_week: self.active_days_of_week,
            unique_destination_count: self.unique_destination_count,
            tcp_flow_count: self.tcp_flow_count,
            udp_flow_count: self.udp_flow_count,
        }
    }

    /// Restore from storage. Any substructure that fails to parse comes
    /// back empty; the rest of the profile is preserved.
    pub fn from_row(row: &ProfileRecord, thresholds: &MaturityThresholds) -> Self {
        let mut profile = Self::new(row.app_uid, row.app_name.clone());
        profile.flow_count = row.flow_count;
        profile.first_seen = DateTime::from_timestamp_millis(row.first_seen_ms).unwrap_or_else(Utc::now);
        profile.last_updated =
            DateTime::from_timestamp_millis(row.last_updated_ms).unwrap_or_else(Utc::now);
        profile.last_flow_at_ms = Some(row.last_updated_ms);
        profile.maturity = Maturity::from_str(&row.maturity)
            .unwrap_or_else(|| Maturity::from_count(row.flow_count, thresholds));
        if let Some(hist) = HourHistogram::from_text(&row.hourly_histogram) {
            profile.hourly = hist;
        }
        if let Some(stats) = RunningStats::from_text(&row.inter_flow_interval) {
            profile.inter_flow_interval = stats;
        }
        if let Some(ema) = Ema::from_text(&row.bytes_in_ema) {
            profile.bytes_in_ema = ema;
        }
        if let Some(ema) = Ema::from_text(&row.bytes_out_ema) {
            profile.bytes_out_ema = ema;
        }
        if let Some(stats) = RunningStats::from_text(&row.duration_stats) {
            profile.duration_stats = stats;
        }
        if let Some(filter) = BloomFilter::from_text(&row.destinations) {
            profile.destinations = filter;
        }
        if let Some(filter) = BloomFilter::from_text(&row.domains) {
            profile.domains = filter;
        }
        profile.port_frequency = parse_port_frequency(&row.port_frequency).unwrap_or_default();
        profile.active_days_of_week = row.active_days_of_week & 0x7F;
        profile.unique_destination_count = row.unique_destination_count;
        profile.tcp_flow_count = row.tcp_flow_count;
        profile.udp_flow_count = row.udp_flow_count;
        profile.uses_tcp = row.tcp_flow_count > 0;
        profile.uses_udp = row.udp_flow_count > 0;
        profile
    }
}

fn parse_port_frequency(text: &str) -> Option<FxHashMap<u16, u32>> {
    if text.is_empty() {
        return Some(FxHashMap::default());
    }
    let mut map = FxHashMap::default();
    for entry in text.split(',') {
        let (port, count) = entry.split_once(':')?;
        map.insert(port.parse().ok()?, count.parse().ok()?);
    }
    Some(map)
}
