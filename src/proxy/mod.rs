//! Single-threaded proxy reactor.
//!
//! All session state lives on one task. Guest packets arrive over the
//! ingress queue; per-session I/O tasks report connect/read/close outcomes
//! over the backend event queue; response frames leave through the TUN
//! writer channel. The only shared structures are the ingress queue, the
//! blocklist, and the flow table.

mod tcp;
mod udp;

pub use tcp::TcpState;

use crate::blocklist::Blocklist;
use crate::buffer_pool::BufferPool;
use crate::flow::table::FlowTable;
use crate::flow::FlowKey;
use crate::packet::Packet;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Selector wait bound; the loop re-checks the running flag at least this often.
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);
/// How often idle sessions are swept.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Backend reads are chunked to this size.
pub(crate) const BACKEND_READ_CHUNK: usize = 4 * 1024;

/// One guest datagram plus the owner uid the flow table resolved for it.
#[derive(Debug)]
pub struct IngressPacket {
    pub buffer: Vec<u8>,
    pub owner_uid: i32,
}

/// Reports from per-session backend I/O tasks.
#[derive(Debug)]
pub(crate) enum BackendEvent {
    TcpConnected {
        key: FlowKey,
        writer: mpsc::Sender<Vec<u8>>,
    },
    TcpData {
        key: FlowKey,
        data: Vec<u8>,
    },
    TcpEof {
        key: FlowKey,
    },
    TcpError {
        key: FlowKey,
    },
    UdpData {
        key: FlowKey,
        data: Vec<u8>,
    },
    UdpError {
        key: FlowKey,
    },
}

#[derive(Debug, Default)]
pub struct ReactorStats {
    pub packets_in: AtomicU64,
    pub blocked_drops: AtomicU64,
    pub malformed_drops: AtomicU64,
    pub tcp_sessions_opened: AtomicU64,
    pub tcp_sessions_closed: AtomicU64,
    pub udp_sessions_opened: AtomicU64,
    pub udp_sessions_closed: AtomicU64,
    pub frames_to_guest: AtomicU64,
    pub bytes_to_guest: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReactorStatsSnapshot {
    pub packets_in: u64,
    pub blocked_drops: u64,
    pub malformed_drops: u64,
    pub tcp_sessions_opened: u64,
    pub tcp_sessions_closed: u64,
    pub udp_sessions_opened: u64,
    pub udp_sessions_closed: u64,
    pub frames_to_guest: u64,
    pub bytes_to_guest: u64,
}

impl ReactorStats {
    pub fn snapshot(&self) -> ReactorStatsSnapshot {
        ReactorStatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            blocked_drops: self.blocked_drops.load(Ordering::Relaxed),
            malformed_drops: self.malformed_drops.load(Ordering::Relaxed),
            tcp_sessions_opened: self.tcp_sessions_opened.load(Ordering::Relaxed),
            tcp_sessions_closed: self.tcp_sessions_closed.load(Ordering::Relaxed),
            udp_sessions_opened: self.udp_sessions_opened.load(Ordering::Relaxed),
            udp_sessions_closed: self.udp_sessions_closed.load(Ordering::Relaxed),
            frames_to_guest: self.frames_to_guest.load(Ordering::Relaxed),
            bytes_to_guest: self.bytes_to_guest.load(Ordering::Relaxed),
        }
    }
}

pub struct Reactor {
    ingress_rx: mpsc::Receiver<IngressPacket>,
    events_rx: mpsc::Receiver<BackendEvent>,
    events_tx: mpsc::Sender<BackendEvent>,
    tun_tx: mpsc::Sender<Vec<u8>>,
    blocklist: Arc<Blocklist>,
    flow_table: Arc<FlowTable>,
    buffer_pool: Arc<BufferPool>,
    running: Arc<AtomicBool>,
    stats: Arc<ReactorStats>,
    tcp_sessions: FxHashMap<FlowKey, tcp::TcpSession>,
    udp_sessions: FxHashMap<FlowKey, udp::UdpSession>,
    tcp_idle: Duration,
    udp_idle: Duration,
    last_sweep: Instant,
}

/// Everything needed to drive the reactor from outside.
pub struct ReactorHandle {
    pub ingress: mpsc::Sender<IngressPacket>,
    pub running: Arc<AtomicBool>,
    pub stats: Arc<ReactorStats>,
}

impl Reactor {
    pub fn new(
        tun_tx: mpsc::Sender<Vec<u8>>,
        blocklist: Arc<Blocklist>,
        flow_table: Arc<FlowTable>,
        buffer_pool: Arc<BufferPool>,
        tcp_idle: Duration,
        udp_idle: Duration,
    ) -> (Self, ReactorHandle) {
        let (ingress_tx, ingress_rx) = mpsc::channel(4096);
        let (events_tx, events_rx) = mpsc::channel(4096);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ReactorStats::default());
        let reactor = Self {
            ingress_rx,
            events_rx,
            events_tx,
            tun_tx,
            blocklist,
            flow_table,
            buffer_pool,
            running: Arc::clone(&running),
            stats: Arc::clone(&stats),
            tcp_sessions: FxHashMap::default(),
            udp_sessions: FxHashMap::default(),
            tcp_idle,
            udp_idle,
            last_sweep: Instant::now(),
        };
        let handle = ReactorHandle {
            ingress: ingress_tx,
            running,
            stats,
        };
        (reactor, handle)
    }

    /// Event loop. Exits once the running flag drops and the current
    /// iteration completes, closing every session on the way out.
    pub async fn run(mut self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                maybe_packet = self.ingress_rx.recv() => {
                    match maybe_packet {
                        Some(packet) => self.on_ingress(packet),
                        None => break,
                    }
                }
                maybe_event = self.events_rx.recv() => {
                    if let Some(event) = maybe_event {
                        self.on_backend_event(event);
                    }
                }
                _ = tokio::time::sleep(SELECT_TIMEOUT) => {}
            }
            if self.last_sweep.elapsed() >= IDLE_SWEEP_INTERVAL {
                self.sweep_idle_sessions();
                self.last_sweep = Instant::now();
            }
        }
        self.close_all_sessions();
        debug!("reactor loop exited");
    }

    fn on_ingress(&mut self, packet: IngressPacket) {
        self.stats.packets_in.fetch_add(1, Ordering::Relaxed);
        if self.blocklist.is_blocked(packet.owner_uid) {
            self.stats.blocked_drops.fetch_add(1, Ordering::Relaxed);
            self.buffer_pool.release(packet.buffer);
            return;
        }
        let buffer = packet.buffer;
        match Packet::parse(&buffer) {
            Some(parsed) if parsed.is_tcp() && parsed.tcp.is_some() => {
                self.handle_tcp_segment(&parsed);
            }
            Some(parsed) if parsed.is_udp() => {
                self.handle_udp_datagram(&parsed);
            }
            Some(_) | None => {
                self.stats.malformed_drops.fetch_add(1, Ordering::Relaxed);
                debug!("dropping undispatchable datagram ({} bytes)", buffer.len());
            }
        }
        self.buffer_pool.release(buffer);
    }

    fn on_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::TcpConnected { key, writer } => self.on_tcp_connected(key, writer),
            BackendEvent::TcpData { key, data } => self.on_tcp_data(key, &data),
            BackendEvent::TcpEof { key } => self.on_tcp_eof(key),
            BackendEvent::TcpError { key } => self.close_tcp_session(key, "backend error"),
            BackendEvent::UdpData { key, data } => self.on_udp_data(key, &data),
            BackendEvent::UdpError { key } => self.close_udp_session(key, "backend error"),
        }
    }

    /// Push one response frame toward the TUN writer.
    fn emit_frame(&self, frame: Vec<u8>) {
        let len = frame.len() as u64;
        match self.tun_tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_to_guest.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_to_guest.fetch_add(len, Ordering::Relaxed);
            }
            Err(_) => warn!("tun writer queue full, dropping response frame"),
        }
    }

    fn sweep_idle_sessions(&mut self) {
        let now = Instant::now();
        let stale_tcp: SmallVec<[FlowKey; 16]> = self
            .tcp_sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_activity) > self.tcp_idle)
            .map(|(key, _)| *key)
            .collect();
        for key in stale_tcp {
            self.close_tcp_session(key, "idle timeout");
        }
        let stale_udp: SmallVec<[FlowKey; 16]> = self
            .udp_sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_activity) > self.udp_idle)
            .map(|(key, _)| *key)
            .collect();
        for key in stale_udp {
            self.close_udp_session(key, "idle timeout");
        }
    }

    fn close_all_sessions(&mut self) {
        let tcp_keys: Vec<FlowKey> = self.tcp_sessions.keys().copied().collect();
        for key in tcp_keys {
            self.close_tcp_session(key, "reactor stop");
        }
        let udp_keys: Vec<FlowKey> = self.udp_sessions.keys().copied().collect();
        for key in udp_keys {
            self.close_udp_session(key, "reactor stop");
        }
    }
}
