//! Connected-datagram bridging for guest UDP flows.

use super::{BackendEvent, Reactor, BACKEND_READ_CHUNK};
use crate::flow::FlowKey;
use crate::packet::{build_udp, Packet};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Depth of the per-session write channel toward the backend socket.
const BACKEND_WRITE_DEPTH: usize = 128;

pub(super) struct UdpSession {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pub last_activity: Instant,
}

impl Reactor {
    pub(super) fn handle_udp_datagram(&mut self, packet: &Packet<'_>) {
        let key = FlowKey::from_packet(packet);
        let payload = packet.payload();

        if !self.udp_sessions.contains_key(&key) {
            self.open_udp_session(key);
        }
        let Some(session) = self.udp_sessions.get_mut(&key) else {
            return;
        };
        session.last_activity = Instant::now();
        if payload.is_empty() {
            return;
        }
        // Guest writes go out immediately; a full queue counts as a write
        // error and tears the session down.
        if session.writer_tx.try_send(payload.to_vec()).is_err() {
            self.close_udp_session(key, "backend write queue full");
        }
    }

    fn open_udp_session(&mut self, key: FlowKey) {
        let (writer_tx, writer_rx) = mpsc::channel(BACKEND_WRITE_DEPTH);
        let session = UdpSession {
            writer_tx,
            last_activity: Instant::now(),
        };
        self.udp_sessions.insert(key, session);
        self.stats.udp_sessions_opened.fetch_add(1, Ordering::Relaxed);
        let events = self.events_tx.clone();
        tokio::spawn(run_udp_backend(key, events, writer_rx));
        debug!(%key, "udp session opened");
    }

    pub(super) fn on_udp_data(&mut self, key: FlowKey, data: &[u8]) {
        let Some(session) = self.udp_sessions.get_mut(&key) else {
            return;
        };
        session.last_activity = Instant::now();
        // Response carries the swapped 5-tuple back toward the guest.
        let frame = build_udp(key.dst, key.src, key.dst_port, key.src_port, data);
        let frame_len = frame.len();
        self.emit_frame(frame);
        self.flow_table.record_response(&key, frame_len);
        trace!(%key, bytes = data.len(), "udp response re-injected");
    }

    pub(super) fn close_udp_session(&mut self, key: FlowKey, reason: &str) {
        if let Some(session) = self.udp_sessions.remove(&key) {
            drop(session.writer_tx); // backend task exits on channel close
            self.stats.udp_sessions_closed.fetch_add(1, Ordering::Relaxed);
            self.flow_table.mark_closed(&key);
            debug!(%key, reason, "udp session closed");
        }
    }
}

/// Per-session backend task: one connected non-blocking socket, reads
/// drained a datagram at a time.
async fn run_udp_backend(
    key: FlowKey,
    events: mpsc::Sender<BackendEvent>,
    mut writer_rx: mpsc::Receiver<Vec<u8>>,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(error) => {
            debug!(%key, %error, "udp socket open failed");
            let _ = events.send(BackendEvent::UdpError { key }).await;
            return;
        }
    };
    if let Err(error) = socket.connect(SocketAddr::V4(key.remote())).await {
        debug!(%key, %error, "udp connect failed");
        let _ = events.send(BackendEvent::UdpError { key }).await;
        return;
    }

    let mut buf = vec![0u8; BACKEND_READ_CHUNK];
    loop {
        tokio::select! {
            result = socket.recv(&mut buf) => {
                match result {
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        if events.send(BackendEvent::UdpData { key, data }).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        debug!(%key, %error, "udp recv failed");
                        let _ = events.send(BackendEvent::UdpError { key }).await;
                        break;
                    }
                }
            }
            maybe_payload = writer_rx.recv() => {
                match maybe_payload {
                    Some(payload) => {
                        if let Err(error) = socket.send(&payload).await {
                            debug!(%key, %error, "udp send failed");
                            let _ = events.send(BackendEvent::UdpError { key }).await;
                            break;
                        }
                    }
                    // Reactor dropped the session.
                    None => break,
                }
            }
        }
    }
}
