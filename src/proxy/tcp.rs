//! Guest-side TCP termination and backend stream bridging.

use super::{BackendEvent, Reactor, BACKEND_READ_CHUNK};
use crate::flow::FlowKey;
use crate::packet::{build_tcp, Packet, TcpFlagSet};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Fixed initial sequence number for proxy-originated segments. The peer is
/// the local kernel, so uniqueness is scoped to the session.
const INITIAL_SEQ: u64 = 1000;
/// Depth of the per-session write channel toward the backend task.
const BACKEND_WRITE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynReceived,
    Established,
    FinWait,
    CloseWait,
}

pub(super) struct TcpSession {
    pub state: TcpState,
    /// Next sequence number we will send, kept 64-bit and truncated on the
    /// wire so arithmetic never wraps.
    pub my_seq: u64,
    /// Next guest byte we expect, same representation.
    pub my_ack: u64,
    pub connected: bool,
    backend_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Guest payloads that arrived before the backend connect completed.
    pending: VecDeque<Vec<u8>>,
    pub last_activity: Instant,
}

impl TcpSession {
    fn new(guest_seq: u32) -> Self {
        Self {
            state: TcpState::SynReceived,
            my_seq: INITIAL_SEQ,
            my_ack: guest_seq as u64 + 1,
            connected: false,
            backend_tx: None,
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn wire_seq(&self) -> u32 {
        (self.my_seq & 0xFFFF_FFFF) as u32
    }

    fn wire_ack(&self) -> u32 {
        (self.my_ack & 0xFFFF_FFFF) as u32
    }
}

impl Reactor {
    pub(super) fn handle_tcp_segment(&mut self, packet: &Packet<'_>) {
        let key = FlowKey::from_packet(packet);
        let Some(header) = packet.tcp else { return };
        let flags = header.flags;

        if !self.tcp_sessions.contains_key(&key) {
            // Only a bare SYN may open a session; anything else on an
            // unknown key is dropped silently.
            if flags.contains(TcpFlagSet::SYN) && !flags.contains(TcpFlagSet::ACK) {
                self.open_tcp_session(key, header.seq);
            } else {
                trace!(%key, "segment without session, dropped");
            }
            return;
        }

        if flags.contains(TcpFlagSet::RST) {
            self.close_tcp_session(key, "guest reset");
            return;
        }

        let payload = packet.payload();

        if flags.contains(TcpFlagSet::FIN) {
            self.on_guest_fin(key, payload);
            return;
        }

        if !payload.is_empty() {
            self.on_guest_data(key, payload);
            return;
        }

        if flags.contains(TcpFlagSet::ACK) {
            if let Some(session) = self.tcp_sessions.get_mut(&key) {
                session.last_activity = Instant::now();
                if session.state == TcpState::SynReceived {
                    session.state = TcpState::Established;
                    trace!(%key, "session established");
                }
            }
        }
    }

    fn open_tcp_session(&mut self, key: FlowKey, guest_seq: u32) {
        let mut session = TcpSession::new(guest_seq);
        let syn_ack = build_tcp(
            key.dst,
            key.src,
            key.dst_port,
            key.src_port,
            session.wire_seq(),
            session.wire_ack(),
            TcpFlagSet::SYN | TcpFlagSet::ACK,
            &[],
        );
        session.my_seq += 1; // our SYN occupies one sequence number
        self.emit_frame(syn_ack);
        self.tcp_sessions.insert(key, session);
        self.stats.tcp_sessions_opened.fetch_add(1, Ordering::Relaxed);

        let events = self.events_tx.clone();
        tokio::spawn(run_tcp_backend(key, events));
        debug!(%key, "tcp session opened");
    }

    fn on_guest_data(&mut self, key: FlowKey, payload: &[u8]) {
        let Some(session) = self.tcp_sessions.get_mut(&key) else {
            return;
        };
        session.last_activity = Instant::now();
        session.my_ack += payload.len() as u64;
        if session.state == TcpState::SynReceived {
            // Data riding on the handshake ACK.
            session.state = TcpState::Established;
        }

        let mut write_failed = false;
        if session.connected {
            if let Some(tx) = session.backend_tx.as_ref() {
                write_failed = tx.try_send(payload.to_vec()).is_err();
            }
        } else {
            session.pending.push_back(payload.to_vec());
        }

        let ack = build_tcp(
            key.dst,
            key.src,
            key.dst_port,
            key.src_port,
            session.wire_seq(),
            session.wire_ack(),
            TcpFlagSet::ACK,
            &[],
        );
        self.emit_frame(ack);
        if write_failed {
            self.close_tcp_session(key, "backend write queue full");
        }
    }

    fn on_guest_fin(&mut self, key: FlowKey, payload: &[u8]) {
        let Some(session) = self.tcp_sessions.get_mut(&key) else {
            return;
        };
        // Rarely the FIN still carries data; forward it before closing.
        if !payload.is_empty() {
            session.my_ack += payload.len() as u64;
            if session.connected {
                if let Some(tx) = session.backend_tx.as_ref() {
                    let _ = tx.try_send(payload.to_vec());
                }
            }
        }
        session.my_ack += 1; // the FIN itself
        session.state = TcpState::CloseWait;
        let ack = build_tcp(
            key.dst,
            key.src,
            key.dst_port,
            key.src_port,
            session.wire_seq(),
            session.wire_ack(),
            TcpFlagSet::ACK,
            &[],
        );
        self.emit_frame(ack);
        self.close_tcp_session(key, "guest fin");
    }

    pub(super) fn on_tcp_connected(&mut self, key: FlowKey, writer: mpsc::Sender<Vec<u8>>) {
        let pending = {
            let Some(session) = self.tcp_sessions.get_mut(&key) else {
                // Session died while the connect was in flight; dropping the
                // writer tears the backend task down.
                return;
            };
            session.connected = true;
            session.last_activity = Instant::now();
            std::mem::take(&mut session.pending)
        };
        for payload in pending {
            if writer.try_send(payload).is_err() {
                self.close_tcp_session(key, "backend write queue full");
                return;
            }
        }
        if let Some(session) = self.tcp_sessions.get_mut(&key) {
            session.backend_tx = Some(writer);
            trace!(%key, "backend connected, pending flushed");
        }
    }

    pub(super) fn on_tcp_data(&mut self, key: FlowKey, data: &[u8]) {
        let Some(session) = self.tcp_sessions.get_mut(&key) else {
            return;
        };
        session.last_activity = Instant::now();
        let frame = build_tcp(
            key.dst,
            key.src,
            key.dst_port,
            key.src_port,
            session.wire_seq(),
            session.wire_ack(),
            TcpFlagSet::PSH | TcpFlagSet::ACK,
            data,
        );
        session.my_seq += data.len() as u64;
        let frame_len = frame.len();
        self.emit_frame(frame);
        self.flow_table.record_response(&key, frame_len);
    }

    pub(super) fn on_tcp_eof(&mut self, key: FlowKey) {
        let Some(session) = self.tcp_sessions.get_mut(&key) else {
            return;
        };
        // Clean close: emit FIN‖ACK and drop the session without waiting
        // for the guest's final ACK.
        session.state = TcpState::FinWait;
        let fin = build_tcp(
            key.dst,
            key.src,
            key.dst_port,
            key.src_port,
            session.wire_seq(),
            session.wire_ack(),
            TcpFlagSet::FIN | TcpFlagSet::ACK,
            &[],
        );
        session.my_seq += 1;
        self.emit_frame(fin);
        self.close_tcp_session(key, "backend eof");
    }

    pub(super) fn close_tcp_session(&mut self, key: FlowKey, reason: &str) {
        if let Some(session) = self.tcp_sessions.remove(&key) {
            drop(session.backend_tx); // backend task exits on channel close
            self.stats.tcp_sessions_closed.fetch_add(1, Ordering::Relaxed);
            self.flow_table.mark_closed(&key);
            debug!(%key, reason, "tcp session closed");
        }
    }
}

/// Per-session backend task: connect, then shuttle bytes both ways until
/// either side goes away. Connect failures surface as an error event; the
/// reactor never answers them with a RST.
async fn run_tcp_backend(key: FlowKey, events: mpsc::Sender<BackendEvent>) {
    let stream = match TcpStream::connect(SocketAddr::V4(key.remote())).await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(%key, %error, "backend connect failed");
            let _ = events.send(BackendEvent::TcpError { key }).await;
            return;
        }
    };
    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(BACKEND_WRITE_DEPTH);
    if events
        .send(BackendEvent::TcpConnected {
            key,
            writer: writer_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; BACKEND_READ_CHUNK];
    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        let _ = events.send(BackendEvent::TcpEof { key }).await;
                        break;
                    }
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        if events.send(BackendEvent::TcpData { key, data }).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        debug!(%key, %error, "backend read failed");
                        let _ = events.send(BackendEvent::TcpError { key }).await;
                        break;
                    }
                }
            }
            maybe_payload = writer_rx.recv() => {
                match maybe_payload {
                    Some(payload) => {
                        if let Err(error) = write_half.write_all(&payload).await {
                            debug!(%key, %error, "backend write failed");
                            let _ = events.send(BackendEvent::TcpError { key }).await;
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
