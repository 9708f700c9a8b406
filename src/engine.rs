//! VPN orchestrator: owns the TUN halves and every background task.

use crate::analyzer::Analyzer;
use crate::anomaly::{AnomalyEnsemble, FeedbackTracker};
use crate::blocklist::{Blocklist, BlocklistStore};
use crate::buffer_pool::{BufferPool, PoolStats};
use crate::config::Config;
use crate::flow::table::{FlowTable, TableStats, EVICTION_BATCH};
use crate::flow::{Flow, FlowSnapshot};
use crate::hooks::{
    AlertSink, FeedbackVerdict, OwnerResolver, PersistenceSink, TunReader, TunWriter,
};
use crate::packet::Packet;
use crate::profile::store::ProfileStore;
use crate::proxy::{IngressPacket, Reactor, ReactorHandle, ReactorStatsSnapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Flow table sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// UI snapshot cadence.
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(500);
/// Dirty-profile flush cadence.
const PROFILE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Depth of the response-frame queue toward the TUN writer.
const TUN_WRITE_DEPTH: usize = 8192;
/// TUN reads must accommodate one full datagram.
const TUN_READ_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine is not running")]
    NotRunning,
}

/// External collaborators, supplied by the host at construction.
pub struct EngineHooks {
    pub resolver: Arc<dyn OwnerResolver>,
    pub sink: Arc<dyn PersistenceSink>,
    pub alerts: Arc<dyn AlertSink>,
    pub blocklist_store: Box<dyn BlocklistStore>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub reactor: ReactorStatsSnapshot,
    pub table: TableStats,
    pub pool: PoolStats,
    pub profiles: usize,
}

struct RunningParts {
    reactor_handle: ReactorHandle,
    reactor_task: tokio::task::JoinHandle<()>,
    analyzer_tx: crossbeam_channel::Sender<Vec<Flow>>,
    analyzer_join: std::thread::JoinHandle<()>,
    writer_join: std::thread::JoinHandle<()>,
}

pub struct Engine {
    config: Config,
    runtime: Runtime,
    running: Arc<AtomicBool>,
    flow_table: Arc<FlowTable>,
    blocklist: Arc<Blocklist>,
    buffer_pool: Arc<BufferPool>,
    profiles: Arc<ProfileStore>,
    feedback: Arc<FeedbackTracker>,
    sink: Arc<dyn PersistenceSink>,
    alerts: Arc<dyn AlertSink>,
    parts: Mutex<Option<RunningParts>>,
}

impl Engine {
    pub fn new(config: Config, hooks: EngineHooks) -> anyhow::Result<Self> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("flowsentry")
            .enable_time()
            .enable_io()
            .build()?;
        let flow_table = Arc::new(FlowTable::new(
            Arc::clone(&hooks.resolver),
            config.flow_idle(),
        ));
        let blocklist = Blocklist::new(hooks.blocklist_store);
        let buffer_pool = Arc::new(BufferPool::new(
            config.buffers.pool_size,
            config.buffers.buffer_size,
        ));
        let profiles = Arc::new(ProfileStore::new(config.maturity_thresholds()));
        Ok(Self {
            config,
            runtime,
            running: Arc::new(AtomicBool::new(false)),
            flow_table,
            blocklist,
            buffer_pool,
            profiles,
            feedback: Arc::new(FeedbackTracker::new()),
            sink: hooks.sink,
            alerts: hooks.alerts,
            parts: Mutex::new(None),
        })
    }

    /// Bring the data plane up: reactor, TUN pumps, sweeper, snapshot
    /// publisher, profile flusher, analyzer.
    pub fn start(
        &self,
        reader: Box<dyn TunReader>,
        writer: Box<dyn TunWriter>,
    ) -> Result<(), EngineError> {
        let mut parts = self.parts.lock();
        if parts.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        self.running.store(true, Ordering::SeqCst);

        let ensemble = AnomalyEnsemble::new(
            self.config.anomaly.weights,
            self.config.anomaly.thresholds,
        );
        let analyzer = Analyzer::new(
            Arc::clone(&self.profiles),
            ensemble,
            Arc::clone(&self.feedback),
            Arc::clone(&self.sink),
            Arc::clone(&self.alerts),
        );
        let (analyzer_tx, analyzer_join) = analyzer.spawn();

        self.blocklist.load();

        let (tun_tx, tun_rx) = mpsc::channel::<Vec<u8>>(TUN_WRITE_DEPTH);
        let writer_join = spawn_tun_writer(writer, tun_rx);

        let (reactor, reactor_handle) = Reactor::new(
            tun_tx,
            Arc::clone(&self.blocklist),
            Arc::clone(&self.flow_table),
            Arc::clone(&self.buffer_pool),
            self.config.tcp_idle(),
            self.config.udp_idle(),
        );
        let reactor_task = self.runtime.spawn(reactor.run());

        self.spawn_sweeper(analyzer_tx.clone());
        self.spawn_snapshot_publisher();
        self.spawn_profile_flusher();
        self.spawn_tun_reader(reader, reactor_handle.ingress.clone());

        *parts = Some(RunningParts {
            reactor_handle,
            reactor_task,
            analyzer_tx,
            analyzer_join,
            writer_join,
        });
        info!("engine started");
        Ok(())
    }

    /// Tear the data plane down. The final flow flush completes before this
    /// returns.
    pub fn stop(&self) -> Result<(), EngineError> {
        let Some(parts) = self.parts.lock().take() else {
            return Err(EngineError::NotRunning);
        };
        info!("engine stopping");
        self.running.store(false, Ordering::SeqCst);
        parts
            .reactor_handle
            .running
            .store(false, Ordering::SeqCst);
        // A nudge so the reactor observes the flag without waiting out its
        // selector timeout.
        let _ = parts.reactor_handle.ingress.try_send(IngressPacket {
            buffer: Vec::new(),
            owner_uid: -1,
        });
        let _ = self.runtime.block_on(parts.reactor_task);

        // Synchronous final flush: every remaining flow goes through the
        // analyzer before we return.
        let remaining = self.flow_table.flush_all();
        for batch in remaining.chunks(EVICTION_BATCH) {
            if parts.analyzer_tx.send(batch.to_vec()).is_err() {
                warn!("analyzer gone before final flush completed");
                break;
            }
        }
        drop(parts.analyzer_tx);
        if parts.analyzer_join.join().is_err() {
            warn!("analyzer thread panicked");
        }
        self.profiles.flush_dirty(self.sink.as_ref());

        // Closing the frame queue lets the writer thread drain and exit;
        // the TUN halves drop with it.
        drop(parts.reactor_handle);
        if parts.writer_join.join().is_err() {
            warn!("tun writer thread panicked");
        }
        info!("engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn flow_snapshot(&self) -> Arc<Vec<FlowSnapshot>> {
        self.flow_table.snapshot()
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    /// Restore profiles persisted by an earlier run. Call before `start`.
    pub fn preload_profiles<'a>(&self, rows: impl IntoIterator<Item = &'a crate::hooks::ProfileRecord>) {
        let mut count = 0usize;
        for row in rows {
            self.profiles.load_row(row);
            count += 1;
        }
        if count > 0 {
            info!(count, "profiles restored");
        }
    }

    /// Replay persisted feedback verdicts into the suspicion tallies.
    pub fn preload_feedback<'a>(
        &self,
        rows: impl IntoIterator<Item = &'a crate::hooks::FeedbackRecord>,
    ) {
        for row in rows {
            self.feedback.preload(row.app_uid, row.verdict);
        }
    }

    /// Record a user verdict on an alert and persist it.
    pub fn record_feedback(
        &self,
        app_uid: i32,
        verdict: FeedbackVerdict,
        original_score: f64,
        destination: String,
        reasons: String,
    ) {
        let app_name = self
            .profiles
            .get(app_uid)
            .and_then(|profile| profile.lock().app_name.clone());
        let row = self.feedback.record(
            app_uid,
            app_name,
            verdict,
            original_score,
            destination,
            reasons,
        );
        if let Err(error) = self.sink.record_feedback(&row) {
            debug!(%error, "feedback persistence failed");
        }
    }

    pub fn stats(&self) -> EngineStats {
        let reactor = self
            .parts
            .lock()
            .as_ref()
            .map(|parts| parts.reactor_handle.stats.snapshot())
            .unwrap_or_default();
        EngineStats {
            reactor,
            table: self.flow_table.stats(),
            pool: self.buffer_pool.stats(),
            profiles: self.profiles.len(),
        }
    }

    fn spawn_sweeper(&self, analyzer_tx: crossbeam_channel::Sender<Vec<Flow>>) {
        let flow_table = Arc::clone(&self.flow_table);
        let running = Arc::clone(&self.running);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let evicted = flow_table.cleanup_stale();
                if evicted.is_empty() {
                    continue;
                }
                debug!(count = evicted.len(), "sweeper evicted stale flows");
                for batch in evicted.chunks(EVICTION_BATCH) {
                    if analyzer_tx.send(batch.to_vec()).is_err() {
                        return;
                    }
                }
            }
        });
    }

    fn spawn_snapshot_publisher(&self) {
        let flow_table = Arc::clone(&self.flow_table);
        let running = Arc::clone(&self.running);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                flow_table.publish_snapshot();
            }
        });
    }

    fn spawn_profile_flusher(&self) {
        let profiles = Arc::clone(&self.profiles);
        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.running);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(PROFILE_FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let flushed = profiles.flush_dirty(sink.as_ref());
                if flushed > 0 {
                    debug!(flushed, "profiles persisted");
                }
            }
        });
    }

    fn spawn_tun_reader(
        &self,
        mut reader: Box<dyn TunReader>,
        ingress: mpsc::Sender<IngressPacket>,
    ) {
        let flow_table = Arc::clone(&self.flow_table);
        let buffer_pool = Arc::clone(&self.buffer_pool);
        let running = Arc::clone(&self.running);
        std::thread::Builder::new()
            .name("tun-reader".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let mut buffer = buffer_pool.acquire(TUN_READ_SIZE);
                    let n = match reader.read_datagram(&mut buffer) {
                        Ok(0) => {
                            buffer_pool.release(buffer);
                            continue;
                        }
                        Ok(n) => n,
                        Err(error) => {
                            buffer_pool.release(buffer);
                            if running.load(Ordering::SeqCst) {
                                warn!(%error, "tun read failed, treating as stop");
                                running.store(false, Ordering::SeqCst);
                            }
                            break;
                        }
                    };
                    buffer.truncate(n);
                    let owner_uid = match Packet::parse(&buffer) {
                        Some(packet) => flow_table.process(&packet),
                        None => {
                            debug!(bytes = n, "malformed datagram dropped");
                            buffer_pool.release(buffer);
                            continue;
                        }
                    };
                    if ingress
                        .blocking_send(IngressPacket { buffer, owner_uid })
                        .is_err()
                    {
                        break;
                    }
                }
                debug!("tun reader exited");
            })
            .expect("failed to spawn tun reader");
    }
}

fn spawn_tun_writer(
    mut writer: Box<dyn TunWriter>,
    mut frames: mpsc::Receiver<Vec<u8>>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("tun-writer".into())
        .spawn(move || {
            while let Some(frame) = frames.blocking_recv() {
                if frame.is_empty() {
                    continue;
                }
                if let Err(error) = writer.write_datagram(&frame) {
                    warn!(%error, "tun write failed, writer exiting");
                    break;
                }
            }
            debug!("tun writer exited");
        })
        .expect("failed to spawn tun writer")
}
