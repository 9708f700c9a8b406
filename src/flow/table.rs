//! Concurrent flow table: creation, accounting, eviction, UI snapshots.

use super::{Flow, FlowKey, FlowSnapshot};
use crate::hooks::{OwnerResolver, UNKNOWN_UID};
use crate::packet::Packet;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lookups are re-issued until this many guest packets have been seen.
const OWNER_LOOKUP_PACKET_LIMIT: u64 = 5;

/// Evictions are handed downstream in slices of this size.
pub const EVICTION_BATCH: usize = 50;

#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    pub flows_created: u64,
    pub flows_evicted: u64,
    pub owner_lookups: u64,
}

pub struct FlowTable {
    flows: Mutex<FxHashMap<FlowKey, Flow>>,
    resolver: Arc<dyn OwnerResolver>,
    idle_timeout: Duration,
    snapshot: RwLock<Arc<Vec<FlowSnapshot>>>,
    flows_created: AtomicU64,
    flows_evicted: AtomicU64,
    owner_lookups: AtomicU64,
}

impl FlowTable {
    pub fn new(resolver: Arc<dyn OwnerResolver>, idle_timeout: Duration) -> Self {
        Self {
            flows: Mutex::new(FxHashMap::default()),
            resolver,
            idle_timeout,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            flows_created: AtomicU64::new(0),
            flows_evicted: AtomicU64::new(0),
            owner_lookups: AtomicU64::new(0),
        }
    }

    /// Account one guest datagram, creating the flow on first sight.
    /// Returns the flow's current owner uid for the blocklist check.
    ///
    /// The ownership lookup may block, so it runs with the table unlocked;
    /// only the ingest task creates flows, so the entry cannot race.
    pub fn process(&self, packet: &Packet<'_>) -> i32 {
        let key = FlowKey::from_packet(packet);
        let wants_owner = {
            let guard = self.flows.lock();
            match guard.get(&key) {
                Some(flow) => {
                    flow.app_uid == UNKNOWN_UID && flow.packets < OWNER_LOOKUP_PACKET_LIMIT
                }
                None => true,
            }
        };
        let resolved = if wants_owner {
            let uid = self.lookup_uid(&key);
            let name = if uid == UNKNOWN_UID {
                None
            } else {
                self.resolver.app_name(uid)
            };
            Some((uid, name))
        } else {
            None
        };

        let mut guard = self.flows.lock();
        let flow = guard.entry(key).or_insert_with(|| {
            self.flows_created.fetch_add(1, Ordering::Relaxed);
            Flow::new(key, UNKNOWN_UID)
        });
        if let Some((uid, name)) = resolved {
            if flow.app_uid == UNKNOWN_UID && uid != UNKNOWN_UID {
                flow.app_uid = uid;
                if flow.app_name.is_none() {
                    flow.app_name = name;
                }
            }
        }
        flow.record_packet(packet);
        flow.app_uid
    }

    fn lookup_uid(&self, key: &FlowKey) -> i32 {
        self.owner_lookups.fetch_add(1, Ordering::Relaxed);
        self.resolver.uid_for(key.protocol, key.local(), key.remote())
    }

    /// Credit bytes re-injected toward the guest.
    pub fn record_response(&self, key: &FlowKey, total_len: usize) {
        if let Some(flow) = self.flows.lock().get_mut(key) {
            flow.record_response(total_len);
        }
    }

    /// Mark a flow finished so the next sweep evicts it.
    pub fn mark_closed(&self, key: &FlowKey) {
        if let Some(flow) = self.flows.lock().get_mut(key) {
            flow.closed = true;
        }
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove closed and idle flows. The caller batches the result toward
    /// the persistence pipeline in [`EVICTION_BATCH`]-sized slices.
    pub fn cleanup_stale(&self) -> Vec<Flow> {
        let now = Instant::now();
        let mut guard = self.flows.lock();
        let stale: Vec<FlowKey> = guard
            .iter()
            .filter(|(_, flow)| flow.closed || flow.idle_for(now) > self.idle_timeout)
            .map(|(key, _)| *key)
            .collect();
        let mut evicted = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(flow) = guard.remove(&key) {
                evicted.push(flow);
            }
        }
        self.flows_evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    /// Drain every flow, attempting one final owner resolution. Called once
    /// on shutdown; must complete before the process exits.
    pub fn flush_all(&self) -> Vec<Flow> {
        let drained: Vec<Flow> = {
            let mut guard = self.flows.lock();
            let keys: Vec<FlowKey> = guard.keys().copied().collect();
            keys.into_iter().filter_map(|key| guard.remove(&key)).collect()
        };
        let mut flows = drained;
        for flow in &mut flows {
            if flow.app_uid != UNKNOWN_UID && flow.app_name.is_none() {
                flow.app_name = self.resolver.app_name(flow.app_uid);
            }
        }
        self.flows_evicted
            .fetch_add(flows.len() as u64, Ordering::Relaxed);
        flows
    }

    /// Rebuild the UI-facing snapshot, most recently touched first.
    pub fn publish_snapshot(&self) {
        let entries: Vec<(Instant, FlowSnapshot)> = {
            let guard = self.flows.lock();
            guard
                .values()
                .map(|flow| (flow.last_seen, flow.snapshot()))
                .collect()
        };
        let mut entries = entries;
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        let snapshot: Vec<FlowSnapshot> = entries.into_iter().map(|(_, s)| s).collect();
        *self.snapshot.write() = Arc::new(snapshot);
    }

    pub fn snapshot(&self) -> Arc<Vec<FlowSnapshot>> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            flows_created: self.flows_created.load(Ordering::Relaxed),
            flows_evicted: self.flows_evicted.load(Ordering::Relaxed),
            owner_lookups: self.owner_lookups.load(Ordering::Relaxed),
        }
    }
}
