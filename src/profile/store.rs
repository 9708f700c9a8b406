//! Profile cache with dirty tracking and opportunistic persistence.

use super::{AppProfile, MaturityThresholds};
use crate::hooks::{PersistenceSink, ProfileRecord};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::debug;

/// Per-app profiles behind individual locks. The outer map lock is held
/// only long enough to clone the `Arc`; updates take the per-profile lock.
pub struct ProfileStore {
    profiles: Mutex<FxHashMap<i32, Arc<Mutex<AppProfile>>>>,
    dirty: Mutex<FxHashSet<i32>>,
    thresholds: MaturityThresholds,
}

impl ProfileStore {
    pub fn new(thresholds: MaturityThresholds) -> Self {
        Self {
            profiles: Mutex::new(FxHashMap::default()),
            dirty: Mutex::new(FxHashSet::default()),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &MaturityThresholds {
        &self.thresholds
    }

    pub fn get_or_create(&self, uid: i32, name: Option<&str>) -> Arc<Mutex<AppProfile>> {
        let mut guard = self.profiles.lock();
        let entry = guard
            .entry(uid)
            .or_insert_with(|| Arc::new(Mutex::new(AppProfile::new(uid, name.map(String::from)))));
        let profile = Arc::clone(entry);
        drop(guard);
        if let Some(name) = name {
            let mut locked = profile.lock();
            if locked.app_name.is_none() {
                locked.app_name = Some(name.to_string());
            }
        }
        profile
    }

    pub fn get(&self, uid: i32) -> Option<Arc<Mutex<AppProfile>>> {
        self.profiles.lock().get(&uid).cloned()
    }

    /// Restore a persisted profile, e.g. at startup.
    pub fn load_row(&self, row: &ProfileRecord) {
        let profile = AppProfile::from_row(row, &self.thresholds);
        self.profiles
            .lock()
            .insert(row.app_uid, Arc::new(Mutex::new(profile)));
    }

    pub fn mark_dirty(&self, uid: i32) {
        self.dirty.lock().insert(uid);
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Write every dirty profile through the sink. Rows the sink rejects
    /// stay dirty so the next flush retries them implicitly.
    pub fn flush_dirty(&self, sink: &dyn PersistenceSink) -> usize {
        let pending: Vec<i32> = self.dirty.lock().drain().collect();
        let mut flushed = 0;
        for uid in pending {
            let Some(profile) = self.get(uid) else { continue };
            let row = profile.lock().to_row();
            match sink.record_profile(&row) {
                Ok(()) => flushed += 1,
                Err(error) => {
                    debug!(uid, %error, "profile persist failed, keeping dirty");
                    self.dirty.lock().insert(uid);
                }
            }
        }
        flushed
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::testing::MemorySink;
    use crate::profile::FlowObservation;
    use chrono::Utc;
    use std::sync::atomic::Ordering;

    fn sample_observation() -> FlowObservation {
        FlowObservation {
            timestamp: Utc::now(),
            protocol: crate::packet::PROTO_UDP,
            destination: "8.8.8.8:53".into(),
            dst_port: 53,
            bytes_in: 80,
            bytes_out: 200,
            packets: 2,
            duration_ms: 40,
            sni: None,
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let store = ProfileStore::new(MaturityThresholds::default());
        let first = store.get_or_create(1000, Some("com.app"));
        let second = store.get_or_create(1000, None);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
        assert_eq!(second.lock().app_name.as_deref(), Some("com.app"));
    }

    #[test]
    fn late_name_fills_in() {
        let store = ProfileStore::new(MaturityThresholds::default());
        store.get_or_create(1000, None);
        let profile = store.get_or_create(1000, Some("com.late"));
        assert_eq!(profile.lock().app_name.as_deref(), Some("com.late"));
    }

    #[test]
    fn flush_writes_dirty_profiles_once() {
        let store = ProfileStore::new(MaturityThresholds::default());
        let profile = store.get_or_create(1000, Some("com.app"));
        profile
            .lock()
            .update(&sample_observation(), store.thresholds());
        store.mark_dirty(1000);

        let sink = MemorySink::default();
        assert_eq!(store.flush_dirty(&sink), 1);
        assert_eq!(sink.profiles.lock().len(), 1);
        assert_eq!(store.dirty_count(), 0);
        // Nothing new to write.
        assert_eq!(store.flush_dirty(&sink), 0);
    }

    #[test]
    fn failed_flush_keeps_dirty_flag() {
        let store = ProfileStore::new(MaturityThresholds::default());
        let profile = store.get_or_create(1000, None);
        profile
            .lock()
            .update(&sample_observation(), store.thresholds());
        store.mark_dirty(1000);

        let sink = MemorySink::default();
        sink.fail_profiles.store(true, Ordering::Relaxed);
        assert_eq!(store.flush_dirty(&sink), 0);
        assert_eq!(store.dirty_count(), 1);

        sink.fail_profiles.store(false, Ordering::Relaxed);
        assert_eq!(store.flush_dirty(&sink), 1);
        assert_eq!(store.dirty_count(), 0);
    }

    #[test]
    fn load_row_restores_profile() {
        let store = ProfileStore::new(MaturityThresholds::default());
        let profile = store.get_or_create(7, Some("com.seven"));
        for _ in 0..35 {
            profile
                .lock()
                .update(&sample_observation(), store.thresholds());
        }
        let row = profile.lock().to_row();

        let fresh = ProfileStore::new(MaturityThresholds::default());
        fresh.load_row(&row);
        let restored = fresh.get(7).expect("restored profile");
        assert_eq!(restored.lock().flow_count, 35);
        assert_eq!(
            restored.lock().maturity,
            crate::profile::Maturity::Learning
        );
    }
}
