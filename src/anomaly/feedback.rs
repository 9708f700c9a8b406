//! User feedback on alerts, folded into a per-app score multiplier.

use crate::hooks::{FeedbackRecord, FeedbackVerdict};
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

const SUSPICIOUS_WEIGHT: f64 = 0.20;
const NORMAL_WEIGHT: f64 = 0.05;
const MULTIPLIER_FLOOR: f64 = 0.3;
const MULTIPLIER_CEIL: f64 = 3.0;

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    suspicious: u32,
    normal: u32,
}

/// Append-only feedback memory. The caller persists the returned records;
/// the tracker only needs the tallies.
#[derive(Default)]
pub struct FeedbackTracker {
    tallies: Mutex<FxHashMap<i32, Tally>>,
}

impl FeedbackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one verdict and return the row to persist.
    pub fn record(
        &self,
        app_uid: i32,
        app_name: Option<String>,
        verdict: FeedbackVerdict,
        original_score: f64,
        destination: String,
        reasons: String,
    ) -> FeedbackRecord {
        let mut guard = self.tallies.lock();
        let tally = guard.entry(app_uid).or_default();
        match verdict {
            FeedbackVerdict::Suspicious => tally.suspicious += 1,
            FeedbackVerdict::Normal => tally.normal += 1,
        }
        FeedbackRecord {
            app_uid,
            app_name,
            verdict,
            original_score,
            destination,
            reasons,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Restore a tally from persisted history at startup.
    pub fn preload(&self, app_uid: i32, verdict: FeedbackVerdict) {
        let mut guard = self.tallies.lock();
        let tally = guard.entry(app_uid).or_default();
        match verdict {
            FeedbackVerdict::Suspicious => tally.suspicious += 1,
            FeedbackVerdict::Normal => tally.normal += 1,
        }
    }

    /// Suspicion multiplier in [0.3, 3.0]; 1.0 for apps without feedback.
    pub fn multiplier(&self, app_uid: i32) -> f64 {
        let guard = self.tallies.lock();
        let Some(tally) = guard.get(&app_uid) else {
            return 1.0;
        };
        let raw = 1.0 + SUSPICIOUS_WEIGHT * tally.suspicious as f64
            - NORMAL_WEIGHT * tally.normal as f64;
        raw.clamp(MULTIPLIER_FLOOR, MULTIPLIER_CEIL)
    }
}
