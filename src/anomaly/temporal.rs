//! Temporal scorer: is now a strange time for this app to talk?

use super::{FactorMean, ScorerOutput};
use crate::profile::{AppProfile, FlowObservation};
use chrono::{Datelike, Timelike};

/// Day-of-week deviations only matter once the app has real history.
const DAY_FACTOR_MIN_FLOWS: u64 = 50;
const BEACON_MIN_INTERVALS: u64 = 20;
const BEACON_MIN_MEAN_MS: f64 = 1000.0;

pub(super) fn score(profile: &AppProfile, obs: &FlowObservation) -> ScorerOutput {
    let confidence = profile.maturity.confidence();
    let mut factors = FactorMean::new();
    let mut reasons = Vec::new();

    let hour = obs.timestamp.hour() as usize;
    let hour_factor = profile.hourly.unusual_score(hour);
    factors.add(hour_factor);
    if hour_factor > 0.5 {
        reasons.push(format!("Activity at unusual hour ({hour:02}:00)"));
    }

    let day = obs.timestamp.weekday().num_days_from_sunday() as u8;
    if !profile.day_active(day) && profile.flow_count > DAY_FACTOR_MIN_FLOWS {
        factors.add(0.6);
        reasons.push("Activity on a day this app is normally silent".to_string());
    }

    let interval = &profile.inter_flow_interval;
    if interval.count() > BEACON_MIN_INTERVALS && interval.mean() > BEACON_MIN_MEAN_MS {
        let cv = interval.std_dev() / interval.mean();
        if cv < 0.05 {
            factors.add(0.9);
            reasons.push("Highly regular intervals (possible beacon)".to_string());
        } else if cv < 0.10 {
            factors.add(0.6);
            reasons.push("Fairly regular connection intervals".to_string());
        }
    }

    ScorerOutput {
        score: factors.mean(),
        confidence,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{mature_profile, observation};
    use super::*;
    use crate::profile::MaturityThresholds;
    use crate::stats::RunningStats;
    use chrono::{TimeZone, Utc};

    #[test]
    fn quiet_for_a_typical_flow() {
        let profile = mature_profile();
        let output = score(&profile, &observation());
        assert_eq!(output.score, 0.0);
        assert!(output.reasons.is_empty());
        assert_eq!(output.confidence, 1.0);
    }

    #[test]
    fn beaconing_cadence_dominates() {
        let mut profile = mature_profile();
        // count=100, mean=60s, stddev=500ms -> cv=0.008.
        profile.inter_flow_interval = beacon_stats(100, 60_000.0, 500.0);
        let output = score(&profile, &observation());
        assert!(output.score >= 0.9 - 1e-9, "score {}", output.score);
        assert!(output
            .reasons
            .iter()
            .any(|r| r == "Highly regular intervals (possible beacon)"));
    }

    #[test]
    fn loose_cadence_scores_lower_tier() {
        let mut profile = mature_profile();
        // cv = 0.08 lands in the second bracket.
        profile.inter_flow_interval = beacon_stats(100, 60_000.0, 4800.0);
        let output = score(&profile, &observation());
        assert!((output.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn sub_second_cadence_is_not_beaconing() {
        let mut profile = mature_profile();
        profile.inter_flow_interval = beacon_stats(100, 800.0, 1.0);
        let output = score(&profile, &observation());
        assert_eq!(output.score, 0.0);
    }

    #[test]
    fn silent_day_raises_factor() {
        let profile = mature_profile(); // active Mon/Tue only
        let mut obs = observation();
        // 2026-03-06 is a Friday.
        obs.timestamp = Utc.with_ymd_and_hms(2026, 3, 6, 14, 30, 0).unwrap();
        let output = score(&profile, &obs);
        assert!(output.score >= 0.6 - 1e-9);
        assert!(output
            .reasons
            .iter()
            .any(|r| r.contains("normally silent")));
    }

    #[test]
    fn young_profile_has_no_confidence() {
        let mut profile = crate::profile::AppProfile::new(1, None);
        let obs = observation();
        profile.update(&obs, &MaturityThresholds::default());
        let output = score(&profile, &obs);
        assert_eq!(output.confidence, 0.0);
    }

    fn beacon_stats(count: u64, mean: f64, std_dev: f64) -> RunningStats {
        RunningStats::from_parts(count, mean, std_dev * std_dev * count as f64)
    }
}
