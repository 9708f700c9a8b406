//! Volume scorer: is this flow out of proportion for this app?

use super::{FactorMean, ScorerOutput};
use crate::profile::{AppProfile, FlowObservation};

/// Below this many typical bytes there is no baseline worth comparing to.
const MIN_BASELINE_BYTES: f64 = 100.0;
const UPLOAD_SHIFT_MAJOR: f64 = 0.4;
const UPLOAD_SHIFT_MINOR: f64 = 0.2;
const UPLOAD_MAJOR_MIN_BYTES: u64 = 10 * 1024;
const FLOOD_MIN_PACKETS: u64 = 50;
const FLOOD_MAX_AVG_PACKET: f64 = 100.0;

pub(super) fn score(profile: &AppProfile, obs: &FlowObservation) -> ScorerOutput {
    let confidence = profile.maturity.confidence();
    let typical = profile.bytes_in_ema.value() + profile.bytes_out_ema.value();
    if typical <= MIN_BASELINE_BYTES {
        return ScorerOutput::silent(0.0);
    }

    let mut factors = FactorMean::new();
    let mut reasons = Vec::new();
    let total = (obs.bytes_in + obs.bytes_out) as f64;

    let ratio = total / typical;
    let ratio_factor = if ratio > 20.0 {
        1.0
    } else if ratio > 10.0 {
        0.8
    } else if ratio > 5.0 {
        0.5
    } else {
        0.0
    };
    factors.add(ratio_factor);
    if ratio_factor > 0.0 {
        reasons.push(format!("Volume {ratio:.0}x higher than typical"));
    }

    if total > 0.0 {
        let upload_ratio = obs.bytes_out as f64 / total;
        let shift = upload_ratio - profile.typical_upload_ratio();
        if shift > UPLOAD_SHIFT_MAJOR && obs.bytes_out > UPLOAD_MAJOR_MIN_BYTES {
            factors.add(0.7);
            reasons.push(format!(
                "Upload ratio {upload_ratio:.2} far above typical {:.2}",
                profile.typical_upload_ratio()
            ));
        } else if shift > UPLOAD_SHIFT_MINOR {
            factors.add(0.3);
            reasons.push(format!(
                "Upload ratio {upload_ratio:.2} above typical {:.2}",
                profile.typical_upload_ratio()
            ));
        }
    }

    if profile.duration_stats.is_stable() {
        let z = profile.duration_stats.z_score(obs.duration_ms as f64).abs();
        if z > 4.0 {
            factors.add(0.6);
            reasons.push(format!("Flow duration {z:.1} sigma from typical"));
        } else if z > 3.0 {
            factors.add(0.3);
            reasons.push(format!("Flow duration {z:.1} sigma from typical"));
        }
    }

    if obs.packets > FLOOD_MIN_PACKETS && total / (obs.packets as f64) < FLOOD_MAX_AVG_PACKET {
        factors.add(0.5);
        reasons.push("Many small packets (possible scan or tunnel)".to_string());
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

    #[test]
    fn no_baseline_means_no_confidence() {
        let profile = crate::profile::AppProfile::new(1, None);
        let output = score(&profile, &observation());
        assert_eq!(output.score, 0.0);
        assert_eq!(output.confidence, 0.0);
    }

    #[test]
    fn typical_flow_is_quiet() {
        let profile = mature_profile();
        let output = score(&profile, &observation());
        assert_eq!(output.score, 0.0);
        assert!(output.reasons.is_empty());
    }

    #[test]
    fn exfiltration_combines_ratio_and_upload_shift() {
        let profile = mature_profile(); // typical ≈ 2000, upload ratio ≈ 0.3
        let mut obs = observation();
        obs.bytes_in = 1000;
        obs.bytes_out = 200_000;
        let output = score(&profile, &obs);
        assert!(output.score >= 0.85 - 1e-9, "score {}", output.score);
        assert!(output
            .reasons
            .iter()
            .any(|r| r.contains("higher than typical")));
        assert!(output.reasons.iter().any(|r| r.contains("Upload ratio")));
    }

    #[test]
    fn ratio_brackets() {
        let profile = mature_profile();
        let mut obs = observation();
        // 6x typical: ratio factor 0.5 alone.
        obs.bytes_in = 12_000;
        obs.bytes_out = 0;
        let output = score(&profile, &obs);
        assert!((output.score - 0.5).abs() < 1e-9, "score {}", output.score);

        // 12x typical.
        obs.bytes_in = 24_000;
        let output = score(&profile, &obs);
        assert!((output.score - 0.8).abs() < 1e-9, "score {}", output.score);
    }

    #[test]
    fn minor_upload_shift_alone() {
        let profile = mature_profile(); // typical upload ratio ≈ 0.3
        let mut obs = observation();
        // Ratio ~0.6: shift ~0.3 (> 0.2, <= 0.4), small absolute upload.
        obs.bytes_in = 800;
        obs.bytes_out = 1200;
        let output = score(&profile, &obs);
        assert!((output.score - 0.3).abs() < 1e-9, "score {}", output.score);
    }

    #[test]
    fn small_packet_flood_detected() {
        let profile = mature_profile();
        let mut obs = observation();
        obs.packets = 80;
        obs.bytes_in = 2000;
        obs.bytes_out = 1500;
        let output = score(&profile, &obs);
        assert!(output
            .reasons
            .iter()
            .any(|r| r.contains("Many small packets")));
    }

    #[test]
    fn flood_factor_is_strict_at_the_average_boundary() {
        let profile = mature_profile();
        let mut obs = observation();
        obs.packets = 80;
        obs.bytes_out = 0;

        // Exactly 100 bytes per packet stays quiet.
        obs.bytes_in = 8_000;
        let output = score(&profile, &obs);
        assert_eq!(output.score, 0.0, "avg of exactly 100 B must not fire");
        assert!(output.reasons.is_empty());

        // One byte under the boundary fires.
        obs.bytes_in = 7_999;
        let output = score(&profile, &obs);
        assert!((output.score - 0.5).abs() < 1e-9, "score {}", output.score);
        assert!(output
            .reasons
            .iter()
            .any(|r| r.contains("Many small packets")));
    }
}
