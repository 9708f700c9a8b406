//! Ensemble anomaly scoring over completed flows.
//!
//! Three scorers look at a flow against its app's profile; their outputs are
//! fused by confidence-weighted averaging, then shifted by accumulated user
//! feedback. Scoring always runs before the profile absorbs the flow, so a
//! flow never justifies itself.

mod destination;
mod feedback;
mod temporal;
mod volume;

pub use feedback::FeedbackTracker;

use crate::profile::{AppProfile, FlowObservation};
use serde::Deserialize;

/// One scorer's verdict.
#[derive(Debug, Clone, Default)]
pub struct ScorerOutput {
    pub score: f64,
    pub confidence: f64,
    pub reasons: Vec<String>,
}

impl ScorerOutput {
    fn silent(confidence: f64) -> Self {
        Self {
            score: 0.0,
            confidence,
            reasons: Vec::new(),
        }
    }
}

/// Sum of positive factors averaged by how many fired.
struct FactorMean {
    sum: f64,
    fired: u32,
}

impl FactorMean {
    fn new() -> Self {
        Self { sum: 0.0, fired: 0 }
    }

    fn add(&mut self, factor: f64) {
        if factor > 0.0 {
            self.sum += factor;
            self.fired += 1;
        }
    }

    fn mean(&self) -> f64 {
        if self.fired == 0 {
            0.0
        } else {
            (self.sum / self.fired as f64).clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScorerWeights {
    pub temporal: f64,
    pub volume: f64,
    pub destination: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            temporal: 0.25,
            volume: 0.35,
            destination: 0.40,
        }
    }
}

impl ScorerWeights {
    pub fn is_valid(&self) -> bool {
        let parts = [self.temporal, self.volume, self.destination];
        parts.iter().all(|w| (0.0..=1.0).contains(w)) && parts.iter().sum::<f64>() <= 1.01
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SeverityThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            low: 0.3,
            medium: 0.5,
            high: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_score(score: f64, thresholds: &SeverityThresholds) -> Self {
        if score >= thresholds.high {
            Severity::High
        } else if score >= thresholds.medium {
            Severity::Medium
        } else if score >= thresholds.low {
            Severity::Low
        } else {
            Severity::None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// Fused scoring outcome for one flow.
#[derive(Debug, Clone)]
pub struct AnomalyResult {
    pub score: f64,
    pub severity: Severity,
    pub reasons: Vec<String>,
}

impl AnomalyResult {
    fn quiet() -> Self {
        Self {
            score: 0.0,
            severity: Severity::None,
            reasons: Vec::new(),
        }
    }
}

pub struct AnomalyEnsemble {
    weights: ScorerWeights,
    thresholds: SeverityThresholds,
}

/// Below this total effective weight the profile cannot support a verdict.
const MIN_EFFECTIVE_WEIGHT: f64 = 0.1;

impl AnomalyEnsemble {
    pub fn new(weights: ScorerWeights, thresholds: SeverityThresholds) -> Self {
        Self {
            weights,
            thresholds,
        }
    }

    /// Score `obs` against `profile` as it stood before this flow.
    pub fn score(
        &self,
        profile: &AppProfile,
        obs: &FlowObservation,
        feedback_multiplier: f64,
    ) -> AnomalyResult {
        let outputs = [
            (self.weights.temporal, temporal::score(profile, obs)),
            (self.weights.volume, volume::score(profile, obs)),
            (self.weights.destination, destination::score(profile, obs)),
        ];

        let effective: f64 = outputs.iter().map(|(w, out)| w * out.confidence).sum();
        if effective < MIN_EFFECTIVE_WEIGHT {
            return AnomalyResult::quiet();
        }

        let weighted: f64 = outputs
            .iter()
            .map(|(w, out)| out.score * w * out.confidence)
            .sum();
        let fused = (weighted / effective).clamp(0.0, 1.0);
        let adjusted = (fused * feedback_multiplier).clamp(0.0, 1.0);

        let reasons: Vec<String> = outputs
            .into_iter()
            .flat_map(|(_, out)| out.reasons)
            .collect();
        AnomalyResult {
            score: adjusted,
            severity: Severity::from_score(adjusted, &self.thresholds),
            reasons,
        }
    }
}

impl Default for AnomalyEnsemble {
    fn default() -> Self {
        Self::new(ScorerWeights::default(), SeverityThresholds::default())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{mature_profile, observation};
    use super::*;
    use crate::profile::AppProfile;

    #[test]
    fn zero_confidence_everywhere_gates_to_none() {
        let profile = AppProfile::new(1, None); // infant: confidence 0
        let ensemble = AnomalyEnsemble::default();
        let result = ensemble.score(&profile, &observation(), 1.0);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.severity, Severity::None);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn benign_flow_scores_low_on_mature_profile() {
        let profile = mature_profile();
        let ensemble = AnomalyEnsemble::default();
        let result = ensemble.score(&profile, &observation(), 1.0);
        assert!(result.score < 0.3, "benign score {}", result.score);
        assert_eq!(result.severity, Severity::None);
    }

    #[test]
    fn feedback_multiplier_scales_and_clips() {
        let profile = mature_profile();
        let ensemble = AnomalyEnsemble::default();
        let mut obs = observation();
        // 100x the typical total with an extreme upload share.
        obs.bytes_in = 1000;
        obs.bytes_out = 200_000;
        let neutral = ensemble.score(&profile, &obs, 1.0);
        let damped = ensemble.score(&profile, &obs, 0.3);
        let amplified = ensemble.score(&profile, &obs, 3.0);
        assert!(neutral.score > 0.0);
        assert!(damped.score < neutral.score);
        assert!(amplified.score >= neutral.score);
        assert!(amplified.score <= 1.0);
    }

    #[test]
    fn exfiltration_pattern_scores_at_least_medium() {
        let profile = mature_profile();
        // typical total ≈ 2000, upload ratio ≈ 0.3.
        let ensemble = AnomalyEnsemble::default();
        let mut obs = observation();
        obs.bytes_in = 1000;
        obs.bytes_out = 200_000;
        let result = ensemble.score(&profile, &obs, 1.0);
        assert!(result.score >= 0.5, "score {}", result.score);
        assert!(result.severity >= Severity::Medium);
        assert!(result
            .reasons
            .iter()
            .any(|r| r.contains("higher than typical")));
        assert!(result.reasons.iter().any(|r| r.contains("Upload ratio")));
    }

    #[test]
    fn severity_bucket_boundaries() {
        let thresholds = SeverityThresholds::default();
        assert_eq!(Severity::from_score(0.0, &thresholds), Severity::None);
        assert_eq!(Severity::from_score(0.29, &thresholds), Severity::None);
        assert_eq!(Severity::from_score(0.3, &thresholds), Severity::Low);
        assert_eq!(Severity::from_score(0.5, &thresholds), Severity::Medium);
        assert_eq!(Severity::from_score(0.69, &thresholds), Severity::Medium);
        assert_eq!(Severity::from_score(0.7, &thresholds), Severity::High);
        assert_eq!(Severity::from_score(1.0, &thresholds), Severity::High);
    }

    #[test]
    fn default_weights_are_valid() {
        assert!(ScorerWeights::default().is_valid());
        let bad = ScorerWeights {
            temporal: 0.6,
            volume: 0.6,
            destination: 0.6,
        };
        assert!(!bad.is_valid());
    }
}
