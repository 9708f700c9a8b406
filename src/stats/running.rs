//! Welford's online mean/variance accumulator.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    const STABLE_COUNT: u64 = 30;
    const MIN_STDDEV: f64 = 1e-4;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Standard score of `x`; zero when the spread is degenerate.
    pub fn z_score(&self, x: f64) -> f64 {
        let std_dev = self.std_dev();
        if std_dev < Self::MIN_STDDEV {
            0.0
        } else {
            (x - self.mean) / std_dev
        }
    }

    pub fn is_stable(&self) -> bool {
        self.count >= Self::STABLE_COUNT
    }

    pub fn to_text(&self) -> String {
        format!("{},{},{}", self.count, self.mean, self.m2)
    }

    pub fn from_text(text: &str) -> Option<Self> {
        let mut parts = text.split(',');
        let count: u64 = parts.next()?.parse().ok()?;
        let mean: f64 = parts.next()?.parse().ok()?;
        let m2: f64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || m2 < 0.0 {
            return None;
        }
        Some(Self { count, mean, m2 })
    }

    /// Restore from previously known aggregate values. Used by tests and by
    /// profile deserialization fallbacks.
    pub fn from_parts(count: u64, mean: f64, m2: f64) -> Self {
        Self { count, mean, m2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_two_pass_variance() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut stats = RunningStats::new();
        for s in samples {
            stats.update(s);
        }
        assert_eq!(stats.count(), 8);
        assert!((stats.mean() - 5.0).abs() < 1e-12);
        assert!((stats.variance() - 4.0).abs() < 1e-12);
        assert!((stats.std_dev() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn z_score_guards_degenerate_spread() {
        let mut stats = RunningStats::new();
        for _ in 0..50 {
            stats.update(3.0);
        }
        assert_eq!(stats.z_score(100.0), 0.0);
    }

    #[test]
    fn z_score_of_mean_is_zero() {
        let mut stats = RunningStats::new();
        for s in [1.0, 2.0, 3.0, 4.0, 5.0] {
            stats.update(s);
        }
        assert!(stats.z_score(3.0).abs() < 1e-12);
        assert!(stats.z_score(5.0) > 0.0);
    }

    #[test]
    fn stability_needs_thirty_samples() {
        let mut stats = RunningStats::new();
        for i in 0..30 {
            assert!(!stats.is_stable(), "not stable at {i}");
            stats.update(i as f64);
        }
        assert!(stats.is_stable());
    }

    #[test]
    fn text_round_trip() {
        let mut stats = RunningStats::new();
        for s in [0.5, -3.25, 7.75, 1e6, 2.0] {
            stats.update(s);
        }
        let restored = RunningStats::from_text(&stats.to_text()).expect("round trip");
        assert_eq!(restored, stats);
    }

    #[test]
    fn rejects_garbage_text() {
        assert!(RunningStats::from_text("5,1.0").is_none());
        assert!(RunningStats::from_text("5,1.0,-2.0").is_none());
        assert!(RunningStats::from_text("x,1.0,2.0").is_none());
    }
}
