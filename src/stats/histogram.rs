//! 24-bucket hour-of-day activity histogram.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HourHistogram {
    counts: [u64; 24],
    total: u64,
}

impl HourHistogram {
    const MIN_TOTAL: u64 = 10;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, hour: usize) {
        if hour < 24 {
            self.counts[hour] += 1;
            self.total += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn count(&self, hour: usize) -> u64 {
        if hour < 24 {
            self.counts[hour]
        } else {
            0
        }
    }

    pub fn probability(&self, hour: usize) -> f64 {
        if self.total == 0 || hour >= 24 {
            0.0
        } else {
            self.counts[hour] as f64 / self.total as f64
        }
    }

    /// How unusual is activity in `hour` compared to a uniform day. Zero
    /// until enough observations exist to say anything.
    pub fn unusual_score(&self, hour: usize) -> f64 {
        if self.total < Self::MIN_TOTAL || hour >= 24 {
            return 0.0;
        }
        let avg = 1.0 / 24.0;
        let p = self.probability(hour);
        if p >= avg {
            0.0
        } else if p >= avg / 2.0 {
            0.3
        } else if p >= avg / 4.0 {
            0.6
        } else if self.counts[hour] > 0 {
            0.8
        } else {
            1.0
        }
    }

    pub fn to_text(&self) -> String {
        self.counts
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn from_text(text: &str) -> Option<Self> {
        let values: Vec<u64> = text
            .split(',')
            .map(|v| v.parse().ok())
            .collect::<Option<Vec<_>>>()?;
        if values.len() != 24 {
            return None;
        }
        let mut counts = [0u64; 24];
        counts.copy_from_slice(&values);
        let total = counts.iter().sum();
        Some(Self { counts, total })
    }
}
