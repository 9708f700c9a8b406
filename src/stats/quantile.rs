//! Jain–Chlamtac P² streaming quantile estimation.

/// Single-quantile estimator with the five canonical markers
/// (min, p/2, p, (1+p)/2, max).
#[derive(Debug, Clone, PartialEq)]
pub struct P2Quantile {
    p: f64,
    count: u64,
    initial: Vec<f64>,
    q: [f64; 5],
    n: [f64; 5],
    np: [f64; 5],
    dn: [f64; 5],
}

impl P2Quantile {
    pub fn new(p: f64) -> Self {
        Self {
            p,
            count: 0,
            initial: Vec::with_capacity(5),
            q: [0.0; 5],
            n: [0.0; 5],
            np: [0.0; 5],
            dn: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn update(&mut self, x: f64) {
        self.count += 1;
        if self.count <= 5 {
            self.initial.push(x);
            if self.count == 5 {
                self.initial.sort_by(f64::total_cmp);
                for i in 0..5 {
                    self.q[i] = self.initial[i];
                    self.n[i] = i as f64;
                }
                self.np = [
                    0.0,
                    2.0 * self.p,
                    4.0 * self.p,
                    2.0 + 2.0 * self.p,
                    4.0,
                ];
            }
            return;
        }

        let k = if x < self.q[0] {
            self.q[0] = x;
            0
        } else if x >= self.q[4] {
            self.q[4] = x;
            3
        } else {
            let mut cell = 0;
            for i in 0..4 {
                if self.q[i] <= x && x < self.q[i + 1] {
                    cell = i;
                    break;
                }
            }
            cell
        };

        for i in (k + 1)..5 {
            self.n[i] += 1.0;
        }
        for i in 0..5 {
            self.np[i] += self.dn[i];
        }

        for i in 1..4 {
            let d = self.np[i] - self.n[i];
            let room_right = self.n[i + 1] - self.n[i] > 1.0;
            let room_left = self.n[i - 1] - self.n[i] < -1.0;
            if (d >= 1.0 && room_right) || (d <= -1.0 && room_left) {
                let d = d.signum();
                let candidate = self.parabolic(i, d);
                if self.q[i - 1] < candidate && candidate < self.q[i + 1] {
                    self.q[i] = candidate;
                } else {
                    self.q[i] = self.linear(i, d);
                }
                self.n[i] += d;
            }
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let q = &self.q;
        let n = &self.n;
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let j = (i as f64 + d) as usize;
        self.q[i] + d * (self.q[j] - self.q[i]) / (self.n[j] - self.n[i])
    }

    /// Current estimate. Falls back to the sorted seed buffer until five
    /// observations have arrived.
    pub fn quantile(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        if self.count < 5 {
            let mut sorted = self.initial.clone();
            sorted.sort_by(f64::total_cmp);
            let index = ((sorted.len() - 1) as f64 * self.p).round() as usize;
            return sorted[index];
        }
        self.q[2]
    }

    pub fn to_text(&self) -> String {
        let join = |values: &[f64]| {
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "{},{}|{}|{}|{}|{}",
            self.p,
            self.count,
            join(&self.initial),
            join(&self.q),
            join(&self.n),
            join(&self.np),
        )
    }

    pub fn from_text(text: &str) -> Option<Self> {
        let mut groups = text.split('|');
        let head = groups.next()?;
        let mut head_parts = head.split(',');
        let p: f64 = head_parts.next()?.parse().ok()?;
        let count: u64 = head_parts.next()?.parse().ok()?;
        if head_parts.next().is_some() || !(p > 0.0 && p < 1.0) {
            return None;
        }
        let parse_list = |group: &str| -> Option<Vec<f64>> {
            if group.is_empty() {
                return Some(Vec::new());
            }
            group.split(',').map(|v| v.parse().ok()).collect()
        };
        let initial = parse_list(groups.next()?)?;
        let q_vec = parse_list(groups.next()?)?;
        let n_vec = parse_list(groups.next()?)?;
        let np_vec = parse_list(groups.next()?)?;
        if groups.next().is_some() || q_vec.len() != 5 || n_vec.len() != 5 || np_vec.len() != 5 {
            return None;
        }
        let mut estimator = Self::new(p);
        estimator.count = count;
        estimator.initial = initial;
        estimator.q.copy_from_slice(&q_vec);
        estimator.n.copy_from_slice(&n_vec);
        estimator.np.copy_from_slice(&np_vec);
        Some(estimator)
    }
}

/// The quantile bundle a profile keeps per metric.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantileSet {
    pub p50: P2Quantile,
    pub p90: P2Quantile,
    pub p95: P2Quantile,
    pub p99: P2Quantile,
}

impl QuantileSet {
    pub fn new() -> Self {
        Self {
            p50: P2Quantile::new(0.50),
            p90: P2Quantile::new(0.90),
            p95: P2Quantile::new(0.95),
            p99: P2Quantile::new(0.99),
        }
    }

    pub fn update(&mut self, x: f64) {
        self.p50.update(x);
        self.p90.update(x);
        self.p95.update(x);
        self.p99.update(x);
    }

    pub fn count(&self) -> u64 {
        self.p50.count()
    }

    /// Coarse "how far into the tail is this value" score.
    pub fn extremity_score(&self, x: f64) -> f64 {
        if x <= self.p50.quantile() {
            0.0
        } else if x <= self.p90.quantile() {
            0.3
        } else if x <= self.p95.quantile() {
            0.5
        } else if x <= self.p99.quantile() {
            0.7
        } else if x <= 2.0 * self.p99.quantile() {
            0.85
        } else {
            1.0
        }
    }

    pub fn to_text(&self) -> String {
        format!(
            "{};{};{};{}",
            self.p50.to_text(),
            self.p90.to_text(),
            self.p95.to_text(),
            self.p99.to_text()
        )
    }

    pub fn from_text(text: &str) -> Option<Self> {
        let mut groups = text.split(';');
        let set = Self {
            p50: P2Quantile::from_text(groups.next()?)?,
            p90: P2Quantile::from_text(groups.next()?)?,
            p95: P2Quantile::from_text(groups.next()?)?,
            p99: P2Quantile::from_text(groups.next()?)?,
        };
        if groups.next().is_some() {
            return None;
        }
        Some(set)
    }
}

impl Default for QuantileSet {
    fn default() -> Self {
        Self::new()
    }
}
