//! Bloom filters sized from a target capacity and false-positive rate.
//!
//! Double hashing over two independent 64-bit hashes: the platform hasher
//! and an FNV-1a pass. No false negatives, ever.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

const MAX_HASHES: u32 = 16;

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xCBF29CE484222325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001B3);
    }
    hash
}

fn platform_hash(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(data);
    hasher.finish()
}

fn optimal_m(capacity: usize, fp_rate: f64) -> usize {
    let ln2 = std::f64::consts::LN_2;
    ((-(capacity as f64) * fp_rate.ln()) / (ln2 * ln2)).ceil() as usize
}

fn optimal_k(m: usize, capacity: usize) -> u32 {
    let k = ((m as f64 / capacity as f64) * std::f64::consts::LN_2).ceil() as u32;
    k.clamp(1, MAX_HASHES)
}

fn bit_indexes(item: &str, k: u32, m: usize) -> impl Iterator<Item = usize> + '_ {
    let h1 = platform_hash(item.as_bytes());
    let h2 = fnv1a(item.as_bytes());
    (0..k as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m as u64) as usize)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    m: usize,
    k: u32,
    items: u64,
}

impl BloomFilter {
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let m = optimal_m(capacity, fp_rate).max(8);
        Self {
            bits: vec![0u64; m.div_ceil(64)],
            m,
            k: optimal_k(m, capacity),
            items: 0,
        }
    }

    pub fn items(&self) -> u64 {
        self.items
    }

    fn get_bit(&self, index: usize) -> bool {
        self.bits[index / 64] & (1u64 << (index % 64)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.bits[index / 64] |= 1u64 << (index % 64);
    }

    pub fn add(&mut self, item: &str) {
        self.add_and_check_new(item);
    }

    /// Set all `k` bits for `item`; `true` when any bit was previously
    /// clear, i.e. the item was definitely never added before.
    pub fn add_and_check_new(&mut self, item: &str) -> bool {
        let indexes: Vec<usize> = bit_indexes(item, self.k, self.m).collect();
        let mut any_clear = false;
        for index in indexes {
            if !self.get_bit(index) {
                any_clear = true;
                self.set_bit(index);
            }
        }
        if any_clear {
            self.items += 1;
        }
        any_clear
    }

    pub fn might_contain(&self, item: &str) -> bool {
        bit_indexes(item, self.k, self.m).all(|index| self.get_bit(index))
    }

    pub fn to_text(&self) -> String {
        let bytes: Vec<u8> = self
            .bits
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        format!("{},{},{}|{}", self.m, self.k, self.items, hex::encode(bytes))
    }

    pub fn from_text(text: &str) -> Option<Self> {
        let (head, body) = text.split_once('|')?;
        let mut parts = head.split(',');
        let m: usize = parts.next()?.parse().ok()?;
        let k: u32 = parts.next()?.parse().ok()?;
        let items: u64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || m == 0 || !(1..=MAX_HASHES).contains(&k) {
            return None;
        }
        let bytes = hex::decode(body).ok()?;
        if bytes.len() != m.div_ceil(64) * 8 {
            return None;
        }
        let bits = bytes
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        Some(Self { bits, m, k, items })
    }
}

/// Counting variant: 4-bit saturating counters, two per byte, so membership
/// survives removals.
#[derive(Debug, Clone, PartialEq)]
pub struct CountingBloomFilter {
    counters: Vec<u8>,
    m: usize,
    k: u32,
    items: u64,
}

impl CountingBloomFilter {
    const COUNTER_MAX: u8 = 0x0F;

    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let m = optimal_m(capacity, fp_rate).max(8);
        Self {
            counters: vec![0u8; m.div_ceil(2)],
            m,
            k: optimal_k(m, capacity),
            items: 0,
        }
    }

    fn counter(&self, index: usize) -> u8 {
        let byte = self.counters[index / 2];
        if index % 2 == 0 {
            byte & 0x0F
        } else {
            byte >> 4
        }
    }

    fn set_counter(&mut self, index: usize, value: u8) {
        let slot = &mut self.counters[index / 2];
        if index % 2 == 0 {
            *slot = (*slot & 0xF0) | (value & 0x0F);
        } else {
            *slot = (*slot & 0x0F) | (value << 4);
        }
    }

    pub fn add(&mut self, item: &str) {
        let indexes: Vec<usize> = bit_indexes(item, self.k, self.m).collect();
        for index in indexes {
            let current = self.counter(index);
            if current < Self::COUNTER_MAX {
                self.set_counter(index, current + 1);
            }
        }
        self.items += 1;
    }

    /// Decrement the item's counters. Saturated counters stay pinned so a
    /// remove can never create a false negative.
    pub fn remove(&mut self, item: &str) {
        if !self.might_contain(item) {
            return;
        }
        let indexes: Vec<usize> = bit_indexes(item, self.k, self.m).collect();
        for index in indexes {
            let current = self.counter(index);
            if current > 0 && current < Self::COUNTER_MAX {
                self.set_counter(index, current - 1);
            }
        }
        self.items = self.items.saturating_sub(1);
    }

    pub fn might_contain(&self, item: &str) -> bool {
        bit_indexes(item, self.k, self.m).all(|index| self.counter(index) > 0)
    }

    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn to_text(&self) -> String {
        format!(
            "{},{},{}|{}",
            self.m,
            self.k,
            self.items,
            hex::encode(&self.counters)
        )
    }

    pub fn from_text(text: &str) -> Option<Self> {
        let (head, body) = text.split_once('|')?;
        let mut parts = head.split(',');
        let m: usize = parts.next()?.parse().ok()?;
        let k: u32 = parts.next()?.parse().ok()?;
        let items: u64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || m == 0 || !(1..=MAX_HASHES).contains(&k) {
            return None;
        }
        let counters = hex::decode(body).ok()?;
        if counters.len() != m.div_ceil(2) {
            return None;
        }
        Some(Self {
            counters,
            m,
            k,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::new(500, 0.01);
        let items: Vec<String> = (0..500).map(|i| format!("10.1.{}.{}:443", i / 256, i % 256)).collect();
        for item in &items {
            filter.add(item);
        }
        for item in &items {
            assert!(filter.might_contain(item), "lost {item}");
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::new(500, 0.01);
        for i in 0..500 {
            filter.add(&format!("member-{i}"));
        }
        let probes = 10_000;
        let false_positives = (0..probes)
            .filter(|i| filter.might_contain(&format!("outsider-{i}")))
            .count();
        let rate = false_positives as f64 / probes as f64;
        assert!(rate <= 0.02, "observed fp rate {rate}");
    }

    #[test]
    fn add_and_check_new_counts_distinct_items() {
        let mut filter = BloomFilter::new(200, 0.01);
        assert!(filter.add_and_check_new("8.8.8.8:53"));
        assert!(!filter.add_and_check_new("8.8.8.8:53"));
        assert!(filter.add_and_check_new("1.1.1.1:443"));
        assert_eq!(filter.items(), 2);
    }

    #[test]
    fn hash_count_is_clamped() {
        let filter = BloomFilter::new(10, 0.000001);
        assert!(filter.k <= MAX_HASHES);
        assert!(filter.k >= 1);
    }

    #[test]
    fn text_round_trip() {
        let mut filter = BloomFilter::new(100, 0.01);
        for i in 0..50 {
            filter.add(&format!("item-{i}"));
        }
        let restored = BloomFilter::from_text(&filter.to_text()).expect("round trip");
        assert_eq!(restored, filter);
        assert!(restored.might_contain("item-13"));
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(BloomFilter::from_text("").is_none());
        assert!(BloomFilter::from_text("10,2,1|zz").is_none());
        assert!(BloomFilter::from_text("10,99,1|00").is_none());
        // Bitset length disagreeing with m.
        assert!(BloomFilter::from_text("100,3,1|00").is_none());
    }

    #[test]
    fn counting_filter_supports_remove() {
        let mut filter = CountingBloomFilter::new(100, 0.01);
        filter.add("example.com");
        assert!(filter.might_contain("example.com"));
        filter.remove("example.com");
        assert!(!filter.might_contain("example.com"));

        filter.add("example.com");
        filter.add("other.net");
        filter.remove("example.com");
        assert!(
            filter.might_contain("other.net"),
            "removal must never disturb other members"
        );
    }

    #[test]
    fn counting_filter_round_trip() {
        let mut filter = CountingBloomFilter::new(64, 0.01);
        for i in 0..30 {
            filter.add(&format!("sni-{i}.example"));
        }
        let restored = CountingBloomFilter::from_text(&filter.to_text()).expect("round trip");
        assert_eq!(restored, filter);
    }
}
