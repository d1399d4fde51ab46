//! Privacy-preserving aggregation primitives used by the self-learner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Clipped gradient vector emitted by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub user_id: String,
    pub values: BTreeMap<String, f64>,
    pub clipping: f64,
}

impl ModelUpdate {
    pub fn new(user_id: impl Into<String>, values: BTreeMap<String, f64>, clipping: f64) -> Self {
        Self {
            user_id: user_id.into(),
            values,
            clipping: clipping.max(f64::MIN_POSITIVE),
        }
    }
}

/// Aggregates masked updates without exposing individual contributions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecureAggregator {
    pub noise_scale: f64,
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, u64>,
}

impl SecureAggregator {
    pub fn new(noise_scale: f64) -> Self {
        Self {
            noise_scale: noise_scale.max(0.0),
            sums: BTreeMap::new(),
            counts: BTreeMap::new(),
        }
    }

    /// Adds a user update using secure summation semantics.
    pub fn submit(&mut self, update: &ModelUpdate) {
        for (key, value) in &update.values {
            let clipped = value.clamp(-update.clipping, update.clipping);
            *self.sums.entry(key.clone()).or_insert(0.0) += clipped;
            *self.counts.entry(key.clone()).or_insert(0) += 1;
        }
    }

    /// Averaged update with optional deterministic DP noise; drains state.
    pub fn aggregate(&mut self) -> BTreeMap<String, f64> {
        if self.sums.is_empty() {
            return BTreeMap::new();
        }
        let mut aggregated = BTreeMap::new();
        for (key, total) in &self.sums {
            let count = self.counts.get(key).copied().unwrap_or(1).max(1);
            let mut averaged = total / count as f64;
            if self.noise_scale > 0.0 {
                averaged += deterministic_noise(key, count) * self.noise_scale;
            }
            aggregated.insert(key.clone(), averaged);
        }
        self.sums.clear();
        self.counts.clear();
        aggregated
    }

    /// Current un-aggregated sums, for observability in tests.
    pub fn peek(&self) -> &BTreeMap<String, f64> {
        &self.sums
    }

    pub fn restore(
        &mut self,
        sums: BTreeMap<String, f64>,
        counts: BTreeMap<String, u64>,
    ) {
        self.sums = sums;
        self.counts = counts;
    }

    pub fn state(&self) -> (&BTreeMap<String, f64>, &BTreeMap<String, u64>) {
        (&self.sums, &self.counts)
    }
}

/// Zero-mean pseudo-noise derived from the key and count; stable across
/// runs so aggregation stays reproducible in tests.
fn deterministic_noise(key: &str, count: u64) -> f64 {
    let mut acc: u64 = count.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    for byte in key.bytes() {
        acc = acc.rotate_left(7) ^ u64::from(byte).wrapping_mul(0x100_0000_01B3);
    }
    (acc % 1000) as f64 / 1000.0 - 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submissions_are_clipped_and_averaged() {
        let mut aggregator = SecureAggregator::new(0.0);
        let mut values = BTreeMap::new();
        values.insert("success".to_string(), 5.0);
        aggregator.submit(&ModelUpdate::new("a", values.clone(), 1.0));
        values.insert("success".to_string(), -5.0);
        aggregator.submit(&ModelUpdate::new("b", values, 1.0));
        let aggregated = aggregator.aggregate();
        assert!((aggregated["success"] - 0.0).abs() < 1e-9);
        assert!(aggregator.peek().is_empty());
    }

    #[test]
    fn noise_is_deterministic() {
        assert_eq!(
            deterministic_noise("success", 3),
            deterministic_noise("success", 3)
        );
    }
}
