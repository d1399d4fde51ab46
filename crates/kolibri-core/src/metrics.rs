//! Runtime SLO instrumentation: per-stage latency windows and breach reports.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

/// Percentile snapshot for a single pipeline stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StageStats {
    pub count: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

fn quantile(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if percentile <= 0.0 {
        return sorted[0];
    }
    if percentile >= 1.0 {
        return sorted[sorted.len() - 1];
    }
    let position = percentile * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Sliding window of latency samples (milliseconds) for one stage.
#[derive(Debug, Clone)]
struct SloWindow {
    limit: usize,
    samples: VecDeque<f64>,
}

impl SloWindow {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            samples: VecDeque::new(),
        }
    }

    fn observe(&mut self, value: f64) {
        self.samples.push_back(value);
        while self.samples.len() > self.limit {
            self.samples.pop_front();
        }
    }

    fn snapshot(&self) -> StageStats {
        if self.samples.is_empty() {
            return StageStats::default();
        }
        let mut ordered: Vec<f64> = self.samples.iter().copied().collect();
        ordered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        StageStats {
            count: ordered.len() as f64,
            p50: quantile(&ordered, 0.5),
            p95: quantile(&ordered, 0.95),
            p99: quantile(&ordered, 0.99),
        }
    }
}

/// Aggregates latency samples for runtime pipeline stages.
///
/// Windows live in a concurrent map so timing guards can record through a
/// shared reference while the orchestrator owns the tracker.
pub struct SloTracker {
    window_size: usize,
    stages: DashMap<String, SloWindow>,
    thresholds: BTreeMap<String, f64>,
    default_threshold: Option<f64>,
}

impl Default for SloTracker {
    fn default() -> Self {
        Self::new(200, BTreeMap::new(), Some(750.0))
    }
}

impl SloTracker {
    pub fn new(
        window: usize,
        thresholds: BTreeMap<String, f64>,
        default_threshold: Option<f64>,
    ) -> Self {
        Self {
            window_size: window.max(1),
            stages: DashMap::new(),
            thresholds,
            default_threshold,
        }
    }

    pub fn observe(&self, stage: &str, value_ms: f64) {
        self.stages
            .entry(stage.to_string())
            .or_insert_with(|| SloWindow::new(self.window_size))
            .observe(value_ms);
    }

    /// SLA threshold for the stage, measured against p95.
    pub fn configure_threshold(&mut self, stage: &str, p95_limit: f64) {
        self.thresholds.insert(stage.to_string(), p95_limit);
    }

    pub fn report(&self) -> BTreeMap<String, StageStats> {
        self.stages
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Structured report with thresholds and the list of breached stages.
    pub fn build_report(&self) -> serde_json::Value {
        let snapshot = self.report();
        let mut breaches = BTreeMap::new();
        for (stage, stats) in &snapshot {
            let threshold = self
                .thresholds
                .get(stage)
                .copied()
                .or(self.default_threshold);
            if let Some(limit) = threshold {
                if stats.p95 > limit {
                    breaches.insert(
                        stage.clone(),
                        serde_json::json!({"p95": stats.p95, "limit": limit}),
                    );
                }
            }
        }
        let mut report = serde_json::json!({
            "stages": snapshot,
            "thresholds": self.thresholds,
        });
        if !breaches.is_empty() {
            report["breaches"] = serde_json::json!(breaches);
        }
        if let Some(default) = self.default_threshold {
            report["default_threshold"] = serde_json::json!(default);
        }
        report
    }

    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.build_report()).unwrap_or_default()
    }

    /// Guard that records the elapsed wall time for `stage` on drop.
    pub fn time_stage<'a>(&'a self, stage: &str) -> StageTimer<'a> {
        StageTimer {
            tracker: self,
            stage: stage.to_string(),
            start: Instant::now(),
        }
    }

    /// Borrow-free variant of [`SloTracker::time_stage`] for callers that
    /// hold the tracker behind an `Arc` and need to keep mutating
    /// themselves while the timer runs.
    pub fn time_stage_owned(self: &std::sync::Arc<Self>, stage: &str) -> OwnedStageTimer {
        OwnedStageTimer {
            tracker: self.clone(),
            stage: stage.to_string(),
            start: Instant::now(),
        }
    }
}

/// RAII stage timer handed out by [`SloTracker::time_stage`].
pub struct StageTimer<'a> {
    tracker: &'a SloTracker,
    stage: String,
    start: Instant,
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.tracker.observe(&self.stage, elapsed_ms);
    }
}

/// Owning stage timer handed out by [`SloTracker::time_stage_owned`].
pub struct OwnedStageTimer {
    tracker: std::sync::Arc<SloTracker>,
    stage: String,
    start: Instant,
}

impl Drop for OwnedStageTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.tracker.observe(&self.stage, elapsed_ms);
    }
}
