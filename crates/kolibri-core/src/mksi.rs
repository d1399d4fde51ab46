//! Rolling six-axis quality snapshot (mKSI) computed from runtime events
//! and SLO data, with best-effort file and HTTP export.

use crate::metrics::StageStats;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Individual mKSI axis values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MksiValues {
    pub generalization: f64,
    pub parsimony: f64,
    pub autonomy: f64,
    pub reliability: f64,
    pub explainability: f64,
    pub usability: f64,
}

impl MksiValues {
    pub fn mksi(&self) -> f64 {
        (self.generalization
            + self.parsimony
            + self.autonomy
            + self.reliability
            + self.explainability
            + self.usability)
            / 6.0
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "generalization": self.generalization,
            "parsimony": self.parsimony,
            "autonomy": self.autonomy,
            "reliability": self.reliability,
            "explainability": self.explainability,
            "usability": self.usability,
            "mksi": self.mksi(),
        })
    }
}

/// Current and rolling mKSI snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MksiReport {
    pub current: MksiValues,
    pub rolling: MksiValues,
}

impl MksiReport {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "current": self.current.to_value(),
            "rolling": self.rolling.to_value(),
        })
    }
}

/// Per-request observation handed to the aggregator.
#[derive(Debug, Clone, Default)]
pub struct MksiObservation {
    pub modalities: Vec<String>,
    pub plan_steps: usize,
    pub execution_statuses: Vec<String>,
    pub reasoning_steps: usize,
    pub adjustments: BTreeMap<String, f64>,
    pub cached: bool,
    pub slo_snapshot: BTreeMap<String, StageStats>,
}

/// Aggregates runtime events and SLO data into mKSI values.
pub struct MksiAggregator {
    history: VecDeque<MksiValues>,
    window: usize,
    slo_targets: BTreeMap<String, f64>,
    latency_budget_ms: f64,
    modality_ceiling: usize,
    reasoning_target: f64,
    default_stage_budget: f64,
    export_file: Option<PathBuf>,
    export_endpoint: Option<String>,
    http_timeout: Duration,
    http: reqwest::Client,
}

impl Default for MksiAggregator {
    fn default() -> Self {
        Self::new(20, BTreeMap::new(), 2500.0, None, None)
    }
}

impl MksiAggregator {
    pub fn new(
        window: usize,
        slo_targets: BTreeMap<String, f64>,
        latency_budget_ms: f64,
        export_file: Option<PathBuf>,
        export_endpoint: Option<String>,
    ) -> Self {
        let latency_budget_ms = latency_budget_ms.max(0.0);
        Self {
            history: VecDeque::new(),
            window: window.max(1),
            slo_targets,
            latency_budget_ms,
            modality_ceiling: 4,
            reasoning_target: 2.0,
            default_stage_budget: if latency_budget_ms > 0.0 {
                latency_budget_ms / 6.0
            } else {
                600.0
            },
            export_file,
            export_endpoint,
            http_timeout: Duration::from_secs(2),
            http: reqwest::Client::new(),
        }
    }

    /// Records a runtime interaction and updates rolling averages. Export
    /// is best-effort and never fails the caller.
    pub async fn observe(&mut self, observation: &MksiObservation) -> MksiReport {
        let current = self.compute(observation);
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(current);
        let report = MksiReport {
            current,
            rolling: self.rolling(),
        };
        self.export(&report).await;
        report
    }

    /// Most recent snapshot without recording a new event.
    pub fn report(&self) -> MksiReport {
        MksiReport {
            current: self.history.back().copied().unwrap_or_default(),
            rolling: self.rolling(),
        }
    }

    fn rolling(&self) -> MksiValues {
        if self.history.is_empty() {
            return MksiValues::default();
        }
        let count = self.history.len() as f64;
        let mut sum = MksiValues::default();
        for values in &self.history {
            sum.generalization += values.generalization;
            sum.parsimony += values.parsimony;
            sum.autonomy += values.autonomy;
            sum.reliability += values.reliability;
            sum.explainability += values.explainability;
            sum.usability += values.usability;
        }
        MksiValues {
            generalization: sum.generalization / count,
            parsimony: sum.parsimony / count,
            autonomy: sum.autonomy / count,
            reliability: sum.reliability / count,
            explainability: sum.explainability / count,
            usability: sum.usability / count,
        }
    }

    fn compute(&self, observation: &MksiObservation) -> MksiValues {
        let total = observation.execution_statuses.len().max(1) as f64;
        let count = |status: &str| {
            observation
                .execution_statuses
                .iter()
                .filter(|s| s == &status)
                .count() as f64
        };
        let ok = count("ok");
        let policy_blocked = count("policy_blocked");
        let missing = count("missing");
        let skipped = count("skipped");
        let plan_total = observation.plan_steps.max(1) as f64;
        let success_ratio = ok / total;

        let unique_modalities: std::collections::BTreeSet<&String> =
            observation.modalities.iter().collect();
        let modality_score =
            (unique_modalities.len() as f64 / self.modality_ceiling as f64).min(1.0);
        let cache_penalty = if observation.cached { 0.1 } else { 0.0 };
        let generalization =
            clamp01(0.55 * success_ratio + 0.35 * modality_score + 0.1 - cache_penalty);

        let non_productive = (plan_total - ok).max(0.0);
        let parsimony = clamp01(1.0 - 0.8 * (non_productive / plan_total));

        let autonomy_base = if observation.cached { 0.55 } else { 0.85 };
        let autonomy = clamp01(
            autonomy_base - 0.6 * (policy_blocked / plan_total)
                - 0.3 * ((missing + skipped) / plan_total),
        );

        let reliability = self.reliability(success_ratio, &observation.slo_snapshot);

        let reasoning_ratio = observation.reasoning_steps as f64 / plan_total;
        let reasoning_score = (reasoning_ratio / self.reasoning_target).min(1.0);
        let explainability = clamp01(0.5 * reasoning_score + 0.5 * (ok / plan_total));

        let usability = self.usability(&observation.adjustments, &observation.slo_snapshot);

        MksiValues {
            generalization,
            parsimony,
            autonomy,
            reliability,
            explainability,
            usability,
        }
    }

    fn reliability(
        &self,
        success_ratio: f64,
        slo_snapshot: &BTreeMap<String, StageStats>,
    ) -> f64 {
        let mut stage_scores: Vec<f64> = Vec::new();
        for (stage, stats) in slo_snapshot {
            let target = self
                .slo_targets
                .get(stage)
                .copied()
                .unwrap_or(self.default_stage_budget);
            if target <= 0.0 {
                continue;
            }
            let ratio = stats.p95 / target;
            stage_scores.push(if ratio <= 1.0 {
                1.0
            } else if ratio <= 1.5 {
                0.6
            } else {
                0.2
            });
        }
        let latency_score = if stage_scores.is_empty() {
            0.5
        } else {
            stage_scores.iter().sum::<f64>() / stage_scores.len() as f64
        };
        clamp01(0.6 * success_ratio + 0.4 * latency_score)
    }

    fn usability(
        &self,
        adjustments: &BTreeMap<String, f64>,
        slo_snapshot: &BTreeMap<String, StageStats>,
    ) -> f64 {
        let total_latency: f64 = slo_snapshot.values().map(|stats| stats.p50).sum();
        let latency_score = if self.latency_budget_ms > 0.0 {
            1.0 - (total_latency / self.latency_budget_ms).min(1.0)
        } else {
            0.5
        };
        let adjustment_penalty = if adjustments.is_empty() {
            0.0
        } else {
            (adjustments.values().map(|value| value.abs()).sum::<f64>()
                / adjustments.len() as f64)
                .min(1.0)
        };
        clamp01(0.7 * latency_score + 0.3 * (1.0 - adjustment_penalty))
    }

    /// Best-effort telemetry: file write plus a bounded-timeout POST.
    async fn export(&self, report: &MksiReport) {
        let payload = report.to_value();
        if let Some(path) = &self.export_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            if let Err(error) =
                std::fs::write(path, serde_json::to_string_pretty(&payload).unwrap_or_default())
            {
                tracing::debug!(target: "kolibri::mksi", error = %error, "mksi file export failed");
            }
        }
        if let Some(endpoint) = &self.export_endpoint {
            let send = self
                .http
                .post(endpoint)
                .timeout(self.http_timeout)
                .json(&payload)
                .send()
                .await;
            if let Err(error) = send {
                tracing::debug!(target: "kolibri::mksi", error = %error, "mksi http export failed");
            }
        }
    }
}
