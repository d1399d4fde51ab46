//! Background self-learning: weak supervision signals are weighted by
//! inverse confidence, securely aggregated per task, and folded into a
//! continual learner. A per-task drift EMA flags degrading tasks.

use crate::encoders::ContinualLearner;
use crate::personalization::{ModelUpdate, SecureAggregator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum LearnerError {
    #[error("learner io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("learner format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Single training signal captured for background learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfLearningSample {
    pub task_id: String,
    pub gradients: BTreeMap<String, f64>,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Tunables for the self-learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    pub noise_scale: f64,
    pub clipping: f64,
    pub min_weight: f64,
    pub history_size: usize,
    pub sample_limit: usize,
    pub consolidation: f64,
    /// EMA smoothing for the drift signal, in (0, 1].
    pub drift_alpha: f64,
    /// Tasks whose drift EMA reaches this level count as degraded.
    pub drift_threshold: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            noise_scale: 0.0,
            clipping: 1.0,
            min_weight: 0.05,
            history_size: 32,
            sample_limit: 256,
            consolidation: 0.5,
            drift_alpha: 0.3,
            drift_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryEntry {
    timestamp: DateTime<Utc>,
    updates: BTreeMap<String, BTreeMap<String, f64>>,
    pending: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize)]
struct PersistedAggregator {
    noise_scale: f64,
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    config: LearnerConfig,
    aggregators: BTreeMap<String, PersistedAggregator>,
    pending_counts: BTreeMap<String, u64>,
    drift: BTreeMap<String, f64>,
    history: Vec<HistoryEntry>,
    samples: Vec<SelfLearningSample>,
    learner: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Aggregates weak supervision signals and updates a continual learner.
pub struct BackgroundSelfLearner {
    config: LearnerConfig,
    learner: ContinualLearner,
    aggregators: BTreeMap<String, SecureAggregator>,
    pending_counts: BTreeMap<String, u64>,
    drift: BTreeMap<String, f64>,
    history: VecDeque<HistoryEntry>,
    samples: VecDeque<SelfLearningSample>,
}

impl Default for BackgroundSelfLearner {
    fn default() -> Self {
        Self::new(LearnerConfig::default())
    }
}

impl BackgroundSelfLearner {
    pub fn new(config: LearnerConfig) -> Self {
        let learner = ContinualLearner::new(config.consolidation);
        Self {
            config,
            learner,
            aggregators: BTreeMap::new(),
            pending_counts: BTreeMap::new(),
            drift: BTreeMap::new(),
            history: VecDeque::new(),
            samples: VecDeque::new(),
        }
    }

    /// Stores a training signal to be processed in the background. Each
    /// gradient is weighted by `max(min_weight, 1 - clamp(confidence))`:
    /// low-confidence outcomes teach the most.
    pub fn enqueue(
        &mut self,
        task_id: &str,
        gradients: BTreeMap<String, f64>,
        confidence: f64,
        metadata: BTreeMap<String, String>,
        user_id: &str,
    ) {
        if gradients.is_empty() {
            return;
        }
        let confidence = confidence.clamp(0.0, 1.0);
        let weight = (1.0 - confidence).max(self.config.min_weight);
        let scaled: BTreeMap<String, f64> = gradients
            .iter()
            .map(|(name, value)| (name.clone(), value * weight))
            .collect();
        let aggregator = self
            .aggregators
            .entry(task_id.to_string())
            .or_insert_with(|| SecureAggregator::new(self.config.noise_scale));
        aggregator.submit(&ModelUpdate::new(user_id, scaled, self.config.clipping));

        self.update_drift(task_id, metadata.get("status").map(String::as_str));

        self.samples.push_back(SelfLearningSample {
            task_id: task_id.to_string(),
            gradients,
            confidence,
            metadata,
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
        });
        while self.samples.len() > self.config.sample_limit {
            self.samples.pop_front();
        }
        *self.pending_counts.entry(task_id.to_string()).or_insert(0) += 1;
    }

    /// Aggregates pending per-task updates and refreshes learner weights.
    pub fn step(&mut self) -> BTreeMap<String, BTreeMap<String, f64>> {
        let mut updates: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (task_id, aggregator) in self.aggregators.iter_mut() {
            let pending = self.pending_counts.get(task_id).copied().unwrap_or(0);
            if pending == 0 {
                continue;
            }
            let aggregated = aggregator.aggregate();
            self.pending_counts.insert(task_id.clone(), 0);
            if aggregated.is_empty() {
                continue;
            }
            let trained = self.learner.train(task_id, &aggregated);
            updates.insert(task_id.clone(), trained);
        }
        self.history.push_back(HistoryEntry {
            timestamp: Utc::now(),
            updates: updates.clone(),
            pending: self.pending_counts.clone(),
        });
        while self.history.len() > self.config.history_size {
            self.history.pop_front();
        }
        updates
    }

    /// EMA of the error signal derived from the execution status.
    fn update_drift(&mut self, task_id: &str, status: Option<&str>) {
        let signal = match status {
            Some("ok") | Some("cached") | Some("success") => 0.0,
            Some("skipped") | Some("noop") => 0.1,
            _ => 1.0,
        };
        let alpha = self.config.drift_alpha.clamp(f64::MIN_POSITIVE, 1.0);
        let previous = self.drift.get(task_id).copied().unwrap_or(0.0);
        self.drift
            .insert(task_id.to_string(), alpha * signal + (1.0 - alpha) * previous);
    }

    pub fn drift(&self, task_id: &str) -> f64 {
        self.drift.get(task_id).copied().unwrap_or(0.0)
    }

    /// Tasks whose drift EMA reached the configured threshold.
    pub fn degraded_tasks(&self) -> Vec<String> {
        self.drift
            .iter()
            .filter(|(_, drift)| **drift >= self.config.drift_threshold)
            .map(|(task, _)| task.clone())
            .collect()
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "tasks": self.aggregators.keys().collect::<Vec<_>>(),
            "pending": self.pending_counts,
            "drift": self.drift,
            "history": self.history.iter().collect::<Vec<_>>(),
        })
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn recent_samples(&self, limit: usize) -> Vec<&SelfLearningSample> {
        let skip = self.samples.len().saturating_sub(limit);
        self.samples.iter().skip(skip).collect()
    }

    pub fn task_weights(&self, task_id: &str) -> Option<&BTreeMap<String, f64>> {
        self.learner.task_weights(task_id)
    }

    /// Persists config, aggregator state, pending counts, drift, weights,
    /// history, and recent samples to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LearnerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let state = PersistedState {
            config: self.config.clone(),
            aggregators: self
                .aggregators
                .iter()
                .map(|(task, aggregator)| {
                    let (sums, counts) = aggregator.state();
                    (
                        task.clone(),
                        PersistedAggregator {
                            noise_scale: aggregator.noise_scale,
                            sums: sums.clone(),
                            counts: counts.clone(),
                        },
                    )
                })
                .collect(),
            pending_counts: self.pending_counts.clone(),
            drift: self.drift.clone(),
            history: self.history.iter().cloned().collect(),
            samples: self.samples.iter().cloned().collect(),
            learner: self.learner.weights().clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&state)?)?;
        Ok(())
    }

    /// Restores a learner from [`BackgroundSelfLearner::save`] output.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LearnerError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let state: PersistedState = serde_json::from_str(&raw)?;
        let mut learner = Self::new(state.config);
        for (task, persisted) in state.aggregators {
            let mut aggregator = SecureAggregator::new(persisted.noise_scale);
            aggregator.restore(persisted.sums, persisted.counts);
            learner.aggregators.insert(task, aggregator);
        }
        learner.pending_counts = state.pending_counts;
        learner.drift = state.drift;
        learner.history = state.history.into_iter().collect();
        learner.samples = state.samples.into_iter().collect();
        learner.learner.restore_weights(state.learner);
        Ok(learner)
    }
}
