//! On-device profiler: folds behavioural signals into per-user preference
//! fields with exponential decay. All raw data stays local.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Cap on the rolling emotion history.
const EMOTION_HISTORY_LIMIT: usize = 32;

/// Single behavioural observation used for profiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionSignal {
    #[serde(rename = "type")]
    pub signal_type: String,
    pub value: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl InteractionSignal {
    pub fn new(signal_type: impl Into<String>, value: f64) -> Self {
        Self {
            signal_type: signal_type.into(),
            value,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Aggregated preferences inferred from local interaction signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub tone_preference: f64,
    pub tempo_preference: f64,
    pub formality_bias: f64,
    pub response_length_bias: f64,
    #[serde(default)]
    pub style_vector: BTreeMap<String, f64>,
    #[serde(default)]
    pub cognition_vector: BTreeMap<String, f64>,
    #[serde(default)]
    pub emotion_history: VecDeque<f64>,
    pub emotion_baseline: f64,
    pub last_updated: DateTime<Utc>,
}

impl UserProfile {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            tone_preference: 0.0,
            tempo_preference: 1.0,
            formality_bias: 0.0,
            response_length_bias: 0.0,
            style_vector: BTreeMap::new(),
            cognition_vector: BTreeMap::new(),
            emotion_history: VecDeque::new(),
            emotion_baseline: 0.0,
            last_updated: Utc::now(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Exponential-blend profiler. Decay must sit in (0, 1].
pub struct OnDeviceProfiler {
    decay: f64,
    profiles: HashMap<String, UserProfile>,
}

impl Default for OnDeviceProfiler {
    fn default() -> Self {
        Self::new(0.85)
    }
}

impl OnDeviceProfiler {
    pub fn new(decay: f64) -> Self {
        Self {
            decay: decay.clamp(f64::MIN_POSITIVE, 1.0),
            profiles: HashMap::new(),
        }
    }

    pub fn profile(&mut self, user_id: &str) -> &UserProfile {
        self.profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::new(user_id))
    }

    pub fn record(&mut self, user_id: &str, signal: &InteractionSignal) -> UserProfile {
        let decay = self.decay;
        let profile = self
            .profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::new(user_id));
        profile.last_updated = Utc::now();
        match signal.signal_type.as_str() {
            "tone" => {
                profile.tone_preference =
                    blend(decay, profile.tone_preference, signal.value, signal.weight);
            }
            "tempo" => {
                profile.tempo_preference =
                    blend(decay, profile.tempo_preference, signal.value, signal.weight);
            }
            "formality" => {
                profile.formality_bias =
                    blend(decay, profile.formality_bias, signal.value, signal.weight);
            }
            "response_length" => {
                profile.response_length_bias = blend(
                    decay,
                    profile.response_length_bias,
                    signal.value,
                    signal.weight,
                );
            }
            "emotion" => {
                profile.emotion_history.push_back(signal.value);
                while profile.emotion_history.len() > EMOTION_HISTORY_LIMIT {
                    profile.emotion_history.pop_front();
                }
                // Baseline drifts toward each new observation.
                profile.emotion_baseline =
                    blend(decay, profile.emotion_baseline, signal.value, signal.weight);
            }
            other => {
                let (map, key) = if let Some(dimension) = other.strip_prefix("cog::") {
                    (&mut profile.cognition_vector, dimension.to_string())
                } else if let Some(dimension) = other.strip_prefix("style::") {
                    (&mut profile.style_vector, dimension.to_string())
                } else {
                    (&mut profile.style_vector, other.to_string())
                };
                let previous = map.get(&key).copied().unwrap_or(0.0);
                map.insert(key, blend(decay, previous, signal.value, signal.weight));
            }
        }
        profile.clone()
    }

    /// Folds a sequence of signals atomically, returning the final profile.
    pub fn bulk_record(&mut self, user_id: &str, signals: &[InteractionSignal]) -> UserProfile {
        for signal in signals {
            self.record(user_id, signal);
        }
        self.profile(user_id).clone()
    }

    pub fn export_profile(&mut self, user_id: &str) -> serde_json::Value {
        self.profile(user_id).to_value()
    }
}

fn blend(decay: f64, previous: f64, value: f64, weight: f64) -> f64 {
    let alpha = weight.clamp(0.0, 10.0);
    let mix = alpha / (alpha + 1.0);
    previous * decay * (1.0 - mix) + value * mix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_signals_land_in_their_fields() {
        let mut profiler = OnDeviceProfiler::default();
        profiler.record("u", &InteractionSignal::new("tone", 0.8));
        profiler.record("u", &InteractionSignal::new("tempo", 1.4));
        profiler.record("u", &InteractionSignal::new("formality", -0.4));
        profiler.record("u", &InteractionSignal::new("style::humor", 0.6));
        profiler.record("u", &InteractionSignal::new("cog::verbosity", 0.3));
        let profile = profiler.profile("u").clone();
        assert!(profile.tone_preference > 0.0);
        assert!(profile.tempo_preference > 1.0);
        assert!(profile.formality_bias < 0.0);
        assert!(profile.style_vector.contains_key("humor"));
        assert!(profile.cognition_vector.contains_key("verbosity"));
    }

    #[test]
    fn emotion_history_is_bounded_and_baseline_drifts() {
        let mut profiler = OnDeviceProfiler::new(0.9);
        for index in 0..(EMOTION_HISTORY_LIMIT + 8) {
            profiler.record("u", &InteractionSignal::new("emotion", index as f64 / 40.0));
        }
        let profile = profiler.profile("u").clone();
        assert_eq!(profile.emotion_history.len(), EMOTION_HISTORY_LIMIT);
        assert!(profile.emotion_baseline > 0.0);
    }

    #[test]
    fn heavier_weight_moves_faster() {
        let mut light = OnDeviceProfiler::default();
        let mut heavy = OnDeviceProfiler::default();
        light.record("u", &InteractionSignal::new("tone", 1.0).with_weight(0.5));
        heavy.record("u", &InteractionSignal::new("tone", 1.0).with_weight(5.0));
        assert!(
            heavy.profile("u").tone_preference > light.profile("u").tone_preference
        );
    }

    #[test]
    fn bulk_record_returns_final_profile() {
        let mut profiler = OnDeviceProfiler::default();
        let signals = vec![
            InteractionSignal::new("tone", 0.5),
            InteractionSignal::new("tone", 0.7),
        ];
        let profile = profiler.bulk_record("u", &signals);
        assert!(profile.tone_preference > 0.0);
    }
}
