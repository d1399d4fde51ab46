//! Deterministic multimodal encoders and fusion layers.
//!
//! Encoders are pure functions from modality inputs to fixed-dimension float
//! vectors; nothing here talks to a model. Real encoder backends are
//! collaborators; only these signatures matter to the runtime.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Tagged union for everything a request may attach under a modality name.
///
/// Cache-key normalization and encoding both branch over this type instead
/// of inspecting dynamic payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ModalityInput {
    Text(String),
    Audio(Vec<f64>),
    Image(Vec<u8>),
    Video(Vec<Vec<u8>>),
    Sensors(Vec<SensorEvent>),
}

impl ModalityInput {
    pub fn kind(&self) -> &'static str {
        match self {
            ModalityInput::Text(_) => "text",
            ModalityInput::Audio(_) => "audio",
            ModalityInput::Image(_) => "image",
            ModalityInput::Video(_) => "video",
            ModalityInput::Sensors(_) => "sensors",
        }
    }
}

/// Simple hashed bag-of-words encoder.
#[derive(Debug, Clone)]
pub struct TextEncoder {
    pub dim: usize,
}

impl Default for TextEncoder {
    fn default() -> Self {
        Self { dim: 32 }
    }
}

impl TextEncoder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn encode(&self, text: &str) -> Vec<f64> {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for token in text.split_whitespace() {
            *counts.entry(token.to_lowercase()).or_insert(0.0) += 1.0;
        }
        let mut vector = vec![0.0; self.dim];
        for (token, count) in counts {
            let digest = Sha256::digest(token.as_bytes());
            let index = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dim;
            vector[index] += count;
        }
        normalize(&mut vector);
        vector
    }
}

/// Deterministic placeholder for speech recognition.
#[derive(Debug, Clone, Default)]
pub struct AsrEncoder;

impl AsrEncoder {
    pub fn transcribe(&self, samples: &[f64]) -> String {
        samples
            .iter()
            .map(|sample| format!("{sample:.3}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Hashes raw bytes to produce a pseudo-embedding.
#[derive(Debug, Clone)]
pub struct ImageEncoder {
    pub dim: usize,
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self { dim: 32 }
    }
}

impl ImageEncoder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn encode(&self, data: &[u8]) -> Vec<f64> {
        if data.is_empty() {
            return vec![0.0; self.dim];
        }
        let digest = Sha256::digest(data);
        (0..self.dim)
            .map(|index| digest[index % digest.len()] as f64 / 255.0)
            .collect()
    }
}

/// Maintains per-user calibration baselines for audio features.
#[derive(Debug, Clone)]
pub struct AdaptiveAudioEncoder {
    pub dim: usize,
    profiles: HashMap<String, Vec<f64>>,
}

impl Default for AdaptiveAudioEncoder {
    fn default() -> Self {
        Self::new(16)
    }
}

impl AdaptiveAudioEncoder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            profiles: HashMap::new(),
        }
    }

    pub fn calibrate(&mut self, user_id: &str, samples: &[f64]) {
        let baseline = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };
        self.profiles
            .insert(user_id.to_string(), vec![baseline; self.dim]);
    }

    pub fn encode(&self, samples: &[f64], user_id: &str) -> Vec<f64> {
        let zeroes = vec![0.0; self.dim];
        let profile = self.profiles.get(user_id).unwrap_or(&zeroes);
        let mut buffer = vec![0.0; self.dim];
        for (index, value) in samples.iter().enumerate() {
            buffer[index % self.dim] += value - profile[index % profile.len()];
        }
        normalize(&mut buffer);
        buffer
    }
}

/// Aggregates frame hashes over a sliding window.
#[derive(Debug, Clone)]
pub struct DiffusionVisionEncoder {
    pub dim: usize,
    pub frame_window: usize,
}

impl Default for DiffusionVisionEncoder {
    fn default() -> Self {
        Self {
            dim: 32,
            frame_window: 4,
        }
    }
}

impl DiffusionVisionEncoder {
    pub fn new(dim: usize, frame_window: usize) -> Self {
        Self {
            dim: dim.max(1),
            frame_window: frame_window.max(1),
        }
    }

    pub fn encode_video(&self, frames: &[Vec<u8>]) -> Vec<f64> {
        let mut window: VecDeque<&[u8]> = VecDeque::with_capacity(self.frame_window);
        for frame in frames {
            if window.len() == self.frame_window {
                window.pop_front();
            }
            window.push_back(frame);
        }
        if window.is_empty() {
            return vec![0.0; self.dim];
        }
        let mut hasher = Sha256::new();
        for frame in &window {
            hasher.update(frame);
        }
        let digest = hasher.finalize();
        (0..self.dim)
            .map(|index| digest[index % digest.len()] as f64 / 255.0)
            .collect()
    }
}

/// One modality's embedding plus the quality signals the fuser adapts to.
#[derive(Debug, Clone)]
pub struct ModalitySignal {
    pub name: String,
    pub embedding: Vec<f64>,
    pub quality: f64,
    pub latency_ms: f64,
}

impl ModalitySignal {
    pub fn new(name: impl Into<String>, embedding: Vec<f64>, quality: f64) -> Self {
        Self {
            name: name.into(),
            embedding,
            quality,
            latency_ms: 0.0,
        }
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Mean absolute amplitude of the embedding.
    pub fn energy(&self) -> f64 {
        if self.embedding.is_empty() {
            return 0.0;
        }
        self.embedding.iter().map(|value| value.abs()).sum::<f64>()
            / self.embedding.len() as f64
    }
}

/// Output of either fusion path.
#[derive(Debug, Clone)]
pub struct FusionResult {
    pub embedding: Vec<f64>,
    pub modality_weights: BTreeMap<String, f64>,
    pub metadata: serde_json::Value,
}

/// Fuses modality embeddings by weighted averaging.
#[derive(Debug, Clone)]
pub struct FusionTransformer {
    pub dim: usize,
}

impl Default for FusionTransformer {
    fn default() -> Self {
        Self { dim: 32 }
    }
}

impl FusionTransformer {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn fuse(&self, embeddings: &BTreeMap<String, Vec<f64>>) -> FusionResult {
        if embeddings.is_empty() {
            return FusionResult {
                embedding: vec![0.0; self.dim],
                modality_weights: BTreeMap::new(),
                metadata: serde_json::json!({}),
            };
        }
        let weight = 1.0 / embeddings.len() as f64;
        let weights: BTreeMap<String, f64> = embeddings
            .keys()
            .map(|name| (name.clone(), weight))
            .collect();
        let mut fused = vec![0.0; self.dim];
        for vector in embeddings.values() {
            for (index, value) in vector.iter().take(self.dim).enumerate() {
                fused[index] += weight * value;
            }
        }
        FusionResult {
            embedding: fused,
            modality_weights: weights,
            metadata: serde_json::json!({}),
        }
    }
}

/// High or low processing resolution chosen per modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    High,
    Low,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::High => "high",
            Resolution::Low => "low",
        }
    }

    fn cost(&self) -> f64 {
        match self {
            Resolution::High => 1.0,
            Resolution::Low => 0.3,
        }
    }
}

/// Adaptive cross-modal fuser.
///
/// Per-modality depth in `[min_depth, max_depth]` follows
/// `quality * (1 + ln(1 + energy)) / (1 + latency_ms / 1000)`; a shared
/// budget decides which modalities run at high resolution. Each depth step
/// applies one rotate-and-blend pseudo-attention layer.
#[derive(Debug, Clone)]
pub struct AdaptiveCrossModalTransformer {
    pub dim: usize,
    pub min_depth: usize,
    pub max_depth: usize,
}

impl Default for AdaptiveCrossModalTransformer {
    fn default() -> Self {
        Self {
            dim: 32,
            min_depth: 1,
            max_depth: 8,
        }
    }
}

impl AdaptiveCrossModalTransformer {
    pub fn new(dim: usize, min_depth: usize, max_depth: usize) -> Self {
        let min_depth = min_depth.max(1);
        Self {
            dim: dim.max(1),
            min_depth,
            max_depth: max_depth.max(min_depth),
        }
    }

    fn score(&self, signal: &ModalitySignal) -> f64 {
        let latency_penalty = 1.0 + signal.latency_ms.max(0.0) / 1000.0;
        signal.quality.max(0.0) * (1.0 + (1.0 + signal.energy()).ln()) / latency_penalty
    }

    fn depth_for(&self, score: f64) -> usize {
        let span = (self.max_depth - self.min_depth) as f64;
        let depth = self.min_depth as f64 + (score.clamp(0.0, 1.0) * span).round();
        (depth as usize).clamp(self.min_depth, self.max_depth)
    }

    /// Picks high or low resolution per modality, strongest signals first,
    /// while the shared budget lasts.
    fn assign_resolutions(
        &self,
        scored: &[(String, f64)],
        budget: f64,
    ) -> BTreeMap<String, Resolution> {
        let mut order: Vec<&(String, f64)> = scored.iter().collect();
        order.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let mut remaining = budget;
        let mut resolutions = BTreeMap::new();
        for (name, _) in order {
            let resolution = if remaining >= Resolution::High.cost() {
                Resolution::High
            } else {
                Resolution::Low
            };
            remaining -= resolution.cost();
            resolutions.insert(name.clone(), resolution);
        }
        resolutions
    }

    /// One pseudo-attention layer: blend the vector with its half-rotation.
    fn rotate_and_blend(vector: &mut [f64]) {
        let len = vector.len();
        if len < 2 {
            return;
        }
        let half = len / 2;
        let rotated: Vec<f64> = (0..len).map(|index| vector[(index + half) % len]).collect();
        for (slot, rotated_value) in vector.iter_mut().zip(rotated) {
            *slot = 0.5 * *slot + 0.5 * rotated_value;
        }
    }

    pub fn fuse(&self, signals: &[ModalitySignal], budget: f64) -> FusionResult {
        if signals.is_empty() {
            return FusionResult {
                embedding: vec![0.0; self.dim],
                modality_weights: BTreeMap::new(),
                metadata: serde_json::json!({}),
            };
        }
        let scored: Vec<(String, f64)> = signals
            .iter()
            .map(|signal| (signal.name.clone(), self.score(signal)))
            .collect();
        let resolutions = self.assign_resolutions(&scored, budget);

        let mut layers = BTreeMap::new();
        let mut weights = BTreeMap::new();
        let mut fused = vec![0.0; self.dim];
        let total: f64 = scored.iter().map(|(_, score)| score.max(1e-9)).sum();
        for (signal, (name, score)) in signals.iter().zip(&scored) {
            let resolution = resolutions
                .get(name)
                .copied()
                .unwrap_or(Resolution::Low);
            let depth = match resolution {
                Resolution::High => self.depth_for(*score),
                // Low resolution halves the attention stack.
                Resolution::Low => self.depth_for(*score / 2.0),
            };
            layers.insert(name.clone(), depth);

            let mut vector = vec![0.0; self.dim];
            for (index, value) in signal.embedding.iter().take(self.dim).enumerate() {
                vector[index] = *value;
            }
            for _ in 0..depth {
                Self::rotate_and_blend(&mut vector);
            }
            let weight = score.max(1e-9) / total;
            weights.insert(name.clone(), weight);
            for (slot, value) in fused.iter_mut().zip(&vector) {
                *slot += weight * value;
            }
        }

        let resolution_names: BTreeMap<String, &'static str> = resolutions
            .iter()
            .map(|(name, resolution)| (name.clone(), resolution.as_str()))
            .collect();
        FusionResult {
            embedding: fused,
            modality_weights: weights,
            metadata: serde_json::json!({
                "layers": layers,
                "resolutions": resolution_names,
            }),
        }
    }
}

/// Raw observation from an on-device sensor stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub source: String,
    pub signal_type: String,
    pub value: f64,
    pub timestamp: f64,
}

/// Collects sensor events and exposes them as time series.
#[derive(Debug, Clone, Default)]
pub struct SensorHub {
    streams: BTreeMap<String, Vec<SensorEvent>>,
}

impl SensorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, event: SensorEvent) {
        let stream = self.streams.entry(event.signal_type.clone()).or_default();
        stream.push(event);
        stream.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn to_sequences(&self) -> BTreeMap<String, Vec<(f64, f64)>> {
        self.streams
            .iter()
            .map(|(signal_type, events)| {
                (
                    signal_type.clone(),
                    events
                        .iter()
                        .map(|event| (event.timestamp, event.value))
                        .collect(),
                )
            })
            .collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

/// Aligns heterogeneous sensor streams using relative offsets.
#[derive(Debug, Clone, Default)]
pub struct TemporalAlignmentEngine;

impl TemporalAlignmentEngine {
    pub fn align(
        &self,
        sequences: &BTreeMap<String, Vec<(f64, f64)>>,
    ) -> BTreeMap<String, Vec<(f64, f64)>> {
        let earliest = sequences
            .values()
            .filter_map(|points| points.first().map(|(timestamp, _)| *timestamp))
            .fold(f64::INFINITY, f64::min);
        if !earliest.is_finite() {
            return BTreeMap::new();
        }
        sequences
            .iter()
            .map(|(signal_type, points)| {
                (
                    signal_type.clone(),
                    points
                        .iter()
                        .map(|(timestamp, value)| (timestamp - earliest, *value))
                        .collect(),
                )
            })
            .collect()
    }
}

/// Tracks task-specific weight updates with elastic consolidation.
#[derive(Debug, Clone)]
pub struct ContinualLearner {
    pub consolidation: f64,
    weights: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Default for ContinualLearner {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl ContinualLearner {
    pub fn new(consolidation: f64) -> Self {
        Self {
            consolidation: consolidation.clamp(0.0, 1.0),
            weights: BTreeMap::new(),
        }
    }

    pub fn train(
        &mut self,
        task_id: &str,
        gradients: &BTreeMap<String, f64>,
    ) -> BTreeMap<String, f64> {
        let task_state = self.weights.entry(task_id.to_string()).or_default();
        let mut updated = BTreeMap::new();
        for (name, gradient) in gradients {
            let previous = task_state.get(name).copied().unwrap_or(0.0);
            let blended = (1.0 - self.consolidation) * previous + self.consolidation * gradient;
            task_state.insert(name.clone(), blended);
            updated.insert(name.clone(), blended);
        }
        updated
    }

    pub fn weights(&self) -> &BTreeMap<String, BTreeMap<String, f64>> {
        &self.weights
    }

    pub fn task_weights(&self, task_id: &str) -> Option<&BTreeMap<String, f64>> {
        self.weights.get(task_id)
    }

    pub fn restore_weights(&mut self, weights: BTreeMap<String, BTreeMap<String, f64>>) {
        self.weights = weights;
    }
}

fn normalize(vector: &mut [f64]) {
    let norm = vector.iter().map(|value| value * value).sum::<f64>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_encoder_is_deterministic_and_normalized() {
        let encoder = TextEncoder::new(16);
        let a = encoder.encode("Kolibri orchestrates skills");
        let b = encoder.encode("Kolibri orchestrates skills");
        assert_eq!(a, b);
        let norm: f64 = a.iter().map(|value| value * value).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn adaptive_fusion_layers_follow_quality_and_latency() {
        let fuser = AdaptiveCrossModalTransformer::new(16, 1, 8);
        let strong = ModalitySignal::new("text", vec![0.5; 16], 0.9);
        let weak = ModalitySignal::new("audio", vec![0.5; 16], 0.2).with_latency(2000.0);
        let result = fuser.fuse(&[strong, weak], 1.5);
        let layers = result.metadata["layers"].as_object().unwrap();
        assert!(layers["text"].as_u64().unwrap() > layers["audio"].as_u64().unwrap());
        let resolutions = result.metadata["resolutions"].as_object().unwrap();
        assert_eq!(resolutions["text"], "high");
        assert_eq!(resolutions["audio"], "low");
    }

    #[test]
    fn fusion_weights_sum_to_one() {
        let fuser = FusionTransformer::new(8);
        let mut embeddings = BTreeMap::new();
        embeddings.insert("text".to_string(), vec![1.0; 8]);
        embeddings.insert("image".to_string(), vec![0.0; 8]);
        let result = fuser.fuse(&embeddings);
        let total: f64 = result.modality_weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn alignment_rebases_to_earliest_timestamp() {
        let mut hub = SensorHub::new();
        hub.ingest(SensorEvent {
            source: "lamp".into(),
            signal_type: "lux".into(),
            value: 10.0,
            timestamp: 100.0,
        });
        hub.ingest(SensorEvent {
            source: "thermostat".into(),
            signal_type: "celsius".into(),
            value: 21.0,
            timestamp: 105.0,
        });
        let aligned = TemporalAlignmentEngine.align(&hub.to_sequences());
        assert_eq!(aligned["lux"][0].0, 0.0);
        assert_eq!(aligned["celsius"][0].0, 5.0);
    }

    #[test]
    fn continual_learner_blends_toward_gradient() {
        let mut learner = ContinualLearner::new(0.5);
        let mut gradients = BTreeMap::new();
        gradients.insert("success".to_string(), 1.0);
        let first = learner.train("writer", &gradients);
        assert!((first["success"] - 0.5).abs() < 1e-9);
        let second = learner.train("writer", &gradients);
        assert!((second["success"] - 0.75).abs() < 1e-9);
    }
}
