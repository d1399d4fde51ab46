//! Empathy modulation: turns a profile plus in-the-moment context signals
//! into bounded tone/tempo/style adjustments.

use super::profile::UserProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Signals observed during the current interaction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EmpathyContext {
    pub sentiment: f64,
    pub urgency: f64,
    pub energy: f64,
}

impl EmpathyContext {
    pub fn new(sentiment: f64, urgency: f64, energy: f64) -> Self {
        Self {
            sentiment,
            urgency,
            energy,
        }
    }
}

/// Computes modulation vectors for tone and tempo adjustments.
///
/// `tone = clamp(tone_pref + 0.5*sentiment - 0.2*urgency, -1, 1)` and
/// `tempo = clamp(tempo_pref + 0.4*urgency + 0.3*energy, 0.2, 3.0)`;
/// every style dimension (including formality) blends in energy and stays
/// within [-1, 1].
#[derive(Debug, Clone, Default)]
pub struct EmpathyModulator;

impl EmpathyModulator {
    pub fn new() -> Self {
        Self
    }

    pub fn modulation(
        &self,
        profile: &UserProfile,
        context: &EmpathyContext,
    ) -> BTreeMap<String, f64> {
        let mut adjustments = BTreeMap::new();
        let tone = profile.tone_preference + 0.5 * context.sentiment - 0.2 * context.urgency;
        adjustments.insert("tone".to_string(), tone.clamp(-1.0, 1.0));
        let tempo = profile.tempo_preference + 0.4 * context.urgency + 0.3 * context.energy;
        adjustments.insert("tempo".to_string(), tempo.clamp(0.2, 3.0));
        adjustments.insert(
            "style::formality".to_string(),
            (profile.formality_bias + 0.1 * context.energy).clamp(-1.0, 1.0),
        );
        for (dimension, weight) in &profile.style_vector {
            adjustments.insert(
                format!("style::{dimension}"),
                (weight + 0.1 * context.energy).clamp(-1.0, 1.0),
            );
        }
        adjustments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::personalization::{InteractionSignal, OnDeviceProfiler};

    #[test]
    fn adjustments_stay_in_bounds() {
        let mut profiler = OnDeviceProfiler::default();
        profiler.record("u", &InteractionSignal::new("tone", 0.9).with_weight(10.0));
        profiler.record("u", &InteractionSignal::new("style::humor", 0.95).with_weight(10.0));
        let profile = profiler.profile("u").clone();
        let context = EmpathyContext::new(1.0, 1.0, 1.0);
        let adjustments = EmpathyModulator::new().modulation(&profile, &context);
        assert!(*adjustments.get("tone").unwrap() <= 1.0);
        assert!(*adjustments.get("tempo").unwrap() <= 3.0);
        assert!(*adjustments.get("style::humor").unwrap() <= 1.0);
    }

    #[test]
    fn urgency_lowers_tone_and_raises_tempo() {
        let mut profiler = OnDeviceProfiler::default();
        let profile = profiler.profile("u").clone();
        let calm = EmpathyModulator::new().modulation(&profile, &EmpathyContext::default());
        let urgent =
            EmpathyModulator::new().modulation(&profile, &EmpathyContext::new(0.0, 1.0, 0.0));
        assert!(urgent["tone"] < calm["tone"]);
        assert!(urgent["tempo"] > calm["tempo"]);
    }

    #[test]
    fn formality_always_present() {
        let mut profiler = OnDeviceProfiler::default();
        let profile = profiler.profile("u").clone();
        let adjustments =
            EmpathyModulator::new().modulation(&profile, &EmpathyContext::default());
        assert!(adjustments.contains_key("style::formality"));
    }
}
