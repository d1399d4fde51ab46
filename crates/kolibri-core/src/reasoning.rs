//! Reasoning log: the transparent, step-by-step explanation attached to every
//! runtime response.

use serde::{Deserialize, Serialize};

/// Single named step in a reasoning trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Ordered trace of reasoning steps produced while serving a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningLog {
    steps: Vec<ReasoningStep>,
}

impl ReasoningLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(
        &mut self,
        name: impl Into<String>,
        message: impl Into<String>,
        references: Vec<String>,
        confidence: f64,
    ) {
        self.steps.push(ReasoningStep {
            name: name.into(),
            message: message.into(),
            references,
            confidence,
        });
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn steps(&self) -> &[ReasoningStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "steps": self.steps.iter().map(|step| serde_json::json!({
                "name": step.name,
                "message": step.message,
                "references": step.references,
                "confidence": step.confidence,
            })).collect::<Vec<_>>()
        })
    }
}
