//! Structured proof payloads derived from answer bundles: each supporting
//! fact becomes a claim with an adaptive confidence interval.

use serde::{Deserialize, Serialize};

/// Bounded confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    /// Narrower interval when both confidence and verification are high.
    fn for_confidence(confidence: f64, verification: f64) -> Self {
        let base = confidence.clamp(0.0, 1.0);
        let verifier = verification.clamp(0.0, 1.0);
        let width = (0.6 - 0.3 * (base + verifier)).max(0.1);
        Self {
            lower: round3((base - width / 2.0).max(0.0)),
            upper: round3((base + width / 2.0).min(1.0)),
        }
    }
}

/// Single verified claim returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredProof {
    pub fact_id: String,
    pub claim: String,
    pub confidence_interval: ConfidenceInterval,
    pub sources: Vec<String>,
    pub score: f64,
}

/// Constructs proofs from an answer payload. Falls back to a single
/// synthetic proof over the summary when no supporting facts exist.
pub fn build_structured_proofs(answer: &serde_json::Value) -> Vec<StructuredProof> {
    let verification_confidence = answer
        .get("verification")
        .and_then(|verification| verification.get("confidence"))
        .and_then(|confidence| confidence.as_f64())
        .unwrap_or(0.0);

    let mut proofs: Vec<StructuredProof> = Vec::new();
    if let Some(support) = answer.get("support").and_then(|support| support.as_array()) {
        for fact in support {
            let Some(fact) = fact.as_object() else {
                continue;
            };
            let fact_id = fact
                .get("id")
                .and_then(|id| id.as_str())
                .filter(|id| !id.is_empty())
                .unwrap_or("fact")
                .to_string();
            let claim = fact
                .get("text")
                .and_then(|text| text.as_str())
                .unwrap_or(&fact_id)
                .to_string();
            let confidence = fact
                .get("confidence")
                .and_then(|confidence| confidence.as_f64())
                .unwrap_or(verification_confidence);
            let sources = fact
                .get("sources")
                .and_then(|sources| sources.as_array())
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| entry.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let score = fact
                .get("score")
                .and_then(|score| score.as_f64())
                .unwrap_or(0.0);
            // Later facts with the same id replace earlier ones.
            proofs.retain(|proof| proof.fact_id != fact_id);
            proofs.push(StructuredProof {
                fact_id,
                claim,
                confidence_interval: ConfidenceInterval::for_confidence(
                    confidence,
                    verification_confidence,
                ),
                sources,
                score,
            });
        }
    }
    if !proofs.is_empty() {
        return proofs;
    }

    let summary = answer
        .get("summary")
        .and_then(|summary| summary.as_str())
        .filter(|summary| !summary.is_empty())
        .map(String::from)
        .or_else(|| {
            answer
                .get("query")
                .and_then(|query| query.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| "runtime-response".to_string());
    let confidence = answer
        .get("confidence")
        .and_then(|confidence| confidence.as_f64())
        .unwrap_or(0.0);
    let sources = answer
        .get("verification")
        .and_then(|verification| verification.get("sources"))
        .and_then(|sources| sources.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    vec![StructuredProof {
        fact_id: "summary".to_string(),
        claim: summary,
        confidence_interval: ConfidenceInterval::for_confidence(
            confidence,
            verification_confidence,
        ),
        sources,
        score: verification_confidence,
    }]
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
