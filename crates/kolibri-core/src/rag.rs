//! Retrieval-augmented answering over the knowledge graph.
//!
//! Retrieval is a dot product between the encoded query and each node's
//! encoded text; the answer bundles a concatenated summary (each fact's
//! text appears verbatim), the supporting facts, and a source-presence
//! verification verdict.

use crate::encoders::TextEncoder;
use crate::graph::{KnowledgeGraph, Node};
use crate::reasoning::ReasoningLog;
use serde::{Deserialize, Serialize};

/// One supporting fact with its retrieval score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedFact {
    pub id: String,
    pub text: String,
    pub sources: Vec<String>,
    pub confidence: f64,
    pub score: f64,
}

impl RetrievedFact {
    fn from_node(node: &Node, score: f64) -> Self {
        Self {
            id: node.id.clone(),
            text: node.text.clone(),
            sources: node.sources.clone(),
            confidence: node.confidence,
            score,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "text": self.text,
            "sources": self.sources,
            "confidence": self.confidence,
            "score": self.score,
        })
    }
}

/// Retrieval pipeline bound to a text encoder.
pub struct RagPipeline {
    encoder: TextEncoder,
}

impl Default for RagPipeline {
    fn default() -> Self {
        Self::new(TextEncoder::new(32))
    }
}

impl RagPipeline {
    pub fn new(encoder: TextEncoder) -> Self {
        Self { encoder }
    }

    /// Top-k facts with a strictly positive score, best first.
    pub fn retrieve(&self, graph: &KnowledgeGraph, query: &str, top_k: usize) -> Vec<RetrievedFact> {
        let query_vector = self.encoder.encode(query);
        let mut scored: Vec<RetrievedFact> = graph
            .nodes(None)
            .into_iter()
            .filter(|node| !node.text.is_empty())
            .filter_map(|node| {
                let node_vector = self.encoder.encode(&node.text);
                let score = dot(&query_vector, &node_vector);
                (score > 0.0).then(|| RetrievedFact::from_node(node, score))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(top_k);
        scored
    }

    /// Retrieves, summarizes, and verifies sources for a query.
    pub fn answer(
        &self,
        graph: &KnowledgeGraph,
        query: &str,
        top_k: usize,
        reasoning: Option<&mut ReasoningLog>,
    ) -> serde_json::Value {
        let retrieved = self.retrieve(graph, query, top_k);
        let references: Vec<String> = retrieved.iter().map(|fact| fact.id.clone()).collect();
        let mut reasoning = reasoning;
        if let Some(log) = reasoning.as_deref_mut() {
            log.add_step(
                "retrieve",
                format!("found {} supporting facts", retrieved.len()),
                references.clone(),
                0.6,
            );
        }
        let summary = summarize(query, &retrieved);
        let support: Vec<serde_json::Value> =
            retrieved.iter().map(RetrievedFact::to_value).collect();
        let verification = verify_sources(&retrieved);
        if let Some(log) = reasoning.as_deref_mut() {
            let message = verification["message"].as_str().unwrap_or_default().to_string();
            let confidence = verification["confidence"].as_f64().unwrap_or(0.0);
            log.add_step("verify", message, references, confidence);
        }
        serde_json::json!({
            "query": query,
            "summary": summary,
            "support": support,
            "verification": verification,
        })
    }
}

/// Status `ok` with confidence 0.9 when every fact carries sources, else
/// `partial` with confidence 0.2 and the ids of the unsourced facts.
fn verify_sources(retrieved: &[RetrievedFact]) -> serde_json::Value {
    let missing: Vec<&str> = retrieved
        .iter()
        .filter(|fact| fact.sources.is_empty())
        .map(|fact| fact.id.as_str())
        .collect();
    if missing.is_empty() {
        serde_json::json!({
            "status": "ok",
            "missing": [],
            "confidence": 0.9,
            "message": "all facts have sources",
        })
    } else {
        serde_json::json!({
            "status": "partial",
            "missing": missing,
            "confidence": 0.2,
            "message": format!("missing sources for {} facts", missing.len()),
        })
    }
}

fn summarize(query: &str, facts: &[RetrievedFact]) -> String {
    if facts.is_empty() {
        return "no supporting knowledge found".to_string();
    }
    let mut lines = vec![format!("Answering: {query}")];
    for fact in facts {
        let snippet = fact.text.trim().replace('\n', " ");
        lines.push(format!("- {snippet} (confidence={:.2})", fact.confidence));
    }
    lines.join("\n")
}

fn dot(left: &[f64], right: &[f64]) -> f64 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Node};

    fn sample_graph() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        graph.add_node(
            Node::new(
                "claim:collaboration",
                "Claim",
                "Kolibri orchestrates skills to deliver autonomous project support",
            )
            .with_sources(["https://kolibri.example/whitepaper"])
            .with_confidence(0.82),
        );
        graph.add_node(
            Node::new(
                "entity:skillstore",
                "Entity",
                "The skill store provides sandboxed execution with declarative manifests",
            )
            .with_sources(["https://kolibri.example/docs/skillstore"])
            .with_confidence(0.77),
        );
        graph
            .add_edge(
                Edge::new("claim:collaboration", "entity:skillstore", "supports")
                    .with_weight(0.6),
            )
            .unwrap();
        graph
    }

    #[test]
    fn answer_includes_fact_text_and_ok_verification() {
        let graph = sample_graph();
        let pipeline = RagPipeline::new(TextEncoder::new(16));
        let mut reasoning = ReasoningLog::new();
        let answer = pipeline.answer(
            &graph,
            "How does Kolibri deliver autonomous support?",
            3,
            Some(&mut reasoning),
        );
        assert_eq!(answer["verification"]["status"], "ok");
        assert!(answer["summary"]
            .as_str()
            .unwrap()
            .contains("autonomous project support"));
        assert!(!reasoning.is_empty());
    }

    #[test]
    fn missing_sources_downgrade_verification() {
        let mut graph = KnowledgeGraph::new();
        graph.add_node(Node::new("claim:bare", "Claim", "unsourced kolibri claim"));
        let pipeline = RagPipeline::new(TextEncoder::new(16));
        let answer = pipeline.answer(&graph, "kolibri claim", 5, None);
        assert_eq!(answer["verification"]["status"], "partial");
        assert_eq!(answer["verification"]["confidence"], 0.2);
        assert_eq!(answer["verification"]["missing"][0], "claim:bare");
    }

    #[test]
    fn retrieval_respects_top_k_and_positive_scores() {
        let graph = sample_graph();
        let pipeline = RagPipeline::new(TextEncoder::new(16));
        let facts = pipeline.retrieve(&graph, "sandboxed manifests", 1);
        assert_eq!(facts.len(), 1);
        assert!(facts[0].score > 0.0);
    }
}
