//! Graph ingestion: free-text documents become Source and Claim nodes with
//! `mentions` edges (duplicates suppressed, negation conflicts linked), and
//! structured domain records become typed long-term nodes.

use super::{Edge, GraphError, KnowledgeGraph, MemoryTier, Node};
use crate::encoders::TextEncoder;
use serde::{Deserialize, Serialize};

/// Document slated for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub doc_id: String,
    pub source: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Summary of the graph mutations one document produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub document_id: String,
    pub nodes_added: usize,
    pub edges_added: usize,
    pub conflicts: Vec<(String, String)>,
    pub warnings: Vec<String>,
}

/// Heuristic sentence-level ingestor.
pub struct KnowledgeIngestor {
    encoder: TextEncoder,
    min_length: usize,
}

impl Default for KnowledgeIngestor {
    fn default() -> Self {
        Self::new(TextEncoder::new(32), 12)
    }
}

impl KnowledgeIngestor {
    pub fn new(encoder: TextEncoder, min_length: usize) -> Self {
        Self {
            encoder,
            min_length: min_length.max(1),
        }
    }

    pub fn ingest(
        &self,
        document: &KnowledgeDocument,
        graph: &mut KnowledgeGraph,
    ) -> Result<IngestionReport, GraphError> {
        let sentences = split_sentences(&document.content);
        let mut nodes_added = 0;
        let mut edges_added = 0;
        let mut warnings: Vec<String> = Vec::new();

        let source_id = format!("source:{}", document.doc_id);
        let title = if document.title.is_empty() {
            document.source.clone()
        } else {
            document.title.clone()
        };
        graph.add_node(
            Node::new(&source_id, "Source", title)
                .with_sources([document.source.clone()])
                .with_confidence(0.9)
                .with_metadata("tags", serde_json::json!(document.tags)),
        );
        nodes_added += 1;

        let conflicts_before = graph.detect_conflicts();
        for (index, sentence) in sentences.iter().enumerate() {
            let position = index + 1;
            if sentence.len() < self.min_length {
                warnings.push(format!("discarded_short_sentence:{position}"));
                continue;
            }
            if let Some(existing) = find_duplicate_claim(graph, sentence) {
                warnings.push(format!("duplicate:{position}:{existing}"));
                continue;
            }
            let claim_id = format!("claim:{}:{position:04}", document.doc_id);
            let confidence = self.sentence_confidence(sentence);
            graph.add_node(
                Node::new(&claim_id, "Claim", sentence.clone())
                    .with_sources([document.source.clone()])
                    .with_confidence(confidence)
                    .with_metadata("document_id", serde_json::json!(document.doc_id))
                    .with_metadata("position", serde_json::json!(position)),
            );
            nodes_added += 1;
            graph.add_edge(
                Edge::new(&source_id, &claim_id, "mentions").with_weight(confidence),
            )?;
            edges_added += 1;
        }

        let conflicts: Vec<(String, String)> = graph
            .detect_conflicts()
            .into_iter()
            .filter(|pair| !conflicts_before.contains(pair))
            .collect();
        tracing::info!(
            target: "kolibri::graph",
            document = %document.doc_id,
            nodes = nodes_added,
            edges = edges_added,
            conflicts = conflicts.len(),
            "document ingested"
        );
        Ok(IngestionReport {
            document_id: document.doc_id.clone(),
            nodes_added,
            edges_added,
            conflicts,
            warnings,
        })
    }

    fn sentence_confidence(&self, sentence: &str) -> f64 {
        let vector = self.encoder.encode(sentence);
        let energy =
            vector.iter().map(|value| value.abs()).sum::<f64>() / vector.len().max(1) as f64;
        (0.5 + energy).clamp(0.2, 0.95)
    }
}

/// Structured domain entry that should be represented in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub identifier: String,
    pub source: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Summary of a domain import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainImportReport {
    pub nodes_added: usize,
    pub edges_added: usize,
    pub types: std::collections::BTreeMap<String, usize>,
    pub sources: Vec<String>,
}

/// Converts structured domain records into typed long-term graph nodes
/// with `describes` edges back to their auto-created source nodes.
pub struct DomainImportPipeline {
    encoder: TextEncoder,
}

impl Default for DomainImportPipeline {
    fn default() -> Self {
        Self::new(TextEncoder::new(24))
    }
}

impl DomainImportPipeline {
    pub fn new(encoder: TextEncoder) -> Self {
        Self { encoder }
    }

    pub fn import_records(
        &self,
        records: &[DomainRecord],
        graph: &mut KnowledgeGraph,
    ) -> Result<DomainImportReport, GraphError> {
        let mut nodes_added = 0;
        let mut edges_added = 0;
        let mut types: std::collections::BTreeMap<String, usize> = Default::default();
        let mut sources: Vec<String> = Vec::new();

        for record in records {
            let node_type = infer_record_type(&record.payload);
            let text = format_record(record);
            let embedding = self.encoder.encode(&text);
            let node_id = format!("record:{}", record.identifier);
            graph.add_node(
                Node::new(&node_id, &node_type, text)
                    .with_sources([record.source.clone()])
                    .with_confidence(0.75)
                    .with_embedding(embedding)
                    .with_memory(MemoryTier::LongTerm)
                    .with_metadata("payload", serde_json::Value::Object(record.payload.clone()))
                    .with_metadata("tags", serde_json::json!(record.tags)),
            );
            nodes_added += 1;
            *types.entry(node_type).or_insert(0) += 1;
            if !sources.contains(&record.source) {
                sources.push(record.source.clone());
            }

            let source_id = format!("source:{}", record.source);
            if graph.get_node(&source_id).is_none() {
                graph.add_node(
                    Node::new(&source_id, "Source", record.source.clone())
                        .with_sources([record.source.clone()])
                        .with_confidence(0.8)
                        .with_memory(MemoryTier::LongTerm)
                        .with_metadata("auto_created", serde_json::json!(true)),
                );
                nodes_added += 1;
            }
            graph.add_edge(
                Edge::new(&source_id, &node_id, "describes")
                    .with_weight(0.8)
                    .with_memory(MemoryTier::LongTerm)
                    .with_metadata("origin", serde_json::json!("domain_import")),
            )?;
            edges_added += 1;
        }

        sources.sort_unstable();
        Ok(DomainImportReport {
            nodes_added,
            edges_added,
            types,
            sources,
        })
    }
}

/// Guesses a node type from the payload shape: explicit `type` wins, small
/// all-numeric payloads are metrics, dated payloads are events, payloads
/// with lists are collections, everything else a fact.
fn infer_record_type(payload: &serde_json::Map<String, serde_json::Value>) -> String {
    if let Some(explicit) = payload.get("type").and_then(|value| value.as_str()) {
        let mut chars = explicit.chars();
        return match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => "Fact".to_string(),
        };
    }
    let numeric_fields = payload
        .values()
        .filter(|value| value.is_number())
        .count();
    if numeric_fields > 0 && payload.len() <= 3 {
        return "Metric".to_string();
    }
    if payload.keys().any(|key| key.to_lowercase().contains("date")) {
        return "Event".to_string();
    }
    if payload.values().any(|value| value.is_array()) {
        return "Collection".to_string();
    }
    "Fact".to_string()
}

fn format_record(record: &DomainRecord) -> String {
    let title = record
        .payload
        .get("name")
        .or_else(|| record.payload.get("title"))
        .and_then(|value| value.as_str())
        .unwrap_or(&record.identifier)
        .to_string();
    let context: Vec<String> = record
        .payload
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "name" | "title" | "type"))
        .take(5)
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    if context.is_empty() {
        title
    } else {
        format!("{title}: {}", context.join(", "))
    }
}

fn split_sentences(content: &str) -> Vec<String> {
    let mut sentences: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in content.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trailing = current.trim();
    if !trailing.is_empty() {
        sentences.push(trailing.to_string());
    }
    sentences
}

fn find_duplicate_claim(graph: &KnowledgeGraph, text: &str) -> Option<String> {
    let normalized = normalize_claim(text);
    graph
        .nodes(None)
        .into_iter()
        .find(|node| node.node_type == "Claim" && normalize_claim(&node.text) == normalized)
        .map(|node| node.id.clone())
}

fn normalize_claim(text: &str) -> String {
    text.split_whitespace()
        .map(|token| token.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
