//! Two-tier knowledge graph: operational (hot) and long-term stores with
//! lazy updates, critic/authority verification, embedding deduplication,
//! conflict detection, and line-delimited JSON snapshots.
//!
//! Nodes are immutable by convention: every mutation replaces the stored
//! record. Edges carry ids, not pointers, so merges only rewrite endpoint
//! strings. Any mutation bumps the revision counter, which keys (and so
//! invalidates) the verification cache.

mod ingest;

pub use ingest::{
    DomainImportPipeline, DomainImportReport, DomainRecord, IngestionReport, KnowledgeDocument,
    KnowledgeIngestor,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w']+").expect("word regex"));

const NEGATION_TOKENS: [&str; 3] = ["not", "never", "no"];

/// Edges with these relations are conflicts by construction.
const CONFLICT_RELATIONS: [&str; 2] = ["contradicts", "conflicts_with"];

/// Weight decay applied to incident edges when a staged update lands.
const BACKPROP_DECAY: f64 = 0.95;

const GRAPH_EVENT_CAPACITY: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("graph io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("graph format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("graph snapshot missing or invalid meta header")]
    Meta,
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("edge endpoint missing: {endpoint_source} -> {target}")]
    MissingEndpoint { endpoint_source: String, target: String },
}

/// Storage tier a node or edge belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    #[default]
    Operational,
    LongTerm,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Operational => "operational",
            MemoryTier::LongTerm => "long_term",
        }
    }
}

/// Knowledge graph entity (claim, entity, metric, source, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub text: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub embedding: Vec<f64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub memory: MemoryTier,
}

fn default_confidence() -> f64 {
    0.5
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            text: text.into(),
            sources: Vec::new(),
            confidence: default_confidence(),
            embedding: Vec::new(),
            metadata: serde_json::Map::new(),
            memory: MemoryTier::Operational,
        }
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f64>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_memory(mut self, memory: MemoryTier) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Ranking tuple used by deduplication: long-term beats operational,
    /// then higher confidence wins.
    fn dedup_rank(&self) -> (bool, f64) {
        (self.memory == MemoryTier::LongTerm, self.confidence)
    }
}

/// Directed, weighted relation between two nodes. Append-only; merges
/// rewrite endpoints and record the redirect history in metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub relation: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub memory: MemoryTier,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_weight() -> f64 {
    1.0
}

impl Edge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relation: relation.into(),
            weight: default_weight(),
            memory: MemoryTier::Operational,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.max(0.0);
        self
    }

    pub fn with_memory(mut self, memory: MemoryTier) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Staged changes for one node, applied by `propagate_pending`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingUpdate {
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Score assigned to one node by one critic or authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub node_id: String,
    pub critic: String,
    pub score: f64,
    pub provenance: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// Authority verdict: external-evidence score plus supporting details.
#[derive(Debug, Clone, Default)]
pub struct AuthorityVerdict {
    pub score: f64,
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl AuthorityVerdict {
    pub fn score_only(score: f64) -> Self {
        Self {
            score,
            details: serde_json::Map::new(),
        }
    }
}

pub type Critic = Arc<dyn Fn(&Node) -> f64 + Send + Sync>;
pub type Authority = Arc<dyn Fn(&Node) -> AuthorityVerdict + Send + Sync>;

/// Mutation notifications for graph listeners.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    NodeUpserted { id: String },
    NodeRemoved { id: String },
    NodePromoted { id: String },
    EdgeAdded { source: String, target: String },
    PendingApplied { nodes: usize },
}

/// Two-tier node and edge store with lazy updates and verification.
pub struct KnowledgeGraph {
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
    pending: BTreeMap<String, PendingUpdate>,
    critics: BTreeMap<String, Critic>,
    authorities: BTreeMap<String, Authority>,
    revision: u64,
    verification_cache: Option<(u64, Vec<VerificationResult>)>,
    events_tx: broadcast::Sender<GraphEvent>,
}

impl Default for KnowledgeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(GRAPH_EVENT_CAPACITY);
        Self {
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            pending: BTreeMap::new(),
            critics: BTreeMap::new(),
            authorities: BTreeMap::new(),
            revision: 0,
            verification_cache: None,
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.events_tx.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self, event: GraphEvent) {
        self.revision += 1;
        self.verification_cache = None;
        let _ = self.events_tx.send(event);
    }

    /// Inserts or replaces a node. Ids are globally unique across tiers, so
    /// a replacement may move the record between tiers.
    pub fn add_node(&mut self, node: Node) {
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        self.touch(GraphEvent::NodeUpserted { id });
    }

    /// Appends an edge (edges are a multiset). Both endpoints must exist.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&edge.source) || !self.nodes.contains_key(&edge.target) {
            return Err(GraphError::MissingEndpoint {
                endpoint_source: edge.source,
                target: edge.target,
            });
        }
        let event = GraphEvent::EdgeAdded {
            source: edge.source.clone(),
            target: edge.target.clone(),
        };
        self.edges.push(edge);
        self.touch(event);
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes of one tier, or the union when `level` is omitted.
    pub fn nodes(&self, level: Option<MemoryTier>) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| level.map_or(true, |tier| node.memory == tier))
            .collect()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Moves a node from operational to long-term. One-way within a session;
    /// promoting an already long-term node is a no-op.
    pub fn promote(&mut self, id: &str) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))?;
        if node.memory == MemoryTier::LongTerm {
            return Ok(());
        }
        node.memory = MemoryTier::LongTerm;
        self.touch(GraphEvent::NodePromoted { id: id.to_string() });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lazy updates
    // ------------------------------------------------------------------

    /// Stages changes for an existing node. `metadata` changes merge into
    /// the pending metadata patch; other keys are direct field writes.
    pub fn lazy_update(
        &mut self,
        id: &str,
        changes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::UnknownNode(id.to_string()));
        }
        let update = self.pending.entry(id.to_string()).or_default();
        for (key, value) in changes {
            if key == "metadata" {
                if let serde_json::Value::Object(patch) = value {
                    for (meta_key, meta_value) in patch {
                        update.metadata.insert(meta_key, meta_value);
                    }
                }
            } else {
                update.fields.insert(key, value);
            }
        }
        Ok(())
    }

    pub fn pending_updates(&self) -> &BTreeMap<String, PendingUpdate> {
        &self.pending
    }

    /// Applies every staged update atomically and back-propagates a weight
    /// decay to incident edges. Bumps the revision counter once.
    pub fn propagate_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let staged = std::mem::take(&mut self.pending);
        let applied = staged.len();
        for (id, update) in staged {
            if !self.nodes.contains_key(&id) {
                continue;
            }
            self.apply_update(&id, update);
            self.backpropagate(&id);
        }
        self.touch(GraphEvent::PendingApplied { nodes: applied });
    }

    fn apply_update(&mut self, id: &str, update: PendingUpdate) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if !update.metadata.is_empty() {
            for (key, value) in &update.metadata {
                node.metadata.insert(key.clone(), value.clone());
            }
            push_to_array(
                &mut node.metadata,
                "revisions",
                serde_json::Value::Object(update.metadata.clone()),
            );
        }
        let mut ignored: Vec<String> = Vec::new();
        for (field, value) in update.fields {
            match field.as_str() {
                "text" => {
                    if let Some(text) = value.as_str() {
                        node.text = text.to_string();
                    }
                }
                "type" => {
                    if let Some(node_type) = value.as_str() {
                        node.node_type = node_type.to_string();
                    }
                }
                "confidence" => {
                    if let Some(confidence) = value.as_f64() {
                        node.confidence = confidence.clamp(0.0, 1.0);
                    }
                }
                "sources" => {
                    if let Some(entries) = value.as_array() {
                        node.sources = entries
                            .iter()
                            .filter_map(|entry| entry.as_str().map(String::from))
                            .collect();
                    }
                }
                "embedding" => {
                    if let Some(entries) = value.as_array() {
                        node.embedding =
                            entries.iter().filter_map(|entry| entry.as_f64()).collect();
                    }
                }
                _ => ignored.push(field),
            }
        }
        for field in ignored {
            push_to_array(
                &mut node.metadata,
                "ignored_updates",
                serde_json::Value::String(field),
            );
        }
    }

    fn backpropagate(&mut self, id: &str) {
        let mut neighbors: BTreeSet<String> = BTreeSet::new();
        for edge in self.edges.iter_mut() {
            if edge.source == id || edge.target == id {
                edge.weight *= BACKPROP_DECAY;
                edge.metadata
                    .insert("pending_review".to_string(), serde_json::Value::Bool(true));
                let other = if edge.source == id {
                    &edge.target
                } else {
                    &edge.source
                };
                if other != id {
                    neighbors.insert(other.clone());
                }
            }
        }
        for neighbor in neighbors {
            if let Some(node) = self.nodes.get_mut(&neighbor) {
                let mut marks: BTreeSet<String> = node
                    .metadata
                    .get("pending_backprop")
                    .and_then(|value| value.as_array())
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|entry| entry.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                marks.insert(id.to_string());
                node.metadata.insert(
                    "pending_backprop".to_string(),
                    serde_json::Value::Array(
                        marks.into_iter().map(serde_json::Value::String).collect(),
                    ),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    pub fn register_critic(&mut self, name: &str, critic: Critic) {
        self.critics.insert(name.to_string(), critic);
        self.verification_cache = None;
    }

    pub fn register_authority(&mut self, name: &str, authority: Authority) {
        self.authorities.insert(name.to_string(), authority);
        self.verification_cache = None;
    }

    /// Runs every critic and authority over every node and aggregates the
    /// mean score into each node's `verification_score` metadata. Results
    /// are cached against the revision counter when no extras are passed.
    pub fn verify_with_critics(
        &mut self,
        extra: Option<&BTreeMap<String, Critic>>,
    ) -> Vec<VerificationResult> {
        if extra.is_none() {
            if let Some((revision, cached)) = &self.verification_cache {
                if *revision == self.revision {
                    return cached.clone();
                }
            }
        }
        let mut results: Vec<VerificationResult> = Vec::new();
        for node in self.nodes.values() {
            for (name, critic) in &self.critics {
                results.push(VerificationResult {
                    node_id: node.id.clone(),
                    critic: name.clone(),
                    score: critic(node).clamp(0.0, 1.0),
                    provenance: "critic".to_string(),
                    details: serde_json::Map::new(),
                });
            }
            if let Some(extra) = extra {
                for (name, critic) in extra {
                    results.push(VerificationResult {
                        node_id: node.id.clone(),
                        critic: name.clone(),
                        score: critic(node).clamp(0.0, 1.0),
                        provenance: "critic".to_string(),
                        details: serde_json::Map::new(),
                    });
                }
            }
            for (name, authority) in &self.authorities {
                let verdict = authority(node);
                results.push(VerificationResult {
                    node_id: node.id.clone(),
                    critic: name.clone(),
                    score: verdict.score.clamp(0.0, 1.0),
                    provenance: "authority".to_string(),
                    details: verdict.details,
                });
            }
        }

        // Aggregation writes are part of verification itself and do not
        // count as graph mutations (they would invalidate this cache).
        let mut per_node: BTreeMap<String, (Vec<f64>, Vec<String>)> = BTreeMap::new();
        for result in &results {
            let slot = per_node.entry(result.node_id.clone()).or_default();
            slot.0.push(result.score);
            slot.1.push(result.provenance.clone());
        }
        for (id, (scores, provenances)) in per_node {
            if let Some(node) = self.nodes.get_mut(&id) {
                let mean = scores.iter().sum::<f64>() / scores.len() as f64;
                node.metadata.insert(
                    "verification_score".to_string(),
                    serde_json::json!(mean),
                );
                node.metadata.insert(
                    "verification_sources".to_string(),
                    serde_json::json!(provenances),
                );
            }
        }

        if extra.is_none() {
            self.verification_cache = Some((self.revision, results.clone()));
        }
        results
    }

    // ------------------------------------------------------------------
    // Deduplication
    // ------------------------------------------------------------------

    /// Collapses near-identical embeddings. The node with the maximal
    /// `(memory == long_term, confidence)` tuple survives; every edge that
    /// referenced the loser is rewritten in place with a redirect record.
    /// Returns `(canonical_id, duplicate_id)` pairs.
    pub fn deduplicate_embeddings(&mut self, threshold: f64) -> Vec<(String, String)> {
        let ids: Vec<String> = self
            .nodes
            .values()
            .filter(|node| !node.embedding.is_empty())
            .map(|node| node.id.clone())
            .collect();
        let mut canonical_ids: Vec<String> = Vec::new();
        let mut pairs: Vec<(String, String)> = Vec::new();

        for id in ids {
            let Some(candidate) = self.nodes.get(&id).cloned() else {
                continue;
            };
            let mut duplicate_of: Option<usize> = None;
            for (slot, canonical_id) in canonical_ids.iter().enumerate() {
                let Some(canonical) = self.nodes.get(canonical_id) else {
                    continue;
                };
                if cosine_similarity(&candidate.embedding, &canonical.embedding) >= threshold {
                    duplicate_of = Some(slot);
                    break;
                }
            }
            match duplicate_of {
                None => canonical_ids.push(id),
                Some(slot) => {
                    let rival_id = canonical_ids[slot].clone();
                    let rival_rank = self
                        .nodes
                        .get(&rival_id)
                        .map(|node| node.dedup_rank())
                        .unwrap_or((false, 0.0));
                    let (winner, loser) = if candidate.dedup_rank() > rival_rank {
                        canonical_ids[slot] = id.clone();
                        (id, rival_id)
                    } else {
                        (rival_id, id)
                    };
                    self.redirect_edges(&loser, &winner);
                    self.nodes.remove(&loser);
                    self.pending.remove(&loser);
                    tracing::debug!(
                        target: "kolibri::graph",
                        canonical = %winner,
                        duplicate = %loser,
                        "deduplicated embedding"
                    );
                    let _ = self.events_tx.send(GraphEvent::NodeRemoved {
                        id: loser.clone(),
                    });
                    pairs.push((winner, loser));
                }
            }
        }
        if !pairs.is_empty() {
            self.revision += 1;
            self.verification_cache = None;
        }
        pairs
    }

    fn redirect_edges(&mut self, from: &str, to: &str) {
        for edge in self.edges.iter_mut() {
            let mut redirected = false;
            if edge.source == from {
                edge.source = to.to_string();
                redirected = true;
            }
            if edge.target == from {
                edge.target = to.to_string();
                redirected = true;
            }
            if redirected {
                push_to_array(
                    &mut edge.metadata,
                    "redirects",
                    serde_json::json!({"from": from, "to": to}),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Unordered conflicting node pairs, sorted. Conflicts come from
    /// `contradicts`/`conflicts_with` edges and from text pairs that differ
    /// only by negation.
    pub fn detect_conflicts(&self) -> Vec<(String, String)> {
        let mut conflicts: BTreeSet<(String, String)> = BTreeSet::new();
        for edge in &self.edges {
            if CONFLICT_RELATIONS.contains(&edge.relation.as_str()) {
                conflicts.insert(ordered_pair(&edge.source, &edge.target));
            }
        }

        let mut groups: BTreeMap<String, Vec<(&str, bool)>> = BTreeMap::new();
        for node in self.nodes.values() {
            if node.text.trim().is_empty() {
                continue;
            }
            let key = normalized_text_key(&node.text);
            groups
                .entry(key)
                .or_default()
                .push((node.id.as_str(), is_negative(&node.text)));
        }
        for members in groups.values() {
            for (left_index, (left, left_negative)) in members.iter().enumerate() {
                for (right, right_negative) in members.iter().skip(left_index + 1) {
                    if left_negative != right_negative {
                        conflicts.insert(ordered_pair(left, right));
                    }
                }
            }
        }
        conflicts.into_iter().collect()
    }

    /// Human-readable prompts asking the user to resolve each conflict,
    /// naming both nodes and the union of their sources.
    pub fn generate_clarification_requests(&self) -> Vec<String> {
        self.detect_conflicts()
            .into_iter()
            .map(|(left, right)| {
                let mut sources: BTreeSet<String> = BTreeSet::new();
                for id in [&left, &right] {
                    if let Some(node) = self.nodes.get(id) {
                        sources.extend(node.sources.iter().cloned());
                    }
                }
                let sources: Vec<String> = sources.into_iter().collect();
                format!(
                    "Clarify conflict between '{left}' and '{right}' (sources: {})",
                    if sources.is_empty() {
                        "none".to_string()
                    } else {
                        sources.join(", ")
                    }
                )
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Writes the snapshot: one meta line, node lines sorted by
    /// `(memory, id)`, edge lines sorted by `(memory, source, target,
    /// relation)`, and a pending-updates line when any exist.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut lines: Vec<String> = Vec::new();
        lines.push(serde_json::json!({"kind": "meta", "version": 1}).to_string());

        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by(|a, b| (a.memory, &a.id).cmp(&(b.memory, &b.id)));
        for node in nodes {
            lines.push(serde_json::json!({"kind": "node", "data": node}).to_string());
        }

        let mut edges: Vec<&Edge> = self.edges.iter().collect();
        edges.sort_by(|a, b| {
            (a.memory, &a.source, &a.target, &a.relation)
                .cmp(&(b.memory, &b.source, &b.target, &b.relation))
        });
        for edge in edges {
            lines.push(serde_json::json!({"kind": "edge", "data": edge}).to_string());
        }

        if !self.pending.is_empty() {
            lines.push(serde_json::json!({"kind": "pending", "data": self.pending}).to_string());
        }
        std::fs::write(path, lines.join("\n") + "\n")?;
        Ok(())
    }

    /// Loads a snapshot written by [`KnowledgeGraph::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
        let meta: serde_json::Value = serde_json::from_str(lines.next().ok_or(GraphError::Meta)?)?;
        if meta.get("kind").and_then(|kind| kind.as_str()) != Some("meta")
            || meta.get("version").and_then(|version| version.as_u64()) != Some(1)
        {
            return Err(GraphError::Meta);
        }

        let mut graph = Self::new();
        for line in lines {
            let record: serde_json::Value = serde_json::from_str(line)?;
            let data = record.get("data").cloned().unwrap_or_default();
            match record.get("kind").and_then(|kind| kind.as_str()) {
                Some("node") => {
                    let node: Node = serde_json::from_value(data)?;
                    graph.nodes.insert(node.id.clone(), node);
                }
                Some("edge") => {
                    let edge: Edge = serde_json::from_value(data)?;
                    if !graph.nodes.contains_key(&edge.source)
                        || !graph.nodes.contains_key(&edge.target)
                    {
                        return Err(GraphError::MissingEndpoint {
                            endpoint_source: edge.source,
                            target: edge.target,
                        });
                    }
                    graph.edges.push(edge);
                }
                Some("pending") => {
                    graph.pending = serde_json::from_value(data)?;
                }
                _ => return Err(GraphError::Meta),
            }
        }
        Ok(graph)
    }
}

fn push_to_array(
    metadata: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
    value: serde_json::Value,
) {
    match metadata.get_mut(key) {
        Some(serde_json::Value::Array(entries)) => entries.push(value),
        _ => {
            metadata.insert(key.to_string(), serde_json::Value::Array(vec![value]));
        }
    }
}

fn cosine_similarity(left: &[f64], right: &[f64]) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let dot: f64 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm: f64 = left.iter().map(|value| value * value).sum::<f64>().sqrt();
    let right_norm: f64 = right.iter().map(|value| value * value).sum::<f64>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

fn ordered_pair(left: &str, right: &str) -> (String, String) {
    if left <= right {
        (left.to_string(), right.to_string())
    } else {
        (right.to_string(), left.to_string())
    }
}

/// Lower-cased word tokens with negation tokens dropped, sorted and joined.
fn normalized_text_key(text: &str) -> String {
    let mut tokens: Vec<String> = WORD_RE
        .find_iter(&text.to_lowercase())
        .map(|token| token.as_str().to_string())
        .filter(|token| !NEGATION_TOKENS.contains(&token.as_str()))
        .collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn is_negative(text: &str) -> bool {
    WORD_RE
        .find_iter(&text.to_lowercase())
        .any(|token| NEGATION_TOKENS.contains(&token.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_claims() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        graph.add_node(
            Node::new("claim:reliable", "Claim", "Kolibri runtime is reliable")
                .with_sources(["https://kolibri.example/report"])
                .with_confidence(0.8),
        );
        graph.add_node(
            Node::new("claim:unreliable", "Claim", "Kolibri runtime is not reliable")
                .with_sources(["https://forum.example/thread"])
                .with_confidence(0.4),
        );
        graph
    }

    #[test]
    fn tiers_are_mutually_exclusive_and_union_by_default() {
        let mut graph = KnowledgeGraph::new();
        graph.add_node(Node::new("a", "Claim", "hot fact"));
        graph.add_node(Node::new("b", "Claim", "cold fact").with_memory(MemoryTier::LongTerm));
        assert_eq!(graph.nodes(None).len(), 2);
        assert_eq!(graph.nodes(Some(MemoryTier::Operational)).len(), 1);
        assert_eq!(graph.nodes(Some(MemoryTier::LongTerm)).len(), 1);
        graph.promote("a").unwrap();
        assert_eq!(graph.nodes(Some(MemoryTier::LongTerm)).len(), 2);
        // Promotion is idempotent.
        graph.promote("a").unwrap();
        assert_eq!(graph.get_node("a").unwrap().memory, MemoryTier::LongTerm);
    }

    #[test]
    fn edges_require_existing_endpoints() {
        let mut graph = KnowledgeGraph::new();
        graph.add_node(Node::new("a", "Claim", "fact"));
        let err = graph.add_edge(Edge::new("a", "ghost", "supports")).unwrap_err();
        assert!(matches!(err, GraphError::MissingEndpoint { .. }));
    }

    #[test]
    fn lazy_update_stages_and_propagates_with_decay() {
        let mut graph = graph_with_claims();
        graph
            .add_edge(
                Edge::new("claim:reliable", "claim:unreliable", "mentions").with_weight(1.0),
            )
            .unwrap();
        let mut changes = serde_json::Map::new();
        changes.insert("confidence".to_string(), serde_json::json!(0.9));
        changes.insert("metadata".to_string(), serde_json::json!({"reviewed": true}));
        changes.insert("unknown_field".to_string(), serde_json::json!(1));
        graph.lazy_update("claim:reliable", changes).unwrap();
        assert_eq!(graph.pending_updates().len(), 1);

        let before = graph.revision();
        graph.propagate_pending();
        assert_eq!(graph.revision(), before + 1);
        assert!(graph.pending_updates().is_empty());

        let node = graph.get_node("claim:reliable").unwrap();
        assert!((node.confidence - 0.9).abs() < 1e-9);
        assert_eq!(node.metadata["reviewed"], serde_json::json!(true));
        assert_eq!(
            node.metadata["revisions"].as_array().unwrap().len(),
            1
        );
        assert_eq!(
            node.metadata["ignored_updates"],
            serde_json::json!(["unknown_field"])
        );

        let edge = &graph.edges()[0];
        assert!((edge.weight - 0.95).abs() < 1e-9);
        assert_eq!(edge.metadata["pending_review"], serde_json::json!(true));
        let neighbor = graph.get_node("claim:unreliable").unwrap();
        assert_eq!(
            neighbor.metadata["pending_backprop"],
            serde_json::json!(["claim:reliable"])
        );
    }

    #[test]
    fn unknown_node_rejects_lazy_update() {
        let mut graph = KnowledgeGraph::new();
        let err = graph
            .lazy_update("ghost", serde_json::Map::new())
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownNode(_)));
    }

    #[test]
    fn verification_caches_on_revision() {
        let mut graph = graph_with_claims();
        graph.register_critic("length", Arc::new(|node: &Node| node.text.len() as f64 / 100.0));
        graph.register_authority(
            "registry",
            Arc::new(|_node: &Node| AuthorityVerdict::score_only(0.75)),
        );
        let first = graph.verify_with_critics(None);
        assert_eq!(first.len(), 4);
        let provenances: BTreeSet<&str> =
            first.iter().map(|result| result.provenance.as_str()).collect();
        assert_eq!(provenances, BTreeSet::from(["critic", "authority"]));

        let node = graph.get_node("claim:reliable").unwrap();
        assert!(node.metadata.contains_key("verification_score"));
        assert_eq!(
            node.metadata["verification_sources"],
            serde_json::json!(["critic", "authority"])
        );

        // Second call is served from cache; a mutation invalidates it.
        let cached = graph.verify_with_critics(None);
        assert_eq!(cached.len(), first.len());
        graph.add_node(Node::new("claim:new", "Claim", "Entirely new assertion here"));
        let refreshed = graph.verify_with_critics(None);
        assert_eq!(refreshed.len(), 6);
    }

    #[test]
    fn conflicts_detected_from_relations_and_negation() {
        let mut graph = graph_with_claims();
        graph.add_node(Node::new("m1", "Metric", "latency is low"));
        graph.add_node(Node::new("m2", "Metric", "throughput is high"));
        graph
            .add_edge(Edge::new("m1", "m2", "contradicts"))
            .unwrap();
        let conflicts = graph.detect_conflicts();
        assert!(conflicts.contains(&(
            "claim:reliable".to_string(),
            "claim:unreliable".to_string()
        )));
        assert!(conflicts.contains(&("m1".to_string(), "m2".to_string())));

        let prompts = graph.generate_clarification_requests();
        let negation_prompt = prompts
            .iter()
            .find(|prompt| prompt.contains("claim:reliable"))
            .unwrap();
        assert!(negation_prompt.contains("claim:unreliable"));
        assert!(negation_prompt.contains("https://kolibri.example/report"));
        assert!(negation_prompt.contains("https://forum.example/thread"));
    }

    #[test]
    fn conflict_detection_is_order_independent() {
        let mut forward = KnowledgeGraph::new();
        forward.add_node(Node::new("p", "Claim", "the cache is warm"));
        forward.add_node(Node::new("q", "Claim", "the cache is not warm"));
        let mut reversed = KnowledgeGraph::new();
        reversed.add_node(Node::new("q", "Claim", "the cache is not warm"));
        reversed.add_node(Node::new("p", "Claim", "the cache is warm"));
        assert_eq!(forward.detect_conflicts(), reversed.detect_conflicts());
    }
}
