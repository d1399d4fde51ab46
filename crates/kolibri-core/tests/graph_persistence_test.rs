//! Integration test: knowledge-graph deduplication, snapshot round-trips,
//! and session-level persistence through the runtime.

use kolibri_core::{
    Edge, KnowledgeGraph, KolibriConfig, KolibriRuntime, MemoryTier, ModalityInput, Node,
    RuntimeRequest, SessionEvent,
};

// ===========================================================================
// Deduplication: long-term confidence winner absorbs the duplicate
// ===========================================================================

#[test]
fn dedup_redirects_edges_and_removes_loser() {
    let mut graph = KnowledgeGraph::new();
    graph.add_node(
        Node::new("A", "Claim", "the hummingbird flies")
            .with_confidence(0.7)
            .with_embedding(vec![1.0, 0.0]),
    );
    graph.add_node(
        Node::new("B", "Claim", "the hummingbird flies")
            .with_confidence(0.7)
            .with_embedding(vec![1.0, 0.0])
            .with_memory(MemoryTier::LongTerm),
    );
    graph.add_node(Node::new("C", "Entity", "hummingbird"));
    graph
        .add_edge(Edge::new("A", "C", "supports").with_weight(0.6))
        .unwrap();

    let pairs = graph.deduplicate_embeddings(0.995);
    assert_eq!(pairs, vec![("B".to_string(), "A".to_string())]);
    assert!(graph.get_node("A").is_none());
    assert!(graph.get_node("B").is_some());

    let edge = &graph.edges()[0];
    assert_eq!(edge.source, "B");
    assert_eq!(edge.target, "C");
    let redirects = edge.metadata["redirects"].as_array().unwrap();
    assert_eq!(redirects[0], serde_json::json!({"from": "A", "to": "B"}));
}

#[test]
fn dissimilar_embeddings_survive_dedup() {
    let mut graph = KnowledgeGraph::new();
    graph.add_node(Node::new("x", "Claim", "one thing").with_embedding(vec![1.0, 0.0]));
    graph.add_node(Node::new("y", "Claim", "another thing").with_embedding(vec![0.0, 1.0]));
    assert!(graph.deduplicate_embeddings(0.995).is_empty());
    assert_eq!(graph.nodes(None).len(), 2);
}

// ===========================================================================
// Snapshot round-trip: nodes, edges, tiers, and pending updates survive
// ===========================================================================

#[test]
fn snapshot_round_trip_preserves_graph_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.kg.jsonl");

    let mut graph = KnowledgeGraph::new();
    graph.add_node(
        Node::new("claim:hot", "Claim", "operational fact").with_confidence(0.6),
    );
    graph.add_node(
        Node::new("claim:cold", "Claim", "long term fact")
            .with_memory(MemoryTier::LongTerm)
            .with_sources(["https://kolibri.example"]),
    );
    graph
        .add_edge(
            Edge::new("claim:hot", "claim:cold", "mentions")
                .with_weight(0.4)
                .with_memory(MemoryTier::LongTerm),
        )
        .unwrap();
    let mut changes = serde_json::Map::new();
    changes.insert("confidence".to_string(), serde_json::json!(0.95));
    graph.lazy_update("claim:hot", changes).unwrap();

    graph.save(&path).unwrap();
    let restored = KnowledgeGraph::load(&path).unwrap();

    assert_eq!(restored.nodes(None).len(), 2);
    assert_eq!(
        restored.get_node("claim:cold").unwrap().memory,
        MemoryTier::LongTerm
    );
    assert_eq!(restored.edges().len(), 1);
    assert_eq!(restored.edges()[0].relation, "mentions");
    assert_eq!(restored.pending_updates().len(), 1);

    // Staged updates still apply after the round trip.
    let mut restored = restored;
    restored.propagate_pending();
    assert!((restored.get_node("claim:hot").unwrap().confidence - 0.95).abs() < 1e-9);
}

#[test]
fn snapshot_without_meta_header_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.kg.jsonl");
    std::fs::write(&path, "{\"kind\":\"node\",\"data\":{}}\n").unwrap();
    assert!(KnowledgeGraph::load(&path).is_err());
}

// ===========================================================================
// Session lifecycle: end_session persists, start_session reloads
// ===========================================================================

#[tokio::test]
async fn session_persists_graph_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = KolibriConfig {
        graph_dir: dir.path().to_path_buf(),
        ..KolibriConfig::default()
    };

    let mut runtime = KolibriRuntime::builder().config(config.clone()).build();
    runtime.start_session("sess-1", None).unwrap();
    let mut events = runtime.subscribe_session("sess-1").unwrap();
    runtime.graph_mut().add_node(
        Node::new("claim:persisted", "Claim", "knowledge outlives the session"),
    );
    let request = RuntimeRequest::new("user-1", "Remember this.")
        .with_modality("text", ModalityInput::Text("note".to_string()));
    // No consent granted: the text modality is filtered, but the request
    // still completes.
    let response = runtime.process(&request).await;
    assert!(!response.cached);
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::RequestCompleted { cached: false, .. }
    ));
    runtime.end_session().unwrap();
    assert!(dir.path().join("sess-1.kg.jsonl").exists());

    let mut next_runtime = KolibriRuntime::builder().config(config).build();
    next_runtime.start_session("sess-1", None).unwrap();
    assert!(next_runtime.graph().get_node("claim:persisted").is_some());
    let events: Vec<String> = next_runtime
        .journal()
        .entries()
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert!(events.contains(&"session_started".to_string()));
}
