//! Integration test: the full request pipeline: privacy gate, planning,
//! retrieval, skill execution, empathy, caching, and journaling.
//!
//! ## Scenarios
//! 1. Happy path: a granted user executes the writer skill; replaying the
//!    identical request is served from the offline cache with equal results.
//! 2. Policy block: a `pii` context tag flips the step to `policy_blocked`.
//! 3. Privacy gate: unconsented modalities never reach the encoders.
//! 4. Cache alerting: sustained misses emit `runtime_alert` entries.
//! 5. Verification report: critics and conflicts over the session graph.

use kolibri_core::{
    AuthorityVerdict, ConsentAction, EmpathyContext, FnExecutor, InteractionSignal, KolibriRuntime,
    ModalityInput, Node, OfflineCache, PolicyLayer, RuntimeRequest, SkillManifest,
};
use std::sync::Arc;

fn writer_manifest() -> SkillManifest {
    SkillManifest::from_value(&serde_json::json!({
        "name": "writer",
        "version": "0.1.0",
        "inputs": ["text"],
        "permissions": ["net.read:whitelist"],
        "billing": "per_call",
        "policy": {"pii": "deny"},
        "entry": "writer.py",
    }))
    .unwrap()
}

fn runtime_with_writer() -> KolibriRuntime {
    let mut runtime = KolibriRuntime::builder()
        .offline_cache(OfflineCache::default())
        .self_learner(Default::default())
        .build();
    runtime
        .register_skill(
            writer_manifest(),
            Arc::new(FnExecutor::new(|payload| {
                Ok(serde_json::json!({
                    "draft": format!(
                        "done: {}",
                        payload.get("step").and_then(|s| s.as_str()).unwrap_or("")
                    ),
                }))
            })),
        )
        .unwrap();
    runtime.privacy_mut().grant("user-1", ["text"]);
    runtime
}

fn pitch_request() -> RuntimeRequest {
    RuntimeRequest::new("user-1", "Draft and refine the product pitch deck.")
        .with_modality("text", ModalityInput::Text("Need pitch.".to_string()))
        .with_skill_scopes(["net.read:whitelist"])
        .with_signals(vec![InteractionSignal::new("tone", 0.4)])
        .with_empathy(EmpathyContext::new(0.2, 0.1, 0.3))
}

// ===========================================================================
// Scenario 1: Happy path, then offline-cache replay
// ===========================================================================

#[tokio::test]
async fn happy_path_executes_and_replays_from_cache() {
    let mut runtime = runtime_with_writer();
    let request = pitch_request();

    let first = runtime.process(&request).await;
    assert!(!first.cached);
    assert_eq!(first.executions.len(), 1);
    assert_eq!(first.executions[0].status(), "ok");
    assert_eq!(
        first.executions[0].skill.as_deref(),
        Some("writer"),
        "planner should map the only registered skill"
    );
    assert!(!first.reasoning.is_empty());
    assert!(runtime.journal().verify());

    let second = runtime.process(&request).await;
    assert!(second.cached);
    assert_eq!(second.executions, first.executions);
    assert_eq!(second.adjustments, first.adjustments);
    assert_eq!(second.plan.to_value(), first.plan.to_value());

    let events: Vec<String> = runtime
        .journal()
        .entries()
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert!(events.contains(&"privacy".to_string()));
    assert!(events.contains(&"plan".to_string()));
    assert!(events.contains(&"skill_executed".to_string()));
    assert!(events.contains(&"cache_store".to_string()));
    assert!(events.contains(&"cache_hit".to_string()));
    assert!(events.contains(&"slo_snapshot".to_string()));
}

// ===========================================================================
// Scenario 2: Policy tag blocks the execution
// ===========================================================================

#[tokio::test]
async fn pii_tag_blocks_writer_policy() {
    let mut runtime = runtime_with_writer();
    let request = pitch_request().with_data_tags(["pii"]);

    let response = runtime.process(&request).await;
    assert!(!response.cached);
    assert_eq!(response.executions[0].status(), "policy_blocked");
    assert_eq!(response.executions[0].output["policy"], "pii");

    let events: Vec<String> = runtime
        .journal()
        .entries()
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert!(events.contains(&"skill_policy_blocked".to_string()));
}

// ===========================================================================
// Scenario 3: Privacy gate filters modalities
// ===========================================================================

#[tokio::test]
async fn unconsented_modalities_are_dropped() {
    let mut runtime = runtime_with_writer();
    // Layered default: sensors allowed even without explicit consent.
    runtime.privacy_mut().add_layer(PolicyLayer::new(
        "ambient-sensors",
        ["sensors"],
        ConsentAction::Allow,
    ));
    let request = pitch_request()
        .with_modality("image", ModalityInput::Image(vec![1, 2, 3]))
        .with_modality(
            "sensors",
            ModalityInput::Sensors(vec![kolibri_core::SensorEvent {
                source: "watch".to_string(),
                signal_type: "hr".to_string(),
                value: 64.0,
                timestamp: 100.0,
            }]),
        );

    let response = runtime.process(&request).await;
    assert!(!response.cached);
    let privacy_entry = runtime
        .journal()
        .entries()
        .into_iter()
        .find(|entry| entry.event == "privacy")
        .unwrap();
    let allowed = privacy_entry.payload["allowed"].as_array().unwrap().clone();
    let blocked = privacy_entry.payload["blocked"].as_array().unwrap().clone();
    assert!(allowed.contains(&serde_json::json!("text")));
    assert!(allowed.contains(&serde_json::json!("sensors")));
    assert!(blocked.contains(&serde_json::json!("image")));
}

// ===========================================================================
// Scenario 4: Sustained cache misses raise alerts
// ===========================================================================

#[tokio::test]
async fn sustained_rag_misses_emit_runtime_alert() {
    let mut runtime = runtime_with_writer();
    for index in 0..10 {
        let request = RuntimeRequest::new("user-1", format!("Unique goal number {index}."))
            .with_modality("text", ModalityInput::Text(format!("variant {index}")))
            .with_skill_scopes(["net.read:whitelist"]);
        runtime.process(&request).await;
    }
    let stats = runtime.rag_cache_stats();
    assert_eq!(stats.requests, 10.0);
    assert_eq!(stats.hits, 0.0);

    let alerts: Vec<serde_json::Value> = runtime
        .journal()
        .entries()
        .into_iter()
        .filter(|entry| entry.event == "runtime_alert")
        .map(|entry| entry.payload)
        .collect();
    assert!(!alerts.is_empty());
    assert!(alerts
        .iter()
        .any(|payload| payload["name"] == "rag_cache_hit_rate" && payload["comparison"] == "<"));
}

// ===========================================================================
// Scenario 5: Verification report over the session graph
// ===========================================================================

#[tokio::test]
async fn verification_report_lists_critics_and_conflicts() {
    let mut runtime = runtime_with_writer();
    runtime.graph_mut().add_node(
        Node::new("claim:up", "Claim", "The device is online")
            .with_sources(["https://status.example"]),
    );
    runtime
        .graph_mut()
        .add_node(Node::new("claim:down", "Claim", "The device is not online"));
    runtime.graph_mut().register_critic(
        "source-presence",
        Arc::new(|node: &Node| if node.sources.is_empty() { 0.1 } else { 0.9 }),
    );
    runtime.graph_mut().register_authority(
        "status-registry",
        Arc::new(|_node: &Node| AuthorityVerdict::score_only(0.8)),
    );

    let report = runtime.verification_report();
    let verification = report["verification"].as_array().unwrap();
    assert_eq!(verification.len(), 4);
    assert!(verification
        .iter()
        .any(|result| result["provenance"] == "authority"));
    let conflicts = report["conflicts"].as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    let pair = conflicts[0].as_array().unwrap();
    assert_eq!(pair[0], "claim:down");
    assert_eq!(pair[1], "claim:up");
}
