//! Runtime orchestrator: composes journal, privacy, encoders, planner,
//! RAG, caches, sandbox, personalization, self-learning, workflows, IoT,
//! and SLO tracking into the per-request pipeline.
//!
//! The pipeline is a linear state machine per request; concurrency enters
//! only at sandbox execution, journal fan-out, and the self-learner
//! cadence. Step-level failures never unwind: they become structured
//! [`StepOutcome`]s and the request completes.

mod request;

pub use request::{
    RuntimeRequest, RuntimeResponse, SessionEvent, SkillExecution, StepOutcome,
};

use crate::cache::{offline_cache_key, OfflineCache, RagCache, RagCacheStats};
use crate::config::KolibriConfig;
use crate::encoders::{
    AdaptiveAudioEncoder, AdaptiveCrossModalTransformer, AsrEncoder, DiffusionVisionEncoder,
    FusionResult, FusionTransformer, ImageEncoder, ModalityInput, ModalitySignal, SensorHub,
    TemporalAlignmentEngine, TextEncoder,
};
use crate::graph::{GraphError, IngestionReport, KnowledgeDocument, KnowledgeGraph, KnowledgeIngestor};
use crate::iot::{Confirmer, IotBridge, IotCommand, IotError, IotPolicy};
use crate::journal::{ActionJournal, JournalEntry};
use crate::learning::BackgroundSelfLearner;
use crate::metrics::SloTracker;
use crate::mksi::{MksiAggregator, MksiObservation};
use crate::personalization::{EmpathyModulator, OnDeviceProfiler};
use crate::planner::{Plan, PlanStep, Planner};
use crate::privacy::PrivacyOperator;
use crate::rag::RagPipeline;
use crate::reasoning::ReasoningLog;
use crate::sandbox::{SandboxError, SkillExecutor, SkillSandbox};
use crate::skills::{ManifestError, SkillManifest, SkillStore};
use crate::workflow::{ReminderEvent, ReminderRule, TaskStepState, Workflow, WorkflowManager};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Alerting thresholds over the RAG cache statistics.
#[derive(Debug, Clone, Copy)]
pub struct CacheAlertThresholds {
    pub min_hit_rate: f64,
    pub max_miss_rate: f64,
    pub max_size: f64,
    pub min_observations: f64,
}

impl Default for CacheAlertThresholds {
    fn default() -> Self {
        Self {
            min_hit_rate: 0.2,
            max_miss_rate: 0.95,
            max_size: 1024.0,
            min_observations: 10.0,
        }
    }
}

impl CacheAlertThresholds {
    /// Accepts both the short keys and their `rag_cache_*` aliases.
    pub fn from_aliases(overrides: &BTreeMap<String, f64>) -> Self {
        let mut thresholds = Self::default();
        for (key, value) in overrides {
            match key.as_str() {
                "min_hit_rate" | "rag_cache_min_hit_rate" => thresholds.min_hit_rate = *value,
                "max_miss_rate" | "rag_cache_max_miss_rate" => thresholds.max_miss_rate = *value,
                "max_size" | "rag_cache_max_entries" => thresholds.max_size = *value,
                "min_observations" | "rag_cache_min_observations" => {
                    thresholds.min_observations = *value
                }
                _ => {}
            }
        }
        thresholds
    }
}

struct SessionState {
    id: String,
    graph_path: PathBuf,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// Builder for [`KolibriRuntime`]. Every component has a sensible default;
/// override what the deployment needs.
pub struct KolibriRuntimeBuilder {
    config: KolibriConfig,
    graph: KnowledgeGraph,
    offline_cache: Option<OfflineCache>,
    rag_cache: RagCache,
    cross_fusion: Option<AdaptiveCrossModalTransformer>,
    fusion_budget: f64,
    iot_policy: Option<IotPolicy>,
    self_learner: Option<BackgroundSelfLearner>,
    mksi: Option<MksiAggregator>,
    cache_alert_thresholds: CacheAlertThresholds,
    sandbox_time_limit: Option<std::time::Duration>,
    encoder_dim: usize,
}

impl Default for KolibriRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: KolibriConfig::default(),
            graph: KnowledgeGraph::new(),
            offline_cache: None,
            rag_cache: RagCache::default(),
            cross_fusion: None,
            fusion_budget: 1.5,
            iot_policy: None,
            self_learner: None,
            mksi: None,
            cache_alert_thresholds: CacheAlertThresholds::default(),
            sandbox_time_limit: None,
            encoder_dim: 32,
        }
    }
}

impl KolibriRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: KolibriConfig) -> Self {
        self.config = config;
        self
    }

    pub fn graph(mut self, graph: KnowledgeGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn offline_cache(mut self, cache: OfflineCache) -> Self {
        self.offline_cache = Some(cache);
        self
    }

    pub fn rag_cache(mut self, cache: RagCache) -> Self {
        self.rag_cache = cache;
        self
    }

    pub fn cross_fusion(mut self, fuser: AdaptiveCrossModalTransformer) -> Self {
        self.cross_fusion = Some(fuser);
        self
    }

    pub fn fusion_budget(mut self, budget: f64) -> Self {
        self.fusion_budget = budget;
        self
    }

    pub fn iot_policy(mut self, policy: IotPolicy) -> Self {
        self.iot_policy = Some(policy);
        self
    }

    pub fn self_learner(mut self, learner: BackgroundSelfLearner) -> Self {
        self.self_learner = Some(learner);
        self
    }

    pub fn mksi(mut self, aggregator: MksiAggregator) -> Self {
        self.mksi = Some(aggregator);
        self
    }

    pub fn cache_alert_thresholds(mut self, overrides: &BTreeMap<String, f64>) -> Self {
        self.cache_alert_thresholds = CacheAlertThresholds::from_aliases(overrides);
        self
    }

    pub fn sandbox_time_limit(mut self, limit: std::time::Duration) -> Self {
        self.sandbox_time_limit = Some(limit);
        self
    }

    pub fn encoder_dim(mut self, dim: usize) -> Self {
        self.encoder_dim = dim.max(1);
        self
    }

    pub fn build(self) -> KolibriRuntime {
        let journal = Arc::new(ActionJournal::new());
        let sensor_hub = Arc::new(Mutex::new(SensorHub::new()));
        let mut sandbox = SkillSandbox::new(journal.clone());
        if let Some(limit) = self.sandbox_time_limit {
            sandbox = sandbox.with_time_limit(limit);
        }
        let iot = self
            .iot_policy
            .map(|policy| IotBridge::new(policy, journal.clone(), sensor_hub.clone()));
        KolibriRuntime {
            config: self.config,
            graph: self.graph,
            text_encoder: TextEncoder::new(self.encoder_dim),
            asr: AsrEncoder,
            image_encoder: ImageEncoder::new(self.encoder_dim),
            audio_encoder: AdaptiveAudioEncoder::new(16),
            vision_encoder: DiffusionVisionEncoder::new(self.encoder_dim, 4),
            fusion: FusionTransformer::new(self.encoder_dim),
            cross_fusion: self.cross_fusion,
            fusion_budget: self.fusion_budget,
            planner: Planner::new(),
            skill_store: SkillStore::with_journal(journal.clone()),
            sandbox,
            privacy: PrivacyOperator::new(),
            profiler: OnDeviceProfiler::default(),
            empathy: EmpathyModulator::new(),
            offline_cache: self.offline_cache,
            rag: RagPipeline::new(TextEncoder::new(self.encoder_dim)),
            rag_cache: self.rag_cache,
            metrics: Arc::new(SloTracker::default()),
            iot,
            workflows: WorkflowManager::default(),
            ingestor: KnowledgeIngestor::default(),
            sensor_hub,
            alignment: TemporalAlignmentEngine,
            learner: self.self_learner,
            mksi: self.mksi,
            cache_alert_thresholds: self.cache_alert_thresholds,
            journal,
            session: None,
        }
    }
}

/// Coordinates encoding, planning, retrieval, skills, and empathy.
pub struct KolibriRuntime {
    config: KolibriConfig,
    graph: KnowledgeGraph,
    text_encoder: TextEncoder,
    asr: AsrEncoder,
    image_encoder: ImageEncoder,
    audio_encoder: AdaptiveAudioEncoder,
    vision_encoder: DiffusionVisionEncoder,
    fusion: FusionTransformer,
    cross_fusion: Option<AdaptiveCrossModalTransformer>,
    fusion_budget: f64,
    planner: Planner,
    skill_store: SkillStore,
    sandbox: SkillSandbox,
    privacy: PrivacyOperator,
    profiler: OnDeviceProfiler,
    empathy: EmpathyModulator,
    offline_cache: Option<OfflineCache>,
    rag: RagPipeline,
    rag_cache: RagCache,
    metrics: Arc<SloTracker>,
    iot: Option<IotBridge>,
    workflows: WorkflowManager,
    ingestor: KnowledgeIngestor,
    sensor_hub: Arc<Mutex<SensorHub>>,
    alignment: TemporalAlignmentEngine,
    learner: Option<BackgroundSelfLearner>,
    mksi: Option<MksiAggregator>,
    cache_alert_thresholds: CacheAlertThresholds,
    journal: Arc<ActionJournal>,
    session: Option<SessionState>,
}

impl Default for KolibriRuntime {
    fn default() -> Self {
        KolibriRuntimeBuilder::new().build()
    }
}

impl KolibriRuntime {
    pub fn builder() -> KolibriRuntimeBuilder {
        KolibriRuntimeBuilder::new()
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    pub fn journal(&self) -> &Arc<ActionJournal> {
        &self.journal
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut KnowledgeGraph {
        &mut self.graph
    }

    pub fn privacy_mut(&mut self) -> &mut PrivacyOperator {
        &mut self.privacy
    }

    pub fn metrics(&self) -> &SloTracker {
        self.metrics.as_ref()
    }

    pub fn skill_store(&self) -> &SkillStore {
        &self.skill_store
    }

    pub fn sandbox(&self) -> &SkillSandbox {
        &self.sandbox
    }

    pub fn rag_cache_stats(&self) -> RagCacheStats {
        self.rag_cache.stats()
    }

    pub fn workflow_manager(&self) -> &WorkflowManager {
        &self.workflows
    }

    pub fn workflow_manager_mut(&mut self) -> &mut WorkflowManager {
        &mut self.workflows
    }

    pub fn self_learner(&self) -> Option<&BackgroundSelfLearner> {
        self.learner.as_ref()
    }

    pub fn self_learner_mut(&mut self) -> Option<&mut BackgroundSelfLearner> {
        self.learner.as_mut()
    }

    /// Registers a manifest with the store, its executor with the sandbox,
    /// and the manifest with the planner's catalogue.
    pub fn register_skill(
        &mut self,
        manifest: SkillManifest,
        executor: Arc<dyn SkillExecutor>,
    ) -> Result<(), ManifestError> {
        let name = manifest.name.clone();
        self.skill_store.register(manifest.clone())?;
        self.sandbox.register(&name, executor);
        self.planner.register_skills([&manifest]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Loads the session graph snapshot (when one exists) and opens the
    /// session event channel. Integrity errors on load are fatal to the
    /// session and surface to the caller.
    pub fn start_session(
        &mut self,
        session_id: &str,
        graph_path: Option<PathBuf>,
    ) -> Result<(), GraphError> {
        let path = graph_path.unwrap_or_else(|| self.config.graph_path_for_session(session_id));
        if path.exists() {
            self.graph = KnowledgeGraph::load(&path)?;
        }
        let (events_tx, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        self.journal.append(
            "session_started",
            serde_json::json!({
                "session_id": session_id,
                "graph_path": path.display().to_string(),
            }),
        );
        let _ = events_tx.send(SessionEvent::Started {
            session_id: session_id.to_string(),
        });
        self.session = Some(SessionState {
            id: session_id.to_string(),
            graph_path: path,
            events_tx,
        });
        Ok(())
    }

    /// Persists the graph, resets IoT session counters, and closes the
    /// session.
    pub fn end_session(&mut self) -> Result<(), GraphError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.graph.save(&session.graph_path)?;
        if let Some(iot) = &mut self.iot {
            iot.reset_all_sessions();
        }
        self.journal.append(
            "session_finished",
            serde_json::json!({
                "session_id": session.id,
                "graph_path": session.graph_path.display().to_string(),
            }),
        );
        let _ = session.events_tx.send(SessionEvent::Finished {
            session_id: session.id.clone(),
        });
        Ok(())
    }

    pub fn active_session(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.id.as_str())
    }

    /// Live journal feed (the streaming chain surface).
    pub fn subscribe_chain(&self) -> broadcast::Receiver<JournalEntry> {
        self.journal.subscribe()
    }

    /// Lifecycle feed for the active session with that id.
    pub fn subscribe_session(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        self.session
            .as_ref()
            .filter(|session| session.id == session_id)
            .map(|session| session.events_tx.subscribe())
    }

    // ------------------------------------------------------------------
    // Request pipeline
    // ------------------------------------------------------------------

    pub async fn process(&mut self, request: &RuntimeRequest) -> RuntimeResponse {
        let mut reasoning = ReasoningLog::new();

        let filtered = {
            let _timer = self.metrics.time_stage_owned("privacy_enforce");
            self.enforce_privacy(request, &mut reasoning)
        };
        let transcript = {
            let _timer = self.metrics.time_stage_owned("compose_transcript");
            self.compose_transcript(&filtered)
        };
        let (embeddings, signals) = {
            let _timer = self.metrics.time_stage_owned("encode_modalities");
            self.encode_modalities(request, &filtered, &transcript, &mut reasoning)
        };
        {
            let _timer = self.metrics.time_stage_owned("fusion");
            self.fuse_modalities(&embeddings, &signals, &mut reasoning);
        }

        let cache_key = offline_cache_key(
            &request.user_id,
            &request.goal,
            &filtered,
            &transcript,
            &request.data_tags,
        );
        let cached_payload = {
            let _timer = self.metrics.time_stage_owned("offline_cache_lookup");
            self.offline_cache
                .as_ref()
                .and_then(|cache| cache.get(&cache_key))
        };
        if let Some(payload) = cached_payload {
            return self
                .cached_response(request, &filtered, payload, reasoning)
                .await;
        }

        let plan = {
            let _timer = self.metrics.time_stage_owned("planning");
            self.planner.plan(&request.goal, &request.hints)
        };
        reasoning.add_step(
            "plan",
            format!("generated {} steps", plan.steps.len()),
            plan.steps.iter().map(|step| step.id.clone()).collect(),
            0.7,
        );
        self.journal.append(
            "plan",
            serde_json::json!({
                "goal": request.goal,
                "step_count": plan.steps.len(),
                "skills": plan.steps.iter().map(|step| &step.skill).collect::<Vec<_>>(),
            }),
        );

        let rag_query = if transcript.is_empty() {
            request.goal.clone()
        } else {
            transcript.clone()
        };
        let modality_names: Vec<String> = filtered.keys().cloned().collect();
        let cached_answer = {
            let _timer = self.metrics.time_stage_owned("rag_cache_lookup");
            self.rag_cache.get(
                &request.user_id,
                &rag_query,
                &request.data_tags,
                &modality_names,
                request.top_k,
            )
        };
        let stats = self.rag_cache.stats();
        self.record_rag_cache_metrics(&stats, &request.user_id, &rag_query);
        let answer = match cached_answer {
            Some(answer) => {
                reasoning.add_step("rag_cache", "served answer from rag cache", Vec::new(), 0.85);
                self.journal.append(
                    "rag_cache_hit",
                    serde_json::json!({
                        "user_id": request.user_id,
                        "goal": request.goal,
                        "query": rag_query,
                    }),
                );
                answer
            }
            None => {
                let answer = {
                    let _timer = self.metrics.time_stage_owned("rag_answer");
                    self.rag
                        .answer(&self.graph, &rag_query, request.top_k, Some(&mut reasoning))
                };
                self.rag_cache.put(
                    &request.user_id,
                    &rag_query,
                    &request.data_tags,
                    &modality_names,
                    request.top_k,
                    answer.clone(),
                );
                self.journal.append(
                    "rag_cache_store",
                    serde_json::json!({
                        "user_id": request.user_id,
                        "goal": request.goal,
                        "query": rag_query,
                    }),
                );
                answer
            }
        };
        self.journal.append(
            "rag_answer",
            serde_json::json!({
                "query": rag_query,
                "support": answer
                    .get("support")
                    .and_then(|support| support.as_array())
                    .map(|facts| {
                        facts
                            .iter()
                            .filter_map(|fact| fact.get("id").and_then(|id| id.as_str()))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default(),
            }),
        );

        let executions = {
            let _timer = self.metrics.time_stage_owned("execute_plan");
            self.execute_plan(&plan, request, &filtered, &mut reasoning)
                .await
        };

        let profile = {
            let _timer = self.metrics.time_stage_owned("profile_signals");
            self.profiler.bulk_record(&request.user_id, &request.signals)
        };
        let adjustments = {
            let _timer = self.metrics.time_stage_owned("empathy_modulation");
            self.empathy.modulation(&profile, &request.empathy)
        };
        reasoning.add_step(
            "empathy",
            "generated modulation vector",
            adjustments.keys().cloned().collect(),
            0.55,
        );
        self.journal.append(
            "empathy",
            serde_json::json!({
                "user_id": request.user_id,
                "adjustments": &adjustments,
            }),
        );

        self.background_learn(request, &answer, &executions);

        let payload = serde_json::json!({
            "plan": plan.to_value(),
            "answer": &answer,
            "executions": executions
                .iter()
                .map(SkillExecution::to_value)
                .collect::<Vec<_>>(),
            "adjustments": &adjustments,
        });
        if let Some(cache) = &self.offline_cache {
            cache.put(&cache_key, payload);
            self.journal.append(
                "cache_store",
                serde_json::json!({"key": cache_key, "user_id": request.user_id}),
            );
        }

        let metrics_snapshot = self.metrics.report();
        self.journal.append(
            "slo_snapshot",
            serde_json::json!({"stages": &metrics_snapshot}),
        );
        self.observe_mksi(&modality_names, &plan, &executions, &reasoning, &adjustments, false)
            .await;
        self.notify_session(request, false);

        RuntimeResponse {
            plan,
            answer,
            adjustments,
            executions,
            reasoning,
            journal_tail: self.journal.tail(5),
            cached: false,
            metrics: metrics_snapshot,
        }
    }

    async fn cached_response(
        &mut self,
        request: &RuntimeRequest,
        filtered: &BTreeMap<String, ModalityInput>,
        payload: serde_json::Value,
        mut reasoning: ReasoningLog,
    ) -> RuntimeResponse {
        let plan = payload
            .get("plan")
            .and_then(Plan::from_value)
            .unwrap_or(Plan {
                goal: request.goal.clone(),
                steps: Vec::new(),
            });
        reasoning.add_step("cache", "served response from offline cache", Vec::new(), 0.95);
        self.journal.append(
            "cache_hit",
            serde_json::json!({"user_id": request.user_id, "goal": request.goal}),
        );
        let executions: Vec<SkillExecution> = payload
            .get("executions")
            .and_then(|executions| executions.as_array())
            .map(|entries| entries.iter().map(SkillExecution::from_value).collect())
            .unwrap_or_default();
        let adjustments: BTreeMap<String, f64> = payload
            .get("adjustments")
            .and_then(|adjustments| adjustments.as_object())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();
        let answer = payload.get("answer").cloned().unwrap_or_default();

        let metrics_snapshot = self.metrics.report();
        self.journal.append(
            "slo_snapshot",
            serde_json::json!({"stages": &metrics_snapshot}),
        );
        let modality_names: Vec<String> = filtered.keys().cloned().collect();
        self.observe_mksi(&modality_names, &plan, &executions, &reasoning, &adjustments, true)
            .await;
        self.notify_session(request, true);

        RuntimeResponse {
            plan,
            answer,
            adjustments,
            executions,
            reasoning,
            journal_tail: self.journal.tail(5),
            cached: true,
            metrics: metrics_snapshot,
        }
    }

    // ------------------------------------------------------------------
    // Pipeline stages
    // ------------------------------------------------------------------

    fn enforce_privacy(
        &mut self,
        request: &RuntimeRequest,
        reasoning: &mut ReasoningLog,
    ) -> BTreeMap<String, ModalityInput> {
        let requested: Vec<String> = request.modalities.keys().cloned().collect();
        let allowed = self.privacy.enforce(&request.user_id, &requested);
        let blocked: Vec<&String> = requested
            .iter()
            .filter(|name| !allowed.contains(*name))
            .collect();
        self.journal.append(
            "privacy",
            serde_json::json!({
                "user_id": request.user_id,
                "allowed": allowed,
                "blocked": blocked,
            }),
        );
        reasoning.add_step("privacy", "enforced consent policies", allowed.clone(), 0.8);
        request
            .modalities
            .iter()
            .filter(|(name, _)| allowed.contains(*name))
            .map(|(name, input)| (name.clone(), input.clone()))
            .collect()
    }

    fn compose_transcript(&self, modalities: &BTreeMap<String, ModalityInput>) -> String {
        let mut fragments: Vec<String> = Vec::new();
        if let Some(ModalityInput::Text(text)) = modalities.get("text") {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                fragments.push(trimmed.to_string());
            }
        }
        if let Some(ModalityInput::Audio(samples)) = modalities.get("audio") {
            let transcript = self.asr.transcribe(samples);
            if !transcript.is_empty() {
                fragments.push(transcript);
            }
        }
        fragments.join("\n")
    }

    fn encode_modalities(
        &mut self,
        request: &RuntimeRequest,
        modalities: &BTreeMap<String, ModalityInput>,
        transcript: &str,
        reasoning: &mut ReasoningLog,
    ) -> (BTreeMap<String, Vec<f64>>, Vec<ModalitySignal>) {
        let mut embeddings: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut signals: Vec<ModalitySignal> = Vec::new();
        if !transcript.is_empty() {
            let embedding = self.text_encoder.encode(transcript);
            embeddings.insert("text".to_string(), embedding.clone());
            signals.push(ModalitySignal::new("text", embedding, 0.9));
        }
        if let Some(ModalityInput::Audio(samples)) = modalities.get("audio") {
            let embedding = self.audio_encoder.encode(samples, &request.user_id);
            embeddings.insert("audio".to_string(), embedding.clone());
            signals.push(ModalitySignal::new("audio", embedding, 0.7));
        }
        if let Some(ModalityInput::Image(bytes)) = modalities.get("image") {
            let embedding = self.image_encoder.encode(bytes);
            embeddings.insert("image".to_string(), embedding.clone());
            signals.push(ModalitySignal::new("image", embedding, 0.6));
        }
        if let Some(ModalityInput::Video(frames)) = modalities.get("video") {
            let embedding = self.vision_encoder.encode_video(frames);
            embeddings.insert("video".to_string(), embedding.clone());
            signals.push(ModalitySignal::new("video", embedding, 0.8));
        }
        if let Some(ModalityInput::Sensors(events)) = modalities.get("sensors") {
            if let Ok(mut hub) = self.sensor_hub.lock() {
                for event in events {
                    hub.ingest(event.clone());
                }
                let aligned = self.alignment.align(&hub.to_sequences());
                reasoning.add_step(
                    "sensor_alignment",
                    format!("aligned {} sensor streams", aligned.len()),
                    aligned.keys().cloned().collect(),
                    0.5,
                );
            }
        }
        (embeddings, signals)
    }

    fn fuse_modalities(
        &self,
        embeddings: &BTreeMap<String, Vec<f64>>,
        signals: &[ModalitySignal],
        reasoning: &mut ReasoningLog,
    ) {
        let fusion_result: Option<FusionResult> = if !signals.is_empty() {
            self.cross_fusion
                .as_ref()
                .map(|fuser| fuser.fuse(signals, self.fusion_budget))
                .or_else(|| (!embeddings.is_empty()).then(|| self.fusion.fuse(embeddings)))
        } else if !embeddings.is_empty() {
            Some(self.fusion.fuse(embeddings))
        } else {
            None
        };
        if let Some(result) = fusion_result {
            self.journal.append(
                "fusion",
                serde_json::json!({
                    "modalities": embeddings.keys().collect::<Vec<_>>(),
                    "weights": &result.modality_weights,
                    "embedding_preview": result.embedding.iter().take(4).collect::<Vec<_>>(),
                    "metadata": &result.metadata,
                }),
            );
            reasoning.add_step(
                "fusion",
                format!("fused {} modalities", embeddings.len()),
                result.modality_weights.keys().cloned().collect(),
                0.6,
            );
        }
    }

    async fn execute_plan(
        &mut self,
        plan: &Plan,
        request: &RuntimeRequest,
        modalities: &BTreeMap<String, ModalityInput>,
        reasoning: &mut ReasoningLog,
    ) -> Vec<SkillExecution> {
        let mut executions = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            executions.push(self.execute_step(step, request, modalities, reasoning).await);
        }
        executions
    }

    async fn execute_step(
        &mut self,
        step: &PlanStep,
        request: &RuntimeRequest,
        modalities: &BTreeMap<String, ModalityInput>,
        reasoning: &mut ReasoningLog,
    ) -> SkillExecution {
        let Some(skill) = step.skill.clone() else {
            reasoning.add_step(
                "noop",
                format!("step {} had no mapped skill", step.id),
                vec![step.id.clone()],
                0.4,
            );
            self.journal
                .append("skill_skipped", serde_json::json!({"step_id": step.id}));
            return SkillExecution {
                step_id: step.id.clone(),
                skill: None,
                output: StepOutcome::Skipped {
                    reason: "no_skill".to_string(),
                }
                .to_value(),
            };
        };

        if self.skill_store.get(&skill).is_none() {
            reasoning.add_step(
                "missing_skill",
                format!("skill {skill} unavailable"),
                vec![step.id.clone()],
                0.3,
            );
            self.journal.append(
                "skill_missing",
                serde_json::json!({"step_id": step.id, "skill": skill}),
            );
            return SkillExecution {
                step_id: step.id.clone(),
                skill: Some(skill.clone()),
                output: StepOutcome::Missing { skill }.to_value(),
            };
        }

        let outcome = self.run_authorized_step(step, &skill, request, modalities, reasoning).await;
        SkillExecution {
            step_id: step.id.clone(),
            skill: Some(skill),
            output: outcome.to_value(),
        }
    }

    async fn run_authorized_step(
        &mut self,
        step: &PlanStep,
        skill: &str,
        request: &RuntimeRequest,
        modalities: &BTreeMap<String, ModalityInput>,
        reasoning: &mut ReasoningLog,
    ) -> StepOutcome {
        let granted = match self.skill_store.authorize_execution(
            skill,
            &request.skill_scopes,
            &request.user_id,
        ) {
            Ok(granted) => granted,
            Err(error) => {
                reasoning.add_step(
                    "skill_permissions",
                    format!("{skill} denied: missing scopes"),
                    vec![step.id.clone()],
                    0.2,
                );
                self.journal.append(
                    "skill_error",
                    serde_json::json!({"step_id": step.id, "error": error.to_string()}),
                );
                return StepOutcome::Error {
                    message: error.to_string(),
                };
            }
        };
        self.journal.append(
            "skill_permissions",
            serde_json::json!({
                "step_id": step.id,
                "skill": skill,
                "granted": granted,
                "user_id": request.user_id,
            }),
        );

        if let Err(violation) =
            self.skill_store
                .enforce_policy(skill, &request.data_tags, &request.user_id)
        {
            reasoning.add_step(
                "skill_policy",
                format!("{skill} blocked by policy"),
                vec![step.id.clone()],
                0.2,
            );
            self.journal.append(
                "skill_policy_blocked",
                serde_json::json!({
                    "step_id": step.id,
                    "skill": skill,
                    "policy": violation.policy,
                    "requirement": violation.requirement,
                }),
            );
            return StepOutcome::PolicyBlocked {
                reason: violation.to_string(),
                policy: violation.policy,
                requirement: violation.requirement,
            };
        }

        let quota = self.skill_store.quota(skill);
        let payload = serde_json::json!({
            "goal": request.goal,
            "step": step.description,
            "modalities": modalities.keys().collect::<Vec<_>>(),
        });
        let result = {
            let _timer = self.metrics.time_stage_owned(&format!("skill::{skill}"));
            self.sandbox.execute(skill, payload, Some(quota)).await
        };
        match result {
            Ok(result) => {
                reasoning.add_step(
                    "skill",
                    format!("executed {skill}"),
                    vec![step.id.clone()],
                    0.75,
                );
                self.journal.append(
                    "skill_executed",
                    serde_json::json!({
                        "step_id": step.id,
                        "skill": skill,
                        "result_keys": result.keys().collect::<Vec<_>>(),
                    }),
                );
                StepOutcome::Ok { result }
            }
            Err(SandboxError::Quota(quota_error)) => {
                reasoning.add_step(
                    "skill_quota",
                    format!("{skill} quota exhausted ({})", quota_error.resource),
                    vec![step.id.clone()],
                    0.2,
                );
                StepOutcome::QuotaBlocked {
                    resource: quota_error.resource.to_string(),
                    limit: quota_error.limit,
                    used: quota_error.used,
                    reason: quota_error.to_string(),
                }
            }
            Err(SandboxError::UnknownSkill(name)) => {
                self.journal.append(
                    "skill_missing",
                    serde_json::json!({"step_id": step.id, "skill": name}),
                );
                StepOutcome::Missing { skill: name }
            }
            Err(error) => {
                reasoning.add_step(
                    "skill_error",
                    format!("{skill} failed"),
                    vec![step.id.clone()],
                    0.1,
                );
                self.journal.append(
                    "skill_error",
                    serde_json::json!({"step_id": step.id, "error": error.to_string()}),
                );
                StepOutcome::Error {
                    message: error.to_string(),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // RAG cache alerting
    // ------------------------------------------------------------------

    fn record_rag_cache_metrics(&self, stats: &RagCacheStats, user_id: &str, query: &str) {
        let stat_fields = serde_json::json!({
            "hits": stats.hits,
            "misses": stats.misses,
            "hit_rate": stats.hit_rate,
            "miss_rate": stats.miss_rate,
            "size": stats.size,
            "requests": stats.requests,
        });
        let mut payload = serde_json::json!({"user_id": user_id, "query": query});
        if let (Some(object), serde_json::Value::Object(fields)) =
            (payload.as_object_mut(), stat_fields.clone())
        {
            for (key, value) in fields {
                object.insert(key, value);
            }
        }
        self.journal.append("rag_cache_stats", payload);

        if stats.requests < self.cache_alert_thresholds.min_observations {
            return;
        }
        let mut alerts: Vec<(&str, &str, f64, f64, &str)> = Vec::new();
        if stats.hit_rate < self.cache_alert_thresholds.min_hit_rate {
            alerts.push((
                "rag_cache_hit_rate",
                "hit_rate",
                stats.hit_rate,
                self.cache_alert_thresholds.min_hit_rate,
                "<",
            ));
        }
        if stats.miss_rate > self.cache_alert_thresholds.max_miss_rate {
            alerts.push((
                "rag_cache_miss_rate",
                "miss_rate",
                stats.miss_rate,
                self.cache_alert_thresholds.max_miss_rate,
                ">",
            ));
        }
        if stats.size > self.cache_alert_thresholds.max_size {
            alerts.push((
                "rag_cache_size",
                "size",
                stats.size,
                self.cache_alert_thresholds.max_size,
                ">",
            ));
        }
        for (name, metric, observed, threshold, comparison) in alerts {
            tracing::warn!(
                target: "kolibri::runtime",
                alert = name,
                observed = observed,
                threshold = threshold,
                "rag cache alert"
            );
            self.journal.append(
                "runtime_alert",
                serde_json::json!({
                    "name": name,
                    "metric": metric,
                    "observed": observed,
                    "threshold": threshold,
                    "comparison": comparison,
                    "stats": &stat_fields,
                    "user_id": user_id,
                    "query": query,
                }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Self-learning
    // ------------------------------------------------------------------

    fn background_learn(
        &mut self,
        request: &RuntimeRequest,
        answer: &serde_json::Value,
        executions: &[SkillExecution],
    ) {
        let Some(learner) = self.learner.as_mut() else {
            return;
        };
        let base_confidence = answer
            .get("verification")
            .and_then(|verification| verification.get("confidence"))
            .and_then(|confidence| confidence.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        for execution in executions {
            let task = execution
                .skill
                .clone()
                .unwrap_or_else(|| execution.step_id.clone());
            if task.is_empty() {
                continue;
            }
            let status = execution.status().to_string();
            let mut gradients: BTreeMap<String, f64> = BTreeMap::new();
            gradients.insert(
                "success".to_string(),
                if status == "ok" { 1.0 } else { 0.0 },
            );
            gradients.insert(
                "penalty".to_string(),
                if status != "ok" && status != "skipped" {
                    1.0
                } else {
                    0.0
                },
            );
            if status == "policy_blocked" {
                gradients.insert("policy".to_string(), 1.0);
            }
            if status == "error" {
                gradients.insert("errors".to_string(), 1.0);
            }
            let mut metadata: BTreeMap<String, String> = BTreeMap::new();
            metadata.insert("goal".to_string(), request.goal.clone());
            metadata.insert("status".to_string(), status);
            metadata.insert("step_id".to_string(), execution.step_id.clone());
            learner.enqueue(&task, gradients, base_confidence, metadata, &request.user_id);
        }
        let updates = learner.step();
        if !updates.is_empty() {
            let tasks: Vec<String> = updates.keys().cloned().collect();
            self.journal.append(
                "self_learning",
                serde_json::json!({
                    "tasks": tasks,
                    "weights": updates,
                }),
            );
        }
    }

    async fn observe_mksi(
        &mut self,
        modalities: &[String],
        plan: &Plan,
        executions: &[SkillExecution],
        reasoning: &ReasoningLog,
        adjustments: &BTreeMap<String, f64>,
        cached: bool,
    ) {
        let Some(mksi) = self.mksi.as_mut() else {
            return;
        };
        let observation = MksiObservation {
            modalities: modalities.to_vec(),
            plan_steps: plan.steps.len(),
            execution_statuses: executions
                .iter()
                .map(|execution| execution.status().to_string())
                .collect(),
            reasoning_steps: reasoning.len(),
            adjustments: adjustments.clone(),
            cached,
            slo_snapshot: self.metrics.report(),
        };
        let report = mksi.observe(&observation).await;
        self.journal.append(
            "mksi",
            serde_json::json!({"current": report.current.to_value(), "rolling": report.rolling.to_value()}),
        );
    }

    fn notify_session(&self, request: &RuntimeRequest, cached: bool) {
        if let Some(session) = &self.session {
            let _ = session.events_tx.send(SessionEvent::RequestCompleted {
                user_id: request.user_id.clone(),
                cached,
            });
        }
    }

    // ------------------------------------------------------------------
    // Auxiliary surfaces
    // ------------------------------------------------------------------

    /// Adds a document to the knowledge graph via the ingestor.
    pub fn ingest_document(
        &mut self,
        document: &KnowledgeDocument,
    ) -> Result<IngestionReport, GraphError> {
        let report = self.ingestor.ingest(document, &mut self.graph)?;
        self.journal.append(
            "knowledge_ingest",
            serde_json::json!({
                "document_id": document.doc_id,
                "nodes_added": report.nodes_added,
                "edges_added": report.edges_added,
                "conflicts": report.conflicts,
                "warnings": report.warnings,
            }),
        );
        Ok(report)
    }

    /// Routes IoT commands through the policy bridge with journaling.
    pub fn dispatch_iot_command(
        &mut self,
        session_id: &str,
        command: &IotCommand,
        confirmer: Option<Confirmer<'_>>,
    ) -> Result<serde_json::Value, IotError> {
        let Some(bridge) = self.iot.as_mut() else {
            return Err(IotError::PolicyDenied {
                device_id: command.device_id.clone(),
                action: command.action.clone(),
            });
        };
        let result = bridge.dispatch(session_id, command, confirmer);
        let status = match &result {
            Ok(ack) => ack
                .get("status")
                .and_then(|status| status.as_str())
                .unwrap_or("executed")
                .to_string(),
            Err(error) => error.to_string(),
        };
        self.journal.append(
            "runtime_iot_dispatch",
            serde_json::json!({
                "session_id": session_id,
                "device_id": command.device_id,
                "action": command.action,
                "status": status,
            }),
        );
        result
    }

    pub fn iot_bridge_mut(&mut self) -> Option<&mut IotBridge> {
        self.iot.as_mut()
    }

    /// Creates and journals a long-running workflow.
    pub fn schedule_workflow(
        &mut self,
        goal: &str,
        steps: Vec<TaskStepState>,
        deadline: Option<DateTime<Utc>>,
        reminders: Vec<ReminderRule>,
        metadata: BTreeMap<String, String>,
    ) -> Workflow {
        let workflow = self
            .workflows
            .create_workflow(goal, steps, deadline, reminders, metadata);
        self.journal.append(
            "workflow_created",
            serde_json::json!({
                "workflow_id": workflow.id,
                "goal": workflow.goal,
                "deadline": workflow.deadline.map(|deadline| deadline.to_rfc3339()),
                "step_count": workflow.steps.len(),
            }),
        );
        workflow
    }

    /// Emits and journals due workflow reminders.
    pub fn emit_workflow_reminders(&mut self, at: Option<DateTime<Utc>>) -> Vec<ReminderEvent> {
        let events = self.workflows.emit_reminders(at);
        for event in &events {
            self.journal.append(
                "workflow_reminder",
                serde_json::json!({
                    "workflow_id": event.workflow_id,
                    "scheduled_for": event.scheduled_for.to_rfc3339(),
                    "message": event.message,
                }),
            );
        }
        events
    }

    /// Verification report over the current graph: every critic/authority
    /// result plus the conflict pairs (the verify-command contract).
    pub fn verification_report(&mut self) -> serde_json::Value {
        let verification = self.graph.verify_with_critics(None);
        let conflicts = self.graph.detect_conflicts();
        serde_json::json!({
            "verification": verification,
            "conflicts": conflicts,
        })
    }
}
