//! kolibri-core: single-process, on-device assistant core.
//!
//! The runtime turns a user request (free-form goal + multi-modal inputs +
//! interaction signals) into a verifiable response: a plan, per-step skill
//! executions, a retrieved-and-cited answer, empathy-based modulation, and
//! a tamper-evident audit record. [`KolibriRuntime`] is the integration
//! spine; everything else is an owned component of it.

mod cache;
mod clock;
mod config;
mod encoders;
mod graph;
mod iot;
mod journal;
mod learning;
mod metrics;
mod mksi;
mod orchestrator;
mod personalization;
mod planner;
mod privacy;
mod proofs;
mod rag;
mod reasoning;
mod sandbox;
mod skills;
mod workflow;

// Action journal (C1)
pub use journal::{ActionJournal, JournalEntry, JournalError, GENESIS_HASH};

// Privacy operator (C2)
pub use privacy::{
    AccessProof, ConsentAction, ConsentRecord, PolicyLayer, PrivacyOperator, SecurityIncident,
};

// Skill store (C3)
pub use skills::{
    AuditDecision, ManifestError, PermissionMissing, PolicyViolation, SkillManifest, SkillQuota,
    SkillStore,
};

// Skill sandbox (C4)
pub use sandbox::{
    FnExecutor, QuotaExceeded, SandboxError, SkillError, SkillExecutor, SkillSandbox, SkillUsage,
};

// Knowledge graph (C5)
pub use graph::{
    Authority, AuthorityVerdict, Critic, DomainImportPipeline, DomainImportReport, DomainRecord,
    Edge, GraphError, GraphEvent, IngestionReport, KnowledgeDocument, KnowledgeGraph,
    KnowledgeIngestor, MemoryTier, Node, PendingUpdate, VerificationResult,
};

// RAG pipeline and the two caches (C6)
pub use cache::{normalize_cache_value, offline_cache_key, OfflineCache, RagCache, RagCacheStats};
pub use rag::{RagPipeline, RetrievedFact};

// Encoders and fusion (C7)
pub use encoders::{
    AdaptiveAudioEncoder, AdaptiveCrossModalTransformer, AsrEncoder, ContinualLearner,
    DiffusionVisionEncoder, FusionResult, FusionTransformer, ImageEncoder, ModalityInput,
    ModalitySignal, Resolution, SensorEvent, SensorHub, TemporalAlignmentEngine, TextEncoder,
};

// Planner (C8)
pub use planner::{Plan, PlanStep, Planner};

// Personalization (C9)
pub use personalization::{
    EmpathyContext, EmpathyModulator, InteractionSignal, ModelUpdate, OnDeviceProfiler,
    SecureAggregator, UserProfile,
};

// Background self-learner (C10)
pub use learning::{BackgroundSelfLearner, LearnerConfig, LearnerError, SelfLearningSample};

// Workflow manager (C11)
pub use workflow::{
    ReminderEvent, ReminderRule, TaskStepState, Workflow, WorkflowError, WorkflowManager,
};

// IoT bridge (C12)
pub use iot::{Confirmer, DeferredCommand, IotBridge, IotCommand, IotError, IotPolicy};

// SLO tracker (C13)
pub use metrics::{OwnedStageTimer, SloTracker, StageStats, StageTimer};

// Runtime orchestrator (C14)
pub use orchestrator::{
    CacheAlertThresholds, KolibriRuntime, KolibriRuntimeBuilder, RuntimeRequest, RuntimeResponse,
    SessionEvent, SkillExecution, StepOutcome,
};

// Explainability and quality telemetry
pub use mksi::{MksiAggregator, MksiObservation, MksiReport, MksiValues};
pub use proofs::{build_structured_proofs, ConfidenceInterval, StructuredProof};
pub use reasoning::{ReasoningLog, ReasoningStep};

// Configuration and time sources
pub use clock::{fixed_clock, system_clock, Clock};
pub use config::KolibriConfig;
