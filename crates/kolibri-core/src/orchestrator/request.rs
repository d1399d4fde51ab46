//! Request, response, and per-step outcome types for the runtime pipeline.

use crate::encoders::ModalityInput;
use crate::journal::JournalEntry;
use crate::metrics::StageStats;
use crate::personalization::{EmpathyContext, InteractionSignal};
use crate::planner::Plan;
use crate::reasoning::ReasoningLog;
use std::collections::BTreeMap;

/// Everything one user turn brings into the pipeline.
#[derive(Debug, Clone)]
pub struct RuntimeRequest {
    pub user_id: String,
    pub goal: String,
    pub modalities: BTreeMap<String, ModalityInput>,
    pub hints: Vec<String>,
    pub signals: Vec<InteractionSignal>,
    pub empathy: EmpathyContext,
    pub data_tags: Vec<String>,
    pub skill_scopes: Vec<String>,
    pub top_k: usize,
}

impl RuntimeRequest {
    pub fn new(user_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            goal: goal.into(),
            modalities: BTreeMap::new(),
            hints: Vec::new(),
            signals: Vec::new(),
            empathy: EmpathyContext::default(),
            data_tags: Vec::new(),
            skill_scopes: Vec::new(),
            top_k: 5,
        }
    }

    pub fn with_modality(mut self, name: &str, input: ModalityInput) -> Self {
        self.modalities.insert(name.to_string(), input);
        self
    }

    pub fn with_hints(mut self, hints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.hints = hints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_signals(mut self, signals: Vec<InteractionSignal>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_empathy(mut self, empathy: EmpathyContext) -> Self {
        self.empathy = empathy;
        self
    }

    pub fn with_data_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.data_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skill_scopes(
        mut self,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.skill_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

/// Per-step execution outcome. The orchestrator never unwinds across
/// stages; every failure mode becomes one of these variants.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Ok {
        result: serde_json::Map<String, serde_json::Value>,
    },
    PolicyBlocked {
        policy: String,
        requirement: String,
        reason: String,
    },
    QuotaBlocked {
        resource: String,
        limit: u64,
        used: u64,
        reason: String,
    },
    Missing {
        skill: String,
    },
    Skipped {
        reason: String,
    },
    Error {
        message: String,
    },
}

impl StepOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            StepOutcome::Ok { .. } => "ok",
            StepOutcome::PolicyBlocked { .. } => "policy_blocked",
            StepOutcome::QuotaBlocked { .. } => "quota_blocked",
            StepOutcome::Missing { .. } => "missing",
            StepOutcome::Skipped { .. } => "skipped",
            StepOutcome::Error { .. } => "error",
        }
    }

    /// Structured step output carried in [`SkillExecution::output`].
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            StepOutcome::Ok { result } => serde_json::json!({
                "status": "ok",
                "result": result,
            }),
            StepOutcome::PolicyBlocked {
                policy,
                requirement,
                reason,
            } => serde_json::json!({
                "status": "policy_blocked",
                "policy": policy,
                "requirement": requirement,
                "reason": reason,
            }),
            StepOutcome::QuotaBlocked {
                resource,
                limit,
                used,
                reason,
            } => serde_json::json!({
                "status": "quota_blocked",
                "resource": resource,
                "limit": limit,
                "used": used,
                "reason": reason,
            }),
            StepOutcome::Missing { skill } => serde_json::json!({
                "status": "missing",
                "skill": skill,
            }),
            StepOutcome::Skipped { reason } => serde_json::json!({
                "status": "skipped",
                "reason": reason,
            }),
            StepOutcome::Error { message } => serde_json::json!({
                "status": "error",
                "message": message,
            }),
        }
    }
}

/// One plan step's execution record.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillExecution {
    pub step_id: String,
    pub skill: Option<String>,
    pub output: serde_json::Value,
}

impl SkillExecution {
    pub fn status(&self) -> &str {
        self.output
            .get("status")
            .and_then(|status| status.as_str())
            .unwrap_or("unknown")
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "step_id": self.step_id,
            "skill": self.skill,
            "output": self.output,
        })
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        Self {
            step_id: value
                .get("step_id")
                .and_then(|id| id.as_str())
                .unwrap_or_default()
                .to_string(),
            skill: value
                .get("skill")
                .and_then(|skill| skill.as_str())
                .map(String::from),
            output: value.get("output").cloned().unwrap_or_default(),
        }
    }
}

/// Full pipeline result handed back to the caller.
#[derive(Debug, Clone)]
pub struct RuntimeResponse {
    pub plan: Plan,
    pub answer: serde_json::Value,
    pub adjustments: BTreeMap<String, f64>,
    pub executions: Vec<SkillExecution>,
    pub reasoning: ReasoningLog,
    pub journal_tail: Vec<JournalEntry>,
    pub cached: bool,
    pub metrics: BTreeMap<String, StageStats>,
}

/// Session lifecycle notifications for `subscribe_session` consumers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { session_id: String },
    RequestCompleted { user_id: String, cached: bool },
    Finished { session_id: String },
}
