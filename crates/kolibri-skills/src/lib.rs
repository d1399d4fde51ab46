//! Bundled skill executors for the Kolibri sandbox.
//!
//! Each skill ships a manifest (validated by the skill store) and an
//! executor (hosted by the sandbox). These are the on-device defaults the
//! planner can map goals onto; deployments register their own on top.

use kolibri_core::{KolibriRuntime, ManifestError, SkillError, SkillExecutor, SkillManifest};
use std::sync::Arc;

/// Drafts a short response from the goal and step description.
pub struct WriterSkill;

#[async_trait::async_trait]
impl SkillExecutor for WriterSkill {
    async fn invoke(&self, payload: serde_json::Value) -> Result<serde_json::Value, SkillError> {
        let goal = payload
            .get("goal")
            .and_then(|goal| goal.as_str())
            .unwrap_or_default();
        let step = payload
            .get("step")
            .and_then(|step| step.as_str())
            .unwrap_or_default();
        tracing::debug!(target: "kolibri::skills", goal = %goal, "writer invoked");
        let draft = if step.is_empty() {
            format!("Draft for: {goal}")
        } else {
            format!("Draft for: {step}")
        };
        Ok(serde_json::json!({
            "draft": draft,
            "word_count": draft.split_whitespace().count(),
        }))
    }
}

impl WriterSkill {
    pub fn manifest() -> Result<SkillManifest, ManifestError> {
        SkillManifest::from_value(&serde_json::json!({
            "name": "writer",
            "version": "0.1.0",
            "inputs": ["text"],
            "permissions": ["net.read:whitelist"],
            "billing": "per_call",
            "policy": {"pii": "deny"},
            "entry": "writer.py",
        }))
    }
}

/// Summarizes which modalities were available for a step.
pub struct ResearchSkill;

#[async_trait::async_trait]
impl SkillExecutor for ResearchSkill {
    async fn invoke(&self, payload: serde_json::Value) -> Result<serde_json::Value, SkillError> {
        let modalities: Vec<String> = payload
            .get("modalities")
            .and_then(|modalities| modalities.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(serde_json::json!({
            "notes": format!("research over {} modalities", modalities.len()),
            "modalities": modalities,
        }))
    }
}

impl ResearchSkill {
    pub fn manifest() -> Result<SkillManifest, ManifestError> {
        SkillManifest::from_value(&serde_json::json!({
            "name": "research",
            "version": "0.1.0",
            "inputs": ["query"],
            "permissions": ["kg.read:local"],
            "billing": "per_call",
            "policy": {},
            "entry": "research.py",
        }))
    }
}

/// Returns its payload untouched. Useful for wiring checks and tests.
pub struct EchoSkill;

#[async_trait::async_trait]
impl SkillExecutor for EchoSkill {
    async fn invoke(&self, payload: serde_json::Value) -> Result<serde_json::Value, SkillError> {
        Ok(serde_json::json!({"echo": payload}))
    }
}

impl EchoSkill {
    pub fn manifest() -> Result<SkillManifest, ManifestError> {
        SkillManifest::from_value(&serde_json::json!({
            "name": "echo",
            "version": "0.1.0",
            "inputs": ["any"],
            "permissions": ["io.loopback:local"],
            "billing": "free",
            "policy": {},
            "entry": "echo.py",
        }))
    }
}

/// Registers the bundled skills with a runtime.
pub fn install_default_skills(runtime: &mut KolibriRuntime) -> Result<(), ManifestError> {
    runtime.register_skill(WriterSkill::manifest()?, Arc::new(WriterSkill))?;
    runtime.register_skill(ResearchSkill::manifest()?, Arc::new(ResearchSkill))?;
    runtime.register_skill(EchoSkill::manifest()?, Arc::new(EchoSkill))?;
    Ok(())
}
