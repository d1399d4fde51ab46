//! Skill store: validated manifests, scope authorization, policy
//! enforcement, and the decision audit ring.

use super::manifest::{ManifestError, SkillManifest, SkillQuota};
use crate::journal::ActionJournal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// Decisions kept in the audit ring.
const AUDIT_RING_CAPACITY: usize = 512;

/// A required scope was not granted to the caller.
#[derive(Debug, thiserror::Error)]
#[error("skill '{skill}' denied for '{actor}': missing scopes {missing:?}")]
pub struct PermissionMissing {
    pub skill: String,
    pub actor: String,
    pub missing: Vec<String>,
}

/// A manifest policy tag rejected the execution context.
#[derive(Debug, thiserror::Error)]
#[error("skill '{skill}' blocked by policy '{policy}' ({requirement})")]
pub struct PolicyViolation {
    pub skill: String,
    pub policy: String,
    pub requirement: String,
}

/// One entry in the bounded decision audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditDecision {
    pub skill: String,
    pub actor: String,
    pub decision: String,
    pub scopes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Registry of validated skill manifests.
pub struct SkillStore {
    skills: BTreeMap<String, SkillManifest>,
    audit: VecDeque<AuditDecision>,
    journal: Option<Arc<ActionJournal>>,
}

impl Default for SkillStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillStore {
    pub fn new() -> Self {
        Self {
            skills: BTreeMap::new(),
            audit: VecDeque::new(),
            journal: None,
        }
    }

    pub fn with_journal(journal: Arc<ActionJournal>) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    /// Validates and registers a manifest. Rejections are journaled as
    /// `skill_manifest.rejected` and surfaced to the caller.
    pub fn register(&mut self, manifest: SkillManifest) -> Result<(), ManifestError> {
        if let Err(error) = manifest.validate() {
            tracing::warn!(
                target: "kolibri::skills",
                skill = %manifest.name,
                error = %error,
                "manifest rejected"
            );
            if let Some(journal) = &self.journal {
                journal.append(
                    "skill_manifest.rejected",
                    serde_json::json!({
                        "skill": manifest.name,
                        "version": manifest.version,
                        "reason": error.to_string(),
                    }),
                );
            }
            return Err(error);
        }
        tracing::info!(
            target: "kolibri::skills",
            skill = %manifest.name,
            version = %manifest.version,
            "skill registered"
        );
        self.skills.insert(manifest.name.clone(), manifest);
        Ok(())
    }

    pub fn register_many(
        &mut self,
        manifests: impl IntoIterator<Item = SkillManifest>,
    ) -> Result<(), ManifestError> {
        for manifest in manifests {
            self.register(manifest)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SkillManifest> {
        self.skills.get(name)
    }

    /// Registered manifests, ordered by name.
    pub fn list(&self) -> Vec<&SkillManifest> {
        self.skills.values().collect()
    }

    pub fn quota(&self, name: &str) -> SkillQuota {
        self.skills
            .get(name)
            .and_then(|manifest| manifest.quota)
            .unwrap_or_default()
    }

    /// Checks that every scope the manifest demands was granted. Returns the
    /// sorted required scopes on success; journals and raises on denial.
    pub fn authorize_execution(
        &mut self,
        name: &str,
        granted_scopes: &[String],
        actor: &str,
    ) -> Result<Vec<String>, PermissionMissing> {
        let required: BTreeSet<String> = self
            .skills
            .get(name)
            .map(|manifest| manifest.permissions.iter().cloned().collect())
            .unwrap_or_default();
        let granted: BTreeSet<&str> = granted_scopes.iter().map(String::as_str).collect();
        let missing: Vec<String> = required
            .iter()
            .filter(|scope| !granted.contains(scope.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.push_audit(name, actor, "deny", missing.clone());
            if let Some(journal) = &self.journal {
                journal.append(
                    "skill_authorization",
                    serde_json::json!({
                        "skill": name,
                        "actor": actor,
                        "decision": "deny",
                        "missing": missing,
                    }),
                );
            }
            return Err(PermissionMissing {
                skill: name.to_string(),
                actor: actor.to_string(),
                missing,
            });
        }
        let required: Vec<String> = required.into_iter().collect();
        self.push_audit(name, actor, "allow", required.clone());
        if let Some(journal) = &self.journal {
            journal.append(
                "skill_authorization",
                serde_json::json!({
                    "skill": name,
                    "actor": actor,
                    "decision": "allow",
                    "scopes": required,
                }),
            );
        }
        Ok(required)
    }

    /// Evaluates manifest policy tags against the request context.
    ///
    /// `deny`/`blocked`/`forbid` reject a tag that is present;
    /// `require`/`required` reject a tag that is absent.
    pub fn enforce_policy(
        &mut self,
        name: &str,
        context_tags: &[String],
        actor: &str,
    ) -> Result<(), PolicyViolation> {
        let policy = self
            .skills
            .get(name)
            .map(|manifest| manifest.policy.clone())
            .unwrap_or_default();
        let tags: BTreeSet<&str> = context_tags.iter().map(String::as_str).collect();
        for (policy_tag, requirement) in policy {
            let rule = requirement.to_lowercase();
            let violated = match rule.as_str() {
                "deny" | "blocked" | "forbid" => tags.contains(policy_tag.as_str()),
                "require" | "required" => !tags.contains(policy_tag.as_str()),
                _ => false,
            };
            if violated {
                self.push_audit(name, actor, "policy_deny", vec![policy_tag.clone()]);
                return Err(PolicyViolation {
                    skill: name.to_string(),
                    policy: policy_tag,
                    requirement: rule,
                });
            }
        }
        Ok(())
    }

    /// Last `limit` audit decisions, newest last. The ring holds at most
    /// [`AUDIT_RING_CAPACITY`] entries.
    pub fn audit_log(&self, limit: usize) -> Vec<AuditDecision> {
        let skip = self.audit.len().saturating_sub(limit);
        self.audit.iter().skip(skip).cloned().collect()
    }

    fn push_audit(&mut self, skill: &str, actor: &str, decision: &str, scopes: Vec<String>) {
        if self.audit.len() == AUDIT_RING_CAPACITY {
            self.audit.pop_front();
        }
        self.audit.push_back(AuditDecision {
            skill: skill.to_string(),
            actor: actor.to_string(),
            decision: decision.to_string(),
            scopes,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_manifest() -> SkillManifest {
        SkillManifest::from_value(&serde_json::json!({
            "name": "writer",
            "version": "0.1.0",
            "inputs": ["text"],
            "permissions": ["net.read:whitelist"],
            "billing": "per_call",
            "policy": {"pii": "deny", "consent": "require"},
            "entry": "writer.py",
        }))
        .unwrap()
    }

    #[test]
    fn authorize_returns_sorted_required_scopes() {
        let mut store = SkillStore::new();
        store.register(writer_manifest()).unwrap();
        let granted = vec!["net.read:whitelist".to_string(), "extra.scope:x".to_string()];
        let scopes = store.authorize_execution("writer", &granted, "user-1").unwrap();
        assert_eq!(scopes, vec!["net.read:whitelist"]);
        assert_eq!(store.audit_log(1)[0].decision, "allow");
    }

    #[test]
    fn missing_scope_denies_and_audits() {
        let mut store = SkillStore::new();
        store.register(writer_manifest()).unwrap();
        let err = store
            .authorize_execution("writer", &[], "user-1")
            .unwrap_err();
        assert_eq!(err.missing, vec!["net.read:whitelist"]);
        assert_eq!(store.audit_log(1)[0].decision, "deny");
    }

    #[test]
    fn policy_rules_deny_and_require() {
        let mut store = SkillStore::new();
        store.register(writer_manifest()).unwrap();
        // pii present -> deny fires.
        let err = store
            .enforce_policy(
                "writer",
                &["pii".to_string(), "consent".to_string()],
                "user-1",
            )
            .unwrap_err();
        assert_eq!(err.policy, "pii");
        // consent absent -> require fires.
        let err = store
            .enforce_policy("writer", &[], "user-1")
            .unwrap_err();
        assert_eq!(err.policy, "consent");
        // consent present, pii absent -> allowed.
        assert!(store
            .enforce_policy("writer", &["consent".to_string()], "user-1")
            .is_ok());
    }

    #[test]
    fn rejection_is_journaled() {
        let journal = Arc::new(ActionJournal::new());
        let mut store = SkillStore::with_journal(journal.clone());
        let mut manifest = writer_manifest();
        manifest.version = "oops".to_string();
        assert!(store.register(manifest).is_err());
        let tail = journal.tail(1);
        assert_eq!(tail[0].event, "skill_manifest.rejected");
    }

    #[test]
    fn quota_defaults_to_unlimited() {
        let mut store = SkillStore::new();
        store.register(writer_manifest()).unwrap();
        assert!(store.quota("writer").is_unlimited());
        assert!(store.quota("unknown").is_unlimited());
    }
}
