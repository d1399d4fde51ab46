//! Privacy operator: per-user consent records, layered default policies,
//! and deterministic access proofs.
//!
//! Consent is tag-based (`text`, `audio`, `pii`, ...). Explicit grant/deny
//! wins, later call wins per tag; when a tag is neither granted nor denied,
//! the first policy layer whose scope contains the tag decides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Default action a policy layer applies to tags in its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentAction {
    Allow,
    Deny,
}

/// Ordered fallback rule consulted when no explicit consent exists for a tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLayer {
    pub name: String,
    pub scope: BTreeSet<String>,
    pub default_action: ConsentAction,
}

impl PolicyLayer {
    pub fn new(
        name: impl Into<String>,
        scope: impl IntoIterator<Item = impl Into<String>>,
        default_action: ConsentAction,
    ) -> Self {
        Self {
            name: name.into(),
            scope: scope.into_iter().map(Into::into).collect(),
            default_action,
        }
    }
}

/// Per-user consent state. Proofs map data types to the opaque hex issued on
/// the most recent allowed access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub user_id: String,
    pub allowed: BTreeSet<String>,
    pub denied: BTreeSet<String>,
    #[serde(default)]
    pub proofs: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl ConsentRecord {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            allowed: BTreeSet::new(),
            denied: BTreeSet::new(),
            proofs: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "user_id": self.user_id,
            "allowed": self.allowed.iter().collect::<Vec<_>>(),
            "denied": self.denied.iter().collect::<Vec<_>>(),
            "proofs": self.proofs,
            "updated_at": self.updated_at.to_rfc3339(),
        })
    }
}

/// Proof that a skill touched a data type under consent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessProof {
    pub user_id: String,
    pub data_type: String,
    pub action: String,
    pub layer: String,
    pub proof: String,
}

/// Denied access attempt recorded for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityIncident {
    pub skill: String,
    pub user_id: String,
    pub data_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Handles consents and layered data policies for all users of the runtime.
#[derive(Default)]
pub struct PrivacyOperator {
    records: HashMap<String, ConsentRecord>,
    layers: Vec<PolicyLayer>,
    incidents: Vec<SecurityIncident>,
}

impl PrivacyOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layers(layers: Vec<PolicyLayer>) -> Self {
        Self {
            layers,
            ..Self::default()
        }
    }

    /// Appends a fallback layer; layers are consulted in registration order.
    pub fn add_layer(&mut self, layer: PolicyLayer) {
        self.layers.push(layer);
    }

    pub fn grant(
        &mut self,
        user_id: &str,
        data_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> &ConsentRecord {
        let record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| ConsentRecord::new(user_id));
        for item in data_types {
            let tag = item.into();
            record.denied.remove(&tag);
            record.allowed.insert(tag);
        }
        record.updated_at = Utc::now();
        record
    }

    pub fn deny(
        &mut self,
        user_id: &str,
        data_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> &ConsentRecord {
        let record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| ConsentRecord::new(user_id));
        for item in data_types {
            let tag = item.into();
            record.allowed.remove(&tag);
            record.denied.insert(tag);
        }
        record.updated_at = Utc::now();
        record
    }

    pub fn is_allowed(&self, user_id: &str, data_type: &str) -> bool {
        if let Some(record) = self.records.get(user_id) {
            if record.denied.contains(data_type) {
                return false;
            }
            if record.allowed.contains(data_type) {
                return true;
            }
        }
        for layer in &self.layers {
            if layer.scope.contains(data_type) {
                return layer.default_action == ConsentAction::Allow;
            }
        }
        false
    }

    /// Allowed subset of `requested`, preserving input order.
    pub fn enforce(&self, user_id: &str, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|tag| self.is_allowed(user_id, tag))
            .cloned()
            .collect()
    }

    /// Issues [`AccessProof`]s for allowed tags and records a
    /// [`SecurityIncident`] for each denied one.
    pub fn record_access(
        &mut self,
        skill: &str,
        user_id: &str,
        data_types: &[String],
    ) -> Vec<AccessProof> {
        let mut proofs = Vec::new();
        for tag in data_types {
            if self.is_allowed(user_id, tag) {
                let layer = self.deciding_layer(user_id, tag);
                let proof = Self::proof_hex(user_id, tag, "read", &layer);
                self.records
                    .entry(user_id.to_string())
                    .or_insert_with(|| ConsentRecord::new(user_id))
                    .proofs
                    .insert(tag.clone(), proof.clone());
                proofs.push(AccessProof {
                    user_id: user_id.to_string(),
                    data_type: tag.clone(),
                    action: "read".to_string(),
                    layer,
                    proof,
                });
            } else {
                tracing::warn!(
                    target: "kolibri::privacy",
                    skill = %skill,
                    user_id = %user_id,
                    data_type = %tag,
                    "access denied"
                );
                self.incidents.push(SecurityIncident {
                    skill: skill.to_string(),
                    user_id: user_id.to_string(),
                    data_type: tag.clone(),
                    timestamp: Utc::now(),
                });
            }
        }
        proofs
    }

    pub fn incidents(&self) -> &[SecurityIncident] {
        &self.incidents
    }

    pub fn export_state(&self) -> BTreeMap<String, serde_json::Value> {
        self.records
            .iter()
            .map(|(user, record)| (user.clone(), record.to_value()))
            .collect()
    }

    fn deciding_layer(&self, user_id: &str, data_type: &str) -> String {
        if let Some(record) = self.records.get(user_id) {
            if record.allowed.contains(data_type) || record.denied.contains(data_type) {
                return "explicit".to_string();
            }
        }
        self.layers
            .iter()
            .find(|layer| layer.scope.contains(data_type))
            .map(|layer| layer.name.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Opaque deterministic hex over `(user, tag, action, layer)`.
    fn proof_hex(user_id: &str, data_type: &str, action: &str, layer: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(b"|");
        hasher.update(data_type.as_bytes());
        hasher.update(b"|");
        hasher.update(action.as_bytes());
        hasher.update(b"|");
        hasher.update(layer.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_call_wins_per_tag() {
        let mut operator = PrivacyOperator::new();
        operator.grant("user-1", ["audio", "text"]);
        operator.deny("user-1", ["audio"]);
        assert!(operator.is_allowed("user-1", "text"));
        assert!(!operator.is_allowed("user-1", "audio"));
        let requested = vec!["audio".to_string(), "text".to_string(), "image".to_string()];
        assert_eq!(operator.enforce("user-1", &requested), vec!["text"]);
    }

    #[test]
    fn first_matching_layer_decides_unset_tags() {
        let mut operator = PrivacyOperator::with_layers(vec![
            PolicyLayer::new("sensors-open", ["sensors"], ConsentAction::Allow),
            PolicyLayer::new("lockdown", ["sensors", "image"], ConsentAction::Deny),
        ]);
        operator.grant("user-1", ["text"]);
        assert!(operator.is_allowed("user-1", "sensors"));
        assert!(!operator.is_allowed("user-1", "image"));
    }

    #[test]
    fn record_access_issues_proofs_and_incidents() {
        let mut operator = PrivacyOperator::new();
        operator.grant("user-1", ["text"]);
        let tags = vec!["text".to_string(), "audio".to_string()];
        let proofs = operator.record_access("writer", "user-1", &tags);
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].data_type, "text");
        assert_eq!(proofs[0].proof.len(), 64);
        assert_eq!(operator.incidents().len(), 1);
        assert_eq!(operator.incidents()[0].data_type, "audio");
        // Deterministic: same access yields the same proof.
        let again = operator.record_access("writer", "user-1", &tags[..1].to_vec());
        assert_eq!(again[0].proof, proofs[0].proof);
    }
}
