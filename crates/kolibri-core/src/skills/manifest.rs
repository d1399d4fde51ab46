//! Skill manifest schema and validation.
//!
//! Manifests are declarative JSON documents shipped alongside a skill
//! package. Validation happens once at registration; a manifest that
//! passes here is trusted by the planner, the store, and the sandbox.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// `ns.sub:verb`, e.g. `net.read:whitelist`.
static PERMISSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_.-]*\.[a-z][a-z0-9_.-]*:[a-z0-9_.]+$").expect("permission regex")
});

/// `N.N.N` with an optional `-`/`+` suffix.
static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+([-+][0-9A-Za-z.-]+)?$").expect("version regex")
});

/// Manifest schema violation. Raised to the caller; registration journals
/// the rejection.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("missing manifest field: {0}")]
    MissingField(&'static str),
    #[error("invalid version '{0}': expected N.N.N with optional suffix")]
    InvalidVersion(String),
    #[error("invalid {field} entry: must be a non-empty string")]
    EmptyListEntry { field: &'static str },
    #[error("invalid permission '{0}': expected ns.sub:verb")]
    InvalidPermission(String),
    #[error("invalid entry path '{path}': {reason}")]
    InvalidEntry { path: String, reason: &'static str },
    #[error("invalid policy: keys and values must be non-empty strings")]
    InvalidPolicy,
    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("manifest io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resource ceilings enforced by the sandbox. All fields optional;
/// unset means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillQuota {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_ops: Option<u64>,
}

impl SkillQuota {
    pub fn is_unlimited(&self) -> bool {
        *self == Self::default()
    }
}

/// Declarative description of a skill: identity, required scopes, policy
/// tags, entry point, and optional resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    pub version: String,
    pub inputs: Vec<String>,
    pub permissions: Vec<String>,
    pub billing: String,
    pub policy: BTreeMap<String, String>,
    pub entry: String,
    #[serde(default, alias = "limits", skip_serializing_if = "Option::is_none")]
    pub quota: Option<SkillQuota>,
}

impl SkillManifest {
    /// Parses and validates a manifest from its JSON representation.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ManifestError> {
        let object = value
            .as_object()
            .ok_or(ManifestError::MissingField("name"))?;
        for field in ["name", "version", "inputs", "permissions", "billing", "policy", "entry"] {
            if !object.contains_key(field) {
                return Err(match field {
                    "name" => ManifestError::MissingField("name"),
                    "version" => ManifestError::MissingField("version"),
                    "inputs" => ManifestError::MissingField("inputs"),
                    "permissions" => ManifestError::MissingField("permissions"),
                    "billing" => ManifestError::MissingField("billing"),
                    "policy" => ManifestError::MissingField("policy"),
                    _ => ManifestError::MissingField("entry"),
                });
            }
        }
        let manifest: SkillManifest = serde_json::from_value(value.clone())?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Loads and validates a manifest JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        Self::from_value(&value)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingField("name"));
        }
        if !VERSION_RE.is_match(&self.version) {
            return Err(ManifestError::InvalidVersion(self.version.clone()));
        }
        for input in &self.inputs {
            if input.trim().is_empty() {
                return Err(ManifestError::EmptyListEntry { field: "inputs" });
            }
        }
        for permission in &self.permissions {
            if permission.trim().is_empty() {
                return Err(ManifestError::EmptyListEntry {
                    field: "permissions",
                });
            }
            if !PERMISSION_RE.is_match(permission) {
                return Err(ManifestError::InvalidPermission(permission.clone()));
            }
        }
        Self::validate_entry(&self.entry)?;
        for (policy, requirement) in &self.policy {
            if policy.trim().is_empty() || requirement.trim().is_empty() {
                return Err(ManifestError::InvalidPolicy);
            }
        }
        Ok(())
    }

    fn validate_entry(entry: &str) -> Result<(), ManifestError> {
        if entry.trim().is_empty() {
            return Err(ManifestError::InvalidEntry {
                path: entry.to_string(),
                reason: "empty path",
            });
        }
        if entry.starts_with('/') || entry.starts_with('\\') {
            return Err(ManifestError::InvalidEntry {
                path: entry.to_string(),
                reason: "absolute paths are not allowed",
            });
        }
        if entry.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(ManifestError::InvalidEntry {
                path: entry.to_string(),
                reason: "parent traversal is not allowed",
            });
        }
        if !entry.ends_with(".py") {
            return Err(ManifestError::InvalidEntry {
                path: entry.to_string(),
                reason: "entry must reference a .py module",
            });
        }
        Ok(())
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "name": "writer",
            "version": "0.1.0",
            "inputs": ["text"],
            "permissions": ["net.read:whitelist"],
            "billing": "per_call",
            "policy": {"pii": "deny"},
            "entry": "writer.py",
        })
    }

    #[test]
    fn accepts_valid_manifest() {
        let manifest = SkillManifest::from_value(&sample()).unwrap();
        assert_eq!(manifest.name, "writer");
        assert!(manifest.quota.is_none());
    }

    #[test]
    fn accepts_version_suffix_and_limits_alias() {
        let mut value = sample();
        value["version"] = serde_json::json!("1.2.3-rc.1");
        value["limits"] = serde_json::json!({"invocations": 3, "wall_ms": 500});
        let manifest = SkillManifest::from_value(&value).unwrap();
        let quota = manifest.quota.unwrap();
        assert_eq!(quota.invocations, Some(3));
        assert_eq!(quota.wall_ms, Some(500));
    }

    #[test]
    fn rejects_missing_field() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("entry");
        assert!(matches!(
            SkillManifest::from_value(&value),
            Err(ManifestError::MissingField("entry"))
        ));
    }

    #[test]
    fn rejects_bad_version() {
        let mut value = sample();
        value["version"] = serde_json::json!("1.2");
        assert!(matches!(
            SkillManifest::from_value(&value),
            Err(ManifestError::InvalidVersion(_))
        ));
    }

    #[test]
    fn rejects_malformed_permission() {
        let mut value = sample();
        value["permissions"] = serde_json::json!(["netread"]);
        assert!(matches!(
            SkillManifest::from_value(&value),
            Err(ManifestError::InvalidPermission(_))
        ));
    }

    #[test]
    fn rejects_traversal_and_absolute_entries() {
        for entry in ["../writer.py", "/abs/writer.py", "writer.rs", ""] {
            let mut value = sample();
            value["entry"] = serde_json::json!(entry);
            assert!(
                matches!(
                    SkillManifest::from_value(&value),
                    Err(ManifestError::InvalidEntry { .. })
                ),
                "entry {entry:?} should be rejected"
            );
        }
    }
}
