//! Runtime configuration loaded from environment variables with an
//! optional `kolibri.toml` override. All defaults are local files.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | KOLIBRI_CHAIN_PATH | unset | Journal chain persistence file (JSONL). |
//! | KOLIBRI_AUDIT_LOG | unset | Audit log export file. |
//! | KOLIBRI_LEARNER_PATH | unset | Self-learner state file (JSON). |
//! | KOLIBRI_GRAPH_DIR | `.` | Directory for `{session}.kg.jsonl` snapshots. |
//! | KOLIBRI_MKSI_EXPORT_FILE | unset | mKSI snapshot export file. |
//! | KOLIBRI_MKSI_EXPORT_ENDPOINT | unset | mKSI telemetry POST endpoint. |
//! | KOLIBRI_HEARTBEAT_SECS | 20 | Streaming heartbeat interval. |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_graph_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_heartbeat_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KolibriConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner_path: Option<PathBuf>,
    #[serde(default = "default_graph_dir")]
    pub graph_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mksi_export_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mksi_export_endpoint: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for KolibriConfig {
    fn default() -> Self {
        Self {
            chain_path: None,
            audit_log_path: None,
            learner_path: None,
            graph_dir: default_graph_dir(),
            mksi_export_file: None,
            mksi_export_endpoint: None,
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl KolibriConfig {
    /// Loads configuration from the environment. Unset or invalid values
    /// fall back to the defaults above.
    pub fn from_env() -> Self {
        Self {
            chain_path: env_path("KOLIBRI_CHAIN_PATH"),
            audit_log_path: env_path("KOLIBRI_AUDIT_LOG"),
            learner_path: env_path("KOLIBRI_LEARNER_PATH"),
            graph_dir: env_path("KOLIBRI_GRAPH_DIR").unwrap_or_else(default_graph_dir),
            mksi_export_file: env_path("KOLIBRI_MKSI_EXPORT_FILE"),
            mksi_export_endpoint: env_string("KOLIBRI_MKSI_EXPORT_ENDPOINT"),
            heartbeat_secs: env_u64("KOLIBRI_HEARTBEAT_SECS", default_heartbeat_secs()),
        }
    }

    /// Loads a TOML file when present, else falls back to the environment.
    pub fn load_from_path(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path)
                .map_err(|error| error.to_string())
                .and_then(|raw| toml::from_str::<Self>(&raw).map_err(|error| error.to_string()))
            {
                Ok(config) => return config,
                Err(error) => {
                    tracing::warn!(
                        target: "kolibri::config",
                        path = %path.display(),
                        error = %error,
                        "config file unreadable; falling back to environment"
                    );
                }
            }
        }
        Self::from_env()
    }

    /// Default snapshot path for a session: `{graph_dir}/{id}.kg.jsonl`.
    pub fn graph_path_for_session(&self, session_id: &str) -> PathBuf {
        self.graph_dir.join(format!("{session_id}.kg.jsonl"))
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_snapshot_path_lands_in_graph_dir() {
        let config = KolibriConfig {
            graph_dir: PathBuf::from("/tmp/kolibri"),
            ..KolibriConfig::default()
        };
        assert_eq!(
            config.graph_path_for_session("sess-1"),
            PathBuf::from("/tmp/kolibri/sess-1.kg.jsonl")
        );
    }

    #[test]
    fn toml_round_trip() {
        let config = KolibriConfig {
            chain_path: Some(PathBuf::from("chain.jsonl")),
            heartbeat_secs: 5,
            ..KolibriConfig::default()
        };
        let raw = toml::to_string(&config).unwrap();
        let parsed: KolibriConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.chain_path, Some(PathBuf::from("chain.jsonl")));
        assert_eq!(parsed.heartbeat_secs, 5);
    }
}
