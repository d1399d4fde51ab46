//! Isolated skill execution with time, memory, and quota limits.
//!
//! Each `execute()` spawns the executor on its own task so a panicking
//! skill cannot take down the runtime, and the parent waits under a wall
//! budget; an overrunning worker is aborted and journaled. The memory cap
//! is the deterministic approximation the contract allows: the serialized
//! size of payload plus result is held against the configured ceiling.
//!
//! Usage counters accumulate per skill and never reset; quota breaches are
//! detected before execution and after every measured update, so a skill
//! that crossed its `wall_ms` budget fails on the very next call.

use crate::clock::process_cpu_ms;
use crate::journal::ActionJournal;
use crate::skills::SkillQuota;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Boxed error type skill executors may return.
pub type SkillError = Box<dyn std::error::Error + Send + Sync>;

/// A registered executor unit. Implementations must return a structured
/// key/value mapping; anything else is a sandbox error.
#[async_trait::async_trait]
pub trait SkillExecutor: Send + Sync {
    async fn invoke(&self, payload: serde_json::Value) -> Result<serde_json::Value, SkillError>;
}

/// Adapter turning a plain function into a [`SkillExecutor`].
pub struct FnExecutor(
    Box<dyn Fn(serde_json::Value) -> Result<serde_json::Value, SkillError> + Send + Sync>,
);

impl FnExecutor {
    pub fn new(
        executor: impl Fn(serde_json::Value) -> Result<serde_json::Value, SkillError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self(Box::new(executor))
    }
}

#[async_trait::async_trait]
impl SkillExecutor for FnExecutor {
    async fn invoke(&self, payload: serde_json::Value) -> Result<serde_json::Value, SkillError> {
        (self.0)(payload)
    }
}

/// Named resource pushed beyond its limit.
#[derive(Debug, Clone, thiserror::Error)]
#[error("skill '{skill}' exceeded {resource} quota: limit {limit}, used {used}")]
pub struct QuotaExceeded {
    pub skill: String,
    pub resource: &'static str,
    pub limit: u64,
    pub used: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unknown skill executor: {0}")]
    UnknownSkill(String),
    #[error("skill '{skill}' timed out after {time_limit:?}")]
    Timeout {
        skill: String,
        time_limit: Duration,
    },
    #[error("skill '{skill}' exceeded memory cap: limit {limit_bytes} bytes, observed {observed_bytes}")]
    MemoryExceeded {
        skill: String,
        limit_bytes: u64,
        observed_bytes: u64,
    },
    #[error("skill '{skill}' worker terminated without a response")]
    Crash { skill: String },
    #[error("skill '{skill}' failed: {message}")]
    Execution { skill: String, message: String },
    #[error("skill '{skill}' returned a non-mapping result")]
    NonObjectResult { skill: String },
    #[error(transparent)]
    Quota(#[from] QuotaExceeded),
}

/// Accumulated resource usage for one skill.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SkillUsage {
    pub invocations: u64,
    pub cpu_ms: f64,
    pub wall_ms: f64,
    pub net_bytes: u64,
    pub fs_bytes: u64,
    pub fs_ops: u64,
}

/// Hosts skill executors behind per-invocation isolation and limits.
pub struct SkillSandbox {
    executors: HashMap<String, Arc<dyn SkillExecutor>>,
    usage: DashMap<String, SkillUsage>,
    quotas: DashMap<String, SkillQuota>,
    journal: Arc<ActionJournal>,
    time_limit: Duration,
    memory_limit_mb: Option<u64>,
}

impl SkillSandbox {
    pub fn new(journal: Arc<ActionJournal>) -> Self {
        Self {
            executors: HashMap::new(),
            usage: DashMap::new(),
            quotas: DashMap::new(),
            journal,
            time_limit: Duration::from_secs(30),
            memory_limit_mb: None,
        }
    }

    /// Wall budget applied to each invocation.
    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    /// Fallback memory cap (MiB) for skills whose quota leaves `ram_mb` unset.
    pub fn with_memory_limit_mb(mut self, limit_mb: u64) -> Self {
        self.memory_limit_mb = Some(limit_mb);
        self
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    pub fn register(&mut self, name: &str, executor: Arc<dyn SkillExecutor>) {
        self.executors.insert(name.to_string(), executor);
        self.usage.entry(name.to_string()).or_default();
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered executor names, sorted.
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn usage_snapshot(&self, name: &str) -> SkillUsage {
        self.usage.get(name).map(|usage| *usage).unwrap_or_default()
    }

    /// Executes a registered skill under the given quota.
    pub async fn execute(
        &self,
        name: &str,
        payload: serde_json::Value,
        quota: Option<SkillQuota>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, SandboxError> {
        let executor = self
            .executors
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownSkill(name.to_string()))?;
        if let Some(quota) = quota {
            self.quotas.insert(name.to_string(), quota);
            let usage = self.usage_snapshot(name);
            self.enforce_quota(name, &usage, &quota)?;
        }

        let payload_keys = payload_keys(&payload);
        let payload_bytes = serde_json::to_vec(&payload).map(|raw| raw.len()).unwrap_or(0);
        let start_wall = Instant::now();
        let start_cpu = process_cpu_ms();
        let worker_payload = payload.clone();
        let worker = tokio::spawn(async move { executor.invoke(worker_payload).await });
        let abort = worker.abort_handle();

        let outcome = tokio::time::timeout(self.time_limit, worker).await;
        let elapsed_wall = start_wall.elapsed().as_secs_f64() * 1000.0;
        let elapsed_cpu = (process_cpu_ms() - start_cpu).max(0.0);
        self.accumulate(name, elapsed_wall, elapsed_cpu);

        let joined = match outcome {
            Err(_) => {
                abort.abort();
                self.journal.append(
                    "skill_timeout",
                    serde_json::json!({
                        "skill": name,
                        "time_limit": self.time_limit.as_secs_f64(),
                        "payload_keys": payload_keys,
                    }),
                );
                tracing::warn!(target: "kolibri::sandbox", skill = %name, "skill timed out");
                return Err(SandboxError::Timeout {
                    skill: name.to_string(),
                    time_limit: self.time_limit,
                });
            }
            Ok(joined) => joined,
        };

        let result = match joined {
            Err(join_error) => {
                self.journal.append(
                    "skill_process_terminated",
                    serde_json::json!({
                        "skill": name,
                        "error_type": if join_error.is_panic() { "panic" } else { "cancelled" },
                        "message": join_error.to_string(),
                        "payload_keys": payload_keys,
                    }),
                );
                return Err(SandboxError::Crash {
                    skill: name.to_string(),
                });
            }
            Ok(Err(error)) => {
                self.journal.append(
                    "skill_execution_error",
                    serde_json::json!({
                        "skill": name,
                        "error_type": "execution",
                        "message": error.to_string(),
                        "payload_keys": payload_keys,
                    }),
                );
                return Err(SandboxError::Execution {
                    skill: name.to_string(),
                    message: error.to_string(),
                });
            }
            Ok(Ok(result)) => result,
        };

        let result_bytes = serde_json::to_vec(&result).map(|raw| raw.len()).unwrap_or(0);
        let limit_mb = self
            .quotas
            .get(name)
            .and_then(|quota| quota.ram_mb)
            .or(self.memory_limit_mb);
        if let Some(limit_mb) = limit_mb {
            let limit_bytes = limit_mb.saturating_mul(1024 * 1024);
            let observed_bytes = (payload_bytes + result_bytes) as u64;
            if observed_bytes > limit_bytes {
                self.journal.append(
                    "skill_memory_limit_exceeded",
                    serde_json::json!({
                        "skill": name,
                        "error_type": "memory",
                        "limit": limit_bytes,
                        "observed": observed_bytes,
                        "payload_keys": payload_keys,
                    }),
                );
                return Err(SandboxError::MemoryExceeded {
                    skill: name.to_string(),
                    limit_bytes,
                    observed_bytes,
                });
            }
        }

        match result {
            serde_json::Value::Object(map) => Ok(map),
            other => {
                self.journal.append(
                    "skill_execution_error",
                    serde_json::json!({
                        "skill": name,
                        "error_type": "non_mapping_result",
                        "message": format!("returned {}", value_kind(&other)),
                        "payload_keys": payload_keys,
                    }),
                );
                Err(SandboxError::NonObjectResult {
                    skill: name.to_string(),
                })
            }
        }
    }

    /// Accounts externally-observed IO and re-checks the quota.
    pub fn record_io(
        &self,
        name: &str,
        net_bytes: u64,
        fs_bytes: u64,
        fs_ops: u64,
    ) -> Result<(), QuotaExceeded> {
        {
            let mut usage = self.usage.entry(name.to_string()).or_default();
            usage.net_bytes += net_bytes;
            usage.fs_bytes += fs_bytes;
            usage.fs_ops += fs_ops;
        }
        if let Some(quota) = self.quotas.get(name).map(|quota| *quota) {
            let usage = self.usage_snapshot(name);
            self.enforce_quota(name, &usage, &quota)?;
        }
        Ok(())
    }

    fn accumulate(&self, name: &str, wall_ms: f64, cpu_ms: f64) {
        let mut usage = self.usage.entry(name.to_string()).or_default();
        usage.invocations += 1;
        usage.wall_ms += wall_ms;
        usage.cpu_ms += cpu_ms;
    }

    fn enforce_quota(
        &self,
        name: &str,
        usage: &SkillUsage,
        quota: &SkillQuota,
    ) -> Result<(), QuotaExceeded> {
        let checks: [(&'static str, f64, Option<u64>); 6] = [
            ("invocations", usage.invocations as f64, quota.invocations),
            ("cpu_ms", usage.cpu_ms, quota.cpu_ms),
            ("wall_ms", usage.wall_ms, quota.wall_ms),
            ("net_bytes", usage.net_bytes as f64, quota.net_bytes),
            ("fs_bytes", usage.fs_bytes as f64, quota.fs_bytes),
            ("fs_ops", usage.fs_ops as f64, quota.fs_ops),
        ];
        for (resource, used, limit) in checks {
            if let Some(limit) = limit {
                if used >= limit as f64 {
                    let error = QuotaExceeded {
                        skill: name.to_string(),
                        resource,
                        limit,
                        used: used as u64,
                    };
                    self.journal.append(
                        "skill_quota_blocked",
                        serde_json::json!({
                            "skill": name,
                            "resource": resource,
                            "limit": limit,
                            "used": used as u64,
                        }),
                    );
                    tracing::warn!(
                        target: "kolibri::sandbox",
                        skill = %name,
                        resource = resource,
                        "quota blocked"
                    );
                    return Err(error);
                }
            }
        }
        Ok(())
    }
}

fn payload_keys(payload: &serde_json::Value) -> Vec<String> {
    match payload {
        serde_json::Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn value_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> SkillSandbox {
        SkillSandbox::new(Arc::new(ActionJournal::new()))
    }

    #[tokio::test]
    async fn executes_registered_skill() {
        let mut sandbox = sandbox();
        sandbox.register(
            "echo",
            Arc::new(FnExecutor::new(|payload| Ok(serde_json::json!({"echo": payload})))),
        );
        let result = sandbox
            .execute("echo", serde_json::json!({"goal": "hi"}), None)
            .await
            .unwrap();
        assert_eq!(result["echo"]["goal"], "hi");
        let usage = sandbox.usage_snapshot("echo");
        assert_eq!(usage.invocations, 1);
        assert!(usage.wall_ms >= 0.0);
    }

    #[tokio::test]
    async fn unknown_skill_is_an_error() {
        let sandbox = sandbox();
        let err = sandbox
            .execute("ghost", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownSkill(_)));
    }

    #[tokio::test]
    async fn non_mapping_result_is_rejected() {
        let mut sandbox = sandbox();
        sandbox.register(
            "scalar",
            Arc::new(FnExecutor::new(|_| Ok(serde_json::json!(42)))),
        );
        let err = sandbox
            .execute("scalar", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NonObjectResult { .. }));
    }

    #[tokio::test]
    async fn invocation_quota_blocks_next_call() {
        let mut sandbox = sandbox();
        sandbox.register(
            "once",
            Arc::new(FnExecutor::new(|_| Ok(serde_json::json!({"ok": true})))),
        );
        let quota = SkillQuota {
            invocations: Some(1),
            ..SkillQuota::default()
        };
        sandbox
            .execute("once", serde_json::json!({}), Some(quota))
            .await
            .unwrap();
        let err = sandbox
            .execute("once", serde_json::json!({}), Some(quota))
            .await
            .unwrap_err();
        match err {
            SandboxError::Quota(quota_err) => {
                assert_eq!(quota_err.resource, "invocations");
                assert_eq!(quota_err.limit, 1);
            }
            other => panic!("expected quota error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn record_io_enforces_quota() {
        let mut sandbox = sandbox();
        sandbox.register(
            "fetch",
            Arc::new(FnExecutor::new(|_| Ok(serde_json::json!({"ok": true})))),
        );
        let quota = SkillQuota {
            net_bytes: Some(100),
            ..SkillQuota::default()
        };
        sandbox
            .execute("fetch", serde_json::json!({}), Some(quota))
            .await
            .unwrap();
        let err = sandbox.record_io("fetch", 200, 0, 0).unwrap_err();
        assert_eq!(err.resource, "net_bytes");
        assert_eq!(err.used, 200);
    }

    #[tokio::test]
    async fn memory_cap_is_deterministic() {
        let journal = Arc::new(ActionJournal::new());
        let mut sandbox = SkillSandbox::new(journal.clone());
        sandbox.register(
            "bloat",
            Arc::new(FnExecutor::new(|_| {
                Ok(serde_json::json!({"blob": "x".repeat(4096)}))
            })),
        );
        let quota = SkillQuota {
            ram_mb: Some(0),
            ..SkillQuota::default()
        };
        let err = sandbox
            .execute("bloat", serde_json::json!({}), Some(quota))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::MemoryExceeded { .. }));
        let events: Vec<String> = journal
            .entries()
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        assert!(events.contains(&"skill_memory_limit_exceeded".to_string()));
    }
}
