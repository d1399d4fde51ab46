//! Policy-gated IoT command bridge with an offline queue and sensor
//! mirroring.
//!
//! Dispatch requires an allowlist hit, headroom in the per-session counter,
//! and (for sensitive actions) a confirmation callback. Commands issued
//! while devices are unreachable queue up bounded and release in timestamp
//! order; every executed command mirrors into the sensor hub under a
//! deterministic signal name.

use crate::encoders::{SensorEvent, SensorHub};
use crate::journal::ActionJournal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum IotError {
    #[error("action '{action}' not allowed for device '{device_id}'")]
    PolicyDenied { device_id: String, action: String },
    #[error("IoT command limit exceeded for session '{session_id}'")]
    RateLimited { session_id: String },
    #[error("command '{device_id}:{action}' requires confirmation")]
    ConfirmationRequired { device_id: String, action: String },
    #[error("batch of {size} exceeds max batch size {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("offline queue full ({limit} deferred commands)")]
    QueueFull { limit: usize },
}

/// Single device action requested by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IotCommand {
    pub device_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl IotCommand {
    pub fn new(device_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            action: action.into(),
            parameters: BTreeMap::new(),
            requires_confirmation: false,
        }
    }

    pub fn with_parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn confirmed_only(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    /// Dedup signature: `(device, action, sorted parameters)`.
    fn signature(&self) -> String {
        let params = serde_json::to_string(&self.parameters).unwrap_or_default();
        format!("{}|{}|{}", self.device_id, self.action, params)
    }
}

/// Capability policy for IoT actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IotPolicy {
    /// device id -> allowed actions.
    pub allowlist: BTreeMap<String, Vec<String>>,
    /// `device:action` tokens that always need confirmation.
    #[serde(default)]
    pub confirmation_required: Vec<String>,
    pub max_actions_per_session: usize,
    pub max_batch_size: usize,
    pub max_deferred_actions: usize,
}

impl Default for IotPolicy {
    fn default() -> Self {
        Self {
            allowlist: BTreeMap::new(),
            confirmation_required: Vec::new(),
            max_actions_per_session: 10,
            max_batch_size: 8,
            max_deferred_actions: 32,
        }
    }
}

impl IotPolicy {
    pub fn is_allowed(&self, device_id: &str, action: &str) -> bool {
        self.allowlist
            .get(device_id)
            .map_or(false, |actions| actions.iter().any(|a| a == action))
    }

    pub fn needs_confirmation(&self, device_id: &str, action: &str) -> bool {
        let token = format!("{device_id}:{action}");
        self.confirmation_required.contains(&token)
    }
}

/// Command parked while its device is offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredCommand {
    pub command: IotCommand,
    pub available_at: DateTime<Utc>,
}

pub type Confirmer<'a> = &'a dyn Fn(&IotCommand) -> bool;

/// Validates, journals, and mirrors IoT commands.
pub struct IotBridge {
    policy: IotPolicy,
    journal: Arc<ActionJournal>,
    sensor_hub: Arc<Mutex<SensorHub>>,
    session_counts: BTreeMap<String, usize>,
    deferred: Vec<DeferredCommand>,
}

impl IotBridge {
    pub fn new(
        policy: IotPolicy,
        journal: Arc<ActionJournal>,
        sensor_hub: Arc<Mutex<SensorHub>>,
    ) -> Self {
        Self {
            policy,
            journal,
            sensor_hub,
            session_counts: BTreeMap::new(),
            deferred: Vec::new(),
        }
    }

    /// Validates the command and returns a deterministic acknowledgement.
    pub fn dispatch(
        &mut self,
        session_id: &str,
        command: &IotCommand,
        confirmer: Option<Confirmer<'_>>,
    ) -> Result<serde_json::Value, IotError> {
        if !self.policy.is_allowed(&command.device_id, &command.action) {
            self.journal_event("iot_denied", session_id, command, None);
            return Err(IotError::PolicyDenied {
                device_id: command.device_id.clone(),
                action: command.action.clone(),
            });
        }

        let current = self.session_counts.get(session_id).copied().unwrap_or(0);
        if current + 1 > self.policy.max_actions_per_session {
            self.journal_event("iot_rate_limited", session_id, command, None);
            return Err(IotError::RateLimited {
                session_id: session_id.to_string(),
            });
        }

        let needs_confirmation = command.requires_confirmation
            || self
                .policy
                .needs_confirmation(&command.device_id, &command.action);
        if needs_confirmation {
            let confirmed = confirmer.map_or(false, |confirm| confirm(command));
            if !confirmed {
                self.journal_event("iot_unconfirmed", session_id, command, None);
                return Err(IotError::ConfirmationRequired {
                    device_id: command.device_id.clone(),
                    action: command.action.clone(),
                });
            }
        }

        let count = current + 1;
        self.session_counts.insert(session_id.to_string(), count);
        let acknowledgement = serde_json::json!({
            "device_id": command.device_id,
            "action": command.action,
            "parameters": command.parameters,
            "status": "executed",
            "session_id": session_id,
            "count": count,
        });
        self.journal_event("iot_executed", session_id, command, Some(&acknowledgement));
        self.mirror_to_sensors(command);
        Ok(acknowledgement)
    }

    /// Dispatches a batch atomically with respect to the size limit.
    pub fn dispatch_batch(
        &mut self,
        session_id: &str,
        commands: &[IotCommand],
        confirmer: Option<Confirmer<'_>>,
    ) -> Result<Vec<Result<serde_json::Value, IotError>>, IotError> {
        if commands.len() > self.policy.max_batch_size {
            return Err(IotError::BatchTooLarge {
                size: commands.len(),
                limit: self.policy.max_batch_size,
            });
        }
        Ok(commands
            .iter()
            .map(|command| self.dispatch(session_id, command, confirmer))
            .collect())
    }

    /// Parks a command until `available_at`. The queue is bounded by
    /// `max_deferred_actions`.
    pub fn queue_command(
        &mut self,
        command: IotCommand,
        available_at: DateTime<Utc>,
    ) -> Result<(), IotError> {
        if self.deferred.len() >= self.policy.max_deferred_actions {
            self.journal.append(
                "iot_queue_full",
                serde_json::json!({
                    "device_id": command.device_id,
                    "action": command.action,
                    "limit": self.policy.max_deferred_actions,
                }),
            );
            return Err(IotError::QueueFull {
                limit: self.policy.max_deferred_actions,
            });
        }
        self.journal.append(
            "iot_deferred",
            serde_json::json!({
                "device_id": command.device_id,
                "action": command.action,
                "available_at": available_at.to_rfc3339(),
            }),
        );
        self.deferred.push(DeferredCommand {
            command,
            available_at,
        });
        Ok(())
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Removes and returns every queued command whose availability time has
    /// passed `upto` (now when omitted), in timestamp order.
    pub fn release_delayed(&mut self, upto: Option<DateTime<Utc>>) -> Vec<IotCommand> {
        let cutoff = upto.unwrap_or_else(Utc::now);
        let mut due: Vec<DeferredCommand> = Vec::new();
        let mut remaining: Vec<DeferredCommand> = Vec::new();
        for deferred in self.deferred.drain(..) {
            if deferred.available_at <= cutoff {
                due.push(deferred);
            } else {
                remaining.push(deferred);
            }
        }
        self.deferred = remaining;
        due.sort_by_key(|deferred| deferred.available_at);
        due.into_iter().map(|deferred| deferred.command).collect()
    }

    /// After connectivity returns: deduplicates the released queue plus the
    /// incoming backlog by command signature and dispatches the survivors.
    pub fn merge_after_offline(
        &mut self,
        session_id: &str,
        incoming: Vec<IotCommand>,
        confirmer: Option<Confirmer<'_>>,
    ) -> Vec<Result<serde_json::Value, IotError>> {
        let mut merged = self.release_delayed(None);
        merged.extend(incoming);
        let mut seen: Vec<String> = Vec::new();
        let mut results = Vec::new();
        for command in merged {
            let signature = command.signature();
            if seen.contains(&signature) {
                self.journal_event("iot_duplicate_skipped", session_id, &command, None);
                continue;
            }
            seen.push(signature);
            results.push(self.dispatch(session_id, &command, confirmer));
        }
        results
    }

    /// Clears the per-session action counter (session teardown).
    pub fn reset_session(&mut self, session_id: &str) {
        self.session_counts.remove(session_id);
    }

    pub fn reset_all_sessions(&mut self) {
        self.session_counts.clear();
    }

    fn mirror_to_sensors(&self, command: &IotCommand) {
        let signal_type = format!("iot::{}::{}", command.device_id, command.action);
        let event = SensorEvent {
            source: command.device_id.clone(),
            signal_type,
            value: 1.0,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        if let Ok(mut hub) = self.sensor_hub.lock() {
            hub.ingest(event);
        }
    }

    fn journal_event(
        &self,
        event: &str,
        session_id: &str,
        command: &IotCommand,
        extra: Option<&serde_json::Value>,
    ) {
        let mut payload = serde_json::json!({
            "session_id": session_id,
            "device_id": command.device_id,
            "action": command.action,
            "parameters": command.parameters,
        });
        if let (Some(object), Some(serde_json::Value::Object(extra))) =
            (payload.as_object_mut(), extra.cloned())
        {
            for (key, value) in extra {
                object.insert(key, value);
            }
        }
        self.journal.append(event, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bridge() -> IotBridge {
        let mut allowlist = BTreeMap::new();
        allowlist.insert(
            "lamp".to_string(),
            vec!["on".to_string(), "off".to_string()],
        );
        allowlist.insert("lock".to_string(), vec!["open".to_string()]);
        let policy = IotPolicy {
            allowlist,
            confirmation_required: vec!["lock:open".to_string()],
            max_actions_per_session: 3,
            max_batch_size: 2,
            max_deferred_actions: 2,
        };
        IotBridge::new(
            policy,
            Arc::new(ActionJournal::new()),
            Arc::new(Mutex::new(SensorHub::new())),
        )
    }

    #[test]
    fn allowlist_and_rate_limit_gate_dispatch() {
        let mut bridge = bridge();
        let on = IotCommand::new("lamp", "on");
        for _ in 0..3 {
            bridge.dispatch("s1", &on, None).unwrap();
        }
        assert!(matches!(
            bridge.dispatch("s1", &on, None),
            Err(IotError::RateLimited { .. })
        ));
        assert!(matches!(
            bridge.dispatch("s2", &IotCommand::new("lamp", "explode"), None),
            Err(IotError::PolicyDenied { .. })
        ));
    }

    #[test]
    fn confirmation_is_required_for_sensitive_actions() {
        let mut bridge = bridge();
        let open = IotCommand::new("lock", "open");
        assert!(matches!(
            bridge.dispatch("s1", &open, None),
            Err(IotError::ConfirmationRequired { .. })
        ));
        let deny: Confirmer<'_> = &|_| false;
        assert!(bridge.dispatch("s1", &open, Some(deny)).is_err());
        let allow: Confirmer<'_> = &|_| true;
        let ack = bridge.dispatch("s1", &open, Some(allow)).unwrap();
        assert_eq!(ack["status"], "executed");
    }

    #[test]
    fn deferred_queue_is_bounded_and_releases_in_order() {
        let mut bridge = bridge();
        let base = Utc::now();
        bridge
            .queue_command(IotCommand::new("lamp", "off"), base + Duration::seconds(2))
            .unwrap();
        bridge
            .queue_command(IotCommand::new("lamp", "on"), base + Duration::seconds(1))
            .unwrap();
        assert!(matches!(
            bridge.queue_command(IotCommand::new("lamp", "on"), base),
            Err(IotError::QueueFull { .. })
        ));
        let released = bridge.release_delayed(Some(base + Duration::seconds(5)));
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].action, "on");
        assert_eq!(released[1].action, "off");
        assert_eq!(bridge.deferred_len(), 0);
    }

    #[test]
    fn merge_after_offline_deduplicates_by_signature() {
        let mut bridge = bridge();
        let base = Utc::now();
        bridge
            .queue_command(IotCommand::new("lamp", "on"), base - Duration::seconds(1))
            .unwrap();
        let incoming = vec![IotCommand::new("lamp", "on"), IotCommand::new("lamp", "off")];
        let results = bridge.merge_after_offline("s1", incoming, None);
        // The duplicate "lamp on" collapsed; two unique commands dispatched.
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_ok));
    }

    #[test]
    fn executed_commands_mirror_into_sensor_hub() {
        let journal = Arc::new(ActionJournal::new());
        let hub = Arc::new(Mutex::new(SensorHub::new()));
        let mut allowlist = BTreeMap::new();
        allowlist.insert("lamp".to_string(), vec!["on".to_string()]);
        let mut bridge = IotBridge::new(
            IotPolicy {
                allowlist,
                ..IotPolicy::default()
            },
            journal.clone(),
            hub.clone(),
        );
        bridge
            .dispatch("s1", &IotCommand::new("lamp", "on"), None)
            .unwrap();
        let sequences = hub.lock().unwrap().to_sequences();
        assert!(sequences.contains_key("iot::lamp::on"));
        let events: Vec<String> = journal
            .entries()
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        assert!(events.contains(&"iot_executed".to_string()));
    }
}
