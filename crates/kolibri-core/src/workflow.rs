//! Long-running task state with deadline-relative reminders.

use crate::clock::{system_clock, Clock};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
    #[error("step index {index} out of range for workflow {workflow_id}")]
    StepOutOfRange { workflow_id: String, index: usize },
}

/// State for a single step inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStepState {
    pub description: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskStepState {
    pub fn new(description: impl Into<String>, tool: Option<String>) -> Self {
        Self {
            description: description.into(),
            tool,
            completed: false,
            completed_at: None,
        }
    }
}

mod offset_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(offset: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_i64(offset.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(de)?))
    }
}

/// Reminder relative to the workflow deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderRule {
    /// How long before the deadline the reminder fires, stored as seconds.
    #[serde(with = "offset_seconds")]
    pub offset: Duration,
    pub message: String,
}

impl ReminderRule {
    pub fn new(offset: Duration, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Long-running task tracked by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub goal: String,
    pub steps: Vec<TaskStepState>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reminders: Vec<ReminderRule>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Workflow {
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 1.0;
        }
        let completed = self.steps.iter().filter(|step| step.completed).count();
        completed as f64 / self.steps.len() as f64
    }

    pub fn is_overdue(&self, at: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |deadline| at > deadline)
    }

    pub fn pending_steps(&self) -> Vec<&TaskStepState> {
        self.steps.iter().filter(|step| !step.completed).collect()
    }
}

/// Reminder that became due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderEvent {
    pub workflow_id: String,
    pub message: String,
    pub scheduled_for: DateTime<Utc>,
}

/// Manages workflows, tracks progress, and emits reminders.
pub struct WorkflowManager {
    clock: Clock,
    workflows: BTreeMap<String, Workflow>,
    next_id: u64,
}

impl Default for WorkflowManager {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl WorkflowManager {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            workflows: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn create_workflow(
        &mut self,
        goal: &str,
        steps: Vec<TaskStepState>,
        deadline: Option<DateTime<Utc>>,
        reminders: Vec<ReminderRule>,
        metadata: BTreeMap<String, String>,
    ) -> Workflow {
        let workflow_id = format!("wf-{:04}", self.next_id);
        self.next_id += 1;
        let workflow = Workflow {
            id: workflow_id.clone(),
            goal: goal.to_string(),
            steps,
            deadline,
            reminders,
            created_at: (self.clock)(),
            metadata,
        };
        tracing::info!(
            target: "kolibri::workflow",
            workflow_id = %workflow_id,
            goal = %goal,
            "workflow created"
        );
        self.workflows.insert(workflow_id, workflow.clone());
        workflow
    }

    pub fn workflow(&self, workflow_id: &str) -> Result<&Workflow, WorkflowError> {
        self.workflows
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))
    }

    pub fn list_workflows(&self) -> Vec<&Workflow> {
        self.workflows.values().collect()
    }

    pub fn mark_step_completed(
        &mut self,
        workflow_id: &str,
        step_index: usize,
    ) -> Result<(), WorkflowError> {
        let now = (self.clock)();
        let workflow = self
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;
        let step = workflow
            .steps
            .get_mut(step_index)
            .ok_or(WorkflowError::StepOutOfRange {
                workflow_id: workflow_id.to_string(),
                index: step_index,
            })?;
        step.completed = true;
        step.completed_at = Some(now);
        Ok(())
    }

    /// Every reminder whose `deadline - offset` has passed `at`, sorted by
    /// `(scheduled_for, workflow_id)`.
    pub fn emit_reminders(&self, at: Option<DateTime<Utc>>) -> Vec<ReminderEvent> {
        let now = at.unwrap_or_else(|| (self.clock)());
        let mut events: Vec<ReminderEvent> = Vec::new();
        for workflow in self.workflows.values() {
            let Some(deadline) = workflow.deadline else {
                continue;
            };
            for rule in &workflow.reminders {
                let scheduled = deadline - rule.offset;
                if scheduled <= now {
                    events.push(ReminderEvent {
                        workflow_id: workflow.id.clone(),
                        message: rule.message.clone(),
                        scheduled_for: scheduled,
                    });
                }
            }
        }
        events.sort_by(|a, b| {
            (a.scheduled_for, &a.workflow_id).cmp(&(b.scheduled_for, &b.workflow_id))
        });
        events
    }

    pub fn overdue_workflows(&self, at: Option<DateTime<Utc>>) -> Vec<&Workflow> {
        let now = at.unwrap_or_else(|| (self.clock)());
        self.workflows
            .values()
            .filter(|workflow| workflow.is_overdue(now))
            .collect()
    }
}
