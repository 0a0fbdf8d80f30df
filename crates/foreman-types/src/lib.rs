use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One unit of pipeline work.
///
/// Producers create a task with [`Task::new`] and hand it to the queue.  From
/// then on only the executor mutates it, appending one [`StageResult`] per
/// pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Producer-assigned identifier; unique per outstanding task.
    pub id: String,
    /// Human-readable label of the feature or work item.
    pub feature_name: String,
    pub status: TaskStatus,
    /// Stage results in execution order.
    pub stages: Vec<StageResult>,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, feature_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            feature_name: feature_name.into(),
            status: TaskStatus::Queued,
            stages: Vec::new(),
            enqueued_at: Utc::now(),
        }
    }

    /// Append the result of a finished stage.
    pub fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    /// Names of the stages that ran to completion, in order.
    pub fn completed_stages(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|r| matches!(r.outcome, StageOutcome::Completed { .. }))
            .map(|r| r.stage.clone())
            .collect()
    }
}

/// Lifecycle of a [`Task`]: `queued → in_progress(stage) → completed | failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress { stage: String },
    Completed,
    Failed { stage: String, reason: String },
}

/// Outcome of a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The responsible service ran and returned a report.
    Completed { output: String },
    /// The responsible service is not registered; the pipeline moved on.
    Skipped { reason: String },
    /// The service errored, panicked, timed out, or the permission gate
    /// refused the stage.  The task halts here.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    /// Registry name of the service responsible for the stage.
    pub service: String,
    pub outcome: StageOutcome,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn new(stage: impl Into<String>, service: impl Into<String>, outcome: StageOutcome) -> Self {
        Self {
            stage: stage.into(),
            service: service.into(),
            outcome,
            finished_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Approvals
// ─────────────────────────────────────────────────────────────────────────────

/// A pending human decision on a privileged action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    /// e.g. `"DEPLOY"`
    pub action: String,
    /// e.g. `"prod"`
    pub resource: String,
    pub justification: String,
    /// Name of the agent that wants to perform the action.
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// `pending → approved | rejected | expired`.  Terminal states never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved { by: String },
    Rejected { by: String, reason: String },
    Expired,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalState::Pending => write!(f, "pending"),
            ApprovalState::Approved { .. } => write!(f, "approved"),
            ApprovalState::Rejected { .. } => write!(f, "rejected"),
            ApprovalState::Expired => write!(f, "expired"),
        }
    }
}

/// Synchronous policy verdict for an `(action, resource, agent)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PermissionCheckResult {
    Allowed,
    RequiresApproval { reason: String },
    Denied { reason: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus events
// ─────────────────────────────────────────────────────────────────────────────

/// Envelope for everything published on the orchestration event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"foreman-runtime::executor"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    TaskEnqueued { task_id: String, feature_name: String },
    StageCompleted { task_id: String, stage: String, service: String },
    StageSkipped { task_id: String, stage: String, service: String },
    StageFailed { task_id: String, stage: String, error: String },
    /// `stages` lists the stages that ran to completion.
    TaskCompleted { task_id: String, stages: Vec<String> },
    TaskFailed { task_id: String, stage: String, reason: String },
    ApprovalRequested(ApprovalRequest),
    ApprovalResolved { request_id: Uuid, state: ApprovalState },
    ServiceRegistered { name: String },
    ServiceUnregistered { name: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Registration-time failures.  Never fatal to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid service '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Failures reported by a service collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service failed: {0}")]
    Failed(String),

    #[error("service '{service}' does not support {operation}")]
    Unsupported { service: String, operation: String },

    #[error("service call timed out after {0:?}")]
    TimedOut(Duration),
}

/// Reasons the permission gate refused a privileged action.
///
/// Every variant is a task-level failure; none is fatal to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("approval request {request_id} was rejected: {reason}")]
    ApprovalRejected { request_id: Uuid, reason: String },

    #[error("approval request {request_id} expired while pending")]
    ApprovalExpired { request_id: Uuid },

    #[error("gave up on approval request {request_id} after {attempts} polls")]
    ApprovalTimeout { request_id: Uuid, attempts: u32 },

    #[error("approval request {request_id} left the pending set without a recorded decision")]
    ApprovalLost { request_id: Uuid },
}

/// Errors returned to the operator resolving approval requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval request {0} not found")]
    NotFound(Uuid),

    #[error("approval request {id} is already {state}")]
    NotPending { id: Uuid, state: ApprovalState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_queued_with_no_stages() {
        let task = Task::new("t1", "X");
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.stages.is_empty());
        assert_eq!(task.feature_name, "X");
    }

    #[test]
    fn completed_stages_ignores_skips_and_failures() {
        let mut task = Task::new("t1", "X");
        task.record(StageResult::new(
            "implement",
            "developer-agent",
            StageOutcome::Completed { output: "ok".into() },
        ));
        task.record(StageResult::new(
            "review",
            "qa-agent",
            StageOutcome::Skipped { reason: "not registered".into() },
        ));
        task.record(StageResult::new(
            "finalize",
            "deployment-agent",
            StageOutcome::Failed { error: "denied".into() },
        ));
        assert_eq!(task.completed_stages(), vec!["implement".to_string()]);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!ApprovalState::Pending.is_terminal());
        assert!(ApprovalState::Expired.is_terminal());
        assert!(ApprovalState::Approved { by: "ops".into() }.is_terminal());
        assert!(ApprovalState::Rejected { by: "ops".into(), reason: "no".into() }.is_terminal());
    }

    #[test]
    fn task_status_serializes_with_state_tag() {
        let status = TaskStatus::Failed {
            stage: "finalize".into(),
            reason: "expired".into(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["stage"], "finalize");
    }

    #[test]
    fn gate_error_display_names_the_request() {
        let id = Uuid::new_v4();
        let err = GateError::ApprovalExpired { request_id: id };
        assert!(err.to_string().contains(&id.to_string()));

        let denied = GateError::PermissionDenied { reason: "no grant".into() };
        assert!(denied.to_string().contains("no grant"));
    }

    #[test]
    fn approval_error_reports_terminal_state() {
        let err = ApprovalError::NotPending {
            id: Uuid::new_v4(),
            state: ApprovalState::Expired,
        };
        assert!(err.to_string().ends_with("already expired"));
    }
}
