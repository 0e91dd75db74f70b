//! Task record types.
//!
//! A task is one long-running unit of work on a stack. Deploys, rollbacks and
//! maintenance tasks share the same record and the same state machine; the
//! `kind` only changes admission rules and which events are emitted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ids::{CommitId, StackId, TaskId};

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    Deploy,
    Rollback,
    /// Ad-hoc maintenance task, identified by its definition name.
    Maintenance { name: String },
}

impl TaskKind {
    /// Deploys and rollbacks move the stack's deployed commit.
    pub fn is_deploy_type(&self) -> bool {
        matches!(self, TaskKind::Deploy | TaskKind::Rollback)
    }

    pub fn name(&self) -> &str {
        match self {
            TaskKind::Deploy => "deploy",
            TaskKind::Rollback => "rollback",
            TaskKind::Maintenance { name } => name,
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failed,
    Error,
    Aborted,
}

impl TaskState {
    /// Pending or running: occupies the stack.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Running)
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Error => "error",
            TaskState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the executor says a running task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The work completed.
    Success,
    /// The work ran and reported failure (e.g. non-zero exit).
    Failed,
    /// The executor itself broke (crash, timeout, infrastructure).
    Error,
}

impl From<TaskOutcome> for TaskState {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Success => TaskState::Success,
            TaskOutcome::Failed => TaskState::Failed,
            TaskOutcome::Error => TaskState::Error,
        }
    }
}

/// One execution unit on a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub stack: StackId,
    pub kind: TaskKind,
    pub state: TaskState,

    /// Commit the task targets.
    pub until_commit: CommitId,

    /// Stack's last deployed commit when the task was admitted.
    pub since_commit: Option<CommitId>,

    /// Who asked for it.
    pub initiator: String,

    /// Overrides after allow-list filtering.
    pub env: BTreeMap<String, String>,

    /// Admission bypassed the concurrency guard and CI gate.
    pub force: bool,

    /// Set when `force` was what let a non-deployable target through.
    pub bypassed_ci: bool,

    /// For rollbacks: the task being rolled back. Display and audit only.
    pub rollback_of: Option<TaskId>,

    /// Roll back automatically once an abort of this task lands.
    pub rollback_once_aborted: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            kind: self.kind.clone(),
            state: self.state,
            until_commit: self.until_commit,
            initiator: self.initiator.clone(),
        }
    }

    /// Wall time between start and end, once both are known.
    pub fn duration(&self) -> Option<Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// Enough about a task to show a caller why admission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub until_commit: CommitId,
    pub initiator: String,
}

impl fmt::Display for TaskSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) by {}",
            self.kind.name(),
            self.id,
            self.state,
            self.initiator
        )
    }
}

/// One ordered fragment of task output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Monotonic per task, starting at 0.
    pub seq: u64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_terminal_partition_states() {
        for state in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Success,
            TaskState::Failed,
            TaskState::Error,
            TaskState::Aborted,
        ] {
            assert_ne!(state.is_active(), state.is_terminal(), "{state}");
        }
        assert!(TaskState::Pending.is_active());
        assert!(TaskState::Running.is_active());
    }

    #[test]
    fn kind_serializes_with_tag() {
        let json = serde_json::to_value(TaskKind::Maintenance {
            name: "flush-cache".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "maintenance");
        assert_eq!(json["name"], "flush-cache");
    }

    #[test]
    fn outcome_maps_to_terminal_state() {
        assert_eq!(TaskState::from(TaskOutcome::Success), TaskState::Success);
        assert_eq!(TaskState::from(TaskOutcome::Failed), TaskState::Failed);
        assert_eq!(TaskState::from(TaskOutcome::Error), TaskState::Error);
    }
}
