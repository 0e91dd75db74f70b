//! Events emitted by state mutators.
//!
//! Every meaningful transition produces an `Event`; the orchestrator hands
//! them to the bus, and the hook dispatcher turns them into deliveries.
//! The serialized form is also the webhook body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AggregateState, Commit, CommitId, EventKind, Sha, SimpleState, StackId, StackLock, Task,
    TaskId, TaskKind, TaskState,
};

/// An event about one stack.
///
/// Example JSON:
/// ```json
/// {"stack":"shop/web","emitted_at":"2024-01-15T10:00:00Z","subject":"deployable_status",
///  "commit":{"id":4,"sha":"..."},"new_state":"success","previous_state":"pending","deployable":true}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub stack: StackId,
    pub emitted_at: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(stack: StackId, payload: EventPayload, emitted_at: DateTime<Utc>) -> Self {
        Event {
            stack,
            emitted_at,
            payload,
        }
    }

    /// Subscription type this event is delivered to.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Identity of a commit inside a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub id: CommitId,
    pub sha: Sha,
}

impl From<&Commit> for CommitRef {
    fn from(commit: &Commit) -> Self {
        CommitRef {
            id: commit.id,
            sha: commit.sha.clone(),
        }
    }
}

/// Task fields carried by task events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub initiator: String,
    pub force: bool,
    pub bypassed_ci: bool,
    pub rollback_of: Option<TaskId>,
    pub duration_secs: Option<i64>,
}

impl From<&Task> for TaskRef {
    fn from(task: &Task) -> Self {
        TaskRef {
            id: task.id,
            kind: task.kind.clone(),
            initiator: task.initiator.clone(),
            force: task.force,
            bypassed_ci: task.bypassed_ci,
            rollback_of: task.rollback_of,
            duration_secs: task.duration().map(|d| d.num_seconds()),
        }
    }
}

/// Event payloads.
///
/// Serialized with internal tagging: `{"subject": "commit_status", ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum EventPayload {
    /// A commit's aggregated CI state changed.
    CommitStatus {
        commit: CommitRef,
        /// Context whose report caused the change.
        context: String,
        new_state: AggregateState,
        previous_state: AggregateState,
    },

    /// A commit's simple state changed.
    DeployableStatus {
        commit: CommitRef,
        new_state: SimpleState,
        previous_state: SimpleState,
        deployable: bool,
    },

    /// A task changed state. Routed as deploy, rollback or task by kind.
    Task {
        task: TaskRef,
        new_state: TaskState,
        previous_state: Option<TaskState>,
        until: CommitRef,
        since: Option<CommitRef>,
    },

    /// A stack was locked or unlocked.
    Lock {
        locked: bool,
        lock: Option<StackLock>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::CommitStatus { .. } => EventKind::CommitStatus,
            EventPayload::DeployableStatus { .. } => EventKind::DeployableStatus,
            EventPayload::Task { task, .. } => match task.kind {
                TaskKind::Deploy => EventKind::Deploy,
                TaskKind::Rollback => EventKind::Rollback,
                TaskKind::Maintenance { .. } => EventKind::Task,
            },
            EventPayload::Lock { .. } => EventKind::Lock,
        }
    }
}
