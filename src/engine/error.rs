//! Errors surfaced by orchestrator operations.

use std::fmt;

use thiserror::Error;

use crate::hooks::DeliveryError;
use crate::state::{AdmissionError, RevisionError, TransitionError};
use crate::types::{Sha, SimpleState, StackId, TaskId, TaskState, TaskSummary};

/// What a lookup failed to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Stack(StackId),
    /// No commit matches the reference.
    Commit(String),
    Task(TaskId),
    /// No earlier successful deploy to roll `0` back to.
    RollbackTarget(TaskId),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Stack(id) => write!(f, "stack {id}"),
            Missing::Commit(reference) => write!(f, "commit {reference:?}"),
            Missing::Task(id) => write!(f, "task {id}"),
            Missing::RollbackTarget(id) => write!(f, "rollback target for task {id}"),
        }
    }
}

/// Errors returned to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The prefix is too short to trust or matches several commits.
    /// `candidates` lists every match so the caller can pick one.
    #[error("ambiguous revision {prefix:?} matches {} commits", .candidates.len())]
    AmbiguousRevision { prefix: String, candidates: Vec<Sha> },

    #[error("{0} not found")]
    NotFound(Missing),

    /// Another task holds the stack. Retry with force, or wait.
    #[error("stack is busy with {blocking}")]
    ConcurrentTask { blocking: TaskSummary },

    #[error("task {task} cannot go from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("commit {sha} is not deployable (CI is {state})")]
    NotDeployable { sha: Sha, state: SimpleState },

    #[error("commit {0} already exists on this stack")]
    DuplicateCommit(Sha),

    #[error("stack {0} already exists")]
    StackExists(StackId),

    /// A hook delivery job failed. Raised by the job worker.
    #[error("delivery failure: {0}")]
    DeliveryFailure(#[from] DeliveryError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<RevisionError> for OrchestratorError {
    fn from(err: RevisionError) -> Self {
        match err {
            RevisionError::Ambiguous {
                prefix, candidates, ..
            } => OrchestratorError::AmbiguousRevision { prefix, candidates },
            RevisionError::NotFound(reference) => {
                OrchestratorError::NotFound(Missing::Commit(reference))
            }
            RevisionError::Duplicate(sha) => OrchestratorError::DuplicateCommit(sha),
        }
    }
}

impl From<AdmissionError> for OrchestratorError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::ConcurrentTask { blocking } => {
                OrchestratorError::ConcurrentTask { blocking }
            }
            AdmissionError::NotDeployable { sha, state } => {
                OrchestratorError::NotDeployable { sha, state }
            }
        }
    }
}

impl From<TransitionError> for OrchestratorError {
    fn from(err: TransitionError) -> Self {
        OrchestratorError::InvalidTransition {
            task: err.task,
            from: err.from,
            to: err.to,
        }
    }
}
