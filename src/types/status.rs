//! CI status types.
//!
//! A `Status` is one named check result for a commit at a point in time.
//! Statuses are immutable: a new result for the same context is a new row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State reported by a single CI check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    /// Returns true if the check has finished running.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusState::Pending)
    }
}

/// Combined state of all checks on a commit.
///
/// Variants are declared best-to-worst so that `Ord` gives the severity
/// order `unknown < success < pending < failure < error`. Aggregation takes
/// the maximum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    /// No checks have reported.
    Unknown,
    Success,
    Pending,
    Failure,
    Error,
}

impl AggregateState {
    /// Collapses the aggregate into the three-valued state used for gating.
    pub fn simple(&self) -> SimpleState {
        match self {
            AggregateState::Success => SimpleState::Success,
            AggregateState::Pending | AggregateState::Unknown => SimpleState::Pending,
            AggregateState::Failure | AggregateState::Error => SimpleState::Failed,
        }
    }
}

impl From<StatusState> for AggregateState {
    fn from(state: StatusState) -> Self {
        match state {
            StatusState::Pending => AggregateState::Pending,
            StatusState::Success => AggregateState::Success,
            StatusState::Failure => AggregateState::Failure,
            StatusState::Error => AggregateState::Error,
        }
    }
}

impl fmt::Display for AggregateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateState::Unknown => "unknown",
            AggregateState::Success => "success",
            AggregateState::Pending => "pending",
            AggregateState::Failure => "failure",
            AggregateState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Three-valued collapse of [`AggregateState`].
///
/// Deployability gating and change detection use this, not the raw aggregate:
/// a commit only re-triggers deployability hooks when its simple state moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleState {
    Success,
    Pending,
    Failed,
}

impl fmt::Display for SimpleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimpleState::Success => "success",
            SimpleState::Pending => "pending",
            SimpleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One CI check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Check name, e.g. `ci/buildkite`.
    pub context: String,
    pub state: StatusState,
    /// When the CI system reported this result.
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub target_url: Option<String>,
}

impl Status {
    pub fn new(context: impl Into<String>, state: StatusState, created_at: DateTime<Utc>) -> Self {
        Status {
            context: context.into(),
            state,
            created_at,
            description: None,
            target_url: None,
        }
    }
}
