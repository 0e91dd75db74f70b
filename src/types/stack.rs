//! Stack types.
//!
//! A stack is one deployable repository/branch pair. It owns its commits and
//! tasks by id; nothing in here points back at them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::ids::{CommitId, StackId};

/// Per-stack behaviour switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSettings {
    /// Deploy automatically whenever a newer commit becomes deployable.
    pub continuous_deployment: bool,

    /// Treat every commit as deployable regardless of CI.
    pub ignore_ci: bool,

    /// Environment keys a task may override. Anything else is dropped.
    pub allowed_env_keys: BTreeSet<String>,

    /// CI contexts that must report before a commit can be deployable.
    /// A missing required context counts as `pending`.
    pub required_contexts: Vec<String>,
}

impl StackSettings {
    pub fn with_continuous_deployment(mut self, enabled: bool) -> Self {
        self.continuous_deployment = enabled;
        self
    }

    pub fn with_ignore_ci(mut self, enabled: bool) -> Self {
        self.ignore_ci = enabled;
        self
    }

    pub fn with_allowed_env_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_env_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    /// Keeps only the overrides whose key is on the allow-list.
    ///
    /// Unknown keys are dropped silently; this is a filter, never an error.
    pub fn filter_env(&self, env: BTreeMap<String, String>) -> BTreeMap<String, String> {
        env.into_iter()
            .filter(|(key, _)| self.allowed_env_keys.contains(key))
            .collect()
    }
}

/// A lock placed on a stack by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackLock {
    pub reason: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

/// A deployable repository/branch pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub repository: String,
    pub branch: String,
    pub settings: StackSettings,

    /// Cached target of the most recent successful deploy or rollback.
    pub last_deployed_commit: Option<CommitId>,

    pub lock: Option<StackLock>,
    pub created_at: DateTime<Utc>,
}

impl Stack {
    pub fn new(
        id: StackId,
        repository: impl Into<String>,
        branch: impl Into<String>,
        settings: StackSettings,
    ) -> Self {
        Stack {
            id,
            repository: repository.into(),
            branch: branch.into(),
            settings,
            last_deployed_commit: None,
            lock: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}
