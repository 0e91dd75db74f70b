//! Per-stack commit lineage.
//!
//! Commits are ordered by their insertion sequence id. Every range and
//! "deployed" question is answered by comparing ids, never timestamps: the
//! provider's timestamps are untrusted and may be skewed or rewritten.

use std::collections::BTreeMap;
use std::ops::Bound;

use thiserror::Error;

use crate::state::aggregate::aggregate_with_required;
use crate::types::{AggregateState, Commit, CommitId, Sha, SimpleState, StackSettings};

/// Errors from resolving or inserting commits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevisionError {
    /// The reference is shorter than the trusted minimum, or matches more
    /// than one commit. `candidates` is empty in the too-short case.
    #[error("ambiguous revision {prefix:?} ({} candidates, minimum length {min_len})", .candidates.len())]
    Ambiguous {
        prefix: String,
        min_len: usize,
        candidates: Vec<Sha>,
    },

    #[error("no commit matches {0:?}")]
    NotFound(String),

    #[error("commit {0} already exists on this stack")]
    Duplicate(Sha),
}

pub type Result<T> = std::result::Result<T, RevisionError>;

/// Ordered commits of one stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitGraph {
    commits: BTreeMap<CommitId, Commit>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a graph from persisted commits.
    pub fn from_commits(commits: impl IntoIterator<Item = Commit>) -> Self {
        CommitGraph {
            commits: commits.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Inserts a commit. Its id must be greater than every existing id.
    pub fn insert(&mut self, commit: Commit) -> Result<&Commit> {
        if self.find(&commit.sha).is_some() {
            return Err(RevisionError::Duplicate(commit.sha));
        }
        debug_assert!(
            self.commits
                .last_key_value()
                .is_none_or(|(last, _)| *last < commit.id),
            "commit ids must increase with insertion"
        );
        let id = commit.id;
        let inserted: &Commit = self.commits.entry(id).or_insert(commit);
        Ok(inserted)
    }

    pub fn get(&self, id: CommitId) -> Option<&Commit> {
        self.commits.get(&id)
    }

    pub fn get_mut(&mut self, id: CommitId) -> Option<&mut Commit> {
        self.commits.get_mut(&id)
    }

    /// Exact SHA lookup.
    pub fn find(&self, sha: &Sha) -> Option<&Commit> {
        self.commits.values().find(|c| &c.sha == sha)
    }

    /// All commits in sequence order, detached ones included.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Commit> {
        self.commits.values()
    }

    /// Commits strictly newer than `commit`; `None` means from the beginning.
    pub fn newer_than(&self, commit: Option<CommitId>) -> impl DoubleEndedIterator<Item = &Commit> {
        let lower = match commit {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.commits
            .range((lower, Bound::Unbounded))
            .map(|(_, c)| c)
    }

    /// Commits up to and including `commit`; `None` means to the end.
    pub fn until(&self, commit: Option<CommitId>) -> impl DoubleEndedIterator<Item = &Commit> {
        let upper = match commit {
            Some(id) => Bound::Included(id),
            None => Bound::Unbounded,
        };
        self.commits
            .range((Bound::Unbounded, upper))
            .map(|(_, c)| c)
    }

    /// Non-detached commits in `(since, until]`.
    pub fn range(&self, since: Option<CommitId>, until: CommitId) -> Vec<&Commit> {
        let lower = match since {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        if since.is_some_and(|s| s >= until) {
            return Vec::new();
        }
        self.commits
            .range((lower, Bound::Included(until)))
            .map(|(_, c)| c)
            .filter(|c| !c.detached)
            .collect()
    }

    /// Every commit strictly newer than `commit` on this stack.
    pub fn children(&self, commit: CommitId) -> impl DoubleEndedIterator<Item = &Commit> {
        self.newer_than(Some(commit))
    }

    /// Marks `commit` and all its children detached. Returns the ids touched.
    pub fn detach(&mut self, commit: CommitId) -> Vec<CommitId> {
        let mut touched = Vec::new();
        for (id, c) in self.commits.range_mut(commit..) {
            if !c.detached {
                c.detached = true;
                touched.push(*id);
            }
        }
        touched
    }

    /// The newest non-detached commit.
    pub fn head(&self) -> Option<&Commit> {
        self.commits.values().rev().find(|c| !c.detached)
    }

    /// Resolves a full SHA or a prefix of at least `min_len` characters.
    pub fn resolve(&self, reference: &str, min_len: usize) -> Result<&Commit> {
        let prefix = reference.trim();
        if prefix.len() < min_len {
            return Err(RevisionError::Ambiguous {
                prefix: prefix.to_string(),
                min_len,
                candidates: Vec::new(),
            });
        }

        let mut matches = self.commits.values().filter(|c| c.sha.starts_with(prefix));
        let Some(first) = matches.next() else {
            return Err(RevisionError::NotFound(prefix.to_string()));
        };
        let rest: Vec<&Commit> = matches.collect();
        if rest.is_empty() {
            return Ok(first);
        }

        let candidates = std::iter::once(first)
            .chain(rest)
            .map(|c| c.sha.clone())
            .collect();
        Err(RevisionError::Ambiguous {
            prefix: prefix.to_string(),
            min_len,
            candidates,
        })
    }

    /// Newest commit that is deployable, not detached, and newer than `deployed`.
    pub fn next_deploy_target(
        &self,
        settings: &StackSettings,
        deployed: Option<CommitId>,
    ) -> Option<&Commit> {
        self.newer_than(deployed)
            .rev()
            .find(|c| !c.detached && deployable(c, settings))
    }
}

/// Aggregate CI verdict for `commit` under the stack's required contexts.
pub fn commit_state(commit: &Commit, settings: &StackSettings) -> AggregateState {
    aggregate_with_required(&commit.statuses, &settings.required_contexts)
}

pub fn simple_state(commit: &Commit, settings: &StackSettings) -> SimpleState {
    commit_state(commit, settings).simple()
}

/// CI is green, or the stack ignores CI.
pub fn deployable(commit: &Commit, settings: &StackSettings) -> bool {
    settings.ignore_ci || simple_state(commit, settings) == SimpleState::Success
}

/// At or before the stack's last deployed commit.
pub fn deployed(commit: &Commit, last_deployed: Option<CommitId>) -> bool {
    last_deployed.is_some_and(|last| commit.id <= last)
}
