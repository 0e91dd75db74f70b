//! Commit types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CommitId, Sha};
use super::status::Status;

/// Author or committer identity as reported by the source-control provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Identity {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Line counts fetched asynchronously after ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    pub additions: u32,
    pub deletions: u32,
}

/// What the source-control provider hands us for a new commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInput {
    pub sha: Sha,
    pub message: String,
    pub author: Identity,
    pub committer: Identity,
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
}

/// One source revision on a stack.
///
/// Only `detached`, `stats` and the status history change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Insertion-ordered sequence id.
    pub id: CommitId,
    pub sha: Sha,
    pub message: String,
    pub author: Identity,
    pub committer: Identity,
    /// Provider-reported timestamps. Informational only, never used for ordering.
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,

    /// Excluded from the deployable lineage (history was rewritten).
    pub detached: bool,

    pub stats: Option<CommitStats>,

    /// Every status ever reported, in arrival order.
    pub statuses: Vec<Status>,
}

impl Commit {
    pub fn from_input(id: CommitId, input: CommitInput) -> Self {
        Commit {
            id,
            sha: input.sha,
            message: input.message,
            author: input.author,
            committer: input.committer,
            authored_at: input.authored_at,
            committed_at: input.committed_at,
            detached: false,
            stats: None,
            statuses: Vec::new(),
        }
    }

    /// First line of the commit message.
    pub fn title(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_first_line() {
        let input = CommitInput {
            sha: Sha::parse("a".repeat(40)).unwrap(),
            message: "Fix checkout\n\nLonger body".to_string(),
            author: Identity::new("Ada", "ada@example.com"),
            committer: Identity::new("Ada", "ada@example.com"),
            authored_at: Utc::now(),
            committed_at: Utc::now(),
        };
        let commit = Commit::from_input(CommitId(1), input);
        assert_eq!(commit.title(), "Fix checkout");
        assert!(!commit.detached);
        assert!(commit.statuses.is_empty());
    }
}
