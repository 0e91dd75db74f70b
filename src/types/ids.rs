//! Identifiers.
//!
//! Arena ids are opaque counters wrapped in their own types, so a `TaskId`
//! cannot be passed where a `CommitId` is wanted. Entities refer to each
//! other only through these.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of a deployable stack (repository/branch pair), e.g. `shop/web/production`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(pub String);

impl StackId {
    pub fn new(s: impl Into<String>) -> Self {
        StackId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StackId {
    fn from(s: &str) -> Self {
        StackId(s.to_string())
    }
}

/// Sequence id of a commit.
///
/// Assigned in strictly increasing insertion order and used for every
/// "newer than" / "until" / "deployed" comparison. Commit timestamps are
/// never used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub u64);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task (deploy, rollback or maintenance task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a webhook subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookId(pub u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a string is not a valid full commit SHA.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid SHA {0:?}: expected 40 hex characters")]
pub struct InvalidSha(pub String);

/// A git commit SHA (40 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha(String);

impl Sha {
    /// Parses a full SHA, normalizing to lowercase.
    pub fn parse(s: impl AsRef<str>) -> Result<Self, InvalidSha> {
        let s = s.as_ref();
        if s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Sha(s.to_ascii_lowercase()))
        } else {
            Err(InvalidSha(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (7-character) version of the SHA for display.
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }

    /// Returns true if `prefix` is a case-insensitive prefix of this SHA.
    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod sha {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parse_accepts_full_hex(s in "[0-9a-f]{40}") {
                let sha = Sha::parse(&s).unwrap();
                prop_assert_eq!(sha.as_str(), s.as_str());
            }

            #[test]
            fn short_returns_7_chars(s in "[0-9a-f]{40}") {
                let sha = Sha::parse(&s).unwrap();
                prop_assert_eq!(sha.short(), &s[..7]);
            }

            #[test]
            fn every_prefix_matches(s in "[0-9a-f]{40}", len in 0usize..=40) {
                let sha = Sha::parse(&s).unwrap();
                prop_assert!(sha.starts_with(&s[..len]));
            }
        }

        #[test]
        fn parse_normalizes_case() {
            let sha = Sha::parse("ABCDEF0123456789ABCDEF0123456789ABCDEF01").unwrap();
            assert_eq!(sha.as_str(), "abcdef0123456789abcdef0123456789abcdef01");
            assert!(sha.starts_with("ABCDEF"));
        }

        #[test]
        fn parse_rejects_bad_input() {
            assert!(Sha::parse("abc").is_err());
            assert!(Sha::parse("z".repeat(40)).is_err());
            assert!(Sha::parse("a".repeat(41)).is_err());
        }

        #[test]
        fn longer_prefix_does_not_match() {
            let sha = Sha::parse("a".repeat(40)).unwrap();
            assert!(!sha.starts_with(&"a".repeat(41)));
        }
    }

    #[test]
    fn task_id_display() {
        assert_eq!(TaskId(12).to_string(), "#12");
    }

    #[test]
    fn stack_id_serializes_transparently() {
        let json = serde_json::to_string(&StackId::new("shop/web")).unwrap();
        assert_eq!(json, "\"shop/web\"");
    }
}
