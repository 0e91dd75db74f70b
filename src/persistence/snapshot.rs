//! Snapshot persistence.
//!
//! A snapshot captures every arena at a point in time: stacks with their
//! commits and tasks, task output, hook subscriptions and deliveries, and the
//! id counters. Restoring one brings the daemon back to where it was.
//!
//! Snapshots are replaced through [`replace_durably`], so a reader sees
//! either the previous snapshot or the new one.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fsync::replace_durably;
use crate::types::{Chunk, Commit, Delivery, HookSubscription, Stack, Task, TaskId};

/// Bumped whenever the layout below changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// One stack with everything it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRecord {
    pub stack: Stack,
    /// In sequence-id order.
    pub commits: Vec<Commit>,
    pub tasks: Vec<Task>,
}

/// Captured output of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task: TaskId,
    pub chunks: Vec<Chunk>,
}

/// The orchestrator's arenas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    /// Next commit sequence id to assign. Global, so ids stay unique across stacks.
    pub next_commit_id: u64,
    pub next_task_id: u64,
    pub stacks: Vec<StackRecord>,
    pub outputs: Vec<TaskOutput>,
}

/// The hook dispatcher's arenas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSnapshot {
    pub next_hook_id: u64,
    pub next_delivery_id: u64,
    pub subscriptions: Vec<HookSubscription>,
    pub deliveries: Vec<Delivery>,
}

/// Persisted state snapshot, stored at `<state_dir>/snapshot.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub schema_version: u32,

    pub snapshot_at: DateTime<Utc>,

    /// First journal entry not reflected in this snapshot.
    pub journal_seq: u64,

    pub orchestrator: OrchestratorSnapshot,
    pub hooks: HookSnapshot,
}

impl PersistedState {
    pub fn new(orchestrator: OrchestratorSnapshot, hooks: HookSnapshot, journal_seq: u64) -> Self {
        PersistedState {
            schema_version: SCHEMA_VERSION,
            snapshot_at: Utc::now(),
            journal_seq,
            orchestrator,
            hooks,
        }
    }
}

/// Writes `snapshot` over `path`.
pub fn save_snapshot_atomic(path: &Path, snapshot: &PersistedState) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    replace_durably(path, &bytes)?;
    Ok(())
}

/// Reads a snapshot written by this version of the daemon.
pub fn load_snapshot(path: &Path) -> Result<PersistedState> {
    let state: PersistedState = serde_json::from_slice(&std::fs::read(path)?)?;
    match state.schema_version {
        SCHEMA_VERSION => Ok(state),
        got => Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got,
        }),
    }
}

/// Like [`load_snapshot`], but a missing file means a fresh start.
pub fn try_load_snapshot(path: &Path) -> Result<Option<PersistedState>> {
    match load_snapshot(path) {
        Err(SnapshotError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        other => other.map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_commit, arb_stack, arb_task, at};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn arb_stack_record() -> impl Strategy<Value = StackRecord> {
        (
            arb_stack(),
            prop::collection::vec(arb_commit(), 0..5),
            prop::collection::vec(arb_task(), 0..5),
        )
            .prop_map(|(stack, commits, tasks)| StackRecord {
                stack,
                commits,
                tasks,
            })
    }

    fn arb_persisted_state() -> impl Strategy<Value = PersistedState> {
        (
            0u64..1_000_000,
            prop::collection::vec(arb_stack_record(), 0..3),
            prop::collection::vec("[ -~]{0,20}", 0..4),
        )
            .prop_map(|(journal_seq, stacks, lines)| {
                let outputs = vec![TaskOutput {
                    task: TaskId(1),
                    chunks: lines
                        .into_iter()
                        .enumerate()
                        .map(|(i, text)| Chunk {
                            seq: i as u64,
                            text,
                            created_at: at(i as i64),
                        })
                        .collect(),
                }];
                PersistedState {
                    schema_version: SCHEMA_VERSION,
                    snapshot_at: at(0),
                    journal_seq,
                    orchestrator: OrchestratorSnapshot {
                        next_commit_id: 100,
                        next_task_id: 100,
                        stacks,
                        outputs,
                    },
                    hooks: HookSnapshot::default(),
                }
            })
    }

    fn empty_state() -> PersistedState {
        PersistedState::new(OrchestratorSnapshot::default(), HookSnapshot::default(), 0)
    }

    proptest! {
        #[test]
        fn saved_state_loads_back_unchanged(state in arb_persisted_state()) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("snapshot.json");

            save_snapshot_atomic(&path, &state).unwrap();

            prop_assert_eq!(load_snapshot(&path).unwrap(), state);
        }
    }

    #[test]
    fn absent_snapshot_is_a_fresh_start() {
        let dir = tempdir().unwrap();
        assert!(try_load_snapshot(&dir.path().join("snapshot.json")).unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_is_not_mistaken_for_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, "{\"schema_version\":").unwrap();

        assert!(matches!(try_load_snapshot(&path), Err(SnapshotError::Json(_))));
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let mut state = empty_state();
        state.schema_version = SCHEMA_VERSION + 1;
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        let err = load_snapshot(&path).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::SchemaMismatch { expected: SCHEMA_VERSION, got } if got == SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn later_save_replaces_earlier() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        save_snapshot_atomic(&path, &empty_state()).unwrap();
        let later = PersistedState::new(OrchestratorSnapshot::default(), HookSnapshot::default(), 42);
        save_snapshot_atomic(&path, &later).unwrap();

        assert_eq!(load_snapshot(&path).unwrap().journal_seq, 42);
    }
}
