//! Shared test utilities and arbitrary generators for property-based testing.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use sha2::{Digest, Sha256};

use crate::jobs::{Job, JobError, JobQueue};
use crate::types::{
    Commit, CommitId, CommitInput, Identity, Sha, Stack, StackId, StackSettings, Status,
    StatusState, Task, TaskId, TaskKind, TaskState,
};

/// A fixed instant plus `secs`, so tests never depend on the wall clock.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_704_067_200 + secs, 0).unwrap()
}

/// A deterministic, well-formed 40-character SHA.
pub fn sha_from_seed(seed: u64) -> String {
    hex::encode(Sha256::digest(seed.to_be_bytes()))[..40].to_string()
}

pub fn commit_input(sha: &str) -> CommitInput {
    CommitInput {
        sha: Sha::parse(sha).unwrap(),
        message: format!("Commit {}", &sha[..7]),
        author: Identity::new("Ada Lovelace", "ada@example.com"),
        committer: Identity::new("Ada Lovelace", "ada@example.com"),
        authored_at: at(0),
        committed_at: at(0),
    }
}

pub fn make_commit(id: u64, sha: &str) -> Commit {
    Commit::from_input(CommitId(id), commit_input(sha))
}

/// A pending deploy of `until` on `stack`.
pub fn make_task(id: u64, stack: &str, until: u64) -> Task {
    Task {
        id: TaskId(id),
        stack: StackId::from(stack),
        kind: TaskKind::Deploy,
        state: TaskState::Pending,
        until_commit: CommitId(until),
        since_commit: None,
        initiator: "ada".to_string(),
        env: BTreeMap::new(),
        force: false,
        bypassed_ci: false,
        rollback_of: None,
        rollback_once_aborted: false,
        created_at: at(0),
        started_at: None,
        ended_at: None,
    }
}

pub fn make_stack(id: &str, settings: StackSettings) -> Stack {
    let mut stack = Stack::new(StackId::from(id), "shop/web", "main", settings);
    stack.created_at = at(0);
    stack
}

/// Job queue that records submissions instead of running them.
#[derive(Debug, Default)]
pub struct RecordingJobQueue {
    jobs: Mutex<Vec<Job>>,
}

impl RecordingJobQueue {
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<Job> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

impl JobQueue for RecordingJobQueue {
    fn submit(&self, job: Job) -> Result<(), JobError> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

pub fn arb_sha() -> impl Strategy<Value = Sha> {
    "[0-9a-f]{40}".prop_map(|s| Sha::parse(s).unwrap())
}

pub fn arb_status_state() -> impl Strategy<Value = StatusState> {
    prop_oneof![
        Just(StatusState::Pending),
        Just(StatusState::Success),
        Just(StatusState::Failure),
        Just(StatusState::Error),
    ]
}

pub fn arb_task_state() -> impl Strategy<Value = TaskState> {
    prop_oneof![
        Just(TaskState::Pending),
        Just(TaskState::Running),
        Just(TaskState::Success),
        Just(TaskState::Failed),
        Just(TaskState::Error),
        Just(TaskState::Aborted),
    ]
}

pub fn arb_task_kind() -> impl Strategy<Value = TaskKind> {
    prop_oneof![
        Just(TaskKind::Deploy),
        Just(TaskKind::Rollback),
        "[a-z-]{1,12}".prop_map(|name| TaskKind::Maintenance { name }),
    ]
}

pub fn arb_status() -> impl Strategy<Value = Status> {
    ("ci/[a-z]{1,8}", arb_status_state(), 0i64..100_000)
        .prop_map(|(context, state, secs)| Status::new(context, state, at(secs)))
}

pub fn arb_commit() -> impl Strategy<Value = Commit> {
    (
        1u64..10_000,
        arb_sha(),
        any::<bool>(),
        prop::collection::vec(arb_status(), 0..4),
    )
        .prop_map(|(id, sha, detached, statuses)| {
            let mut commit = make_commit(id, sha.as_str());
            commit.detached = detached;
            commit.statuses = statuses;
            commit
        })
}

pub fn arb_task() -> impl Strategy<Value = Task> {
    (
        1u64..10_000,
        arb_task_kind(),
        arb_task_state(),
        1u64..10_000,
        prop::option::of(1u64..10_000),
        any::<bool>(),
    )
        .prop_map(|(id, kind, state, until, since, force)| {
            let mut task = make_task(id, "shop/web", until);
            task.kind = kind;
            task.state = state;
            task.since_commit = since.map(CommitId);
            task.force = force;
            task
        })
}

pub fn arb_stack() -> impl Strategy<Value = Stack> {
    ("[a-z]{1,8}/[a-z]{1,8}", any::<bool>(), any::<bool>()).prop_map(|(id, cd, ignore_ci)| {
        make_stack(
            &id,
            StackSettings::default()
                .with_continuous_deployment(cd)
                .with_ignore_ci(ignore_ci),
        )
    })
}
