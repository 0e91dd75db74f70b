//! Admission checks for new tasks.
//!
//! The concurrency guard is a check, not a lock: callers run it under the
//! stack's mutex, which is what makes check-then-insert safe in-process.

use thiserror::Error;

use crate::state::graph::{deployable, simple_state};
use crate::types::{
    Commit, Sha, SimpleState, StackSettings, Task, TaskId, TaskKind, TaskState, TaskSummary,
};

/// Why a task was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("stack is busy with {blocking}")]
    ConcurrentTask { blocking: TaskSummary },

    #[error("commit {sha} is not deployable (CI is {state})")]
    NotDeployable { sha: Sha, state: SimpleState },
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

/// The oldest pending or running task, if any.
pub fn active_task<'a, I>(tasks: I) -> Option<&'a Task>
where
    I: IntoIterator<Item = &'a Task>,
{
    tasks
        .into_iter()
        .filter(|t| t.state.is_active())
        .min_by_key(|t| t.id)
}

/// Rejects admission while another task is active, unless forced.
///
/// A forced admission leaves the active task untouched.
pub fn check_concurrency<'a, I>(tasks: I, force: bool) -> Result<()>
where
    I: IntoIterator<Item = &'a Task>,
{
    if force {
        return Ok(());
    }
    match active_task(tasks) {
        Some(blocking) => Err(AdmissionError::ConcurrentTask {
            blocking: blocking.summary(),
        }),
        None => Ok(()),
    }
}

/// CI gate for deploy-type tasks.
///
/// Returns whether `force` was what let the target through, so the task can
/// record that CI was bypassed.
pub fn check_deployable(
    kind: &TaskKind,
    target: &Commit,
    settings: &StackSettings,
    force: bool,
) -> Result<bool> {
    if !kind.is_deploy_type() || deployable(target, settings) {
        return Ok(false);
    }
    if force {
        return Ok(true);
    }
    Err(AdmissionError::NotDeployable {
        sha: target.sha.clone(),
        state: simple_state(target, settings),
    })
}

/// Finds what a rollback of `reference` should go back to: the most recent
/// other successful deploy-type task on the stack.
pub fn rollback_target<'a, I>(tasks: I, reference: TaskId) -> Option<&'a Task>
where
    I: IntoIterator<Item = &'a Task>,
{
    tasks
        .into_iter()
        .filter(|t| t.id != reference)
        .filter(|t| t.kind.is_deploy_type() && t.state == TaskState::Success)
        .max_by_key(|t| t.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{at, make_commit, make_task, sha_from_seed};
    use crate::types::{Status, StatusState};
    use proptest::prelude::*;

    fn with_state(mut task: Task, state: TaskState) -> Task {
        task.state = state;
        task
    }

    mod concurrency {
        use super::*;

        #[test]
        fn idle_stack_admits() {
            let tasks = vec![with_state(make_task(1, "s", 1), TaskState::Success)];
            assert_eq!(check_concurrency(&tasks, false), Ok(()));
        }

        #[test]
        fn active_task_blocks_and_is_reported() {
            let tasks = vec![
                with_state(make_task(1, "s", 1), TaskState::Success),
                with_state(make_task(2, "s", 2), TaskState::Running),
            ];
            match check_concurrency(&tasks, false) {
                Err(AdmissionError::ConcurrentTask { blocking }) => {
                    assert_eq!(blocking.id, TaskId(2));
                    assert_eq!(blocking.state, TaskState::Running);
                }
                other => panic!("expected ConcurrentTask, got {other:?}"),
            }
        }

        #[test]
        fn force_bypasses_guard() {
            let tasks = vec![make_task(1, "s", 1)];
            assert_eq!(check_concurrency(&tasks, true), Ok(()));
        }

        proptest! {
            #[test]
            fn blocks_iff_any_task_active(states in prop::collection::vec(crate::test_utils::arb_task_state(), 0..8)) {
                let tasks: Vec<Task> = states
                    .iter()
                    .enumerate()
                    .map(|(i, s)| with_state(make_task(i as u64 + 1, "s", 1), *s))
                    .collect();
                let any_active = states.iter().any(TaskState::is_active);
                prop_assert_eq!(check_concurrency(&tasks, false).is_err(), any_active);
            }
        }
    }

    mod deployability {
        use super::*;

        #[test]
        fn maintenance_tasks_skip_ci_gate() {
            let commit = make_commit(1, &sha_from_seed(1));
            let kind = TaskKind::Maintenance { name: "migrate".into() };
            assert_eq!(check_deployable(&kind, &commit, &StackSettings::default(), false), Ok(false));
        }

        #[test]
        fn red_commit_needs_force_and_records_bypass() {
            let mut commit = make_commit(1, &sha_from_seed(1));
            commit.statuses.push(Status::new("ci", StatusState::Failure, at(0)));
            let settings = StackSettings::default();

            assert_eq!(
                check_deployable(&TaskKind::Deploy, &commit, &settings, false),
                Err(AdmissionError::NotDeployable {
                    sha: commit.sha.clone(),
                    state: SimpleState::Failed,
                })
            );
            assert_eq!(check_deployable(&TaskKind::Deploy, &commit, &settings, true), Ok(true));
        }

        #[test]
        fn green_commit_with_force_is_not_a_bypass() {
            let mut commit = make_commit(1, &sha_from_seed(1));
            commit.statuses.push(Status::new("ci", StatusState::Success, at(0)));
            assert_eq!(
                check_deployable(&TaskKind::Deploy, &commit, &StackSettings::default(), true),
                Ok(false)
            );
        }
    }

    mod rollback {
        use super::*;

        #[test]
        fn picks_most_recent_other_success() {
            let tasks = vec![
                with_state(make_task(1, "s", 10), TaskState::Success),
                with_state(make_task(2, "s", 20), TaskState::Success),
                with_state(make_task(3, "s", 30), TaskState::Failed),
                with_state(make_task(4, "s", 40), TaskState::Success),
            ];
            assert_eq!(rollback_target(&tasks, TaskId(4)).map(|t| t.id), Some(TaskId(2)));
            assert_eq!(rollback_target(&tasks, TaskId(3)).map(|t| t.id), Some(TaskId(4)));
        }

        #[test]
        fn ignores_maintenance_tasks() {
            let mut maintenance = with_state(make_task(2, "s", 20), TaskState::Success);
            maintenance.kind = TaskKind::Maintenance { name: "reindex".into() };
            let tasks = vec![
                with_state(make_task(1, "s", 10), TaskState::Success),
                maintenance,
                with_state(make_task(3, "s", 30), TaskState::Success),
            ];
            assert_eq!(rollback_target(&tasks, TaskId(3)).map(|t| t.id), Some(TaskId(1)));
        }

        #[test]
        fn none_without_prior_success() {
            let tasks = vec![with_state(make_task(1, "s", 10), TaskState::Success)];
            assert!(rollback_target(&tasks, TaskId(1)).is_none());
        }
    }
}
