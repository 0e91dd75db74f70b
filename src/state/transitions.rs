//! Task lifecycle transitions.
//!
//! Pure functions for moving a task through
//! `pending -> running -> {success, failed, error, aborted}`.
//! Only `start` and `finish` belong to the executor; `abort` may come from
//! anywhere and is idempotent.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Task, TaskId, TaskOutcome, TaskState};

/// A requested lifecycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Finish(TaskOutcome),
    Abort,
}

impl Transition {
    /// The state this transition would land in.
    pub fn target(&self) -> TaskState {
        match self {
            Transition::Start => TaskState::Running,
            Transition::Finish(outcome) => TaskState::from(*outcome),
            Transition::Abort => TaskState::Aborted,
        }
    }
}

/// An illegal state change was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {task} cannot go from {from} to {to}")]
pub struct TransitionError {
    pub task: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

pub type Result<T> = std::result::Result<T, TransitionError>;

/// Computes the state after `transition`.
///
/// Returns `Ok(None)` when the transition is a no-op (aborting an aborted task).
pub fn next_state(
    task: TaskId,
    current: TaskState,
    transition: Transition,
) -> Result<Option<TaskState>> {
    let to = transition.target();
    match (current, transition) {
        (TaskState::Pending, Transition::Start) => Ok(Some(to)),
        (TaskState::Running, Transition::Finish(_)) => Ok(Some(to)),
        (TaskState::Pending | TaskState::Running, Transition::Abort) => Ok(Some(to)),
        (TaskState::Aborted, Transition::Abort) => Ok(None),
        (from, _) => Err(TransitionError { task, from, to }),
    }
}

/// Applies `transition` to `task`, stamping start/end times.
///
/// Returns the previous state if the task changed, `None` for a no-op.
pub fn apply(
    task: &mut Task,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Option<TaskState>> {
    let Some(next) = next_state(task.id, task.state, transition)? else {
        return Ok(None);
    };
    let previous = task.state;
    task.state = next;
    if next == TaskState::Running {
        task.started_at = Some(now);
    }
    if next.is_terminal() {
        task.ended_at = Some(now);
    }
    Ok(Some(previous))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_task_state, at, make_task};
    use proptest::prelude::*;

    const ALL_OUTCOMES: [TaskOutcome; 3] =
        [TaskOutcome::Success, TaskOutcome::Failed, TaskOutcome::Error];

    #[test]
    fn happy_path_stamps_times() {
        let mut task = make_task(1, "shop/web", 1);
        assert_eq!(apply(&mut task, Transition::Start, at(10)), Ok(Some(TaskState::Pending)));
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.started_at, Some(at(10)));

        apply(&mut task, Transition::Finish(TaskOutcome::Success), at(70)).unwrap();
        assert_eq!(task.state, TaskState::Success);
        assert_eq!(task.ended_at, Some(at(70)));
        assert_eq!(task.duration().map(|d| d.num_seconds()), Some(60));
    }

    #[test]
    fn cannot_start_twice() {
        let mut task = make_task(1, "shop/web", 1);
        apply(&mut task, Transition::Start, at(0)).unwrap();
        let err = apply(&mut task, Transition::Start, at(1)).unwrap_err();
        assert_eq!(err.from, TaskState::Running);
        assert_eq!(err.to, TaskState::Running);
    }

    #[test]
    fn cannot_finish_pending_task() {
        let mut task = make_task(1, "shop/web", 1);
        assert!(apply(&mut task, Transition::Finish(TaskOutcome::Success), at(0)).is_err());
        assert_eq!(task.state, TaskState::Pending);
    }

    #[test]
    fn abort_from_pending_skips_running() {
        let mut task = make_task(1, "shop/web", 1);
        apply(&mut task, Transition::Abort, at(5)).unwrap();
        assert_eq!(task.state, TaskState::Aborted);
        assert_eq!(task.started_at, None);
        assert_eq!(task.ended_at, Some(at(5)));
    }

    #[test]
    fn abort_is_idempotent() {
        let mut task = make_task(1, "shop/web", 1);
        apply(&mut task, Transition::Start, at(0)).unwrap();
        apply(&mut task, Transition::Abort, at(5)).unwrap();
        assert_eq!(apply(&mut task, Transition::Abort, at(9)), Ok(None));
        assert_eq!(task.ended_at, Some(at(5)));
    }

    #[test]
    fn finishing_an_aborted_task_is_rejected() {
        let mut task = make_task(1, "shop/web", 1);
        apply(&mut task, Transition::Start, at(0)).unwrap();
        apply(&mut task, Transition::Abort, at(1)).unwrap();
        let err = apply(&mut task, Transition::Finish(TaskOutcome::Success), at(2)).unwrap_err();
        assert_eq!(err.from, TaskState::Aborted);
        assert_eq!(task.state, TaskState::Aborted);
    }

    proptest! {
        /// Nothing leaves a terminal state except the abort no-op.
        #[test]
        fn terminal_states_are_sticky(state in arb_task_state()) {
            prop_assume!(state.is_terminal());
            let id = TaskId(1);
            prop_assert!(next_state(id, state, Transition::Start).is_err());
            for outcome in ALL_OUTCOMES {
                prop_assert!(next_state(id, state, Transition::Finish(outcome)).is_err());
            }
            let abort = next_state(id, state, Transition::Abort);
            if state == TaskState::Aborted {
                prop_assert_eq!(abort, Ok(None));
            } else {
                prop_assert!(abort.is_err());
            }
        }

        /// Aborting any active task lands in aborted.
        #[test]
        fn abort_from_active_is_aborted(state in arb_task_state()) {
            prop_assume!(state.is_active());
            prop_assert_eq!(
                next_state(TaskId(1), state, Transition::Abort),
                Ok(Some(TaskState::Aborted))
            );
        }
    }
}
