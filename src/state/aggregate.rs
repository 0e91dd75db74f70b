//! CI status aggregation.
//!
//! Pure functions that fold a commit's status history into one verdict.
//! Only the most recent status per context counts; the verdict is the worst
//! state among those (`error > failure > pending > success`), or `unknown`
//! when nothing has reported.

use std::collections::BTreeMap;

use crate::types::{AggregateState, SimpleState, Status, StatusState};

/// Returns the most recent status for each context.
///
/// Recency is the status timestamp. On equal timestamps the status that
/// appears later in `statuses` wins, so arrival order breaks ties.
pub fn latest_per_context<'a, I>(statuses: I) -> BTreeMap<&'a str, &'a Status>
where
    I: IntoIterator<Item = &'a Status>,
{
    let mut latest: BTreeMap<&'a str, &'a Status> = BTreeMap::new();
    for status in statuses {
        match latest.get(status.context.as_str()) {
            Some(current) if current.created_at > status.created_at => {}
            _ => {
                latest.insert(status.context.as_str(), status);
            }
        }
    }
    latest
}

/// Combines a commit's statuses into one aggregate state.
pub fn aggregate<'a, I>(statuses: I) -> AggregateState
where
    I: IntoIterator<Item = &'a Status>,
{
    latest_per_context(statuses)
        .values()
        .map(|status| AggregateState::from(status.state))
        .max()
        .unwrap_or(AggregateState::Unknown)
}

/// Like [`aggregate`], but contexts in `required` that never reported count
/// as `pending`.
pub fn aggregate_with_required<'a, I>(statuses: I, required: &[String]) -> AggregateState
where
    I: IntoIterator<Item = &'a Status>,
{
    let latest = latest_per_context(statuses);
    let missing_required = required
        .iter()
        .any(|context| !latest.contains_key(context.as_str()));

    let reported = latest
        .values()
        .map(|status| AggregateState::from(status.state))
        .max()
        .unwrap_or(AggregateState::Unknown);

    if missing_required {
        reported.max(AggregateState::Pending)
    } else {
        reported
    }
}

/// Before/after view of one status application, used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub previous: AggregateState,
    pub current: AggregateState,
}

impl StatusTransition {
    pub fn new(previous: AggregateState, current: AggregateState) -> Self {
        StatusTransition { previous, current }
    }

    /// The raw aggregate moved.
    pub fn state_changed(&self) -> bool {
        self.previous != self.current
    }

    /// The simple state moved. Only this re-triggers deployability hooks.
    pub fn simple_changed(&self) -> bool {
        self.previous.simple() != self.current.simple()
    }

    pub fn previous_simple(&self) -> SimpleState {
        self.previous.simple()
    }

    pub fn current_simple(&self) -> SimpleState {
        self.current.simple()
    }
}

/// Returns the raw states of the latest status per context, sorted by context.
pub fn context_states<'a, I>(statuses: I) -> Vec<(String, StatusState)>
where
    I: IntoIterator<Item = &'a Status>,
{
    latest_per_context(statuses)
        .into_iter()
        .map(|(context, status)| (context.to_string(), status.state))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_status_state, at};
    use proptest::prelude::*;

    fn status(context: &str, state: StatusState, secs: i64) -> Status {
        Status::new(context, state, at(secs))
    }

    #[test]
    fn empty_set_is_unknown() {
        let statuses: Vec<Status> = vec![];
        assert_eq!(aggregate(&statuses), AggregateState::Unknown);
        assert_eq!(aggregate(&statuses).simple(), SimpleState::Pending);
    }

    #[test]
    fn newer_status_replaces_older_for_same_context() {
        let statuses = vec![
            status("ci/test", StatusState::Failure, 10),
            status("ci/test", StatusState::Success, 20),
        ];
        assert_eq!(aggregate(&statuses), AggregateState::Success);
    }

    #[test]
    fn recency_is_by_timestamp_not_arrival() {
        // A late-arriving but older result must not override the newer one.
        let statuses = vec![
            status("ci/test", StatusState::Success, 20),
            status("ci/test", StatusState::Failure, 10),
        ];
        assert_eq!(aggregate(&statuses), AggregateState::Success);
    }

    #[test]
    fn equal_timestamps_prefer_later_arrival() {
        let statuses = vec![
            status("ci/test", StatusState::Pending, 10),
            status("ci/test", StatusState::Success, 10),
        ];
        assert_eq!(aggregate(&statuses), AggregateState::Success);
    }

    #[test]
    fn worst_context_wins() {
        let statuses = vec![
            status("ci/a", StatusState::Success, 1),
            status("ci/b", StatusState::Pending, 1),
            status("ci/c", StatusState::Failure, 1),
        ];
        assert_eq!(aggregate(&statuses), AggregateState::Failure);

        let with_error = [statuses, vec![status("ci/d", StatusState::Error, 1)]].concat();
        assert_eq!(aggregate(&with_error), AggregateState::Error);
    }

    #[test]
    fn missing_required_context_is_pending() {
        let statuses = vec![status("ci/unit", StatusState::Success, 1)];
        let required = vec!["ci/unit".to_string(), "ci/integration".to_string()];

        assert_eq!(
            aggregate_with_required(&statuses, &required),
            AggregateState::Pending
        );
        assert_eq!(aggregate(&statuses), AggregateState::Success);
    }

    #[test]
    fn missing_required_does_not_mask_failure() {
        let statuses = vec![status("ci/unit", StatusState::Failure, 1)];
        let required = vec!["ci/integration".to_string()];
        assert_eq!(
            aggregate_with_required(&statuses, &required),
            AggregateState::Failure
        );
    }

    #[test]
    fn transition_detects_simple_change_only_when_collapsed_state_moves() {
        let t = StatusTransition::new(AggregateState::Unknown, AggregateState::Pending);
        assert!(t.state_changed());
        assert!(!t.simple_changed());

        let t = StatusTransition::new(AggregateState::Failure, AggregateState::Error);
        assert!(t.state_changed());
        assert!(!t.simple_changed());

        let t = StatusTransition::new(AggregateState::Pending, AggregateState::Success);
        assert!(t.simple_changed());
        assert_eq!(t.current_simple(), SimpleState::Success);
    }

    proptest! {
        /// With one status per context, the aggregate is the worst state present.
        #[test]
        fn aggregate_is_worst_state(states in prop::collection::vec(arb_status_state(), 1..12)) {
            let statuses: Vec<Status> = states
                .iter()
                .enumerate()
                .map(|(i, state)| status(&format!("ci/{i}"), *state, 0))
                .collect();

            let rank = |s: &StatusState| match s {
                StatusState::Success => 0,
                StatusState::Pending => 1,
                StatusState::Failure => 2,
                StatusState::Error => 3,
            };
            let worst = states.iter().max_by_key(|s| rank(s)).copied().unwrap();

            prop_assert_eq!(aggregate(&statuses), AggregateState::from(worst));
        }

        /// Shuffling arrival order never changes the verdict when timestamps are distinct.
        #[test]
        fn aggregate_ignores_arrival_order(
            states in prop::collection::vec(arb_status_state(), 1..10),
            contexts in prop::collection::vec(0usize..3, 1..10),
        ) {
            let statuses: Vec<Status> = states
                .iter()
                .zip(contexts.iter().cycle())
                .enumerate()
                .map(|(i, (state, ctx))| status(&format!("ci/{ctx}"), *state, i as i64))
                .collect();
            let mut reversed = statuses.clone();
            reversed.reverse();

            prop_assert_eq!(aggregate(&statuses), aggregate(&reversed));
        }
    }
}
