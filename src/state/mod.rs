//! Pure state logic for the orchestrator.
//!
//! This module contains the functional core: status aggregation, commit
//! lineage queries, task transitions, admission checks and output streams.
//! Nothing in here locks, sleeps or performs I/O.

pub mod aggregate;
pub mod chunks;
pub mod graph;
pub mod guard;
pub mod transitions;

// Re-export commonly used types and functions
pub use aggregate::{StatusTransition, aggregate, aggregate_with_required, latest_per_context};
pub use chunks::ChunkStream;
pub use graph::{CommitGraph, RevisionError, commit_state, deployable, deployed, simple_state};
pub use guard::{AdmissionError, active_task, check_concurrency, check_deployable, rollback_target};
pub use transitions::{Transition, TransitionError, apply, next_state};
