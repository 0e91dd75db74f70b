//! Stateful orchestration over the pure core in [`crate::state`].
//!
//! The [`Orchestrator`] holds every stack behind its own lock and exposes the
//! boundary operations: status ingestion, task admission and lifecycle,
//! output streaming, stack locks and snapshots. Every mutation that matters
//! to the outside world is published on the [`EventBus`](crate::events::EventBus);
//! long work is handed to the [`JobQueue`](crate::jobs::JobQueue).

pub mod error;
pub mod orchestrator;

pub use error::{Missing, OrchestratorError, Result};
pub use orchestrator::{
    CONTINUOUS_DEPLOYMENT_INITIATOR, CommitView, DEFAULT_MIN_PREFIX_LEN, Orchestrator,
    OrchestratorConfig, Recovery, StatusUpdate, TaskRequest,
};
