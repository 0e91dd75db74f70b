//! Core domain types for the orchestration engine.
//!
//! Entities live in arenas keyed by opaque ids; these types never hold
//! references to each other, only ids.

pub mod commit;
pub mod hook;
pub mod ids;
pub mod stack;
pub mod status;
pub mod task;

// Re-export commonly used types at the module level
pub use commit::{Commit, CommitInput, CommitStats, Identity};
pub use hook::{Delivery, DeliveryStatus, EventKind, HookSubscription};
pub use ids::{CommitId, DeliveryId, HookId, InvalidSha, Sha, StackId, TaskId};
pub use stack::{Stack, StackLock, StackSettings};
pub use status::{AggregateState, SimpleState, Status, StatusState};
pub use task::{Chunk, Task, TaskKind, TaskOutcome, TaskState, TaskSummary};
