//! Persistence layer for the orchestrator.
//!
//! # Architecture
//!
//! - **Journal**: append-only JSON Lines record of every emitted event
//! - **Snapshots**: periodic full-state captures for recovery
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   snapshot.json     # latest full snapshot
//!   events.log        # event journal (JSON Lines)
//! ```
//!
//! # Crash Safety
//!
//! - Journal: partial writes detected and truncated on replay
//! - Snapshots: written atomically using write-to-temp-then-rename
//! - The journal handle is synced on critical events and on shutdown

pub mod fsync;
pub mod log;
pub mod snapshot;

use std::path::{Path, PathBuf};

pub use fsync::{fsync_dir, fsync_file, replace_durably};
pub use log::{EventLog, EventLogError, JournalEntry};
pub use snapshot::{
    HookSnapshot, OrchestratorSnapshot, PersistedState, SCHEMA_VERSION, SnapshotError,
    StackRecord, TaskOutput, load_snapshot, save_snapshot_atomic, try_load_snapshot,
};

pub fn snapshot_path(state_dir: &Path) -> PathBuf {
    state_dir.join("snapshot.json")
}

pub fn journal_path(state_dir: &Path) -> PathBuf {
    state_dir.join("events.log")
}
