//! Job substrate interface.
//!
//! The orchestrator never runs long work inline. It submits a [`Job`] and
//! returns; something else runs it later, at least once. Anything that can
//! accept a job implements [`JobQueue`].

pub mod worker;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{DeliveryId, TaskId};

pub use worker::{JobWorker, WorkerConfig};

/// A unit of deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Execute an admitted task.
    RunTask { task: TaskId },

    /// Attempt one webhook delivery.
    DeliverHook { delivery: DeliveryId },
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::RunTask { task } => write!(f, "run task {task}"),
            Job::DeliverHook { delivery } => write!(f, "deliver {delivery}"),
        }
    }
}

/// Errors from submitting work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job queue is closed, dropped {0}")]
    QueueClosed(Job),
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Capability to schedule work for later execution.
pub trait JobQueue: Send + Sync {
    fn submit(&self, job: Job) -> Result<()>;
}

/// Receiving half of a [`ChannelJobQueue`].
pub type JobReceiver = mpsc::UnboundedReceiver<Job>;

/// In-process queue over a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelJobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl ChannelJobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelJobQueue { tx }, rx)
    }
}

impl JobQueue for ChannelJobQueue {
    fn submit(&self, job: Job) -> Result<()> {
        self.tx.send(job).map_err(|e| JobError::QueueClosed(e.0))
    }
}
