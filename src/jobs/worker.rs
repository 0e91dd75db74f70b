//! Drains the job queue and runs each job on its own tokio task.
//!
//! Delivery retries are decided here, not in the dispatcher: a failed
//! delivery is resubmitted after a delay until it has used its attempts.
//! Either way the failure is reported as
//! [`OrchestratorError::DeliveryFailure`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{Job, JobQueue, JobReceiver};
use crate::engine::OrchestratorError;
use crate::executor::{TaskExecutor, TaskRunner};
use crate::hooks::{DeliveryError, HookDispatcher, HookTransport};
use crate::types::DeliveryId;

/// Default number of attempts per delivery.
pub const DEFAULT_DELIVERY_ATTEMPTS: u32 = 3;

/// Default delay before a failed delivery is retried.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Total attempts per delivery, first one included.
    pub delivery_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            delivery_attempts: DEFAULT_DELIVERY_ATTEMPTS,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
        }
    }
}

/// Routes jobs to the task executor and the hook dispatcher.
pub struct JobWorker<R, T> {
    config: WorkerConfig,
    executor: Arc<TaskExecutor<R>>,
    dispatcher: Arc<HookDispatcher<T>>,
    queue: Arc<dyn JobQueue>,
}

impl<R: TaskRunner, T: HookTransport> JobWorker<R, T> {
    pub fn new(
        config: WorkerConfig,
        executor: Arc<TaskExecutor<R>>,
        dispatcher: Arc<HookDispatcher<T>>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        JobWorker {
            config,
            executor,
            dispatcher,
            queue,
        }
    }

    /// Runs one job to completion.
    #[instrument(skip(self), fields(job = %job))]
    pub async fn handle(&self, job: Job) -> Result<(), OrchestratorError> {
        match job {
            Job::RunTask { task } => {
                let state = self.executor.execute(task).await?;
                debug!(state = %state, "task job done");
            }
            Job::DeliverHook { delivery } => {
                if let Err(e) = self.dispatcher.deliver(delivery).await {
                    self.retry_delivery(delivery, &e).await;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn retry_delivery(&self, delivery: DeliveryId, err: &DeliveryError) {
        let retryable = matches!(
            err,
            DeliveryError::Rejected { .. } | DeliveryError::Transport { .. }
        );
        if !retryable {
            warn!(error = %err, "delivery dropped");
            return;
        }
        let attempts = self
            .dispatcher
            .delivery(delivery)
            .await
            .map_or(u32::MAX, |d| d.attempts);
        if attempts >= self.config.delivery_attempts {
            warn!(attempts, error = %err, "delivery gave up");
            return;
        }

        debug!(attempts, delay = ?self.config.retry_delay, "delivery will be retried");
        tokio::time::sleep(self.config.retry_delay).await;
        if let Err(e) = self.queue.submit(Job::DeliverHook { delivery }) {
            warn!(error = %e, "failed to resubmit delivery");
        }
    }
}

impl<R: TaskRunner, T: HookTransport> JobWorker<R, T> {
    /// Takes jobs until the queue closes or `shutdown` fires. Jobs still
    /// running at shutdown are cancelled; recovery settles them on restart.
    pub async fn run(self: Arc<Self>, mut jobs: JobReceiver, shutdown: CancellationToken) {
        info!("job worker started");
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(result) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "job panicked");
                    }
                }
                job = jobs.recv() => match job {
                    Some(job) => {
                        let worker = self.clone();
                        running.spawn(async move {
                            if let Err(e) = worker.handle(job).await {
                                error!(error = %e, "job failed");
                            }
                        });
                    }
                    None => {
                        info!("job queue closed");
                        break;
                    }
                },
            }
        }

        if !running.is_empty() {
            info!(in_flight = running.len(), "cancelling in-flight jobs");
        }
        running.shutdown().await;
        info!("job worker stopped");
    }
}
