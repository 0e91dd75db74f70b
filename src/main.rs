use std::path::Path;
use std::sync::Arc;

use stackpilot::config::Config;
use stackpilot::engine::Orchestrator;
use stackpilot::events::EventBus;
use stackpilot::executor::{ScriptRunner, TaskExecutor};
use stackpilot::hooks::{HookDispatcher, HookTransport, ReqwestTransport, TransportError};
use stackpilot::jobs::{ChannelJobQueue, JobQueue, JobWorker};
use stackpilot::persistence::{
    EventLog, EventLogError, PersistedState, SnapshotError, journal_path, save_snapshot_atomic,
    snapshot_path, try_load_snapshot,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("HTTP client error: {0}")]
    Transport(#[from] TransportError),
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stackpilot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(state_dir = %config.state_dir.display(), "starting stackpilot");
    std::fs::create_dir_all(&config.state_dir)?;
    let snapshot_file = snapshot_path(&config.state_dir);
    let journal_file = journal_path(&config.state_dir);

    let (bus, events) = EventBus::channel();
    let (queue, job_rx) = ChannelJobQueue::new();
    let queue: Arc<dyn JobQueue> = Arc::new(queue);

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        bus,
        queue.clone(),
    ));
    let dispatcher = Arc::new(
        HookDispatcher::new(
            config.dispatcher.clone(),
            ReqwestTransport::new(&config.transport)?,
            queue.clone(),
        )
        .with_journal(EventLog::open(&journal_file)?),
    );

    restore(&orchestrator, &dispatcher, &snapshot_file, &journal_file).await?;

    let executor = Arc::new(TaskExecutor::new(
        orchestrator.clone(),
        ScriptRunner::new(config.scripts.clone()),
    ));
    let worker = Arc::new(JobWorker::new(
        config.worker.clone(),
        executor,
        dispatcher.clone(),
        queue,
    ));

    let shutdown = CancellationToken::new();
    let dispatcher_task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        async move { dispatcher.run(events, shutdown).await }
    });
    let worker_task = tokio::spawn(worker.run(job_rx, shutdown.clone()));
    let snapshot_task = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        let path = snapshot_file.clone();
        let period = config.snapshot_interval;
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = write_snapshot(&orchestrator, &dispatcher, &path).await {
                            error!(error = %e, "periodic snapshot failed");
                        }
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();

    for (name, task) in [
        ("dispatcher", dispatcher_task),
        ("worker", worker_task),
        ("snapshot", snapshot_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "background task failed");
        }
    }

    write_snapshot(&orchestrator, &dispatcher, &snapshot_file).await?;
    info!("stackpilot stopped");
    Ok(())
}

/// Loads the last snapshot, settles leftover work, and re-dispatches events
/// journaled after the snapshot was taken.
async fn restore<T: HookTransport>(
    orchestrator: &Orchestrator,
    dispatcher: &HookDispatcher<T>,
    snapshot_file: &Path,
    journal_file: &Path,
) -> Result<(), DaemonError> {
    let Some(state) = try_load_snapshot(snapshot_file)? else {
        info!("no snapshot, starting empty");
        return Ok(());
    };
    info!(snapshot_at = %state.snapshot_at, journal_seq = state.journal_seq, "restoring snapshot");
    let journal_seq = state.journal_seq;
    orchestrator.restore(state.orchestrator).await;
    dispatcher.restore(state.hooks).await;

    let recovery = orchestrator.recover().await;
    if !recovery.errored.is_empty() {
        warn!(tasks = ?recovery.errored, "tasks lost their executor");
    }
    let requeued = dispatcher.requeue_pending().await;

    let (entries, _) = EventLog::replay(journal_file)?;
    let mut replayed = 0;
    for entry in entries.into_iter().filter(|e| e.seq >= journal_seq) {
        dispatcher.dispatch(&entry.event).await;
        replayed += 1;
    }

    info!(
        resubmitted = recovery.resubmitted.len(),
        requeued, replayed, "recovery complete"
    );
    Ok(())
}

async fn write_snapshot<T: HookTransport>(
    orchestrator: &Orchestrator,
    dispatcher: &HookDispatcher<T>,
    path: &Path,
) -> Result<(), SnapshotError> {
    let journal_seq = dispatcher.journal_seq().await.unwrap_or(0);
    let hooks = dispatcher.snapshot().await;
    let state = PersistedState::new(orchestrator.snapshot().await, hooks, journal_seq);
    save_snapshot_atomic(path, &state)?;
    info!(journal_seq, "snapshot written");
    Ok(())
}
