//! Task execution.
//!
//! [`TaskExecutor`] owns the executor side of the task lifecycle: it starts
//! a pending task, hands the work to a [`TaskRunner`], and records how it
//! ended. Aborts are cooperative: the runner sees the task's cancellation
//! token through its [`TaskContext`] and is expected to stop at a safe point.

use std::collections::BTreeMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::{Orchestrator, OrchestratorError};
use crate::types::{Commit, Task, TaskId, TaskKind, TaskOutcome, TaskState};

/// The runner could not do its job at all. Maps to the `error` state.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// What a runner sees while it works.
pub struct TaskContext {
    task: Task,
    target: Commit,
    token: CancellationToken,
    orchestrator: Arc<Orchestrator>,
}

impl TaskContext {
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The commit being deployed (or rolled back to).
    pub fn target(&self) -> &Commit {
        &self.target
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Appends to the task's output. Failures are logged, never fatal.
    pub async fn write(&self, text: impl Into<String>) {
        if let Err(e) = self.orchestrator.append_chunk(self.task.id, text).await {
            warn!(task = %self.task.id, error = %e, "failed to record task output");
        }
    }
}

/// Does the actual work of a task.
///
/// `Ok(Failed)` means the work ran and failed; `Err` means it could not run.
pub trait TaskRunner: Send + Sync + 'static {
    fn run(
        &self,
        ctx: &TaskContext,
    ) -> impl Future<Output = Result<TaskOutcome, RunnerError>> + Send;
}

/// Drives admitted tasks through their lifecycle.
pub struct TaskExecutor<R> {
    orchestrator: Arc<Orchestrator>,
    runner: R,
}

impl<R: TaskRunner> TaskExecutor<R> {
    pub fn new(orchestrator: Arc<Orchestrator>, runner: R) -> Self {
        TaskExecutor {
            orchestrator,
            runner,
        }
    }

    /// Runs one task to completion and returns the state it ended in.
    ///
    /// Safe to call more than once for the same task: a task that already
    /// left `pending` is not run again.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn execute(&self, id: TaskId) -> Result<TaskState, OrchestratorError> {
        let (task, token) = match self.orchestrator.start_task(id).await {
            Ok(started) => started,
            Err(OrchestratorError::InvalidTransition { from, .. }) => {
                debug!(state = %from, "task already left pending, skipping");
                return Ok(from);
            }
            Err(e) => return Err(e),
        };
        let target = self.orchestrator.task_target(id).await?;

        let ctx = TaskContext {
            task,
            target,
            token,
            orchestrator: self.orchestrator.clone(),
        };

        let outcome = match self.runner.run(&ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "runner failed");
                ctx.write(format!("runner error: {e}\n")).await;
                TaskOutcome::Error
            }
        };

        if ctx.is_cancelled() {
            info!("task stopped after abort");
            return Ok(TaskState::Aborted);
        }

        match self.orchestrator.finish_task(id, outcome).await {
            Ok(task) => Ok(task.state),
            // An abort landed between the runner returning and now.
            Err(OrchestratorError::InvalidTransition {
                from: TaskState::Aborted,
                ..
            }) => Ok(TaskState::Aborted),
            Err(e) => Err(e),
        }
    }
}

/// Default time an aborted script gets to exit after SIGTERM.
pub const DEFAULT_KILL_GRACE_SECS: u64 = 10;

/// Shell commands run for each kind of task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptConfig {
    pub deploy: String,
    pub rollback: String,
    /// Maintenance tasks by name.
    pub tasks: BTreeMap<String, String>,
    /// How long an aborted script may take to stop before it is killed.
    pub kill_grace: Duration,
}

/// Runs a shell command per task and streams its output as chunks.
///
/// The command gets the task's environment overrides plus `STACKPILOT_*`
/// variables describing the task. Output is split on newlines and decoded
/// lossily. On abort the child gets SIGTERM, then SIGKILL once
/// `kill_grace` runs out.
pub struct ScriptRunner {
    config: ScriptConfig,
}

impl ScriptRunner {
    pub fn new(config: ScriptConfig) -> Self {
        ScriptRunner { config }
    }

    fn command_for(&self, kind: &TaskKind) -> Option<&str> {
        match kind {
            TaskKind::Deploy => Some(&self.config.deploy),
            TaskKind::Rollback => Some(&self.config.rollback),
            TaskKind::Maintenance { name } => self.config.tasks.get(name).map(String::as_str),
        }
    }

    fn build(&self, script: &str, ctx: &TaskContext) -> Command {
        let task = ctx.task();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("{script} 2>&1"));
        cmd.envs(&task.env);
        cmd.env("STACKPILOT_TASK_ID", task.id.0.to_string());
        cmd.env("STACKPILOT_TASK_KIND", task.kind.name());
        cmd.env("STACKPILOT_STACK", task.stack.as_str());
        cmd.env("STACKPILOT_SHA", ctx.target().sha.as_str());
        cmd.env("STACKPILOT_INITIATOR", &task.initiator);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl TaskRunner for ScriptRunner {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, RunnerError> {
        let Some(script) = self.command_for(&ctx.task().kind) else {
            return Err(RunnerError::Other(format!(
                "no command configured for {}",
                ctx.task().kind.name()
            )));
        };

        let mut child = self.build(script, ctx).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Other("child has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).split(b'\n');

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    stop(&mut child, self.config.kill_grace).await?;
                    ctx.write("aborted\n").await;
                    return Ok(TaskOutcome::Failed);
                }
                line = lines.next_segment() => match line? {
                    Some(line) => ctx.write(format!("{}\n", String::from_utf8_lossy(&line))).await,
                    None => break,
                },
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(TaskOutcome::Success)
        } else {
            ctx.write(format!("command exited with {status}\n")).await;
            Ok(TaskOutcome::Failed)
        }
    }
}

/// Asks the child to exit and kills it if it is still there after `grace`.
async fn stop(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    if let Some(pid) = child.id()
        && terminate(pid)
    {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                debug!(status = %status?, "script stopped after SIGTERM");
                return Ok(());
            }
            Err(_) => warn!(pid, ?grace, "script ignored SIGTERM, killing"),
        }
    }
    child.start_kill()?;
    child.wait().await?;
    Ok(())
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: the pid is our own unreaped child.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}
