//! The orchestrator: owns every stack and drives the pure state logic.
//!
//! # Locking
//!
//! Each stack (its settings, commits, statuses and tasks) sits behind its own
//! mutex. Each task's output stream has its own mutex. The maps that index
//! them are behind read-write locks held only long enough to clone a handle.
//! No operation holds more than one stack lock, so stacks never contend.
//!
//! Lock order, when nested: stack → task index → outputs → cancellations.
//!
//! # Events
//!
//! Mutators publish their events while still holding the stack lock, so the
//! bus sees one stack's events in the order the stack changed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::{Missing, OrchestratorError, Result};
use crate::events::{CommitRef, Event, EventBus, EventPayload, TaskRef};
use crate::jobs::{Job, JobQueue};
use crate::persistence::{OrchestratorSnapshot, StackRecord, TaskOutput};
use crate::state::aggregate::context_states;
use crate::state::{
    ChunkStream, CommitGraph, StatusTransition, Transition, active_task, apply, check_concurrency,
    check_deployable, commit_state, deployable, deployed, rollback_target,
};
use crate::types::{
    AggregateState, Chunk, Commit, CommitId, CommitInput, CommitStats, SimpleState, Stack,
    StackId, StackLock, StackSettings, Status, StatusState, Task, TaskId, TaskKind, TaskOutcome,
    TaskState,
};

/// Default minimum length of a commit prefix that `resolve` will trust.
pub const DEFAULT_MIN_PREFIX_LEN: usize = 6;

/// Initiator recorded on tasks admitted by continuous deployment.
pub const CONTINUOUS_DEPLOYMENT_INITIATOR: &str = "continuous-deployment";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Shorter prefixes are rejected as ambiguous before any lookup.
    pub min_prefix_len: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            min_prefix_len: DEFAULT_MIN_PREFIX_LEN,
        }
    }
}

/// A request to admit a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub stack: StackId,
    pub kind: TaskKind,
    /// Full SHA or prefix of the target commit.
    pub until: String,
    pub initiator: String,
    /// Filtered against the stack's allow-list on admission.
    pub env: BTreeMap<String, String>,
    pub force: bool,
}

impl TaskRequest {
    pub fn deploy(stack: StackId, until: impl Into<String>, initiator: impl Into<String>) -> Self {
        TaskRequest {
            stack,
            kind: TaskKind::Deploy,
            until: until.into(),
            initiator: initiator.into(),
            env: BTreeMap::new(),
            force: false,
        }
    }

    pub fn maintenance(
        stack: StackId,
        name: impl Into<String>,
        until: impl Into<String>,
        initiator: impl Into<String>,
    ) -> Self {
        TaskRequest {
            kind: TaskKind::Maintenance { name: name.into() },
            ..TaskRequest::deploy(stack, until, initiator)
        }
    }

    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// What a status report did to its commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub commit: CommitId,
    pub transition: StatusTransition,
    /// Deploy admitted by continuous deployment as a result, if any.
    pub deploy: Option<Task>,
}

/// A commit with its derived CI and deploy state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitView {
    pub commit: Commit,
    pub state: AggregateState,
    pub simple: SimpleState,
    /// Latest state per context, sorted by context.
    pub checks: Vec<(String, StatusState)>,
    pub deployable: bool,
    pub deployed: bool,
}

/// What `recover` did to tasks left over from a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Running tasks whose executor is gone, now in `error`.
    pub errored: Vec<TaskId>,
    /// Pending tasks submitted again.
    pub resubmitted: Vec<TaskId>,
}

/// Everything one stack owns.
#[derive(Debug)]
struct StackState {
    stack: Stack,
    graph: CommitGraph,
    tasks: BTreeMap<TaskId, Task>,
}

impl StackState {
    fn new(stack: Stack) -> Self {
        StackState {
            stack,
            graph: CommitGraph::new(),
            tasks: BTreeMap::new(),
        }
    }

    fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks
            .get(&id)
            .ok_or(OrchestratorError::NotFound(Missing::Task(id)))
    }

    fn task_event(&self, task: &Task, previous: Option<TaskState>, now: DateTime<Utc>) -> Option<Event> {
        let Some(until) = self.graph.get(task.until_commit) else {
            warn!(task = %task.id, commit = %task.until_commit, "task targets unknown commit, event dropped");
            return None;
        };
        let payload = EventPayload::Task {
            task: TaskRef::from(task),
            new_state: task.state,
            previous_state: previous,
            until: CommitRef::from(until),
            since: task
                .since_commit
                .and_then(|id| self.graph.get(id))
                .map(CommitRef::from),
        };
        Some(Event::new(self.stack.id.clone(), payload, now))
    }

    fn record(&self) -> StackRecord {
        StackRecord {
            stack: self.stack.clone(),
            commits: self.graph.iter().cloned().collect(),
            tasks: self.tasks.values().cloned().collect(),
        }
    }
}

/// Admission already decided; only bookkeeping remains.
struct Admission {
    kind: TaskKind,
    until: CommitId,
    initiator: String,
    env: BTreeMap<String, String>,
    force: bool,
    bypassed_ci: bool,
    rollback_of: Option<TaskId>,
}

type StackHandle = Arc<Mutex<StackState>>;
type OutputHandle = Arc<Mutex<ChunkStream>>;

/// Owns stacks, commits, tasks and task output.
pub struct Orchestrator {
    config: OrchestratorConfig,
    stacks: RwLock<HashMap<StackId, StackHandle>>,
    task_index: RwLock<HashMap<TaskId, StackId>>,
    outputs: RwLock<HashMap<TaskId, OutputHandle>>,
    cancellations: Mutex<HashMap<TaskId, CancellationToken>>,
    next_commit_id: AtomicU64,
    next_task_id: AtomicU64,
    events: EventBus,
    jobs: Arc<dyn JobQueue>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, events: EventBus, jobs: Arc<dyn JobQueue>) -> Self {
        Orchestrator {
            config,
            stacks: RwLock::new(HashMap::new()),
            task_index: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            next_commit_id: AtomicU64::new(1),
            next_task_id: AtomicU64::new(1),
            events,
            jobs,
        }
    }

    // ─── Lookups ────────────────────────────────────────────────────────────

    async fn stack_handle(&self, id: &StackId) -> Result<StackHandle> {
        self.stacks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(Missing::Stack(id.clone())))
    }

    async fn task_handle(&self, task: TaskId) -> Result<StackHandle> {
        let stack = self
            .task_index
            .read()
            .await
            .get(&task)
            .cloned()
            .ok_or(OrchestratorError::NotFound(Missing::Task(task)))?;
        self.stack_handle(&stack).await
    }

    async fn output_handle(&self, task: TaskId) -> Result<OutputHandle> {
        self.outputs
            .read()
            .await
            .get(&task)
            .cloned()
            .ok_or(OrchestratorError::NotFound(Missing::Task(task)))
    }

    // ─── Stacks ─────────────────────────────────────────────────────────────

    #[instrument(skip_all, fields(stack = %stack.id))]
    pub async fn add_stack(&self, stack: Stack) -> Result<Stack> {
        let mut stacks = self.stacks.write().await;
        if stacks.contains_key(&stack.id) {
            return Err(OrchestratorError::StackExists(stack.id));
        }
        stacks.insert(
            stack.id.clone(),
            Arc::new(Mutex::new(StackState::new(stack.clone()))),
        );
        info!("stack added");
        Ok(stack)
    }

    pub async fn stack(&self, id: &StackId) -> Result<Stack> {
        let handle = self.stack_handle(id).await?;
        let state = handle.lock().await;
        Ok(state.stack.clone())
    }

    pub async fn stack_ids(&self) -> Vec<StackId> {
        let mut ids: Vec<StackId> = self.stacks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replaces a stack's settings. Enabling continuous deployment may admit
    /// a deploy straight away.
    #[instrument(skip(self, settings), fields(stack = %id))]
    pub async fn update_settings(&self, id: &StackId, settings: StackSettings) -> Result<Stack> {
        let handle = self.stack_handle(id).await?;
        let mut state = handle.lock().await;
        state.stack.settings = settings;
        debug!("settings updated");
        self.continuous_deploy(&mut state, Utc::now()).await;
        Ok(state.stack.clone())
    }

    /// Locks a stack against continuous deployment. Locking a locked stack
    /// keeps the original lock.
    #[instrument(skip(self, reason, locked_by), fields(stack = %id))]
    pub async fn lock_stack(
        &self,
        id: &StackId,
        reason: impl Into<String>,
        locked_by: impl Into<String>,
    ) -> Result<Stack> {
        let handle = self.stack_handle(id).await?;
        let mut state = handle.lock().await;
        if state.stack.is_locked() {
            debug!("stack already locked");
            return Ok(state.stack.clone());
        }
        let now = Utc::now();
        let lock = StackLock {
            reason: reason.into(),
            locked_by: locked_by.into(),
            locked_at: now,
        };
        state.stack.lock = Some(lock.clone());
        info!(locked_by = %lock.locked_by, "stack locked");
        self.events.publish(Event::new(
            id.clone(),
            EventPayload::Lock {
                locked: true,
                lock: Some(lock),
            },
            now,
        ));
        Ok(state.stack.clone())
    }

    #[instrument(skip(self), fields(stack = %id))]
    pub async fn unlock_stack(&self, id: &StackId) -> Result<Stack> {
        let handle = self.stack_handle(id).await?;
        let mut state = handle.lock().await;
        if state.stack.lock.take().is_none() {
            debug!("stack not locked");
            return Ok(state.stack.clone());
        }
        let now = Utc::now();
        info!("stack unlocked");
        self.events.publish(Event::new(
            id.clone(),
            EventPayload::Lock {
                locked: false,
                lock: None,
            },
            now,
        ));
        self.continuous_deploy(&mut state, now).await;
        Ok(state.stack.clone())
    }

    // ─── Commits ────────────────────────────────────────────────────────────

    /// Appends a commit with the next sequence id.
    #[instrument(skip(self, input), fields(stack = %stack, sha = %input.sha.short()))]
    pub async fn add_commit(&self, stack: &StackId, input: CommitInput) -> Result<Commit> {
        let handle = self.stack_handle(stack).await?;
        let mut state = handle.lock().await;
        if state.graph.find(&input.sha).is_some() {
            return Err(OrchestratorError::DuplicateCommit(input.sha));
        }

        let id = CommitId(self.next_commit_id.fetch_add(1, Ordering::SeqCst));
        let commit = state.graph.insert(Commit::from_input(id, input))?.clone();
        debug!(commit = %id, "commit added");

        // Under ignore-CI a commit is deployable from birth.
        self.continuous_deploy(&mut state, Utc::now()).await;
        Ok(commit)
    }

    /// Records line counts fetched after ingestion. Stats are set once;
    /// later calls leave them alone.
    pub async fn backfill_stats(
        &self,
        stack: &StackId,
        reference: &str,
        additions: u32,
        deletions: u32,
    ) -> Result<Commit> {
        let handle = self.stack_handle(stack).await?;
        let mut state = handle.lock().await;
        let id = state.graph.resolve(reference, self.config.min_prefix_len)?.id;
        let commit = state
            .graph
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(Missing::Commit(reference.to_string())))?;
        if commit.stats.is_none() {
            commit.stats = Some(CommitStats {
                additions,
                deletions,
            });
        }
        Ok(commit.clone())
    }

    /// Detaches a commit and everything newer after a history rewrite.
    #[instrument(skip(self), fields(stack = %stack))]
    pub async fn detach_commit(&self, stack: &StackId, reference: &str) -> Result<Vec<CommitId>> {
        let handle = self.stack_handle(stack).await?;
        let mut state = handle.lock().await;
        let id = state.graph.resolve(reference, self.config.min_prefix_len)?.id;
        let detached = state.graph.detach(id);
        info!(from = %id, count = detached.len(), "commits detached");
        Ok(detached)
    }

    pub async fn resolve(&self, stack: &StackId, reference: &str) -> Result<Commit> {
        let handle = self.stack_handle(stack).await?;
        let state = handle.lock().await;
        Ok(state
            .graph
            .resolve(reference, self.config.min_prefix_len)?
            .clone())
    }

    /// Resolves a commit and derives its CI and deploy state.
    pub async fn commit(&self, stack: &StackId, reference: &str) -> Result<CommitView> {
        let handle = self.stack_handle(stack).await?;
        let state = handle.lock().await;
        let commit = state.graph.resolve(reference, self.config.min_prefix_len)?;
        let settings = &state.stack.settings;
        let aggregate = commit_state(commit, settings);
        Ok(CommitView {
            commit: commit.clone(),
            state: aggregate,
            simple: aggregate.simple(),
            checks: context_states(&commit.statuses),
            deployable: deployable(commit, settings),
            deployed: deployed(commit, state.stack.last_deployed_commit),
        })
    }

    /// Applies one CI status to a commit.
    ///
    /// The before and after verdicts are computed under the stack lock, so
    /// concurrent reports for the same commit cannot produce duplicate events.
    /// Emits `commit_status` when the aggregate moves and `deployable_status`
    /// when the simple state moves.
    #[instrument(skip(self, status), fields(stack = %stack, context = %status.context))]
    pub async fn ingest_status(
        &self,
        stack: &StackId,
        sha: &str,
        status: Status,
    ) -> Result<StatusUpdate> {
        let handle = self.stack_handle(stack).await?;
        let mut state = handle.lock().await;
        let now = Utc::now();
        let settings = state.stack.settings.clone();
        let context = status.context.clone();

        let id = state.graph.resolve(sha, self.config.min_prefix_len)?.id;
        let commit = state
            .graph
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(Missing::Commit(sha.to_string())))?;
        let before = commit_state(commit, &settings);
        commit.statuses.push(status);
        let after = commit_state(commit, &settings);
        let transition = StatusTransition::new(before, after);
        let commit_ref = CommitRef::from(&*commit);
        let now_deployable = deployable(commit, &settings);

        if transition.state_changed() {
            debug!(previous = %before, current = %after, "commit state changed");
            self.events.publish(Event::new(
                stack.clone(),
                EventPayload::CommitStatus {
                    commit: commit_ref.clone(),
                    context,
                    new_state: after,
                    previous_state: before,
                },
                now,
            ));
        }

        let mut deploy = None;
        if transition.simple_changed() {
            info!(
                previous = %transition.previous_simple(),
                current = %transition.current_simple(),
                "deployable state changed"
            );
            self.events.publish(Event::new(
                stack.clone(),
                EventPayload::DeployableStatus {
                    commit: commit_ref,
                    new_state: transition.current_simple(),
                    previous_state: transition.previous_simple(),
                    deployable: now_deployable,
                },
                now,
            ));
            if now_deployable {
                deploy = self.continuous_deploy(&mut state, now).await;
            }
        }

        Ok(StatusUpdate {
            commit: id,
            transition,
            deploy,
        })
    }

    // ─── Admission ──────────────────────────────────────────────────────────

    /// Admits a task after the concurrency guard and, for deploy-type tasks,
    /// the CI gate. The task is created `pending` and submitted for execution.
    #[instrument(skip_all, fields(stack = %request.stack, kind = request.kind.name(), initiator = %request.initiator))]
    pub async fn create_task(&self, request: TaskRequest) -> Result<Task> {
        let handle = self.stack_handle(&request.stack).await?;
        let mut state = handle.lock().await;

        let target = state
            .graph
            .resolve(&request.until, self.config.min_prefix_len)?;
        check_concurrency(state.tasks.values(), request.force)?;
        let bypassed_ci =
            check_deployable(&request.kind, target, &state.stack.settings, request.force)?;
        if bypassed_ci {
            warn!(sha = %target.sha.short(), "CI gate bypassed by force");
        }

        let admission = Admission {
            kind: request.kind,
            until: target.id,
            initiator: request.initiator,
            env: request.env,
            force: request.force,
            bypassed_ci,
            rollback_of: None,
        };
        Ok(self.admit(&mut state, admission, Utc::now()).await)
    }

    /// Admits a rollback of `reference` to the most recent other successful
    /// deploy on the stack. Rollbacks are not gated on CI.
    #[instrument(skip(self, initiator), fields(task = %reference))]
    pub async fn create_rollback(
        &self,
        reference: TaskId,
        initiator: impl Into<String>,
        force: bool,
    ) -> Result<Task> {
        let handle = self.task_handle(reference).await?;
        let mut state = handle.lock().await;
        state.task(reference)?;

        let until = rollback_target(state.tasks.values(), reference)
            .map(|t| t.until_commit)
            .ok_or(OrchestratorError::NotFound(Missing::RollbackTarget(reference)))?;
        check_concurrency(state.tasks.values(), force)?;

        let admission = Admission {
            kind: TaskKind::Rollback,
            until,
            initiator: initiator.into(),
            env: BTreeMap::new(),
            force,
            bypassed_ci: false,
            rollback_of: Some(reference),
        };
        Ok(self.admit(&mut state, admission, Utc::now()).await)
    }

    async fn admit(&self, state: &mut StackState, admission: Admission, now: DateTime<Utc>) -> Task {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst));
        let task = Task {
            id,
            stack: state.stack.id.clone(),
            kind: admission.kind,
            state: TaskState::Pending,
            until_commit: admission.until,
            since_commit: state.stack.last_deployed_commit,
            initiator: admission.initiator,
            env: state.stack.settings.filter_env(admission.env),
            force: admission.force,
            bypassed_ci: admission.bypassed_ci,
            rollback_of: admission.rollback_of,
            rollback_once_aborted: false,
            created_at: now,
            started_at: None,
            ended_at: None,
        };
        state.tasks.insert(id, task.clone());

        self.task_index
            .write()
            .await
            .insert(id, state.stack.id.clone());
        self.outputs
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(ChunkStream::new())));
        self.cancellations
            .lock()
            .await
            .insert(id, CancellationToken::new());

        info!(task = %id, kind = task.kind.name(), until = %task.until_commit, "task admitted");
        if let Some(event) = state.task_event(&task, None, now) {
            self.events.publish(event);
        }
        if let Err(e) = self.jobs.submit(Job::RunTask { task: id }) {
            warn!(task = %id, error = %e, "failed to submit task, it stays pending until recovery");
        }
        task
    }

    /// Admits a deploy of the newest deployable commit if the stack wants one.
    async fn continuous_deploy(&self, state: &mut StackState, now: DateTime<Utc>) -> Option<Task> {
        let stack = &state.stack;
        if !stack.settings.continuous_deployment || stack.is_locked() {
            return None;
        }
        if active_task(state.tasks.values()).is_some() {
            return None;
        }
        let target = state
            .graph
            .next_deploy_target(&stack.settings, stack.last_deployed_commit)?
            .id;

        // A commit gets one automatic attempt; a failed deploy is not retried.
        if state
            .tasks
            .values()
            .any(|t| t.kind.is_deploy_type() && t.until_commit == target)
        {
            debug!(stack = %stack.id, commit = %target, "commit already attempted, skipping");
            return None;
        }

        info!(stack = %stack.id, commit = %target, "continuous deployment triggered");
        let admission = Admission {
            kind: TaskKind::Deploy,
            until: target,
            initiator: CONTINUOUS_DEPLOYMENT_INITIATOR.to_string(),
            env: BTreeMap::new(),
            force: false,
            bypassed_ci: false,
            rollback_of: None,
        };
        Some(self.admit(state, admission, now).await)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Moves a pending task to running. Executor-facing.
    ///
    /// Returns the task and the token the executor must watch for aborts.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn start_task(&self, id: TaskId) -> Result<(Task, CancellationToken)> {
        let handle = self.task_handle(id).await?;
        let mut state = handle.lock().await;
        let now = Utc::now();

        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(Missing::Task(id)))?;
        let previous = apply(task, Transition::Start, now)?;
        let task = task.clone();

        let token = self
            .cancellations
            .lock()
            .await
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone();

        info!("task started");
        if let Some(event) = state.task_event(&task, previous, now) {
            self.events.publish(event);
        }
        Ok((task, token))
    }

    /// Records how a running task ended. Executor-facing.
    ///
    /// Fails with `InvalidTransition` if an abort already landed. A successful
    /// deploy or rollback becomes the stack's last deployed commit. Whatever
    /// the kind, the freed stack is offered to continuous deployment.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn finish_task(&self, id: TaskId, outcome: TaskOutcome) -> Result<Task> {
        let handle = self.task_handle(id).await?;
        let mut state = handle.lock().await;
        let now = Utc::now();

        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(Missing::Task(id)))?;
        let previous = apply(task, Transition::Finish(outcome), now)?;
        let task = task.clone();
        self.cancellations.lock().await.remove(&id);

        if task.state == TaskState::Success && task.kind.is_deploy_type() {
            state.stack.last_deployed_commit = Some(task.until_commit);
            info!(commit = %task.until_commit, "stack deployed");
        }
        info!(state = %task.state, "task finished");
        if let Some(event) = state.task_event(&task, previous, now) {
            self.events.publish(event);
        }

        self.continuous_deploy(&mut state, now).await;
        Ok(task)
    }

    /// Aborts a pending or running task and signals its executor.
    ///
    /// Aborting an aborted task is a no-op. With `rollback_once_aborted`, an
    /// aborted deploy is followed by a forced rollback to the previous
    /// successful deploy, if there is one. Otherwise the freed stack is
    /// offered to continuous deployment.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn abort_task(&self, id: TaskId, rollback_once_aborted: bool) -> Result<Task> {
        let handle = self.task_handle(id).await?;
        let mut state = handle.lock().await;
        let now = Utc::now();

        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(Missing::Task(id)))?;
        let Some(previous) = apply(task, Transition::Abort, now)? else {
            debug!("task already aborted");
            return Ok(task.clone());
        };
        task.rollback_once_aborted = rollback_once_aborted;
        let task = task.clone();

        if let Some(token) = self.cancellations.lock().await.remove(&id) {
            token.cancel();
        }
        info!(from = %previous, "task aborted");
        if let Some(event) = state.task_event(&task, Some(previous), now) {
            self.events.publish(event);
        }

        let rollback_until = if rollback_once_aborted && task.kind == TaskKind::Deploy {
            let until = rollback_target(state.tasks.values(), id).map(|t| t.until_commit);
            if until.is_none() {
                warn!("no earlier successful deploy, rollback skipped");
            }
            until
        } else {
            None
        };

        match rollback_until {
            Some(until) => {
                let admission = Admission {
                    kind: TaskKind::Rollback,
                    until,
                    initiator: task.initiator.clone(),
                    env: BTreeMap::new(),
                    force: true,
                    bypassed_ci: false,
                    rollback_of: Some(id),
                };
                self.admit(&mut state, admission, now).await;
            }
            None => {
                self.continuous_deploy(&mut state, now).await;
            }
        }
        Ok(task)
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub async fn task(&self, id: TaskId) -> Result<Task> {
        let handle = self.task_handle(id).await?;
        let state = handle.lock().await;
        state.task(id).cloned()
    }

    /// All tasks on a stack, oldest first.
    pub async fn tasks(&self, stack: &StackId) -> Result<Vec<Task>> {
        let handle = self.stack_handle(stack).await?;
        let state = handle.lock().await;
        Ok(state.tasks.values().cloned().collect())
    }

    pub async fn active_task(&self, stack: &StackId) -> Result<Option<Task>> {
        let handle = self.stack_handle(stack).await?;
        let state = handle.lock().await;
        Ok(active_task(state.tasks.values()).cloned())
    }

    /// The commit a task targets.
    pub async fn task_target(&self, id: TaskId) -> Result<Commit> {
        let handle = self.task_handle(id).await?;
        let state = handle.lock().await;
        let until = state.task(id)?.until_commit;
        state
            .graph
            .get(until)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(Missing::Commit(until.to_string())))
    }

    /// Commits a task ships: `(since, until]`, detached ones excluded.
    pub async fn commits_in_range(&self, id: TaskId) -> Result<Vec<Commit>> {
        let handle = self.task_handle(id).await?;
        let state = handle.lock().await;
        let task = state.task(id)?;
        Ok(state
            .graph
            .range(task.since_commit, task.until_commit)
            .into_iter()
            .cloned()
            .collect())
    }

    // ─── Output ─────────────────────────────────────────────────────────────

    pub async fn append_chunk(&self, task: TaskId, text: impl Into<String>) -> Result<Chunk> {
        let output = self.output_handle(task).await?;
        let mut stream = output.lock().await;
        Ok(stream.append(text, Utc::now()).clone())
    }

    /// Chunks with sequence at or after `from`.
    pub async fn read_chunks(&self, task: TaskId, from: u64) -> Result<Vec<Chunk>> {
        let output = self.output_handle(task).await?;
        let stream = output.lock().await;
        Ok(stream.read_from(from).to_vec())
    }

    // ─── Persistence ────────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> OrchestratorSnapshot {
        let handles: Vec<StackHandle> = self.stacks.read().await.values().cloned().collect();
        let mut stacks = Vec::with_capacity(handles.len());
        for handle in handles {
            stacks.push(handle.lock().await.record());
        }
        stacks.sort_by(|a, b| a.stack.id.cmp(&b.stack.id));

        let outputs_map: Vec<(TaskId, OutputHandle)> = self
            .outputs
            .read()
            .await
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();
        let mut outputs = Vec::with_capacity(outputs_map.len());
        for (task, handle) in outputs_map {
            outputs.push(TaskOutput {
                task,
                chunks: handle.lock().await.chunks().to_vec(),
            });
        }
        outputs.sort_by_key(|o| o.task);

        OrchestratorSnapshot {
            next_commit_id: self.next_commit_id.load(Ordering::SeqCst),
            next_task_id: self.next_task_id.load(Ordering::SeqCst),
            stacks,
            outputs,
        }
    }

    /// Replaces all state with a snapshot. Counters never go backwards past
    /// an id already in use.
    pub async fn restore(&self, snapshot: OrchestratorSnapshot) {
        let mut stacks = HashMap::new();
        let mut task_index = HashMap::new();
        let mut outputs: HashMap<TaskId, OutputHandle> = HashMap::new();
        let mut cancellations = HashMap::new();
        let mut max_commit = 0;
        let mut max_task = 0;

        for record in snapshot.stacks {
            let graph = CommitGraph::from_commits(record.commits);
            max_commit = graph.iter().map(|c| c.id.0).max().unwrap_or(0).max(max_commit);

            let mut tasks = BTreeMap::new();
            for task in record.tasks {
                max_task = max_task.max(task.id.0);
                task_index.insert(task.id, record.stack.id.clone());
                outputs.insert(task.id, Arc::new(Mutex::new(ChunkStream::new())));
                if task.state.is_active() {
                    cancellations.insert(task.id, CancellationToken::new());
                }
                tasks.insert(task.id, task);
            }

            let id = record.stack.id.clone();
            let state = StackState {
                stack: record.stack,
                graph,
                tasks,
            };
            stacks.insert(id, Arc::new(Mutex::new(state)));
        }

        for output in snapshot.outputs {
            if task_index.contains_key(&output.task) {
                outputs.insert(
                    output.task,
                    Arc::new(Mutex::new(ChunkStream::from_chunks(output.chunks))),
                );
            }
        }

        let restored = stacks.len();
        *self.stacks.write().await = stacks;
        *self.task_index.write().await = task_index;
        *self.outputs.write().await = outputs;
        *self.cancellations.lock().await = cancellations;
        self.next_commit_id
            .store(snapshot.next_commit_id.max(max_commit + 1), Ordering::SeqCst);
        self.next_task_id
            .store(snapshot.next_task_id.max(max_task + 1), Ordering::SeqCst);
        info!(stacks = restored, "orchestrator state restored");
    }

    /// Settles tasks left over from a previous process.
    ///
    /// A running task lost its executor and goes to `error`. A pending task
    /// never started and is submitted again.
    pub async fn recover(&self) -> Recovery {
        let mut recovery = Recovery::default();
        let handles: Vec<StackHandle> = self.stacks.read().await.values().cloned().collect();

        for handle in handles {
            let mut state = handle.lock().await;
            let now = Utc::now();
            let active: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|t| t.state.is_active())
                .map(|t| t.id)
                .collect();

            for id in active {
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                if task.state == TaskState::Pending {
                    if let Err(e) = self.jobs.submit(Job::RunTask { task: id }) {
                        warn!(task = %id, error = %e, "failed to resubmit task");
                    }
                    recovery.resubmitted.push(id);
                    continue;
                }

                let previous = match apply(task, Transition::Finish(TaskOutcome::Error), now) {
                    Ok(previous) => previous,
                    Err(e) => {
                        warn!(task = %id, error = %e, "could not settle task");
                        continue;
                    }
                };
                let task = task.clone();
                self.cancellations.lock().await.remove(&id);
                warn!(task = %id, "executor lost, task marked as error");
                if let Some(event) = state.task_event(&task, previous, now) {
                    self.events.publish(event);
                }
                recovery.errored.push(id);
            }
        }

        recovery.errored.sort();
        recovery.resubmitted.sort();
        for id in &recovery.errored {
            if let Err(e) = self.append_chunk(*id, "executor lost, task marked as error\n").await {
                warn!(task = %id, error = %e, "failed to record recovery note");
            }
        }
        recovery
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
