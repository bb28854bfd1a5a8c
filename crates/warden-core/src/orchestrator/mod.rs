//! Scheduler loop: runs tasks at their firing instants, serialized per
//! repository, with cooperative cancellation and config reload.
//!
//! The loop is the sole owner of scheduler state. Everything reaches it
//! through channels: new tasks (including follow-ups scheduled by running
//! tasks), control messages (cancel, reload), and completion notices from
//! spawned runners. Tasks on distinct repos run in parallel; a task whose
//! repo slot is held is requeued at its original time and retried once the
//! slot frees.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_db::models::{OpStatus, Operation};

use crate::config::{Config, ConfigHandle, Plan};
use crate::events::Broker;
use crate::logstore::LogStore;
use crate::oplog::OpLog;
use crate::repo::RepoRegistry;
use crate::tasks::backup::BackupTask;
use crate::tasks::index_snapshots::IndexSnapshotsTask;
use crate::tasks::{CancelSignal, Task, TaskContext, TaskKey, TaskKind, TaskScheduler};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long shutdown waits for running tasks to return before marking
    /// their operations cancelled directly.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Retry floor when due tasks are blocked on a busy repo slot and no
/// completion notice is expected to free it (e.g. a service-held slot).
const BLOCKED_RETRY: Duration = Duration::from_millis(500);

/// Control messages into the scheduler loop.
enum ControlMsg {
    Cancel { op_id: i64, status: OpStatus },
    Reload(Config),
}

/// Completion notice from a spawned runner, returning task ownership.
struct TaskDone {
    key: TaskKey,
    task: Box<dyn Task>,
    result: anyhow::Result<()>,
}

/// Handle to a running scheduler loop.
pub struct Orchestrator {
    scheduler: TaskScheduler,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    shutdown: CancellationToken,
    join: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Recover orphaned operations, seed the task set from the config, and
    /// start the scheduler loop.
    pub async fn start(
        oplog: Arc<OpLog>,
        broker: Broker,
        registry: Arc<RepoRegistry>,
        logstore: LogStore,
        config: ConfigHandle,
        options: OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        let (task_tx, task_rx) = mpsc::unbounded_channel::<Box<dyn Task>>();
        let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlMsg>();
        let shutdown = CancellationToken::new();
        let scheduler = TaskScheduler::new(task_tx);

        let ctx = TaskContext {
            oplog,
            broker,
            registry,
            logstore,
            config,
            scheduler: scheduler.clone(),
        };

        // 1. Restart recovery: operations left unfinished by a previous
        //    process are cancelled by the system.
        recover_orphans(&ctx).await?;

        // 2. Seed: one recurring backup task per plan, one snapshot-index
        //    task per repo.
        let snapshot = ctx.config.current();
        seed_tasks(&ctx, &snapshot, None);

        // 3. Run the loop.
        let join = tokio::spawn(run_loop(ctx, task_rx, control_rx, shutdown.clone(), options));

        Ok(Self {
            scheduler,
            control_tx,
            shutdown,
            join: std::sync::Mutex::new(Some(join)),
        })
    }

    /// Handle for enqueuing one-shot tasks.
    pub fn scheduler(&self) -> TaskScheduler {
        self.scheduler.clone()
    }

    /// Request cancellation of an operation. Returns immediately; a running
    /// task observes its token, a pending row is marked directly.
    pub fn cancel(&self, op_id: i64, status: OpStatus) {
        let _ = self.control_tx.send(ControlMsg::Cancel { op_id, status });
    }

    /// Swap in a new (already validated) config and diff the task set.
    pub fn reload(&self, config: Config) {
        let _ = self.control_tx.send(ControlMsg::Reload(config));
    }

    /// Cancel everything and wait for the loop to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let join = self.join.lock().expect("join lock poisoned").take();
        if let Some(join) = join {
            if let Err(err) = join.await {
                error!(error = %err, "scheduler loop panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Startup helpers
// ---------------------------------------------------------------------------

async fn recover_orphans(ctx: &TaskContext) -> anyhow::Result<()> {
    let orphans = ctx.oplog.unfinished().await?;
    let now = Utc::now().timestamp_millis();
    for mut op in orphans {
        warn!(op_id = op.id, status = %op.status, "cancelling operation orphaned by restart");
        op.status = OpStatus::SystemCancelled;
        op.ended_at_ms = Some(now.max(op.started_at_ms));
        ctx.oplog.update_terminal(&op).await?;
    }
    Ok(())
}

/// Schedule the standing tasks for a config. With `previous` set, only
/// plans/repos new relative to it are seeded (reload path).
fn seed_tasks(ctx: &TaskContext, config: &Config, previous: Option<&Config>) {
    for plan in &config.plans {
        if previous.is_some_and(|prev| prev.plan(&plan.id).is_some()) {
            continue;
        }
        schedule_plan_backup(ctx, plan);
    }
    for repo in &config.repos {
        if previous.is_some_and(|prev| prev.repo(&repo.id).is_some()) {
            continue;
        }
        ctx.scheduler
            .schedule(Box::new(IndexSnapshotsTask::one_shot(&repo.id, None, None)));
    }
}

fn schedule_plan_backup(ctx: &TaskContext, plan: &Plan) {
    match BackupTask::scheduled(plan) {
        Ok(task) => ctx.scheduler.schedule(Box::new(task)),
        Err(err) => {
            // Validation happens before a config is accepted; reaching this
            // means the schedule broke after acceptance.
            error!(plan_id = %plan.id, error = %err, "cannot schedule plan backup");
        }
    }
}

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

struct HeapEntry {
    at_ms: i64,
    seq: u64,
    key: TaskKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at_ms, self.seq).cmp(&(other.at_ms, other.seq))
    }
}

enum TaskSlot {
    Idle(Box<dyn Task>),
    Running { op_id: Option<i64> },
}

struct TaskEntry {
    slot: TaskSlot,
    /// Sequence of this task's live heap entry; entries carrying another
    /// seq are stale and skipped on pop.
    heap_seq: u64,
}

#[derive(Default)]
struct LoopState {
    tasks: HashMap<TaskKey, TaskEntry>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// Pending-op id -> owning task, for cancelling not-yet-running work.
    op_index: HashMap<i64, TaskKey>,
    /// In-flight op id -> its cancel signal.
    cancels: HashMap<i64, CancelSignal>,
    /// Keys dropped while running; retired instead of rescheduled on return.
    retired: HashSet<TaskKey>,
    /// Running plan-backup tasks whose plan mutated mid-run; replaced with
    /// a task for the new plan at the next firing boundary.
    replace_on_done: HashMap<TaskKey, Plan>,
    seq: u64,
}

impl LoopState {
    fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|entry| matches!(entry.slot, TaskSlot::Running { .. }))
            .count()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn insert_idle(&mut self, task: Box<dyn Task>, at_ms: i64) {
        let key = task.key();
        if let Some(op_id) = task.op_id() {
            self.op_index.insert(op_id, key.clone());
        }
        let seq = self.next_seq();
        self.tasks.insert(
            key.clone(),
            TaskEntry {
                slot: TaskSlot::Idle(task),
                heap_seq: seq,
            },
        );
        self.heap.push(Reverse(HeapEntry { at_ms, seq, key }));
    }

    fn forget_op(&mut self, op_id: Option<i64>) {
        if let Some(op_id) = op_id {
            self.op_index.remove(&op_id);
            self.cancels.remove(&op_id);
        }
    }
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

async fn run_loop(
    ctx: TaskContext,
    mut task_rx: mpsc::UnboundedReceiver<Box<dyn Task>>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    shutdown: CancellationToken,
    options: OrchestratorConfig,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskDone>();
    let mut state = LoopState::default();

    info!("scheduler loop started");

    loop {
        // Dispatch everything due; learn whether something is blocked on a
        // busy repo slot.
        let blocked = dispatch_due(&mut state, &ctx, &done_tx, &shutdown).await;

        let wait = next_wait(&state, blocked);
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(task) = task_rx.recv() => {
                admit_task(&mut state, &ctx, task).await;
                // Drain whatever else queued up behind it.
                while let Ok(task) = task_rx.try_recv() {
                    admit_task(&mut state, &ctx, task).await;
                }
            }

            Some(msg) = control_rx.recv() => {
                handle_control(&mut state, &ctx, msg).await;
            }

            Some(done) = done_rx.recv() => {
                handle_done(&mut state, &ctx, done).await;
            }

            _ = tokio::time::sleep(wait) => {}
        }
    }

    drain_on_shutdown(&mut state, &ctx, &mut done_rx, options.shutdown_grace).await;
    info!("scheduler loop stopped");
}

/// Time until the earliest live heap entry, floored when blocked tasks need
/// a retry poll, one day when nothing is queued.
fn next_wait(state: &LoopState, blocked: bool) -> Duration {
    let now_ms = Utc::now().timestamp_millis();
    let until_next = state
        .heap
        .peek()
        .map(|Reverse(entry)| Duration::from_millis((entry.at_ms - now_ms).max(0) as u64))
        .unwrap_or(Duration::from_secs(24 * 60 * 60));
    if blocked {
        until_next.min(BLOCKED_RETRY)
    } else {
        until_next
    }
}

/// Admit a task from the intake channel: ask it for its firing instant
/// (allocating its pending row) and queue it. A key collision replaces the
/// previous task, cancelling its pending row.
async fn admit_task(state: &mut LoopState, ctx: &TaskContext, mut task: Box<dyn Task>) {
    let key = task.key();

    if let Some(existing) = state.tasks.get_mut(&key) {
        match &mut existing.slot {
            TaskSlot::Idle(old) => {
                debug!(task = %key, "replacing scheduled task");
                if let Err(err) = old.cancel(OpStatus::SystemCancelled, ctx).await {
                    warn!(task = %key, error = %err, "failed to cancel superseded task");
                }
                let old_op = old.op_id();
                state.forget_op(old_op);
                state.tasks.remove(&key);
            }
            TaskSlot::Running { .. } => {
                // Keep the running instance; drop the newcomer. Reload uses
                // replace_on_done for this case instead.
                warn!(task = %key, "task already running, dropping duplicate");
                return;
            }
        }
    }

    match task.next(Utc::now(), ctx).await {
        Ok(Some(at)) => {
            debug!(task = %task.name(), at = %at, "task scheduled");
            state.insert_idle(task, at.timestamp_millis());
        }
        Ok(None) => {
            debug!(task = %task.name(), "task retired on admission");
        }
        Err(err) => {
            error!(task = %task.name(), error = %err, "task admission failed");
        }
    }
}

/// Pop and launch every due task whose repo slot is free. Returns true when
/// at least one due task was requeued behind a busy slot.
async fn dispatch_due(
    state: &mut LoopState,
    ctx: &TaskContext,
    done_tx: &mpsc::UnboundedSender<TaskDone>,
    shutdown: &CancellationToken,
) -> bool {
    let now_ms = Utc::now().timestamp_millis();
    let mut requeue = Vec::new();
    let mut blocked = false;

    while let Some(Reverse(top)) = state.heap.peek() {
        if top.at_ms > now_ms {
            break;
        }
        let Reverse(entry) = state.heap.pop().expect("peeked entry vanished");

        let Some(task_entry) = state.tasks.get_mut(&entry.key) else {
            continue; // task removed; stale entry
        };
        if task_entry.heap_seq != entry.seq {
            continue; // superseded entry
        }
        let TaskSlot::Idle(task_ref) = &task_entry.slot else {
            continue;
        };

        // Per-repo serialization: non-blocking acquire, requeue on busy.
        let repo_id = task_ref.repo_id().to_owned();
        let slot = ctx.registry.slot(&repo_id);
        let permit = match slot.try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(task = %entry.key, repo_id = %repo_id, "repo slot busy, requeueing");
                blocked = true;
                requeue.push(entry);
                continue;
            }
        };

        let op_id = task_ref.op_id();
        let TaskSlot::Idle(mut task) =
            std::mem::replace(&mut task_entry.slot, TaskSlot::Running { op_id })
        else {
            unreachable!("slot checked idle above");
        };

        let signal = CancelSignal::child_of(shutdown);
        if let Some(op_id) = op_id {
            state.cancels.insert(op_id, signal.clone());
        }

        let key = entry.key.clone();
        let runner_ctx = ctx.clone();
        let runner_done = done_tx.clone();
        info!(task = %task.name(), "launching task");
        tokio::spawn(async move {
            let result = task.run(&runner_ctx, signal).await;
            drop(permit);
            let _ = runner_done.send(TaskDone { key, task, result });
        });
    }

    for entry in requeue {
        state.heap.push(Reverse(entry));
    }
    blocked
}

/// A runner returned: release bookkeeping, then ask the task for its next
/// firing (or retire/replace it).
async fn handle_done(state: &mut LoopState, ctx: &TaskContext, done: TaskDone) {
    if let Some(entry) = state.tasks.remove(&done.key) {
        if let TaskSlot::Running { op_id } = entry.slot {
            state.forget_op(op_id);
        }
    }

    if let Err(err) = &done.result {
        error!(task = %done.task.name(), error = %err, "task run failed");
    }

    if state.retired.remove(&done.key) {
        debug!(task = %done.task.name(), "task retired after run (plan removed)");
        return;
    }
    if let Some(plan) = state.replace_on_done.remove(&done.key) {
        debug!(task = %done.task.name(), "replacing task after run (plan changed)");
        schedule_plan_backup(ctx, &plan);
        return;
    }

    let mut task = done.task;
    match task.next(Utc::now(), ctx).await {
        Ok(Some(at)) => {
            state.insert_idle(task, at.timestamp_millis());
        }
        Ok(None) => {
            debug!(task = %task.name(), "task retired");
        }
        Err(err) => {
            error!(task = %task.name(), error = %err, "task rescheduling failed");
        }
    }
}

async fn handle_control(state: &mut LoopState, ctx: &TaskContext, msg: ControlMsg) {
    match msg {
        ControlMsg::Cancel { op_id, status } => cancel_op(state, ctx, op_id, status).await,
        ControlMsg::Reload(config) => reload_config(state, ctx, config).await,
    }
}

async fn cancel_op(state: &mut LoopState, ctx: &TaskContext, op_id: i64, status: OpStatus) {
    // Running: fire the stored cancel handle and return immediately; the
    // runner records the outcome.
    if let Some(signal) = state.cancels.get(&op_id) {
        info!(op_id, status = %status, "cancelling running operation");
        signal.cancel(status);
        return;
    }

    // Pending and owned by a scheduled task: let the task mark its row.
    if let Some(key) = state.op_index.remove(&op_id) {
        if let Some(entry) = state.tasks.get_mut(&key) {
            if let TaskSlot::Idle(task) = &mut entry.slot {
                if let Err(err) = task.cancel(status, ctx).await {
                    warn!(op_id, error = %err, "failed to cancel pending task");
                }
                return;
            }
        }
    }

    // Not tracked by the scheduler (e.g. inherited from an old process):
    // mark the row directly if it is still live.
    match ctx.oplog.get(op_id).await {
        Ok(mut op) if !op.status.is_terminal() => {
            op.status = status;
            op.ended_at_ms = Some(Utc::now().timestamp_millis().max(op.started_at_ms));
            if let Err(err) = ctx.oplog.update_terminal(&op).await {
                warn!(op_id, error = %err, "failed to cancel untracked operation");
            }
        }
        Ok(_) => debug!(op_id, "cancel ignored, operation already terminal"),
        Err(err) => debug!(op_id, error = %err, "cancel ignored"),
    }
}

async fn reload_config(state: &mut LoopState, ctx: &TaskContext, config: Config) {
    info!(
        repos = config.repos.len(),
        plans = config.plans.len(),
        "applying config reload"
    );
    let previous = ctx.config.replace(config);
    let current = ctx.config.current();

    // Plans that disappeared: drop their task, cancelling running work.
    for plan in &previous.plans {
        if current.plan(&plan.id).is_some() {
            continue;
        }
        let key = TaskKey::for_plan(&plan.id, TaskKind::Backup);
        remove_plan_task(state, ctx, &key).await;
    }

    // Plans that changed: re-time at the next firing boundary.
    for plan in &current.plans {
        let Some(old) = previous.plan(&plan.id) else {
            continue;
        };
        if old == plan {
            continue;
        }
        let key = TaskKey::for_plan(&plan.id, TaskKind::Backup);
        match state.tasks.get_mut(&key) {
            Some(entry) => match &mut entry.slot {
                TaskSlot::Idle(task) => {
                    if let Err(err) = task.cancel(OpStatus::SystemCancelled, ctx).await {
                        warn!(plan_id = %plan.id, error = %err, "failed to supersede pending backup");
                    }
                    let old_op = task.op_id();
                    state.forget_op(old_op);
                    state.tasks.remove(&key);
                    schedule_plan_backup(ctx, plan);
                }
                TaskSlot::Running { .. } => {
                    // Let the current run finish; swap in the new plan when
                    // it returns.
                    state.replace_on_done.insert(key, plan.clone());
                }
            },
            None => schedule_plan_backup(ctx, plan),
        }
    }

    // New plans and repos.
    seed_tasks(ctx, &current, Some(&previous));

    // Tear down registry entries for repos that are gone.
    let keep: Vec<String> = current.repos.iter().map(|r| r.id.clone()).collect();
    ctx.registry.retain(&keep).await;
}

async fn remove_plan_task(state: &mut LoopState, ctx: &TaskContext, key: &TaskKey) {
    let Some(entry) = state.tasks.get_mut(key) else {
        return;
    };
    match &mut entry.slot {
        TaskSlot::Idle(task) => {
            info!(task = %key, "removing task, plan dropped from config");
            if let Err(err) = task.cancel(OpStatus::SystemCancelled, ctx).await {
                warn!(task = %key, error = %err, "failed to cancel removed task");
            }
            let op_id = task.op_id();
            state.forget_op(op_id);
            state.tasks.remove(key);
        }
        TaskSlot::Running { op_id } => {
            info!(task = %key, "cancelling running task, plan dropped from config");
            if let Some(id) = *op_id {
                if let Some(signal) = state.cancels.get(&id) {
                    signal.cancel(OpStatus::SystemCancelled);
                }
            }
            state.retired.insert(key.clone());
        }
    }
}

/// Shutdown: the parent token already cancelled every running signal. Mark
/// idle pending rows, then wait out the grace window for runners to return;
/// anything still out has its operation marked cancelled directly.
async fn drain_on_shutdown(
    state: &mut LoopState,
    ctx: &TaskContext,
    done_rx: &mut mpsc::UnboundedReceiver<TaskDone>,
    grace: Duration,
) {
    let keys: Vec<TaskKey> = state.tasks.keys().cloned().collect();
    for key in keys {
        let Some(entry) = state.tasks.get_mut(&key) else {
            continue;
        };
        if let TaskSlot::Idle(task) = &mut entry.slot {
            if let Err(err) = task.cancel(OpStatus::SystemCancelled, ctx).await {
                warn!(task = %key, error = %err, "failed to cancel pending task at shutdown");
            }
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while state.running_count() > 0 {
        match tokio::time::timeout_at(deadline, done_rx.recv()).await {
            Ok(Some(done)) => {
                if let Some(entry) = state.tasks.remove(&done.key) {
                    if let TaskSlot::Running { op_id } = entry.slot {
                        state.forget_op(op_id);
                    }
                }
                if let Err(err) = &done.result {
                    warn!(task = %done.task.name(), error = %err, "task failed during shutdown drain");
                }
            }
            _ => break,
        }
    }

    let stragglers: Vec<i64> = state
        .tasks
        .values()
        .filter_map(|entry| match entry.slot {
            TaskSlot::Running { op_id } => op_id,
            TaskSlot::Idle(_) => None,
        })
        .collect();
    for op_id in stragglers {
        warn!(op_id, "task did not return within grace window, marking cancelled");
        match ctx.oplog.get(op_id).await {
            Ok(op) if !op.status.is_terminal() => {
                let mut op: Operation = op;
                op.status = OpStatus::SystemCancelled;
                op.ended_at_ms = Some(Utc::now().timestamp_millis().max(op.started_at_ms));
                if let Err(err) = ctx.oplog.update_terminal(&op).await {
                    error!(op_id, error = %err, "failed to mark straggler cancelled");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(op_id, error = %err, "straggler lookup failed"),
        }
    }
}
