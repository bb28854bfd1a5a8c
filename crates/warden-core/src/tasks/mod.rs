//! Schedulable units of work and their shared contract.
//!
//! Every task implements [`Task`]: the scheduler asks `next(now)` for the
//! upcoming firing instant (allocating the pending journal row as a side
//! effect), later calls `run` with a cancellation signal, and `cancel` when
//! the user or a shutdown supersedes the work. Tasks reach the rest of the
//! core only through the [`TaskContext`] capability bundle -- they never
//! hold a pointer back into the orchestrator.

pub mod backup;
pub mod forget;
pub mod index_snapshots;
pub mod prune;
pub mod restore;
pub mod stats;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use warden_db::models::{OpStatus, Operation};

use crate::config::ConfigHandle;
use crate::events::Broker;
use crate::logstore::LogStore;
use crate::oplog::OpLog;
use crate::repo::RepoRegistry;

/// Journal writes from progress callbacks are debounced to one per this
/// interval. The first entry always writes; the final summary bypasses the
/// limiter entirely.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// What a task does; used in keys, names, and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Backup,
    Forget,
    Prune,
    Restore,
    IndexSnapshots,
    Stats,
    Check,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backup => "backup",
            Self::Forget => "forget",
            Self::Prune => "prune",
            Self::Restore => "restore",
            Self::IndexSnapshots => "index_snapshots",
            Self::Stats => "stats",
            Self::Check => "check",
        };
        f.write_str(s)
    }
}

/// Scheduler identity of a task. Plan-scheduled tasks key on the plan so a
/// config reload can find and replace them; one-shots get a synthetic
/// scope that never collides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub scope: String,
    pub kind: TaskKind,
}

impl TaskKey {
    /// Key for the recurring task of a plan.
    pub fn for_plan(plan_id: &str, kind: TaskKind) -> Self {
        Self {
            scope: plan_id.to_owned(),
            kind,
        }
    }

    /// Synthetic key for a one-shot task.
    pub fn one_shot(kind: TaskKind) -> Self {
        Self {
            scope: format!("oneshot-{}", Uuid::new_v4().simple()),
            kind,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.scope)
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation handle passed into [`Task::run`].
///
/// Carries both the token the driver polls and the status the outcome
/// should be recorded with. The default is `SystemCancelled` so a plain
/// parent-token shutdown needs no extra bookkeeping; a user cancel sets
/// `UserCancelled` explicitly before firing the token.
#[derive(Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    status: Arc<Mutex<OpStatus>>,
}

impl CancelSignal {
    /// A signal whose token is a child of `parent`; cancelling the parent
    /// cancels this signal with the default `SystemCancelled` outcome.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            status: Arc::new(Mutex::new(OpStatus::SystemCancelled)),
        }
    }

    /// Request cancellation with an explicit outcome status. Idempotent;
    /// the first caller wins the status.
    pub fn cancel(&self, status: OpStatus) {
        debug_assert!(status.is_cancelled());
        if !self.token.is_cancelled() {
            *self.status.lock().expect("cancel status lock poisoned") = status;
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The status a cancelled run should be recorded with.
    pub fn status(&self) -> OpStatus {
        *self.status.lock().expect("cancel status lock poisoned")
    }

    /// The raw token, for handing to drivers.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Handle for enqueuing follow-up tasks into the scheduler loop.
#[derive(Clone)]
pub struct TaskScheduler {
    tx: mpsc::UnboundedSender<Box<dyn Task>>,
}

impl TaskScheduler {
    pub fn new(tx: mpsc::UnboundedSender<Box<dyn Task>>) -> Self {
        Self { tx }
    }

    /// Hand a task to the scheduler loop. A send after shutdown is logged
    /// and dropped; the loop is gone, so is the work.
    pub fn schedule(&self, task: Box<dyn Task>) {
        if let Err(err) = self.tx.send(task) {
            warn!(task = %err.0.name(), "scheduler stopped, dropping task");
        }
    }
}

/// Capability bundle handed to tasks. This is all a task can see of the
/// orchestrator.
#[derive(Clone)]
pub struct TaskContext {
    pub oplog: Arc<OpLog>,
    pub broker: Broker,
    pub registry: Arc<RepoRegistry>,
    pub logstore: LogStore,
    pub config: ConfigHandle,
    pub scheduler: TaskScheduler,
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// A schedulable unit of work.
#[async_trait]
pub trait Task: Send {
    /// Human-readable name for logs.
    fn name(&self) -> String;

    /// Scheduler identity.
    fn key(&self) -> TaskKey;

    /// The repo this task runs against, for slot acquisition.
    fn repo_id(&self) -> &str;

    /// Id of the task's outstanding pending/in-progress journal row, if any.
    fn op_id(&self) -> Option<i64>;

    /// The next firing instant strictly after `now`, or `None` to retire
    /// the task. As a side effect, allocates (or re-times) the task's
    /// single pending journal row at the returned instant.
    async fn next(
        &mut self,
        now: DateTime<Utc>,
        ctx: &TaskContext,
    ) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Perform the work: pending -> inprogress -> terminal. Observes
    /// `signal` at every driver boundary; a cancelled signal is recorded
    /// with `signal.status()`.
    async fn run(&mut self, ctx: &TaskContext, signal: CancelSignal) -> anyhow::Result<()>;

    /// Terminally mark a not-yet-running pending row. Safe to call
    /// repeatedly; a no-op while the task is mid-`run` (the run path owns
    /// the terminal transition then).
    async fn cancel(&mut self, status: OpStatus, ctx: &TaskContext) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Terminally mark a task's pending row, used by `cancel` implementations.
/// In-progress and already-terminal rows are left alone.
pub(crate) async fn cancel_pending_op(
    op: &mut Option<Operation>,
    status: OpStatus,
    ctx: &TaskContext,
) -> anyhow::Result<()> {
    let Some(current) = op.as_mut() else {
        return Ok(());
    };
    if current.status != OpStatus::Pending {
        return Ok(());
    }

    current.status = status;
    current.ended_at_ms = Some(now_ms().max(current.started_at_ms));
    let committed = ctx.oplog.update_terminal(current).await?;
    *op = None;
    tracing::info!(op_id = committed.id, status = %status, "cancelled pending operation");
    Ok(())
}

/// Move a task's row to `Inprogress`, stamping the real start time and the
/// flow id (a backup starts its own flow keyed by its journal id).
pub(crate) async fn mark_inprogress(
    ctx: &TaskContext,
    op: &mut Operation,
    flow_id: Option<i64>,
) -> anyhow::Result<()> {
    op.status = OpStatus::Inprogress;
    op.started_at_ms = now_ms();
    if op.flow_id.is_none() {
        op.flow_id = flow_id.or(Some(op.id));
    }
    ctx.oplog.update(op).await?;
    Ok(())
}

/// Commit a terminal status, stamping the end time.
pub(crate) async fn finish(
    ctx: &TaskContext,
    op: &mut Operation,
    status: OpStatus,
) -> anyhow::Result<()> {
    op.status = status;
    op.ended_at_ms = Some(now_ms().max(op.started_at_ms));
    ctx.oplog.update_terminal(op).await?;
    Ok(())
}

/// Allocate the task's pending row at `at_ms`, or re-time the one it
/// already holds (a task owns at most one outstanding pending row).
pub(crate) async fn upsert_pending(
    ctx: &TaskContext,
    slot: &mut Option<Operation>,
    template: impl FnOnce() -> warden_db::models::NewOperation,
    at_ms: i64,
) -> anyhow::Result<()> {
    match slot {
        Some(op) if op.status == OpStatus::Pending => {
            op.started_at_ms = at_ms;
            ctx.oplog.update(op).await?;
        }
        _ => {
            let mut new = template();
            new.status = OpStatus::Pending;
            new.started_at_ms = at_ms;
            new.ended_at_ms = None;
            let op = ctx.oplog.add(new).await?;
            *slot = Some(op);
        }
    }
    Ok(())
}

/// Publish a hook-phase notification through the broker.
pub(crate) fn publish_hook(
    ctx: &TaskContext,
    phase: crate::events::HookPhase,
    repo_id: &str,
    plan_id: &str,
    op: Option<&Operation>,
    message: Option<String>,
) {
    ctx.broker
        .publish(crate::events::Event::Hook(crate::events::HookNotification {
            phase,
            repo_id: repo_id.to_owned(),
            plan_id: plan_id.to_owned(),
            op_id: op.map(|o| o.id),
            flow_id: op.and_then(|o| o.flow_id),
            message,
        }));
}

/// Debouncer for progress-driven journal writes.
///
/// The first event always passes. After that an event passes only when
/// strictly more than the interval elapsed since the last passed event, so
/// a burst at 0/249/250/251 ms lets through exactly 0 and 251.
pub struct ProgressLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Should this event be written?
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut last = self.last.lock().expect("limiter lock poisoned");
        match *last {
            Some(prev) if now.duration_since(prev) <= self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_emits_first_event() {
        let limiter = ProgressLimiter::new(PROGRESS_INTERVAL);
        assert!(limiter.allow());
    }

    #[test]
    fn limiter_boundary_behavior() {
        let limiter = ProgressLimiter::new(PROGRESS_INTERVAL);
        let t0 = Instant::now();

        assert!(limiter.allow_at(t0), "0 ms event must pass");
        assert!(
            !limiter.allow_at(t0 + Duration::from_millis(249)),
            "249 ms event must be dropped"
        );
        assert!(
            !limiter.allow_at(t0 + Duration::from_millis(250)),
            "250 ms event must be dropped"
        );
        assert!(
            limiter.allow_at(t0 + Duration::from_millis(251)),
            "251 ms event must pass"
        );
    }

    #[test]
    fn limiter_window_restarts_after_emission() {
        let limiter = ProgressLimiter::new(Duration::from_millis(100));
        let t0 = Instant::now();

        assert!(limiter.allow_at(t0));
        assert!(limiter.allow_at(t0 + Duration::from_millis(101)));
        // Window now anchored at t0+101.
        assert!(!limiter.allow_at(t0 + Duration::from_millis(150)));
        assert!(limiter.allow_at(t0 + Duration::from_millis(202)));
    }

    #[test]
    fn plan_keys_collide_one_shot_keys_do_not() {
        let a = TaskKey::for_plan("p1", TaskKind::Backup);
        let b = TaskKey::for_plan("p1", TaskKind::Backup);
        assert_eq!(a, b);

        let c = TaskKey::one_shot(TaskKind::Backup);
        let d = TaskKey::one_shot(TaskKind::Backup);
        assert_ne!(c, d);
    }

    #[test]
    fn cancel_signal_defaults_to_system_cancelled() {
        let parent = CancellationToken::new();
        let signal = CancelSignal::child_of(&parent);
        parent.cancel();
        assert!(signal.is_cancelled());
        assert_eq!(signal.status(), OpStatus::SystemCancelled);
    }

    #[test]
    fn cancel_signal_user_cancel_wins_first() {
        let parent = CancellationToken::new();
        let signal = CancelSignal::child_of(&parent);
        signal.cancel(OpStatus::UserCancelled);
        // A later system cancel does not overwrite the recorded outcome.
        signal.cancel(OpStatus::SystemCancelled);
        assert_eq!(signal.status(), OpStatus::UserCancelled);
    }
}
