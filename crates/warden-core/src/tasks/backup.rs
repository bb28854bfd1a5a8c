//! The backup task: the only recurring task, and the root of every flow.
//!
//! Fires on the plan's cron schedule (or once, when triggered manually),
//! drives `RepoDriver::backup` with debounced progress mirroring into the
//! journal, and on success schedules the snapshot-index and forget
//! follow-ups under its own flow id.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use tokio::sync::mpsc;
use tracing::{info, warn};

use warden_db::models::{BackupProgress, NewOperation, OpPayload, OpStatus, Operation};

use crate::config::Plan;
use crate::events::HookPhase;
use crate::tasks::{
    CancelSignal, PROGRESS_INTERVAL, ProgressLimiter, Task, TaskContext, TaskKey, TaskKind,
    cancel_pending_op, finish, mark_inprogress, publish_hook, upsert_pending,
};

pub struct BackupTask {
    plan: Plan,
    /// `None` for a one-shot (manually triggered) backup.
    schedule: Option<Schedule>,
    key: TaskKey,
    op: Option<Operation>,
    ran: bool,
}

impl BackupTask {
    /// Recurring backup on the plan's cron expression.
    pub fn scheduled(plan: &Plan) -> anyhow::Result<Self> {
        let schedule = crate::config::parse_schedule(&plan.schedule)?;
        Ok(Self {
            plan: plan.clone(),
            schedule: Some(schedule),
            key: TaskKey::for_plan(&plan.id, TaskKind::Backup),
            op: None,
            ran: false,
        })
    }

    /// One-shot backup triggered by the user.
    pub fn one_shot(plan: &Plan) -> Self {
        Self {
            plan: plan.clone(),
            schedule: None,
            key: TaskKey::one_shot(TaskKind::Backup),
            op: None,
            ran: false,
        }
    }
}

#[async_trait]
impl Task for BackupTask {
    fn name(&self) -> String {
        format!("backup/{}", self.plan.id)
    }

    fn key(&self) -> TaskKey {
        self.key.clone()
    }

    fn repo_id(&self) -> &str {
        &self.plan.repo_id
    }

    fn op_id(&self) -> Option<i64> {
        self.op.as_ref().map(|op| op.id)
    }

    async fn next(
        &mut self,
        now: DateTime<Utc>,
        ctx: &TaskContext,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let at = match &self.schedule {
            Some(schedule) => match schedule.after(&now).next() {
                Some(at) => at,
                None => return Ok(None),
            },
            None => {
                if self.ran {
                    return Ok(None);
                }
                now + ChronoDuration::milliseconds(1)
            }
        };

        let plan = &self.plan;
        upsert_pending(
            ctx,
            &mut self.op,
            || NewOperation {
                flow_id: None,
                repo_id: plan.repo_id.clone(),
                plan_id: plan.id.clone(),
                snapshot_id: None,
                status: OpStatus::Pending,
                started_at_ms: 0,
                ended_at_ms: None,
                payload: OpPayload::backup(),
            },
            at.timestamp_millis(),
        )
        .await?;

        Ok(Some(at))
    }

    async fn run(&mut self, ctx: &TaskContext, signal: CancelSignal) -> anyhow::Result<()> {
        self.ran = true;
        let Some(mut op) = self.op.take() else {
            // The pending row was cancelled out from under us.
            return Ok(());
        };

        mark_inprogress(ctx, &mut op, None).await?;
        publish_hook(
            ctx,
            HookPhase::SnapshotStart,
            &self.plan.repo_id,
            &self.plan.id,
            Some(&op),
            None,
        );

        let config = ctx.config.current();
        let driver = match config.repo(&self.plan.repo_id) {
            Some(repo) => match ctx.registry.get(repo).await {
                Ok(driver) => driver,
                Err(err) => {
                    return self.fail(ctx, op, format!("driver unavailable: {err}")).await;
                }
            },
            None => {
                return self
                    .fail(ctx, op, format!("repo {:?} not in config", self.plan.repo_id))
                    .await;
            }
        };

        // Progress entries arrive on a synchronous callback; mirror them
        // into the journal from a side task so the driver never waits on a
        // write. Journal errors here are best-effort by design.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<BackupProgress>();
        let updater = {
            let oplog = ctx.oplog.clone();
            let mut shadow = op.clone();
            tokio::spawn(async move {
                let limiter = ProgressLimiter::new(PROGRESS_INTERVAL);
                while let Some(entry) = progress_rx.recv().await {
                    if !limiter.allow() {
                        continue;
                    }
                    if let OpPayload::Backup { last_status, .. } = &mut shadow.payload {
                        *last_status = Some(entry);
                    }
                    if let Err(err) = oplog.update(&shadow).await {
                        warn!(op_id = shadow.id, error = %err, "progress write failed");
                    }
                }
            })
        };

        let progress_cb = move |entry: BackupProgress| {
            let _ = progress_tx.send(entry);
        };
        let result = driver.backup(signal.token(), &self.plan, &progress_cb).await;
        drop(progress_cb);
        let _ = updater.await;

        match result {
            Ok(summary) => {
                // The summary overwrites the last debounced entry
                // unconditionally.
                op.payload = OpPayload::Backup {
                    last_status: Some(BackupProgress {
                        percent_done: 1.0,
                        files_done: summary.files_processed,
                        total_files: summary.files_processed,
                        bytes_done: summary.bytes_processed,
                        total_bytes: summary.bytes_processed,
                        current_file: None,
                    }),
                    snapshot_id: Some(summary.snapshot_id.clone()),
                    error: None,
                };
                op.snapshot_id = Some(summary.snapshot_id.clone());
                finish(ctx, &mut op, OpStatus::Success).await?;
                publish_hook(
                    ctx,
                    HookPhase::SnapshotEnd,
                    &self.plan.repo_id,
                    &self.plan.id,
                    Some(&op),
                    None,
                );
                info!(
                    op_id = op.id,
                    plan_id = %self.plan.id,
                    snapshot_id = %summary.snapshot_id,
                    "backup completed"
                );

                // Follow-ups share the backup's flow.
                ctx.scheduler.schedule(Box::new(
                    super::index_snapshots::IndexSnapshotsTask::one_shot(
                        &self.plan.repo_id,
                        Some(self.plan.id.clone()),
                        op.flow_id,
                    ),
                ));
                if self.plan.retention.is_some() {
                    ctx.scheduler.schedule(Box::new(
                        super::forget::ForgetTask::for_plan(&self.plan, op.flow_id),
                    ));
                }
                Ok(())
            }
            Err(err) => {
                if signal.is_cancelled() || err.is_cancelled() {
                    let status = if signal.is_cancelled() {
                        signal.status()
                    } else {
                        OpStatus::SystemCancelled
                    };
                    finish(ctx, &mut op, status).await?;
                    info!(op_id = op.id, plan_id = %self.plan.id, status = %status, "backup cancelled");
                    return Ok(());
                }

                self.fail(ctx, op, err.to_string()).await
            }
        }
    }

    async fn cancel(&mut self, status: OpStatus, ctx: &TaskContext) -> anyhow::Result<()> {
        cancel_pending_op(&mut self.op, status, ctx).await
    }
}

impl BackupTask {
    async fn fail(
        &self,
        ctx: &TaskContext,
        mut op: Operation,
        message: String,
    ) -> anyhow::Result<()> {
        op.payload.set_error(message.as_str());
        finish(ctx, &mut op, OpStatus::Error).await?;
        publish_hook(
            ctx,
            HookPhase::SnapshotError,
            &self.plan.repo_id,
            &self.plan.id,
            Some(&op),
            Some(message.clone()),
        );
        warn!(op_id = op.id, plan_id = %self.plan.id, error = %message, "backup failed");
        Ok(())
    }
}

impl std::fmt::Debug for BackupTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupTask")
            .field("plan_id", &self.plan.id)
            .field("recurring", &self.schedule.is_some())
            .finish()
    }
}
