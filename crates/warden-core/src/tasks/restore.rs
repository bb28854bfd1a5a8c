//! The restore task: extracts a path from a snapshot into a target
//! directory, from which an external collaborator later assembles the
//! downloadable archive.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use warden_db::models::{NewOperation, OpPayload, OpStatus, Operation, RestoreProgress};

use crate::tasks::{
    CancelSignal, PROGRESS_INTERVAL, ProgressLimiter, Task, TaskContext, TaskKey, TaskKind,
    cancel_pending_op, finish, mark_inprogress, upsert_pending,
};

pub struct RestoreTask {
    repo_id: String,
    plan_id: String,
    snapshot_id: String,
    path: String,
    target: PathBuf,
    key: TaskKey,
    op: Option<Operation>,
    ran: bool,
}

impl RestoreTask {
    pub fn new(
        repo_id: &str,
        plan_id: &str,
        snapshot_id: &str,
        path: &str,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo_id: repo_id.to_owned(),
            plan_id: plan_id.to_owned(),
            snapshot_id: snapshot_id.to_owned(),
            path: path.to_owned(),
            target: target.into(),
            key: TaskKey::one_shot(TaskKind::Restore),
            op: None,
            ran: false,
        }
    }
}

#[async_trait]
impl Task for RestoreTask {
    fn name(&self) -> String {
        format!("restore/{}@{}", self.snapshot_id, self.repo_id)
    }

    fn key(&self) -> TaskKey {
        self.key.clone()
    }

    fn repo_id(&self) -> &str {
        &self.repo_id
    }

    fn op_id(&self) -> Option<i64> {
        self.op.as_ref().map(|op| op.id)
    }

    async fn next(
        &mut self,
        now: DateTime<Utc>,
        ctx: &TaskContext,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        if self.ran {
            return Ok(None);
        }
        let at = now + ChronoDuration::milliseconds(1);

        let payload = OpPayload::Restore {
            snapshot_id: self.snapshot_id.clone(),
            path: self.path.clone(),
            target: self.target.display().to_string(),
            last_status: None,
            error: None,
        };
        let (repo_id, plan_id, snapshot_id) = (
            self.repo_id.clone(),
            self.plan_id.clone(),
            self.snapshot_id.clone(),
        );
        upsert_pending(
            ctx,
            &mut self.op,
            move || NewOperation {
                flow_id: None,
                repo_id,
                plan_id,
                snapshot_id: Some(snapshot_id),
                status: OpStatus::Pending,
                started_at_ms: 0,
                ended_at_ms: None,
                payload,
            },
            at.timestamp_millis(),
        )
        .await?;

        Ok(Some(at))
    }

    async fn run(&mut self, ctx: &TaskContext, signal: CancelSignal) -> anyhow::Result<()> {
        self.ran = true;
        let Some(mut op) = self.op.take() else {
            return Ok(());
        };

        mark_inprogress(ctx, &mut op, None).await?;

        let config = ctx.config.current();
        let Some(repo) = config.repo(&self.repo_id) else {
            op.payload
                .set_error(format!("repo {:?} not in config", self.repo_id));
            finish(ctx, &mut op, OpStatus::Error).await?;
            return Ok(());
        };
        let driver = match ctx.registry.get(repo).await {
            Ok(driver) => driver,
            Err(err) => {
                op.payload.set_error(format!("driver unavailable: {err}"));
                finish(ctx, &mut op, OpStatus::Error).await?;
                return Ok(());
            }
        };

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<RestoreProgress>();
        let updater = {
            let oplog = ctx.oplog.clone();
            let mut shadow = op.clone();
            tokio::spawn(async move {
                let limiter = ProgressLimiter::new(PROGRESS_INTERVAL);
                while let Some(entry) = progress_rx.recv().await {
                    if !limiter.allow() {
                        continue;
                    }
                    if let OpPayload::Restore { last_status, .. } = &mut shadow.payload {
                        *last_status = Some(entry);
                    }
                    if let Err(err) = oplog.update(&shadow).await {
                        warn!(op_id = shadow.id, error = %err, "progress write failed");
                    }
                }
            })
        };

        let progress_cb = move |entry: RestoreProgress| {
            let _ = progress_tx.send(entry);
        };
        let result = driver
            .restore(
                signal.token(),
                &self.snapshot_id,
                &self.path,
                &self.target,
                &progress_cb,
            )
            .await;
        drop(progress_cb);
        let _ = updater.await;

        match result {
            Ok(()) => {
                if let OpPayload::Restore { last_status, .. } = &mut op.payload {
                    if let Some(status) = last_status {
                        status.percent_done = 1.0;
                    }
                }
                finish(ctx, &mut op, OpStatus::Success).await?;
                info!(
                    op_id = op.id,
                    snapshot_id = %self.snapshot_id,
                    target = %self.target.display(),
                    "restore completed"
                );
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
                    return Ok(());
                }
                warn!(op_id = op.id, snapshot_id = %self.snapshot_id, error = %err, "restore failed");
                op.payload.set_error(err.to_string());
                finish(ctx, &mut op, OpStatus::Error).await?;
                Ok(())
            }
        }
    }

    async fn cancel(&mut self, status: OpStatus, ctx: &TaskContext) -> anyhow::Result<()> {
        cancel_pending_op(&mut self.op, status, ctx).await
    }
}
