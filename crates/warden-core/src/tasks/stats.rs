//! Stats and check tasks: run the corresponding repo subcommand and attach
//! the parsed summary to the operation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use warden_db::models::{NewOperation, OpPayload, OpStatus, Operation};

use crate::config::SYSTEM_PLAN_ID;
use crate::tasks::{
    CancelSignal, Task, TaskContext, TaskKey, TaskKind, cancel_pending_op, finish,
    mark_inprogress, upsert_pending,
};

/// Which repo subcommand a [`RepoScanTask`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    Stats,
    Check,
}

/// One-shot repo-scoped task shared by stats and check; the two differ only
/// in the driver call and the payload variant.
pub struct RepoScanTask {
    repo_id: String,
    mode: ScanMode,
    key: TaskKey,
    op: Option<Operation>,
    ran: bool,
}

/// Stats task constructor.
pub struct StatsTask;

impl StatsTask {
    pub fn one_shot(repo_id: &str) -> RepoScanTask {
        RepoScanTask {
            repo_id: repo_id.to_owned(),
            mode: ScanMode::Stats,
            key: TaskKey::one_shot(TaskKind::Stats),
            op: None,
            ran: false,
        }
    }
}

/// Check task constructor.
pub struct CheckTask;

impl CheckTask {
    pub fn one_shot(repo_id: &str) -> RepoScanTask {
        RepoScanTask {
            repo_id: repo_id.to_owned(),
            mode: ScanMode::Check,
            key: TaskKey::one_shot(TaskKind::Check),
            op: None,
            ran: false,
        }
    }
}

#[async_trait]
impl Task for RepoScanTask {
    fn name(&self) -> String {
        match self.mode {
            ScanMode::Stats => format!("stats/{}", self.repo_id),
            ScanMode::Check => format!("check/{}", self.repo_id),
        }
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

        let repo_id = self.repo_id.clone();
        let payload = match self.mode {
            ScanMode::Stats => OpPayload::Stats {
                summary: None,
                error: None,
            },
            ScanMode::Check => OpPayload::Check {
                summary: None,
                error: None,
            },
        };
        upsert_pending(
            ctx,
            &mut self.op,
            move || NewOperation {
                flow_id: None,
                repo_id,
                plan_id: SYSTEM_PLAN_ID.to_owned(),
                snapshot_id: None,
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

        let result = match self.mode {
            ScanMode::Stats => driver.stats(signal.token()).await.map(|summary| {
                op.payload = OpPayload::Stats {
                    summary: Some(summary),
                    error: None,
                };
            }),
            ScanMode::Check => driver.check(signal.token()).await.map(|summary| {
                op.payload = OpPayload::Check {
                    summary: Some(summary),
                    error: None,
                };
            }),
        };

        match result {
            Ok(()) => {
                finish(ctx, &mut op, OpStatus::Success).await?;
                info!(op_id = op.id, task = %self.name(), "repo scan completed");
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
                warn!(op_id = op.id, task = %self.name(), error = %err, "repo scan failed");
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
