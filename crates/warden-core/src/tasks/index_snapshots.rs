//! The snapshot-index task: reconciles the journal with the snapshots that
//! actually exist in a repo.
//!
//! Lists the driver's snapshots per plan, diffs against the already-indexed
//! set, and bulk-inserts one `Success` IndexSnapshot row per new snapshot.
//! Idempotent: a stable snapshot set makes re-runs no-ops. Unlike the other
//! tasks this one allocates no pending row of its own -- its entire product
//! is the rows it inserts.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use warden_db::models::{NewOperation, OpPayload, OpStatus};

use crate::tasks::{CancelSignal, Task, TaskContext, TaskKey, TaskKind, now_ms};

pub struct IndexSnapshotsTask {
    repo_id: String,
    /// Restrict indexing to one plan (backup follow-up); `None` reconciles
    /// every plan targeting the repo.
    plan_id: Option<String>,
    flow_id: Option<i64>,
    key: TaskKey,
    ran: bool,
}

impl IndexSnapshotsTask {
    pub fn one_shot(repo_id: &str, plan_id: Option<String>, flow_id: Option<i64>) -> Self {
        Self {
            repo_id: repo_id.to_owned(),
            plan_id,
            flow_id,
            key: TaskKey::one_shot(TaskKind::IndexSnapshots),
            ran: false,
        }
    }
}

#[async_trait]
impl Task for IndexSnapshotsTask {
    fn name(&self) -> String {
        format!("index_snapshots/{}", self.repo_id)
    }

    fn key(&self) -> TaskKey {
        self.key.clone()
    }

    fn repo_id(&self) -> &str {
        &self.repo_id
    }

    fn op_id(&self) -> Option<i64> {
        None
    }

    async fn next(
        &mut self,
        now: DateTime<Utc>,
        _ctx: &TaskContext,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        if self.ran {
            return Ok(None);
        }
        Ok(Some(now + ChronoDuration::milliseconds(1)))
    }

    async fn run(&mut self, ctx: &TaskContext, signal: CancelSignal) -> anyhow::Result<()> {
        self.ran = true;

        let config = ctx.config.current();
        let Some(repo) = config.repo(&self.repo_id) else {
            warn!(repo_id = %self.repo_id, "skipping snapshot index, repo not in config");
            return Ok(());
        };
        let driver = match ctx.registry.get(repo).await {
            Ok(driver) => driver,
            Err(err) => {
                warn!(repo_id = %self.repo_id, error = %err, "skipping snapshot index");
                return Ok(());
            }
        };

        let plans: Vec<_> = match &self.plan_id {
            Some(plan_id) => config.plan(plan_id).into_iter().collect(),
            None => config.plans_for_repo(&self.repo_id),
        };

        let mut seen: HashSet<String> = ctx
            .oplog
            .index_snapshot_ids(&self.repo_id)
            .await?
            .into_iter()
            .collect();

        let mut news = Vec::new();
        for plan in plans {
            if signal.is_cancelled() {
                return Ok(());
            }
            let snapshots = match driver.snapshots_for_plan(signal.token(), plan).await {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    warn!(
                        repo_id = %self.repo_id,
                        plan_id = %plan.id,
                        error = %err,
                        "failed to list snapshots"
                    );
                    continue;
                }
            };

            let now = now_ms();
            for snapshot in snapshots {
                if !seen.insert(snapshot.id.clone()) {
                    continue;
                }
                news.push(NewOperation {
                    flow_id: self.flow_id,
                    repo_id: self.repo_id.clone(),
                    plan_id: plan.id.clone(),
                    snapshot_id: Some(snapshot.id.clone()),
                    status: OpStatus::Success,
                    started_at_ms: snapshot.time_ms,
                    ended_at_ms: Some(now.max(snapshot.time_ms)),
                    payload: OpPayload::IndexSnapshot {
                        snapshot_id: snapshot.id,
                    },
                });
            }
        }

        if news.is_empty() {
            return Ok(());
        }
        let inserted = ctx.oplog.bulk_add(news).await?;
        info!(
            repo_id = %self.repo_id,
            indexed = inserted.len(),
            "indexed new snapshots"
        );
        Ok(())
    }

    async fn cancel(&mut self, _status: OpStatus, _ctx: &TaskContext) -> anyhow::Result<()> {
        // No pending row to mark; the task either ran or it didn't.
        Ok(())
    }
}
