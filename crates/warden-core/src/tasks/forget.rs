//! The forget task: applies a plan's retention policy, or removes one
//! specific snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use warden_db::models::{NewOperation, OpPayload, OpStatus, Operation};

use crate::config::{Plan, SYSTEM_PLAN_ID};
use crate::events::HookPhase;
use crate::repo::ForgetTarget;
use crate::tasks::{
    CancelSignal, Task, TaskContext, TaskKey, TaskKind, cancel_pending_op, finish,
    mark_inprogress, publish_hook, upsert_pending,
};

pub struct ForgetTask {
    repo_id: String,
    /// Plan-scoped mode: apply the plan's retention policy.
    plan: Option<Plan>,
    /// Snapshot-scoped mode: drop exactly this snapshot.
    snapshot_id: Option<String>,
    /// Plan id recorded on the journal row.
    plan_label: String,
    flow_id: Option<i64>,
    key: TaskKey,
    op: Option<Operation>,
    ran: bool,
}

impl ForgetTask {
    /// Forget per the plan's retention policy, usually as a backup
    /// follow-up sharing its flow.
    pub fn for_plan(plan: &Plan, flow_id: Option<i64>) -> Self {
        Self {
            repo_id: plan.repo_id.clone(),
            plan: Some(plan.clone()),
            snapshot_id: None,
            plan_label: plan.id.clone(),
            flow_id,
            key: TaskKey::one_shot(TaskKind::Forget),
            op: None,
            ran: false,
        }
    }

    /// Forget one specific snapshot (plan-less invocation).
    pub fn for_snapshot(repo_id: &str, plan_id: Option<&str>, snapshot_id: &str) -> Self {
        Self {
            repo_id: repo_id.to_owned(),
            plan: None,
            snapshot_id: Some(snapshot_id.to_owned()),
            plan_label: plan_id.unwrap_or(SYSTEM_PLAN_ID).to_owned(),
            flow_id: None,
            key: TaskKey::one_shot(TaskKind::Forget),
            op: None,
            ran: false,
        }
    }
}

#[async_trait]
impl Task for ForgetTask {
    fn name(&self) -> String {
        format!("forget/{}", self.plan_label)
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

        let (repo_id, plan_label, flow_id, snapshot_id) = (
            self.repo_id.clone(),
            self.plan_label.clone(),
            self.flow_id,
            self.snapshot_id.clone(),
        );
        upsert_pending(
            ctx,
            &mut self.op,
            move || NewOperation {
                flow_id,
                repo_id,
                plan_id: plan_label,
                snapshot_id,
                status: OpStatus::Pending,
                started_at_ms: 0,
                ended_at_ms: None,
                payload: OpPayload::forget(),
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

        mark_inprogress(ctx, &mut op, self.flow_id).await?;
        publish_hook(
            ctx,
            HookPhase::ForgetStart,
            &self.repo_id,
            &self.plan_label,
            Some(&op),
            None,
        );

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

        let target = match (&self.snapshot_id, &self.plan) {
            (Some(snapshot_id), _) => ForgetTarget::Snapshot(snapshot_id),
            (None, Some(plan)) => match &plan.retention {
                Some(policy) => ForgetTarget::Plan { plan, policy },
                None => {
                    op.payload
                        .set_error(format!("plan {:?} has no retention policy", plan.id));
                    finish(ctx, &mut op, OpStatus::Error).await?;
                    return Ok(());
                }
            },
            (None, None) => {
                op.payload
                    .set_error("forget needs a plan or a snapshot id".to_owned());
                finish(ctx, &mut op, OpStatus::Error).await?;
                return Ok(());
            }
        };

        match driver.forget(signal.token(), target).await {
            Ok(forgotten) => {
                info!(
                    op_id = op.id,
                    repo_id = %self.repo_id,
                    forgotten = forgotten.len(),
                    "forget completed"
                );
                op.payload = OpPayload::Forget {
                    forgotten,
                    error: None,
                };
                finish(ctx, &mut op, OpStatus::Success).await?;
                publish_hook(
                    ctx,
                    HookPhase::ForgetEnd,
                    &self.repo_id,
                    &self.plan_label,
                    Some(&op),
                    None,
                );

                // Plan-scoped forgets trigger a prune when the repo wants one.
                if self.plan.is_some() && repo.prune.is_some() {
                    ctx.scheduler.schedule(Box::new(super::prune::PruneTask::one_shot(
                        &self.repo_id,
                        op.flow_id,
                    )));
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
                    return Ok(());
                }
                warn!(op_id = op.id, repo_id = %self.repo_id, error = %err, "forget failed");
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
