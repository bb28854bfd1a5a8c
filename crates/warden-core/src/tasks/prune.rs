//! The prune task: repo-scoped repacking of unused data.
//!
//! Honors the repo's prune policy: a frequency cap that skips the run when
//! a successful prune is recent enough, and an unused-percent threshold
//! handed to the driver. The subprocess emits unstructured text, streamed
//! verbatim into a log blob; the journal row keeps only a short preview.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use warden_db::models::{NewOperation, OpPayload, OpStatus, Operation};

use crate::config::{PrunePolicy, SYSTEM_PLAN_ID};
use crate::events::HookPhase;
use crate::tasks::{
    CancelSignal, Task, TaskContext, TaskKey, TaskKind, cancel_pending_op, finish,
    mark_inprogress, now_ms, publish_hook, upsert_pending,
};

/// Bytes of subprocess output kept inline on the journal row.
const OUTPUT_PREVIEW_BYTES: usize = 4096;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

pub struct PruneTask {
    repo_id: String,
    flow_id: Option<i64>,
    key: TaskKey,
    op: Option<Operation>,
    ran: bool,
}

impl PruneTask {
    pub fn one_shot(repo_id: &str, flow_id: Option<i64>) -> Self {
        Self {
            repo_id: repo_id.to_owned(),
            flow_id,
            key: TaskKey::one_shot(TaskKind::Prune),
            op: None,
            ran: false,
        }
    }
}

#[async_trait]
impl Task for PruneTask {
    fn name(&self) -> String {
        format!("prune/{}", self.repo_id)
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

        let (repo_id, flow_id) = (self.repo_id.clone(), self.flow_id);
        upsert_pending(
            ctx,
            &mut self.op,
            move || NewOperation {
                flow_id,
                repo_id,
                plan_id: SYSTEM_PLAN_ID.to_owned(),
                snapshot_id: None,
                status: OpStatus::Pending,
                started_at_ms: 0,
                ended_at_ms: None,
                payload: OpPayload::prune(),
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

        let config = ctx.config.current();
        let Some(repo) = config.repo(&self.repo_id) else {
            op.payload
                .set_error(format!("repo {:?} not in config", self.repo_id));
            finish(ctx, &mut op, OpStatus::Error).await?;
            return Ok(());
        };
        let policy = repo.prune.clone().unwrap_or_default();

        // Frequency cap: a recent successful prune makes this run a no-op.
        if policy.max_frequency_days > 0 {
            if let Some(last_ms) = ctx.oplog.last_successful_prune_ms(&self.repo_id).await? {
                let age_ms = now_ms() - last_ms;
                if age_ms < i64::from(policy.max_frequency_days) * MS_PER_DAY {
                    info!(
                        op_id = op.id,
                        repo_id = %self.repo_id,
                        age_days = age_ms / MS_PER_DAY,
                        "skipping prune, repo pruned recently"
                    );
                    op.payload = OpPayload::Prune {
                        output_preview: format!(
                            "skipped: last successful prune is {} day(s) old",
                            age_ms / MS_PER_DAY
                        ),
                        skipped: true,
                        error: None,
                    };
                    finish(ctx, &mut op, OpStatus::Success).await?;
                    return Ok(());
                }
            }
        }

        let driver = match ctx.registry.get(repo).await {
            Ok(driver) => driver,
            Err(err) => {
                op.payload.set_error(format!("driver unavailable: {err}"));
                finish(ctx, &mut op, OpStatus::Error).await?;
                return Ok(());
            }
        };

        publish_hook(
            ctx,
            HookPhase::PruneStart,
            &self.repo_id,
            SYSTEM_PLAN_ID,
            Some(&op),
            None,
        );

        let output = Mutex::new(String::new());
        let on_output = |line: &str| {
            let mut buf = output.lock().expect("prune output lock poisoned");
            buf.push_str(line);
            buf.push('\n');
        };

        let result = driver.prune(signal.token(), &policy, &on_output).await;
        drop(on_output);
        let output = output.into_inner().expect("prune output lock poisoned");

        // The full text goes to the blob store either way; the row keeps a
        // preview plus the blob handle.
        if !output.is_empty() {
            match ctx.logstore.put(output.as_bytes()).await {
                Ok(log_ref) => op.log_ref = Some(log_ref),
                Err(err) => warn!(op_id = op.id, error = %err, "failed to store prune log"),
            }
        }

        match result {
            Ok(()) => {
                op.payload = OpPayload::Prune {
                    output_preview: preview(&output),
                    skipped: false,
                    error: None,
                };
                finish(ctx, &mut op, OpStatus::Success).await?;
                publish_hook(
                    ctx,
                    HookPhase::PruneEnd,
                    &self.repo_id,
                    SYSTEM_PLAN_ID,
                    Some(&op),
                    None,
                );
                info!(op_id = op.id, repo_id = %self.repo_id, "prune completed");
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
                warn!(op_id = op.id, repo_id = %self.repo_id, error = %err, "prune failed");
                op.payload = OpPayload::Prune {
                    output_preview: preview(&output),
                    skipped: false,
                    error: Some(err.to_string()),
                };
                finish(ctx, &mut op, OpStatus::Error).await?;
                Ok(())
            }
        }
    }

    async fn cancel(&mut self, status: OpStatus, ctx: &TaskContext) -> anyhow::Result<()> {
        cancel_pending_op(&mut self.op, status, ctx).await
    }
}

/// First chunk of the output, cut on a char boundary.
fn preview(output: &str) -> String {
    if output.len() <= OUTPUT_PREVIEW_BYTES {
        return output.to_owned();
    }
    let mut end = OUTPUT_PREVIEW_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_preview_is_identity() {
        assert_eq!(preview("repacking"), "repacking");
    }

    #[test]
    fn long_output_preview_is_capped() {
        let long = "x".repeat(OUTPUT_PREVIEW_BYTES * 2);
        assert_eq!(preview(&long).len(), OUTPUT_PREVIEW_BYTES);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let mut long = "x".repeat(OUTPUT_PREVIEW_BYTES - 1);
        long.push('é');
        long.push_str(&"y".repeat(100));
        let p = preview(&long);
        assert!(p.len() <= OUTPUT_PREVIEW_BYTES);
        assert!(p.chars().all(|c| c == 'x'));
    }
}
