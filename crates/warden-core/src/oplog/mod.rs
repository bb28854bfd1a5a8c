//! The operation journal: durable, append-only, indexed by id, repo, plan,
//! snapshot, and flow, with synchronous fan-out on every committed
//! mutation.
//!
//! All mutations run inside a single write transaction that validates the
//! status graph and the at-most-one-running invariant before touching rows.
//! The write path is serialized by an async mutex so subscribers observe
//! mutations strictly in commit order. Subscriber callbacks run on the
//! commit path and must not block; the broadcast broker satisfies that by
//! only enqueuing.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{error, warn};

use warden_db::error::OpLogError;
use warden_db::models::{HistoryFilter, NewOperation, OpQuery, OpStatus, Operation};
use warden_db::queries::operations as db;

/// Subscriber callback, invoked with `(old, new)`: `None` old on insert,
/// `None` new on delete.
pub type Callback = dyn Fn(Option<&Operation>, Option<&Operation>) + Send + Sync;

/// Handle returned by [`OpLog::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// Terminal-transition retry schedule. The journal must not lose terminal
/// states, so a persistent failure here aborts the process.
const TERMINAL_RETRIES: u32 = 4;
const TERMINAL_BACKOFF: Duration = Duration::from_millis(100);

/// Page size for [`OpLog::for_each_since`].
const SCAN_BATCH: u32 = 256;

pub struct OpLog {
    pool: SqlitePool,
    write_lock: tokio::sync::Mutex<()>,
    /// Copy-on-write: `notify` reads a snapshot, mutation replaces the Arc.
    subscribers: RwLock<Arc<Vec<(u64, Arc<Callback>)>>>,
    next_handle: AtomicU64,
}

impl OpLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: tokio::sync::Mutex::new(()),
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_handle: AtomicU64::new(1),
        }
    }

    // -- mutation ----------------------------------------------------------

    /// Insert one operation; the journal assigns the id.
    pub async fn add(&self, new: NewOperation) -> Result<Operation, OpLogError> {
        validate_new(&new)?;

        let _guard = self.write_lock.lock().await;
        let op = db::insert_operation(&self.pool, &new).await?;
        self.notify(None, Some(&op));
        Ok(op)
    }

    /// Atomically insert a batch, assigning contiguous ids in input order.
    pub async fn bulk_add(&self, news: Vec<NewOperation>) -> Result<Vec<Operation>, OpLogError> {
        for new in &news {
            validate_new(new)?;
        }

        let _guard = self.write_lock.lock().await;
        let ops = db::bulk_insert_operations(&self.pool, &news).await?;
        for op in &ops {
            self.notify(None, Some(op));
        }
        Ok(ops)
    }

    /// Replace an existing row after validating the status transition.
    ///
    /// Fails with [`OpLogError::NotFound`] for unknown ids and
    /// [`OpLogError::IllegalTransition`] for non-monotonic status moves.
    /// Terminal rows accept only a log-ref backfill.
    pub async fn update(&self, op: &Operation) -> Result<Operation, OpLogError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let old = db::get_operation(&mut *tx, op.id)
            .await?
            .ok_or(OpLogError::NotFound(op.id))?;

        validate_update(&old, op)?;

        if old.status == OpStatus::Pending && op.status == OpStatus::Inprogress {
            let running =
                db::count_inprogress_for_pair(&mut *tx, &op.repo_id, &op.plan_id, op.id).await?;
            if running > 0 {
                return Err(OpLogError::InvalidArgument(format!(
                    "another operation for repo {:?} plan {:?} is already in progress",
                    op.repo_id, op.plan_id
                )));
            }
        }

        let rows = db::update_operation(&mut *tx, op).await?;
        if rows == 0 {
            // The row vanished between the read and the write; both run in
            // the same transaction, so this indicates storage trouble.
            return Err(OpLogError::NotFound(op.id));
        }
        tx.commit().await?;

        self.notify(Some(&old), Some(op));
        Ok(op.clone())
    }

    /// Commit a terminal transition, retrying transient storage errors with
    /// bounded backoff. If the terminal state still cannot be committed the
    /// journal would violate its lifecycle invariant, so the process aborts.
    pub async fn update_terminal(&self, op: &Operation) -> Result<Operation, OpLogError> {
        debug_assert!(op.status.is_terminal());

        let mut attempt = 0;
        loop {
            match self.update(op).await {
                Ok(committed) => return Ok(committed),
                Err(err) if err.is_transient() && attempt < TERMINAL_RETRIES => {
                    attempt += 1;
                    warn!(
                        op_id = op.id,
                        attempt,
                        error = %err,
                        "transient failure committing terminal status, retrying"
                    );
                    tokio::time::sleep(TERMINAL_BACKOFF * attempt).await;
                }
                Err(err) if err.is_transient() => {
                    error!(
                        op_id = op.id,
                        error = %err,
                        "cannot commit terminal status, aborting"
                    );
                    std::process::abort();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Delete history rows matching the filter. Returns the deleted ids.
    pub async fn delete(&self, filter: &HistoryFilter) -> Result<Vec<i64>, OpLogError> {
        let _guard = self.write_lock.lock().await;
        let deleted = db::delete_operations(&self.pool, filter).await?;
        for op in &deleted {
            self.notify(Some(op), None);
        }
        Ok(deleted.into_iter().map(|op| op.id).collect())
    }

    // -- lookup ------------------------------------------------------------

    /// Point lookup; [`OpLogError::NotFound`] when the id does not exist.
    pub async fn get(&self, id: i64) -> Result<Operation, OpLogError> {
        db::get_operation(&self.pool, id)
            .await?
            .ok_or(OpLogError::NotFound(id))
    }

    pub async fn get_by_repo(
        &self,
        repo_id: &str,
        query: &OpQuery,
    ) -> Result<Vec<Operation>, OpLogError> {
        db::list_by_repo(&self.pool, repo_id, query).await
    }

    pub async fn get_by_plan(
        &self,
        plan_id: &str,
        query: &OpQuery,
    ) -> Result<Vec<Operation>, OpLogError> {
        db::list_by_plan(&self.pool, plan_id, query).await
    }

    pub async fn get_by_snapshot(
        &self,
        snapshot_id: &str,
        query: &OpQuery,
    ) -> Result<Vec<Operation>, OpLogError> {
        db::list_by_snapshot(&self.pool, snapshot_id, query).await
    }

    pub async fn get_by_flow(
        &self,
        flow_id: i64,
        query: &OpQuery,
    ) -> Result<Vec<Operation>, OpLogError> {
        db::list_by_flow(&self.pool, flow_id, query).await
    }

    pub async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<Operation>, OpLogError> {
        db::list_by_ids(&self.pool, ids).await
    }

    pub async fn get_last_n(&self, n: u32) -> Result<Vec<Operation>, OpLogError> {
        db::list_last_n(&self.pool, n).await
    }

    /// Streaming scan of every row with id greater than `since_id`, in id
    /// order. Used by late subscribers to catch up after a `Lost` marker.
    /// Returns the last id visited (or `since_id` when nothing matched).
    pub async fn for_each_since<F>(&self, since_id: i64, mut visit: F) -> Result<i64, OpLogError>
    where
        F: FnMut(Operation),
    {
        let mut cursor = since_id;
        loop {
            let batch = db::list_since(&self.pool, cursor, SCAN_BATCH).await?;
            let Some(last) = batch.last() else {
                return Ok(cursor);
            };
            cursor = last.id;
            for op in batch {
                visit(op);
            }
        }
    }

    /// Snapshot ids already indexed for a repo, ignoring cancelled rows.
    pub async fn index_snapshot_ids(&self, repo_id: &str) -> Result<Vec<String>, OpLogError> {
        db::index_snapshot_ids_for_repo(&self.pool, repo_id).await
    }

    /// Completion time of the newest successful prune for a repo.
    pub async fn last_successful_prune_ms(
        &self,
        repo_id: &str,
    ) -> Result<Option<i64>, OpLogError> {
        db::last_successful_prune_ms(&self.pool, repo_id).await
    }

    /// Rows left pending or in progress by a previous process.
    pub async fn unfinished(&self) -> Result<Vec<Operation>, OpLogError> {
        db::list_unfinished(&self.pool).await
    }

    // -- fan-out -----------------------------------------------------------

    /// Register a callback invoked on the commit path for every mutation.
    /// Callbacks must not block.
    pub fn subscribe(&self, callback: Arc<Callback>) -> SubscriptionHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.subscribers.write().expect("subscriber lock poisoned");
        let mut next = guard.as_ref().clone();
        next.push((handle, callback));
        *guard = Arc::new(next);
        SubscriptionHandle(handle)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut guard = self.subscribers.write().expect("subscriber lock poisoned");
        let mut next = guard.as_ref().clone();
        next.retain(|(id, _)| *id != handle.0);
        *guard = Arc::new(next);
    }

    fn notify(&self, old: Option<&Operation>, new: Option<&Operation>) {
        let snapshot = {
            let guard = self.subscribers.read().expect("subscriber lock poisoned");
            Arc::clone(&guard)
        };
        for (id, callback) in snapshot.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| callback(old, new)));
            if result.is_err() {
                warn!(subscriber = id, "journal subscriber panicked; commit unaffected");
            }
        }
    }
}

impl std::fmt::Debug for OpLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLog").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_new(new: &NewOperation) -> Result<(), OpLogError> {
    if new.status == OpStatus::Inprogress {
        return Err(OpLogError::InvalidArgument(
            "operations are inserted pending or terminal, never in progress".into(),
        ));
    }
    if new.status.is_terminal() && new.ended_at_ms.is_none() {
        return Err(OpLogError::InvalidArgument(
            "terminal operations require an end timestamp".into(),
        ));
    }
    if let Some(ended) = new.ended_at_ms {
        if ended < new.started_at_ms {
            return Err(OpLogError::InvalidArgument(
                "operation would end before it started".into(),
            ));
        }
    }
    if new.payload.kind() == warden_db::models::OpKind::IndexSnapshot {
        match &new.snapshot_id {
            Some(id) if !id.is_empty() => {}
            _ => {
                return Err(OpLogError::InvalidArgument(
                    "index-snapshot operations require a snapshot id".into(),
                ));
            }
        }
    }
    Ok(())
}

fn validate_update(old: &Operation, op: &Operation) -> Result<(), OpLogError> {
    if old.kind() != op.kind() {
        return Err(OpLogError::InvalidArgument(format!(
            "operation {} cannot change kind ({} -> {})",
            op.id,
            old.kind(),
            op.kind()
        )));
    }

    if let Some(ended) = op.ended_at_ms {
        if ended < op.started_at_ms {
            return Err(OpLogError::InvalidArgument(format!(
                "operation {} would end ({ended}) before it started ({})",
                op.id, op.started_at_ms
            )));
        }
    }

    if old.status.is_terminal() {
        // Terminal rows are immutable except for log-ref backfill.
        let mut candidate = op.clone();
        candidate.log_ref = old.log_ref.clone();
        if candidate != *old {
            return Err(OpLogError::IllegalTransition {
                id: op.id,
                from: old.status,
                to: op.status,
            });
        }
        return Ok(());
    }

    if !old.status.can_transition_to(op.status) {
        return Err(OpLogError::IllegalTransition {
            id: op.id,
            from: old.status,
            to: op.status,
        });
    }

    Ok(())
}
