//! Database query functions for the `operations` table.

use sqlx::sqlite::Sqlite;
use sqlx::types::Json;
use sqlx::{Executor, QueryBuilder, SqlitePool};

use crate::error::OpLogError;
use crate::models::{HistoryFilter, NewOperation, OpQuery, OpStatus, Operation};

/// Insert a new operation row. The journal assigns the id; the `kind`
/// column is derived from the payload tag.
pub async fn insert_operation<'e, E>(ex: E, new: &NewOperation) -> Result<Operation, OpLogError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let op = sqlx::query_as::<_, Operation>(
        "INSERT INTO operations \
         (flow_id, repo_id, plan_id, snapshot_id, kind, status, started_at_ms, ended_at_ms, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         RETURNING *",
    )
    .bind(new.flow_id)
    .bind(&new.repo_id)
    .bind(&new.plan_id)
    .bind(&new.snapshot_id)
    .bind(new.payload.kind())
    .bind(new.status)
    .bind(new.started_at_ms)
    .bind(new.ended_at_ms)
    .bind(Json(&new.payload))
    .fetch_one(ex)
    .await?;

    Ok(op)
}

/// Atomically insert a batch of operation rows inside one transaction,
/// yielding contiguous ids in input order.
pub async fn bulk_insert_operations(
    pool: &SqlitePool,
    news: &[NewOperation],
) -> Result<Vec<Operation>, OpLogError> {
    let mut tx = pool.begin().await?;

    let mut inserted = Vec::with_capacity(news.len());
    for new in news {
        let op = insert_operation(&mut *tx, new).await?;
        inserted.push(op);
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Fetch a single operation by id.
pub async fn get_operation<'e, E>(ex: E, id: i64) -> Result<Option<Operation>, OpLogError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let op = sqlx::query_as::<_, Operation>("SELECT * FROM operations WHERE id = ?1")
        .bind(id)
        .fetch_optional(ex)
        .await?;

    Ok(op)
}

/// Replace an existing row wholesale. Returns the number of rows affected
/// (0 when the id does not exist).
pub async fn update_operation<'e, E>(ex: E, op: &Operation) -> Result<u64, OpLogError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE operations SET \
         flow_id = ?1, repo_id = ?2, plan_id = ?3, snapshot_id = ?4, kind = ?5, \
         status = ?6, started_at_ms = ?7, ended_at_ms = ?8, payload = ?9, log_ref = ?10 \
         WHERE id = ?11",
    )
    .bind(op.flow_id)
    .bind(&op.repo_id)
    .bind(&op.plan_id)
    .bind(&op.snapshot_id)
    .bind(op.kind())
    .bind(op.status)
    .bind(op.started_at_ms)
    .bind(op.ended_at_ms)
    .bind(Json(&op.payload))
    .bind(&op.log_ref)
    .bind(op.id)
    .execute(ex)
    .await?;

    Ok(result.rows_affected())
}

/// Count in-progress rows for a `(repo, plan)` pair, excluding one id.
/// Backs the at-most-one-running invariant check inside the update
/// transaction.
pub async fn count_inprogress_for_pair<'e, E>(
    ex: E,
    repo_id: &str,
    plan_id: &str,
    exclude_id: i64,
) -> Result<i64, OpLogError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM operations \
         WHERE repo_id = ?1 AND plan_id = ?2 AND status = 'inprogress' AND id != ?3",
    )
    .bind(repo_id)
    .bind(plan_id)
    .bind(exclude_id)
    .fetch_one(ex)
    .await?;

    Ok(row.0)
}

// ---------------------------------------------------------------------------
// Range scans
// ---------------------------------------------------------------------------

async fn scan_dimension(
    pool: &SqlitePool,
    column: &str,
    value: ScanValue<'_>,
    query: &OpQuery,
) -> Result<Vec<Operation>, OpLogError> {
    // `column` is a compile-time constant from the callers below, never
    // caller input.
    let sql = if query.reverse {
        format!(
            "SELECT * FROM operations WHERE {column} = ?1 AND id < ?2 \
             ORDER BY id DESC LIMIT ?3"
        )
    } else {
        format!(
            "SELECT * FROM operations WHERE {column} = ?1 AND id > ?2 \
             ORDER BY id ASC LIMIT ?3"
        )
    };

    let cursor = query
        .cursor
        .unwrap_or(if query.reverse { i64::MAX } else { 0 });
    // SQLite treats a negative LIMIT as unbounded.
    let limit = query.limit.map(i64::from).unwrap_or(-1);

    let mut q = sqlx::query_as::<_, Operation>(&sql);
    q = match value {
        ScanValue::Text(s) => q.bind(s.to_owned()),
        ScanValue::Int(i) => q.bind(i),
    };
    let ops = q.bind(cursor).bind(limit).fetch_all(pool).await?;

    Ok(ops)
}

enum ScanValue<'a> {
    Text(&'a str),
    Int(i64),
}

/// Range scan over all operations for one repo.
pub async fn list_by_repo(
    pool: &SqlitePool,
    repo_id: &str,
    query: &OpQuery,
) -> Result<Vec<Operation>, OpLogError> {
    scan_dimension(pool, "repo_id", ScanValue::Text(repo_id), query).await
}

/// Range scan over all operations for one plan.
pub async fn list_by_plan(
    pool: &SqlitePool,
    plan_id: &str,
    query: &OpQuery,
) -> Result<Vec<Operation>, OpLogError> {
    scan_dimension(pool, "plan_id", ScanValue::Text(plan_id), query).await
}

/// Range scan over all operations referencing one snapshot.
pub async fn list_by_snapshot(
    pool: &SqlitePool,
    snapshot_id: &str,
    query: &OpQuery,
) -> Result<Vec<Operation>, OpLogError> {
    scan_dimension(pool, "snapshot_id", ScanValue::Text(snapshot_id), query).await
}

/// Range scan over all operations in one flow.
pub async fn list_by_flow(
    pool: &SqlitePool,
    flow_id: i64,
    query: &OpQuery,
) -> Result<Vec<Operation>, OpLogError> {
    scan_dimension(pool, "flow_id", ScanValue::Int(flow_id), query).await
}

/// Forward page of operations with id strictly greater than `since_id`.
/// Backs the streaming catch-up scan.
pub async fn list_since(
    pool: &SqlitePool,
    since_id: i64,
    limit: u32,
) -> Result<Vec<Operation>, OpLogError> {
    let ops = sqlx::query_as::<_, Operation>(
        "SELECT * FROM operations WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
    )
    .bind(since_id)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    Ok(ops)
}

/// Explicit-id lookup preserving id order.
pub async fn list_by_ids(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<Operation>, OpLogError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM operations WHERE id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(") ORDER BY id ASC");

    let ops = builder
        .build_query_as::<Operation>()
        .fetch_all(pool)
        .await?;

    Ok(ops)
}

/// The most recent page of operations, returned in id order.
pub async fn list_last_n(pool: &SqlitePool, n: u32) -> Result<Vec<Operation>, OpLogError> {
    let mut ops = sqlx::query_as::<_, Operation>(
        "SELECT * FROM operations ORDER BY id DESC LIMIT ?1",
    )
    .bind(i64::from(n))
    .fetch_all(pool)
    .await?;

    ops.reverse();
    Ok(ops)
}

// ---------------------------------------------------------------------------
// Kind-specific lookups
// ---------------------------------------------------------------------------

/// Snapshot ids already indexed for a repo, ignoring cancelled rows.
pub async fn index_snapshot_ids_for_repo(
    pool: &SqlitePool,
    repo_id: &str,
) -> Result<Vec<String>, OpLogError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT snapshot_id FROM operations \
         WHERE repo_id = ?1 AND kind = 'index_snapshot' \
           AND status NOT IN ('user_cancelled', 'system_cancelled') \
           AND snapshot_id IS NOT NULL \
         ORDER BY id ASC",
    )
    .bind(repo_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Completion time of the newest successful prune for a repo, if any.
pub async fn last_successful_prune_ms(
    pool: &SqlitePool,
    repo_id: &str,
) -> Result<Option<i64>, OpLogError> {
    let row: Option<(Option<i64>,)> = sqlx::query_as(
        "SELECT ended_at_ms FROM operations \
         WHERE repo_id = ?1 AND kind = 'prune' AND status = 'success' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(repo_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(ms,)| ms))
}

/// Rows left pending or in progress, e.g. orphans from a previous process.
pub async fn list_unfinished(pool: &SqlitePool) -> Result<Vec<Operation>, OpLogError> {
    let ops = sqlx::query_as::<_, Operation>(
        "SELECT * FROM operations \
         WHERE status IN ('pending', 'inprogress') ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(ops)
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

/// Delete history rows matching the filter, returning the deleted rows so
/// the caller can publish removal events.
///
/// Only terminal rows are eligible; with `only_failed`, rows that ended in
/// `Success` or `Warning` are kept as well.
pub async fn delete_operations(
    pool: &SqlitePool,
    filter: &HistoryFilter,
) -> Result<Vec<Operation>, OpLogError> {
    let mut builder = QueryBuilder::<Sqlite>::new(
        "DELETE FROM operations WHERE status NOT IN ('pending', 'inprogress')",
    );

    if filter.only_failed {
        builder.push(" AND status NOT IN (");
        let mut kept = builder.separated(", ");
        kept.push_bind(OpStatus::Success);
        kept.push_bind(OpStatus::Warning);
        kept.push_unseparated(")");
    }
    if let Some(ref repo_id) = filter.repo_id {
        builder.push(" AND repo_id = ");
        builder.push_bind(repo_id);
    }
    if let Some(ref plan_id) = filter.plan_id {
        builder.push(" AND plan_id = ");
        builder.push_bind(plan_id);
    }
    if !filter.ids.is_empty() {
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in &filter.ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");
    }
    builder.push(" RETURNING *");

    let deleted = builder
        .build_query_as::<Operation>()
        .fetch_all(pool)
        .await?;

    Ok(deleted)
}
