//! Integration tests for the operation journal semantics: transition
//! enforcement, the single-running invariant, and commit-ordered fan-out.

use std::sync::{Arc, Mutex};

use warden_core::oplog::OpLog;
use warden_db::error::OpLogError;
use warden_db::models::{NewOperation, OpPayload, OpStatus, Operation};
use warden_test_utils::{TestDb, create_test_db};

/// Keeps the backing [`TestDb`] (and its `TempDir`) alive for as long as
/// the journal itself, so later connections can still open the file.
struct TestOpLog {
    oplog: OpLog,
    _db: TestDb,
}

impl std::ops::Deref for TestOpLog {
    type Target = OpLog;
    fn deref(&self) -> &OpLog {
        &self.oplog
    }
}

fn pending_backup(repo_id: &str, plan_id: &str) -> NewOperation {
    NewOperation {
        flow_id: None,
        repo_id: repo_id.to_owned(),
        plan_id: plan_id.to_owned(),
        snapshot_id: None,
        status: OpStatus::Pending,
        started_at_ms: 1_000,
        ended_at_ms: None,
        payload: OpPayload::backup(),
    }
}

async fn test_oplog() -> TestOpLog {
    let db = create_test_db().await;
    let oplog = OpLog::new(db.pool.clone());
    TestOpLog { oplog, _db: db }
}

async fn advance(oplog: &OpLog, op: &Operation, status: OpStatus) -> Result<Operation, OpLogError> {
    let mut next = op.clone();
    next.status = status;
    if status.is_terminal() {
        next.ended_at_ms = Some(next.started_at_ms + 100);
    }
    oplog.update(&next).await
}

#[tokio::test]
async fn add_assigns_ids_and_rejects_inprogress_inserts() {
    let oplog = test_oplog().await;

    let a = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    let b = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    assert!(b.id > a.id);

    let mut bad = pending_backup("r1", "p1");
    bad.status = OpStatus::Inprogress;
    assert!(matches!(
        oplog.add(bad).await,
        Err(OpLogError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn index_snapshot_inserts_require_a_snapshot_id() {
    let oplog = test_oplog().await;

    let mut bad = pending_backup("r1", "p1");
    bad.payload = OpPayload::IndexSnapshot {
        snapshot_id: "snap".into(),
    };
    // Payload says index-snapshot but the column is empty.
    assert!(matches!(
        oplog.add(bad).await,
        Err(OpLogError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn lifecycle_happy_path() {
    let oplog = test_oplog().await;

    let op = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    let running = advance(&oplog, &op, OpStatus::Inprogress).await.unwrap();
    let done = advance(&oplog, &running, OpStatus::Success).await.unwrap();

    assert_eq!(done.status, OpStatus::Success);
    assert!(done.ended_at_ms.unwrap() >= done.started_at_ms);
}

#[tokio::test]
async fn non_monotone_transitions_are_rejected() {
    let oplog = test_oplog().await;

    // Pending cannot jump straight to a success/error terminal.
    let op = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    assert!(matches!(
        advance(&oplog, &op, OpStatus::Success).await,
        Err(OpLogError::IllegalTransition { .. })
    ));

    // A terminal row cannot come back to life.
    let running = advance(&oplog, &op, OpStatus::Inprogress).await.unwrap();
    let done = advance(&oplog, &running, OpStatus::Error).await.unwrap();
    assert!(matches!(
        advance(&oplog, &done, OpStatus::Inprogress).await,
        Err(OpLogError::IllegalTransition { .. })
    ));
    assert!(matches!(
        advance(&oplog, &done, OpStatus::Success).await,
        Err(OpLogError::IllegalTransition { .. })
    ));
}

#[tokio::test]
async fn pending_can_be_cancelled_without_running() {
    let oplog = test_oplog().await;

    let op = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    let cancelled = advance(&oplog, &op, OpStatus::UserCancelled).await.unwrap();
    assert_eq!(cancelled.status, OpStatus::UserCancelled);
}

#[tokio::test]
async fn terminal_rows_accept_only_log_ref_backfill() {
    let oplog = test_oplog().await;

    let op = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    let running = advance(&oplog, &op, OpStatus::Inprogress).await.unwrap();
    let done = advance(&oplog, &running, OpStatus::Success).await.unwrap();

    // Backfilling the log ref is fine.
    let mut backfill = done.clone();
    backfill.log_ref = Some("abc.log".into());
    let committed = oplog.update(&backfill).await.unwrap();
    assert_eq!(committed.log_ref.as_deref(), Some("abc.log"));

    // Changing anything else is not.
    let mut tampered = committed.clone();
    tampered.started_at_ms += 1;
    assert!(matches!(
        oplog.update(&tampered).await,
        Err(OpLogError::IllegalTransition { .. })
    ));
}

#[tokio::test]
async fn at_most_one_inprogress_per_repo_plan_pair() {
    let oplog = test_oplog().await;

    let first = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    let second = oplog.add(pending_backup("r1", "p1")).await.unwrap();

    advance(&oplog, &first, OpStatus::Inprogress).await.unwrap();
    // The second op for the same (repo, plan) cannot start.
    assert!(matches!(
        advance(&oplog, &second, OpStatus::Inprogress).await,
        Err(OpLogError::InvalidArgument(_))
    ));

    // A different plan on the same repo is unaffected.
    let other = oplog.add(pending_backup("r1", "p2")).await.unwrap();
    advance(&oplog, &other, OpStatus::Inprogress).await.unwrap();
}

#[tokio::test]
async fn end_before_start_is_rejected() {
    let oplog = test_oplog().await;

    let op = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    let running = advance(&oplog, &op, OpStatus::Inprogress).await.unwrap();

    let mut bad = running.clone();
    bad.status = OpStatus::Success;
    bad.ended_at_ms = Some(bad.started_at_ms - 1);
    assert!(matches!(
        oplog.update(&bad).await,
        Err(OpLogError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn update_of_unknown_id_is_not_found() {
    let oplog = test_oplog().await;

    let op = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    let mut ghost = op.clone();
    ghost.id = 9_999;
    ghost.status = OpStatus::Inprogress;
    assert!(matches!(
        oplog.update(&ghost).await,
        Err(OpLogError::NotFound(9_999))
    ));

    assert!(matches!(
        oplog.get(8_888).await,
        Err(OpLogError::NotFound(8_888))
    ));
}

#[tokio::test]
async fn subscribers_see_every_mutation_in_commit_order() {
    let oplog = test_oplog().await;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Created(i64),
        Updated(i64, OpStatus),
        Deleted(i64),
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let seen = Arc::clone(&seen);
        oplog.subscribe(Arc::new(move |old, new| {
            let mut seen = seen.lock().unwrap();
            match (old, new) {
                (None, Some(op)) => seen.push(Seen::Created(op.id)),
                (Some(_), Some(op)) => seen.push(Seen::Updated(op.id, op.status)),
                (Some(op), None) => seen.push(Seen::Deleted(op.id)),
                (None, None) => {}
            }
        }))
    };

    let op = oplog.add(pending_backup("r1", "p1")).await.unwrap();
    let running = advance(&oplog, &op, OpStatus::Inprogress).await.unwrap();
    advance(&oplog, &running, OpStatus::Error).await.unwrap();
    oplog
        .delete(&warden_db::models::HistoryFilter {
            only_failed: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Seen::Created(op.id),
            Seen::Updated(op.id, OpStatus::Inprogress),
            Seen::Updated(op.id, OpStatus::Error),
            Seen::Deleted(op.id),
        ]
    );

    // After unsubscribing, mutations no longer arrive.
    oplog.unsubscribe(handle);
    oplog.add(pending_backup("r1", "p1")).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn panicking_subscriber_does_not_fail_the_commit() {
    let oplog = test_oplog().await;

    oplog.subscribe(Arc::new(|_, _| panic!("bad subscriber")));
    let op = oplog.add(pending_backup("r1", "p1")).await;
    assert!(op.is_ok(), "commit must survive a subscriber panic");
}

#[tokio::test]
async fn bulk_add_is_atomic_and_ordered() {
    let oplog = test_oplog().await;

    let news: Vec<NewOperation> = (0..3)
        .map(|i| {
            let mut new = pending_backup("r1", "p1");
            new.status = OpStatus::Success;
            new.ended_at_ms = Some(1_000);
            new.snapshot_id = Some(format!("snap-{i}"));
            new.payload = OpPayload::IndexSnapshot {
                snapshot_id: format!("snap-{i}"),
            };
            new
        })
        .collect();

    let ops = oplog.bulk_add(news).await.unwrap();
    assert_eq!(ops.len(), 3);
    for pair in ops.windows(2) {
        assert_eq!(pair[1].id, pair[0].id + 1);
    }
}

#[tokio::test]
async fn for_each_since_scans_in_id_order() {
    let oplog = test_oplog().await;

    let mut ids = Vec::new();
    for _ in 0..7 {
        ids.push(oplog.add(pending_backup("r1", "p1")).await.unwrap().id);
    }

    let mut visited = Vec::new();
    let last = oplog
        .for_each_since(ids[2], |op| visited.push(op.id))
        .await
        .unwrap();

    assert_eq!(visited, ids[3..].to_vec());
    assert_eq!(last, *ids.last().unwrap());

    // Nothing after the tail.
    let mut empty = Vec::new();
    let last = oplog
        .for_each_since(last, |op| empty.push(op.id))
        .await
        .unwrap();
    assert!(empty.is_empty());
    assert_eq!(last, *ids.last().unwrap());
}
