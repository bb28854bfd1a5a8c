//! A scriptable in-memory [`RepoDriver`] for integration tests.
//!
//! Backups mint snapshots into an in-memory list, forget applies keep-last
//! retention against it, and every call bumps a counter so tests can assert
//! what ran. Concurrency gauges record how many backups overlapped, which
//! is how the per-repo serialization tests observe the scheduler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use warden_core::config::{Plan, PrunePolicy, Repo, RetentionPolicy};
use warden_core::repo::{
    DriverError, DriverFactory, FileEntry, ForgetTarget, RepoDriver, Snapshot,
};
use warden_db::models::{
    BackupProgress, BackupSummary, CheckSummary, RestoreProgress, StatsSummary,
};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as i64
}

/// Tunable behavior, mutable mid-test.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// How long a backup "runs" (cancellable).
    pub backup_delay: Duration,
    /// Fail backups with a subprocess error instead of completing.
    pub fail_backup: bool,
    /// Progress entries emitted before a backup completes.
    pub progress_entries: Vec<BackupProgress>,
}

/// Observed-concurrency gauge shared across drivers of one factory.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    running: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous backups observed.
    pub fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct CallCounts {
    pub backups: AtomicUsize,
    pub forgets: AtomicUsize,
    pub prunes: AtomicUsize,
    pub restores: AtomicUsize,
    pub stats: AtomicUsize,
    pub checks: AtomicUsize,
    pub unlocks: AtomicUsize,
}

pub struct MockDriver {
    repo_id: String,
    pub behavior: Mutex<MockBehavior>,
    pub counts: CallCounts,
    /// Per-driver overlap gauge: >1 means the scheduler broke per-repo
    /// serialization.
    pub overlap: ConcurrencyGauge,
    /// Shared across the factory's drivers, for cross-repo parallelism
    /// assertions.
    pub global_overlap: Arc<ConcurrencyGauge>,
    snapshots: Mutex<Vec<Snapshot>>,
    snapshot_counter: AtomicU64,
}

impl MockDriver {
    fn new(repo_id: &str, global_overlap: Arc<ConcurrencyGauge>) -> Self {
        Self {
            repo_id: repo_id.to_owned(),
            behavior: Mutex::new(MockBehavior::default()),
            counts: CallCounts::default(),
            overlap: ConcurrencyGauge::default(),
            global_overlap,
            snapshots: Mutex::new(Vec::new()),
            snapshot_counter: AtomicU64::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().expect("behavior lock poisoned") = behavior;
    }

    /// Pre-seed a snapshot, as if a backup ran before the supervisor
    /// started.
    pub fn seed_snapshot(&self, plan_id: &str, time_ms: i64) -> String {
        let n = self.snapshot_counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-snap-{n}", self.repo_id);
        self.snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .push(Snapshot {
                id: id.clone(),
                plan_id: plan_id.to_owned(),
                time_ms,
                paths: vec![],
                hostname: "mock".into(),
            });
        id
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }
}

#[async_trait]
impl RepoDriver for MockDriver {
    fn repo_id(&self) -> &str {
        &self.repo_id
    }

    async fn backup(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        progress: &(dyn Fn(BackupProgress) + Send + Sync),
    ) -> Result<BackupSummary, DriverError> {
        self.counts.backups.fetch_add(1, Ordering::SeqCst);
        self.overlap.enter();
        self.global_overlap.enter();

        let behavior = self.behavior.lock().expect("behavior lock poisoned").clone();
        for entry in &behavior.progress_entries {
            progress(entry.clone());
        }

        let outcome = async {
            if !behavior.backup_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(behavior.backup_delay) => {}
                    _ = cancel.cancelled() => return Err(DriverError::Cancelled),
                }
            }
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            if behavior.fail_backup {
                return Err(DriverError::SubprocessFailed {
                    exit_code: 1,
                    tail: "mock backup failure".into(),
                });
            }

            let snapshot_id = self.seed_snapshot(&plan.id, now_ms());
            Ok(BackupSummary {
                snapshot_id,
                files_processed: 10,
                bytes_processed: 1024,
                duration_ms: behavior.backup_delay.as_millis() as i64,
            })
        }
        .await;

        self.overlap.exit();
        self.global_overlap.exit();
        outcome
    }

    async fn forget(
        &self,
        _cancel: &CancellationToken,
        target: ForgetTarget<'_>,
    ) -> Result<Vec<String>, DriverError> {
        self.counts.forgets.fetch_add(1, Ordering::SeqCst);
        let mut snapshots = self.snapshots.lock().expect("snapshot lock poisoned");

        match target {
            ForgetTarget::Snapshot(snapshot_id) => {
                let before = snapshots.len();
                snapshots.retain(|s| s.id != snapshot_id);
                if snapshots.len() < before {
                    Ok(vec![snapshot_id.to_owned()])
                } else {
                    Ok(vec![])
                }
            }
            ForgetTarget::Plan { plan, policy } => {
                let keep = match policy {
                    RetentionPolicy::KeepLast(n) => *n as usize,
                    // Time-bucketed retention is not simulated; keep all.
                    RetentionPolicy::TimeBucketed { .. } => return Ok(vec![]),
                };

                let mut plan_snapshots: Vec<Snapshot> = snapshots
                    .iter()
                    .filter(|s| s.plan_id == plan.id)
                    .cloned()
                    .collect();
                plan_snapshots.sort_by_key(|s| std::cmp::Reverse(s.time_ms));

                let forgotten: Vec<String> = plan_snapshots
                    .iter()
                    .skip(keep)
                    .map(|s| s.id.clone())
                    .collect();
                snapshots.retain(|s| !forgotten.contains(&s.id));
                Ok(forgotten)
            }
        }
    }

    async fn prune(
        &self,
        _cancel: &CancellationToken,
        _policy: &PrunePolicy,
        on_output: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<(), DriverError> {
        self.counts.prunes.fetch_add(1, Ordering::SeqCst);
        on_output("counting files in repo");
        on_output("repacking packs");
        on_output("done");
        Ok(())
    }

    async fn restore(
        &self,
        _cancel: &CancellationToken,
        _snapshot_id: &str,
        _path: &str,
        _target: &Path,
        progress: &(dyn Fn(RestoreProgress) + Send + Sync),
    ) -> Result<(), DriverError> {
        self.counts.restores.fetch_add(1, Ordering::SeqCst);
        progress(RestoreProgress {
            percent_done: 1.0,
            bytes_restored: 2048,
            total_bytes: 2048,
        });
        Ok(())
    }

    async fn snapshots_for_plan(
        &self,
        _cancel: &CancellationToken,
        plan: &Plan,
    ) -> Result<Vec<Snapshot>, DriverError> {
        let snapshots = self.snapshots.lock().expect("snapshot lock poisoned");
        Ok(snapshots
            .iter()
            .filter(|s| s.plan_id == plan.id)
            .cloned()
            .collect())
    }

    async fn list_files(
        &self,
        _cancel: &CancellationToken,
        snapshot_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>, DriverError> {
        let base = path.trim_end_matches('/');
        Ok(vec![
            FileEntry {
                path: format!("{base}/hello.txt"),
                size: 64,
                is_dir: false,
                mtime_ms: now_ms(),
            },
            FileEntry {
                path: format!("{base}/{snapshot_id}"),
                size: 0,
                is_dir: true,
                mtime_ms: now_ms(),
            },
        ])
    }

    async fn unlock(&self, _cancel: &CancellationToken) -> Result<(), DriverError> {
        self.counts.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self, _cancel: &CancellationToken) -> Result<StatsSummary, DriverError> {
        self.counts.stats.fetch_add(1, Ordering::SeqCst);
        let snapshots = self.snapshots.lock().expect("snapshot lock poisoned");
        Ok(StatsSummary {
            total_size: 4096,
            total_file_count: 10,
            snapshot_count: snapshots.len() as u64,
        })
    }

    async fn check(&self, _cancel: &CancellationToken) -> Result<CheckSummary, DriverError> {
        self.counts.checks.fetch_add(1, Ordering::SeqCst);
        Ok(CheckSummary {
            ok: true,
            detail: None,
        })
    }
}

/// Factory handing out one shared [`MockDriver`] per repo id. Tests grab
/// the driver up front (creating it) to script behavior before the
/// registry ever asks for it.
#[derive(Default)]
pub struct MockFactory {
    drivers: Mutex<HashMap<String, Arc<MockDriver>>>,
    global_overlap: Arc<ConcurrencyGauge>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The (shared) driver for a repo, created on first use.
    pub fn driver(&self, repo_id: &str) -> Arc<MockDriver> {
        let mut drivers = self.drivers.lock().expect("driver lock poisoned");
        Arc::clone(drivers.entry(repo_id.to_owned()).or_insert_with(|| {
            Arc::new(MockDriver::new(repo_id, Arc::clone(&self.global_overlap)))
        }))
    }

    pub fn global_overlap(&self) -> &ConcurrencyGauge {
        &self.global_overlap
    }
}

#[async_trait]
impl DriverFactory for MockFactory {
    async fn build(&self, repo: &Repo) -> Result<Arc<dyn RepoDriver>, DriverError> {
        Ok(self.driver(&repo.id) as Arc<dyn RepoDriver>)
    }
}
