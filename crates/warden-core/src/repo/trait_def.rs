//! The `RepoDriver` trait -- the adapter interface to the backup binary.
//!
//! The concrete driver (argument construction, stdout parsing, process
//! management) lives outside this crate. The trait is intentionally
//! object-safe so it can be stored as `Arc<dyn RepoDriver>` in the
//! [`super::RepoRegistry`].

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use warden_db::models::{BackupProgress, BackupSummary, CheckSummary, RestoreProgress, StatsSummary};

use super::types::{DriverError, FileEntry, ForgetTarget, Snapshot};
use crate::config::{Plan, PrunePolicy};

/// Adapter interface for one repository's backup subprocess.
///
/// Implementations must honor `cancel` at every I/O boundary: a cancelled
/// token means "terminate the child and return [`DriverError::Cancelled`]".
/// Progress callbacks are synchronous and must be cheap; the core debounces
/// journal writes on its side.
#[async_trait]
pub trait RepoDriver: Send + Sync {
    /// The repo this driver is bound to.
    fn repo_id(&self) -> &str;

    /// Back up the plan's paths. `progress` is invoked per progress entry;
    /// the returned summary is authoritative for the final state.
    async fn backup(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        progress: &(dyn Fn(BackupProgress) + Send + Sync),
    ) -> Result<BackupSummary, DriverError>;

    /// Remove snapshots per the target's retention policy (or one specific
    /// snapshot). Returns the forgotten snapshot ids.
    async fn forget(
        &self,
        cancel: &CancellationToken,
        target: ForgetTarget<'_>,
    ) -> Result<Vec<String>, DriverError>;

    /// Repack unused data. Output is unstructured text, streamed verbatim
    /// through `on_output` line by line.
    async fn prune(
        &self,
        cancel: &CancellationToken,
        policy: &PrunePolicy,
        on_output: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<(), DriverError>;

    /// Restore `path` from a snapshot into `target`.
    async fn restore(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        path: &str,
        target: &Path,
        progress: &(dyn Fn(RestoreProgress) + Send + Sync),
    ) -> Result<(), DriverError>;

    /// All snapshots tagged for the plan.
    async fn snapshots_for_plan(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
    ) -> Result<Vec<Snapshot>, DriverError>;

    /// Directory listing inside a snapshot.
    async fn list_files(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>, DriverError>;

    /// Drop stale repository locks.
    async fn unlock(&self, cancel: &CancellationToken) -> Result<(), DriverError>;

    /// Repository statistics.
    async fn stats(&self, cancel: &CancellationToken) -> Result<StatsSummary, DriverError>;

    /// Repository integrity check.
    async fn check(&self, cancel: &CancellationToken) -> Result<CheckSummary, DriverError>;
}

// Compile-time assertion: RepoDriver must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn RepoDriver) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    /// A trivial driver that does nothing, used only to prove the trait can
    /// be implemented and used as `dyn RepoDriver`.
    struct NoopDriver;

    #[async_trait]
    impl RepoDriver for NoopDriver {
        fn repo_id(&self) -> &str {
            "noop"
        }

        async fn backup(
            &self,
            _cancel: &CancellationToken,
            _plan: &Plan,
            _progress: &(dyn Fn(BackupProgress) + Send + Sync),
        ) -> Result<BackupSummary, DriverError> {
            Ok(BackupSummary::default())
        }

        async fn forget(
            &self,
            _cancel: &CancellationToken,
            _target: ForgetTarget<'_>,
        ) -> Result<Vec<String>, DriverError> {
            Ok(vec![])
        }

        async fn prune(
            &self,
            _cancel: &CancellationToken,
            _policy: &PrunePolicy,
            _on_output: &(dyn Fn(&str) + Send + Sync),
        ) -> Result<(), DriverError> {
            Ok(())
        }

        async fn restore(
            &self,
            _cancel: &CancellationToken,
            _snapshot_id: &str,
            _path: &str,
            _target: &Path,
            _progress: &(dyn Fn(RestoreProgress) + Send + Sync),
        ) -> Result<(), DriverError> {
            Ok(())
        }

        async fn snapshots_for_plan(
            &self,
            _cancel: &CancellationToken,
            _plan: &Plan,
        ) -> Result<Vec<Snapshot>, DriverError> {
            Ok(vec![])
        }

        async fn list_files(
            &self,
            _cancel: &CancellationToken,
            _snapshot_id: &str,
            _path: &str,
        ) -> Result<Vec<FileEntry>, DriverError> {
            Ok(vec![])
        }

        async fn unlock(&self, _cancel: &CancellationToken) -> Result<(), DriverError> {
            Ok(())
        }

        async fn stats(&self, _cancel: &CancellationToken) -> Result<StatsSummary, DriverError> {
            Ok(StatsSummary::default())
        }

        async fn check(&self, _cancel: &CancellationToken) -> Result<CheckSummary, DriverError> {
            Ok(CheckSummary {
                ok: true,
                detail: None,
            })
        }
    }

    #[test]
    fn driver_is_object_safe() {
        // If this compiles, the trait is object-safe.
        let driver: Box<dyn RepoDriver> = Box::new(NoopDriver);
        assert_eq!(driver.repo_id(), "noop");
    }

    #[tokio::test]
    async fn noop_driver_round_trip() {
        let driver: Box<dyn RepoDriver> = Box::new(NoopDriver);
        let cancel = CancellationToken::new();

        let summary = driver.stats(&cancel).await.unwrap();
        assert_eq!(summary.snapshot_count, 0);

        let check = driver.check(&cancel).await.unwrap();
        assert!(check.ok);

        driver.unlock(&cancel).await.unwrap();
    }
}
