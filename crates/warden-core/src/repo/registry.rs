//! Repo registry -- memoized drivers plus the per-repo execution slot.
//!
//! Drivers are built lazily through the injected [`DriverFactory`] on first
//! access and cached for the life of the config. The slot is a one-permit
//! semaphore: the scheduler acquires it before running any task against the
//! repo, which is what serializes work per repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use super::trait_def::RepoDriver;
use super::types::DriverError;
use crate::config::Repo;

/// Builds a concrete driver for one repo. Implemented by the external
/// subprocess driver; tests inject scriptable fakes.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn build(&self, repo: &Repo) -> Result<Arc<dyn RepoDriver>, DriverError>;
}

pub struct RepoRegistry {
    factory: Arc<dyn DriverFactory>,
    /// Held across `factory.build` so concurrent `get` calls for the same
    /// repo block until the first build finishes.
    drivers: tokio::sync::Mutex<HashMap<String, Arc<dyn RepoDriver>>>,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl RepoRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            drivers: tokio::sync::Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The cached driver for `repo`, building it on first access.
    pub async fn get(&self, repo: &Repo) -> Result<Arc<dyn RepoDriver>, DriverError> {
        let mut drivers = self.drivers.lock().await;
        if let Some(driver) = drivers.get(&repo.id) {
            return Ok(Arc::clone(driver));
        }

        debug!(repo_id = %repo.id, "building repo driver");
        let driver = self.factory.build(repo).await?;
        drivers.insert(repo.id.clone(), Arc::clone(&driver));
        Ok(driver)
    }

    /// The mutual-exclusion slot for a repo: one permit, not reentrant.
    /// Created on first use so it exists before any driver does.
    pub fn slot(&self, repo_id: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        Arc::clone(
            slots
                .entry(repo_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    /// Tear down state for repos no longer in the config. Running tasks
    /// keep their driver alive through their own `Arc`.
    pub async fn retain(&self, keep: &[String]) {
        let mut drivers = self.drivers.lock().await;
        drivers.retain(|id, _| keep.contains(id));
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        slots.retain(|id, _| keep.contains(id));
    }
}

impl std::fmt::Debug for RepoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use std::path::Path;
    use tokio_util::sync::CancellationToken;
    use warden_db::models::{
        BackupProgress, BackupSummary, CheckSummary, RestoreProgress, StatsSummary,
    };

    use crate::config::{Plan, PrunePolicy};
    use crate::repo::types::{FileEntry, ForgetTarget, Snapshot};

    struct FakeDriver {
        repo_id: String,
    }

    #[async_trait]
    impl RepoDriver for FakeDriver {
        fn repo_id(&self) -> &str {
            &self.repo_id
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

    struct CountingFactory {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl DriverFactory for CountingFactory {
        async fn build(&self, repo: &Repo) -> Result<Arc<dyn RepoDriver>, DriverError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeDriver {
                repo_id: repo.id.clone(),
            }))
        }
    }

    fn test_repo(id: &str) -> Repo {
        Repo {
            id: id.into(),
            uri: format!("/srv/{id}"),
            env: BTreeMap::new(),
            flags: vec![],
            prune: None,
        }
    }

    #[tokio::test]
    async fn driver_is_built_once_and_cached() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let registry = RepoRegistry::new(Arc::clone(&factory) as Arc<dyn DriverFactory>);
        let repo = test_repo("r1");

        let a = registry.get(&repo).await.unwrap();
        let b = registry.get(&repo).await.unwrap();

        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_gets_build_once() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let registry = Arc::new(RepoRegistry::new(
            Arc::clone(&factory) as Arc<dyn DriverFactory>
        ));
        let repo = test_repo("r1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                registry.get(&repo).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slot_is_one_permit_and_shared() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let registry = RepoRegistry::new(factory as Arc<dyn DriverFactory>);

        let slot = registry.slot("r1");
        let same = registry.slot("r1");
        assert!(Arc::ptr_eq(&slot, &same));

        let permit = slot.clone().try_acquire_owned().unwrap();
        assert!(same.try_acquire().is_err(), "second acquire must fail");
        drop(permit);
        assert!(same.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn retain_drops_vanished_repos() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let registry = RepoRegistry::new(Arc::clone(&factory) as Arc<dyn DriverFactory>);

        registry.get(&test_repo("r1")).await.unwrap();
        registry.get(&test_repo("r2")).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);

        registry.retain(&["r1".to_owned()]).await;

        // r1 is still cached, r2 gets rebuilt.
        registry.get(&test_repo("r1")).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        registry.get(&test_repo("r2")).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 3);
    }
}
