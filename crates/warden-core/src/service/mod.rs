//! The supervisor facade: the service-level API a transport binds against.
//!
//! Owns the wiring between the journal, the broker, the registry, and the
//! scheduler loop: journal mutations fan out as broker events, trigger
//! calls enqueue one-shot tasks and return immediately, and download paths
//! are signed and verified here.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use warden_db::config::DbConfig;
use warden_db::error::OpLogError;
use warden_db::models::{HistoryFilter, OpKind, OpQuery, OpStatus, Operation};
use warden_db::pool;

use crate::config::{Config, ConfigHandle, Repo};
use crate::events::{Broker, Event};
use crate::logstore::LogStore;
use crate::oplog::{OpLog, SubscriptionHandle};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::repo::{DriverError, DriverFactory, FileEntry, RepoRegistry, Snapshot};
use crate::signing::{SignError, Signer};
use crate::tasks::backup::BackupTask;
use crate::tasks::forget::ForgetTask;
use crate::tasks::index_snapshots::IndexSnapshotsTask;
use crate::tasks::prune::PruneTask;
use crate::tasks::restore::RestoreTask;
use crate::tasks::stats::{CheckTask, StatsTask};

/// Default page size for unfiltered operation listings.
const DEFAULT_LAST_N: u32 = 100;

/// Errors surfaced across the service boundary.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    OpLog(#[from] OpLogError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<SignError> for ServiceError {
    fn from(err: SignError) -> Self {
        match err {
            SignError::Unauthorized => Self::Unauthorized,
            SignError::InvalidFormat(msg) => Self::InvalidArgument(msg),
        }
    }
}

/// Filter for [`Supervisor::get_operations`]. The most specific populated
/// dimension wins: explicit ids, then snapshot, flow, plan, repo; an empty
/// filter returns the most recent page.
#[derive(Debug, Clone, Default)]
pub struct OpFilter {
    pub repo_id: Option<String>,
    pub plan_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub flow_id: Option<i64>,
    pub ids: Vec<i64>,
    pub last_n: Option<u32>,
}

/// Filesystem and tuning knobs for a supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub database: DbConfig,
    /// Directory for subprocess log blobs.
    pub log_dir: PathBuf,
    /// Path of the persisted download-signing secret.
    pub secret_path: PathBuf,
    pub orchestrator: OrchestratorConfig,
}

pub struct Supervisor {
    oplog: Arc<OpLog>,
    broker: Broker,
    registry: Arc<RepoRegistry>,
    orchestrator: Orchestrator,
    logstore: LogStore,
    signer: Signer,
    config: ConfigHandle,
    broker_subscription: SubscriptionHandle,
}

impl Supervisor {
    /// Open storage, wire the journal fan-out, and start the scheduler.
    pub async fn start(
        options: SupervisorOptions,
        initial_config: Config,
        factory: Arc<dyn DriverFactory>,
    ) -> anyhow::Result<Self> {
        initial_config.validate().context("invalid config")?;

        let db_pool = pool::create_pool(&options.database).await?;
        pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

        let oplog = Arc::new(OpLog::new(db_pool));
        let broker = Broker::default();

        // Every committed journal mutation becomes a broker event, in
        // commit order. Publishing only enqueues, so the commit path stays
        // bounded.
        let broker_subscription = {
            let broker = broker.clone();
            oplog.subscribe(Arc::new(move |old, new| match (old, new) {
                (None, Some(op)) => broker.publish(Event::OperationCreated(op.clone())),
                (Some(_), Some(op)) => broker.publish(Event::OperationUpdated(op.clone())),
                (Some(op), None) => broker.publish(Event::OperationDeleted { id: op.id }),
                (None, None) => {}
            }))
        };

        let registry = Arc::new(RepoRegistry::new(factory));
        let logstore = LogStore::new(&options.log_dir)?;
        let signer = Signer::load_or_generate(&options.secret_path)?;
        let config = ConfigHandle::new(initial_config);

        let orchestrator = Orchestrator::start(
            Arc::clone(&oplog),
            broker.clone(),
            Arc::clone(&registry),
            logstore.clone(),
            config.clone(),
            options.orchestrator,
        )
        .await?;

        Ok(Self {
            oplog,
            broker,
            registry,
            orchestrator,
            logstore,
            signer,
            config,
            broker_subscription,
        })
    }

    /// Stop the scheduler, cancelling all active work as system-cancelled.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        self.oplog.unsubscribe(self.broker_subscription);
    }

    pub fn oplog(&self) -> &Arc<OpLog> {
        &self.oplog
    }

    // -- config ------------------------------------------------------------

    pub fn get_config(&self) -> Arc<Config> {
        self.config.current()
    }

    /// Validate and apply a full config replacement. The task-set diff is
    /// applied asynchronously by the scheduler loop.
    pub fn set_config(&self, config: Config) -> Result<Config, ServiceError> {
        config
            .validate()
            .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
        self.orchestrator.reload(config.clone());
        Ok(config)
    }

    /// Add (or replace) one repo, keeping the rest of the config.
    pub fn add_repo(&self, repo: Repo) -> Result<Config, ServiceError> {
        let mut config = (*self.config.current()).clone();
        config.repos.retain(|r| r.id != repo.id);
        config.repos.push(repo);
        self.set_config(config)
    }

    // -- operations --------------------------------------------------------

    pub async fn get_operation(&self, op_id: i64) -> Result<Operation, ServiceError> {
        match self.oplog.get(op_id).await {
            Ok(op) => Ok(op),
            Err(OpLogError::NotFound(id)) => Err(ServiceError::NotFound(format!("operation {id}"))),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_operations(&self, filter: &OpFilter) -> Result<Vec<Operation>, ServiceError> {
        let query = match filter.last_n {
            Some(n) => OpQuery::last(n),
            None => OpQuery::all(),
        };

        let ops = if !filter.ids.is_empty() {
            self.oplog.get_by_ids(&filter.ids).await?
        } else if let Some(snapshot_id) = &filter.snapshot_id {
            self.oplog.get_by_snapshot(snapshot_id, &query).await?
        } else if let Some(flow_id) = filter.flow_id {
            self.oplog.get_by_flow(flow_id, &query).await?
        } else if let Some(plan_id) = &filter.plan_id {
            self.oplog.get_by_plan(plan_id, &query).await?
        } else if let Some(repo_id) = &filter.repo_id {
            self.oplog.get_by_repo(repo_id, &query).await?
        } else {
            self.oplog
                .get_last_n(filter.last_n.unwrap_or(DEFAULT_LAST_N))
                .await?
        };

        Ok(ops)
    }

    /// Live event stream with an optional catch-up prelude: rows with ids
    /// greater than `since` are replayed (as updates) before live delivery
    /// starts. Subscribing happens before the scan, so nothing committed in
    /// between is missed -- a row may merely appear twice.
    pub fn operation_events(
        &self,
        since: Option<i64>,
    ) -> impl Stream<Item = Event> + Send + 'static {
        let oplog = Arc::clone(&self.oplog);
        let broker = self.broker.clone();

        async_stream::stream! {
            let live = broker.subscribe();

            if let Some(since_id) = since {
                let mut backlog = Vec::new();
                if let Err(err) = oplog
                    .for_each_since(since_id, |op| backlog.push(op))
                    .await
                {
                    warn!(error = %err, "event catch-up scan failed");
                }
                for op in backlog {
                    yield Event::OperationUpdated(op);
                }
            }

            futures::pin_mut!(live);
            while let Some(event) = live.next().await {
                yield event;
            }
        }
    }

    pub fn cancel(&self, op_id: i64) {
        self.orchestrator.cancel(op_id, OpStatus::UserCancelled);
    }

    pub async fn clear_history(&self, filter: &HistoryFilter) -> Result<Vec<i64>, ServiceError> {
        Ok(self.oplog.delete(filter).await?)
    }

    pub async fn get_logs(&self, log_ref: &str) -> Result<Vec<u8>, ServiceError> {
        Ok(self.logstore.read(log_ref).await?)
    }

    // -- triggers ----------------------------------------------------------

    /// Enqueue a one-shot backup of a plan. Returns immediately.
    pub fn backup(&self, plan_id: &str) -> Result<(), ServiceError> {
        let config = self.config.current();
        let plan = config
            .plan(plan_id)
            .ok_or_else(|| ServiceError::NotFound(format!("plan {plan_id:?}")))?;
        self.orchestrator
            .scheduler()
            .schedule(Box::new(BackupTask::one_shot(plan)));
        Ok(())
    }

    /// Enqueue a one-shot prune of a plan's repo.
    pub fn prune(&self, plan_id: &str) -> Result<(), ServiceError> {
        let config = self.config.current();
        let plan = config
            .plan(plan_id)
            .ok_or_else(|| ServiceError::NotFound(format!("plan {plan_id:?}")))?;
        self.orchestrator
            .scheduler()
            .schedule(Box::new(PruneTask::one_shot(&plan.repo_id, None)));
        Ok(())
    }

    /// Enqueue a one-shot forget: with a snapshot id, drop exactly that
    /// snapshot; otherwise apply the plan's retention policy.
    pub fn forget(
        &self,
        repo_id: &str,
        plan_id: Option<&str>,
        snapshot_id: Option<&str>,
    ) -> Result<(), ServiceError> {
        let config = self.config.current();
        if config.repo(repo_id).is_none() {
            return Err(ServiceError::NotFound(format!("repo {repo_id:?}")));
        }

        let task = match snapshot_id {
            Some(snapshot_id) => ForgetTask::for_snapshot(repo_id, plan_id, snapshot_id),
            None => {
                let plan_id = plan_id.ok_or_else(|| {
                    ServiceError::InvalidArgument("forget needs a plan or a snapshot id".into())
                })?;
                let plan = config
                    .plan(plan_id)
                    .ok_or_else(|| ServiceError::NotFound(format!("plan {plan_id:?}")))?;
                ForgetTask::for_plan(plan, None)
            }
        };
        self.orchestrator.scheduler().schedule(Box::new(task));
        Ok(())
    }

    /// Enqueue a one-shot restore into `target`.
    pub fn restore(
        &self,
        repo_id: &str,
        plan_id: &str,
        snapshot_id: &str,
        path: &str,
        target: impl Into<PathBuf>,
    ) -> Result<(), ServiceError> {
        let config = self.config.current();
        if config.repo(repo_id).is_none() {
            return Err(ServiceError::NotFound(format!("repo {repo_id:?}")));
        }
        self.orchestrator.scheduler().schedule(Box::new(RestoreTask::new(
            repo_id,
            plan_id,
            snapshot_id,
            path,
            target,
        )));
        Ok(())
    }

    pub fn index_snapshots(&self, repo_id: &str) -> Result<(), ServiceError> {
        self.require_repo(repo_id)?;
        self.orchestrator
            .scheduler()
            .schedule(Box::new(IndexSnapshotsTask::one_shot(repo_id, None, None)));
        Ok(())
    }

    pub fn stats(&self, repo_id: &str) -> Result<(), ServiceError> {
        self.require_repo(repo_id)?;
        self.orchestrator
            .scheduler()
            .schedule(Box::new(StatsTask::one_shot(repo_id)));
        Ok(())
    }

    pub fn check(&self, repo_id: &str) -> Result<(), ServiceError> {
        self.require_repo(repo_id)?;
        self.orchestrator
            .scheduler()
            .schedule(Box::new(CheckTask::one_shot(repo_id)));
        Ok(())
    }

    /// Drop stale repository locks. Synchronous: waits for the repo slot so
    /// it never races a running task on the same repo.
    pub async fn unlock(&self, repo_id: &str) -> Result<(), ServiceError> {
        let driver = self.driver_for(repo_id).await?;
        let slot = self.registry.slot(repo_id);
        let _permit = slot
            .acquire_owned()
            .await
            .map_err(|e| ServiceError::Other(anyhow::anyhow!("repo slot closed: {e}")))?;
        driver.unlock(&CancellationToken::new()).await?;
        Ok(())
    }

    // -- snapshots ---------------------------------------------------------

    pub async fn list_snapshots(
        &self,
        repo_id: &str,
        plan_id: &str,
    ) -> Result<Vec<Snapshot>, ServiceError> {
        let config = self.config.current();
        let plan = config
            .plan(plan_id)
            .ok_or_else(|| ServiceError::NotFound(format!("plan {plan_id:?}")))?;
        let driver = self.driver_for(repo_id).await?;
        Ok(driver
            .snapshots_for_plan(&CancellationToken::new(), plan)
            .await?)
    }

    pub async fn list_snapshot_files(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>, ServiceError> {
        let driver = self.driver_for(repo_id).await?;
        Ok(driver
            .list_files(&CancellationToken::new(), snapshot_id, path)
            .await?)
    }

    // -- downloads ---------------------------------------------------------

    /// The signed path segment for a completed restore's artifacts.
    /// Non-restore operations are not downloadable.
    pub async fn download_path(&self, op_id: i64) -> Result<String, ServiceError> {
        let op = self.get_operation(op_id).await?;
        if op.kind() != OpKind::Restore {
            return Err(ServiceError::NotFound(format!(
                "downloadable operation {op_id}"
            )));
        }
        Ok(self.signer.sign(op_id))
    }

    /// Verify a `<signed-segment>/<subpath>` download path: bad signature
    /// is `Unauthorized`, an unknown or non-restore operation `NotFound`.
    /// Returns the operation and the requested subpath.
    pub async fn verify_download(
        &self,
        path: &str,
    ) -> Result<(Operation, String), ServiceError> {
        let (op_id, subpath) = self.signer.verify_download_path(path)?;
        let op = self.get_operation(op_id).await?;
        if op.kind() != OpKind::Restore {
            return Err(ServiceError::NotFound(format!(
                "downloadable operation {op_id}"
            )));
        }
        Ok((op, subpath.to_owned()))
    }

    // -- helpers -----------------------------------------------------------

    fn require_repo(&self, repo_id: &str) -> Result<(), ServiceError> {
        if self.config.current().repo(repo_id).is_none() {
            return Err(ServiceError::NotFound(format!("repo {repo_id:?}")));
        }
        Ok(())
    }

    async fn driver_for(
        &self,
        repo_id: &str,
    ) -> Result<Arc<dyn crate::repo::RepoDriver>, ServiceError> {
        let config = self.config.current();
        let repo = config
            .repo(repo_id)
            .ok_or_else(|| ServiceError::NotFound(format!("repo {repo_id:?}")))?;
        Ok(self.registry.get(repo).await?)
    }
}
