//! The `RepoDriver` seam to the backup subprocess.
//!
//! This module defines the [`RepoDriver`] trait the external subprocess
//! driver implements, the supporting types ([`Snapshot`], [`FileEntry`],
//! [`ForgetTarget`], [`DriverError`]), and the [`RepoRegistry`] that
//! memoizes one driver per repository and serializes access to it.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator / tasks
//!     |
//!     v
//! RepoRegistry --get(repo)--> Arc<dyn RepoDriver>
//!     |                            |
//!     |   backup(cancel, plan, progress_cb)
//!     |   forget(cancel, target)
//!     |   prune(cancel, policy, on_output)
//!     |   restore / snapshots_for_plan / list_files
//!     |   unlock / stats / check
//!     |
//!     +--slot(repo_id)--> Arc<Semaphore>   (one permit per repo)
//! ```

pub mod registry;
pub mod trait_def;
pub mod types;

// Re-export the primary public API at the module level.
pub use registry::{DriverFactory, RepoRegistry};
pub use trait_def::RepoDriver;
pub use types::{DriverError, FileEntry, ForgetTarget, Snapshot, output_tail};
