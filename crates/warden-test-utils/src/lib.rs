//! Shared test utilities for warden integration tests.
//!
//! Provides a temporary SQLite database per test (migrations applied) and
//! a scriptable mock [`RepoDriver`] so scheduler and journal behavior can
//! be exercised without a real backup binary.

pub mod mock;

use std::path::PathBuf;

use sqlx::SqlitePool;
use tempfile::TempDir;

use warden_db::config::DbConfig;
use warden_db::pool;

/// A temporary database plus the directory keeping it alive. Dropping the
/// struct removes everything.
pub struct TestDb {
    pub pool: SqlitePool,
    dir: TempDir,
}

impl TestDb {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// A scratch path inside the test directory (for log blobs, secrets).
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Create a temporary database with migrations applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = DbConfig::new(dir.path().join("warden.db"));

    let db_pool = pool::create_pool(&config)
        .await
        .expect("failed to open temp database");
    pool::run_migrations(&db_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    TestDb { pool: db_pool, dir }
}
