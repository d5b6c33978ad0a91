//! Shared fixtures: two SQLite files standing in for backends A and B, plus a
//! connector that injects failures in front of a real pool.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use db_sync_core::clock::Sleeper;
use db_sync_core::config::PoolOptions;
use db_sync_core::db::pool::create_pool;
use db_sync_core::db::{
    ConnectionSource, Connector, Database, DbConnection, DbPool, PoolManager, RetryPolicy,
};
use db_sync_core::error::{DbError, DbResult};
use db_sync_core::models::record::format_timestamp;
use db_sync_core::models::{Backend, ConnectionConfig, DatabaseType, Row, SqlValue, TableSpec};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const PROJECTS_DDL: &str = "CREATE TABLE projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT,
    budget INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    updated_by TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    deleted_at TEXT
)";

pub fn projects_spec() -> TableSpec {
    TableSpec::new("projects")
        .required("name")
        .optional("status")
        .optional("budget")
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
}

pub fn sqlite_config(backend: Backend, dir: &Path, options: PoolOptions) -> ConnectionConfig {
    let path = dir.join(format!("backend_{}.db", backend.as_str().to_lowercase()));
    ConnectionConfig::new(backend, format!("sqlite:{}", path.display()), options).unwrap()
}

/// Retries without waiting; the sleeper records what would have been slept.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(100), 2.0)
}

#[derive(Debug, Default)]
pub struct RecordingSleeper {
    pub slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

/// A real SQLite pool with injectable faults.
#[derive(Debug)]
pub struct FlakySource {
    inner: DbPool,
    /// Remaining `acquire` calls that fail with a connection error
    pub acquire_failures: AtomicU32,
    pub ping_delay: Mutex<Duration>,
    pub fail_close: AtomicBool,
}

impl FlakySource {
    pub async fn open(config: &ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: create_pool(config).await.unwrap(),
            acquire_failures: AtomicU32::new(0),
            ping_delay: Mutex::new(Duration::ZERO),
            fail_close: AtomicBool::new(false),
        })
    }

    pub fn fail_next_acquires(&self, n: u32) {
        self.acquire_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = delay;
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ConnectionSource for FlakySource {
    fn db_type(&self) -> DatabaseType {
        self.inner.db_type()
    }

    async fn acquire(&self) -> DbResult<DbConnection> {
        if take_one(&self.acquire_failures) {
            return Err(DbError::connection("injected acquire failure"));
        }
        self.inner.acquire().await
    }

    async fn ping(&self) -> DbResult<()> {
        let delay = *self.ping_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.ping().await
    }

    fn size(&self) -> u32 {
        self.inner.size()
    }

    fn num_idle(&self) -> usize {
        self.inner.num_idle()
    }

    async fn close(&self) -> DbResult<()> {
        self.inner.close().await?;
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(DbError::connection("injected close failure"));
        }
        Ok(())
    }
}

/// Hands out one shared [`FlakySource`], optionally failing the first
/// `connect` calls.
#[derive(Debug)]
pub struct FlakyConnector {
    pub source: Arc<FlakySource>,
    pub connect_failures: AtomicU32,
    pub connect_calls: AtomicU32,
}

impl FlakyConnector {
    pub fn new(source: Arc<FlakySource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            connect_failures: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> DbResult<Arc<dyn ConnectionSource>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.connect_failures) {
            return Err(DbError::connection("injected connect failure"));
        }
        let source: Arc<dyn ConnectionSource> = self.source.clone();
        Ok(source)
    }
}

/// Both backends as SQLite files with the `projects` table created.
pub struct Harness {
    pub dir: TempDir,
    pub pool: Arc<PoolManager>,
    pub db: Database,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(PoolOptions::default()).await
    }

    pub async fn with_options(options: PoolOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sleeper = Arc::new(RecordingSleeper::default());
        let pool = Arc::new(
            PoolManager::new(
                sqlite_config(Backend::A, dir.path(), options.clone()),
                sqlite_config(Backend::B, dir.path(), options),
            )
            .with_retry_policy(fast_retry())
            .with_sleeper(sleeper.clone()),
        );
        pool.initialize().await.unwrap();

        let db = Database::new(pool.clone()).with_tables([projects_spec()]);
        for backend in Backend::ALL {
            db.execute(PROJECTS_DDL, &[], Some(backend)).await.unwrap();
        }
        Self {
            dir,
            pool,
            db,
            sleeper,
        }
    }

    /// Insert a project row directly, bypassing the repository.
    pub async fn insert(
        &self,
        backend: Backend,
        id: &str,
        name: &str,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) {
        self.db
            .execute(
                "INSERT INTO projects (id, name, status, budget, created_at, updated_at, version)
                 VALUES (?, ?, 'active', 100, ?, ?, 1)",
                &[
                    SqlValue::from(id),
                    SqlValue::from(name),
                    SqlValue::from(format_timestamp(&created_at)),
                    SqlValue::from(format_timestamp(&updated_at)),
                ],
                Some(backend),
            )
            .await
            .unwrap();
    }

    /// Insert the same row on both backends, as after a completed sync.
    pub async fn insert_both(
        &self,
        id: &str,
        name: &str,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) {
        for backend in Backend::ALL {
            self.insert(backend, id, name, created_at, updated_at).await;
        }
    }

    pub async fn touch(&self, backend: Backend, id: &str, name: &str, updated_at: DateTime<Utc>) {
        let affected = self
            .db
            .execute(
                "UPDATE projects SET name = ?, updated_at = ?, version = version + 1 WHERE id = ?",
                &[
                    SqlValue::from(name),
                    SqlValue::from(format_timestamp(&updated_at)),
                    SqlValue::from(id),
                ],
                Some(backend),
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    pub async fn row(&self, backend: Backend, id: &str) -> Option<Row> {
        self.db
            .query(
                "SELECT * FROM projects WHERE id = ?",
                &[SqlValue::from(id)],
                Some(backend),
            )
            .await
            .unwrap()
            .into_iter()
            .next()
    }

    pub async fn ids(&self, backend: Backend) -> Vec<String> {
        self.db
            .query("SELECT id FROM projects ORDER BY id", &[], Some(backend))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|row| row.get("id").and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    pub async fn name_of(&self, backend: Backend, id: &str) -> Option<String> {
        self.row(backend, id)
            .await
            .and_then(|row| row.get("name").and_then(|v| v.as_str()).map(String::from))
    }
}
