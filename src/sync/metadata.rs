//! Durable synchronization state: per-table checkpoints and schedules.
//!
//! Each table has two checkpoints. The resume point (the watermark) is where
//! the next incremental read starts and is held back for rows that failed. The
//! baseline is the newest timestamp a run processed; conflict detection treats
//! only changes after it as new.
//!
//! Checkpoints only move forward. A write that would move one backwards is
//! ignored and the stored value returned, so concurrent runs finishing out of
//! order cannot rewind them.

use crate::db::classifier::translate;
use crate::error::{DbError, DbResult};
use crate::models::record::{format_timestamp, parse_timestamp};
use crate::models::{DatabaseType, Schedule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::Row as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Where the next incremental read resumes
    Resume,
    /// Newest timestamp already reconciled on both sides
    Baseline,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Baseline => "baseline",
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    async fn get_checkpoint(
        &self,
        table: &str,
        checkpoint: Checkpoint,
    ) -> DbResult<Option<DateTime<Utc>>>;

    /// Store `ts` if it is later than the current value. Returns the value in
    /// effect afterwards.
    async fn advance_checkpoint(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        ts: DateTime<Utc>,
    ) -> DbResult<DateTime<Utc>>;

    async fn get_watermark(&self, table: &str) -> DbResult<Option<DateTime<Utc>>> {
        self.get_checkpoint(table, Checkpoint::Resume).await
    }

    async fn advance_watermark(&self, table: &str, ts: DateTime<Utc>) -> DbResult<DateTime<Utc>> {
        self.advance_checkpoint(table, Checkpoint::Resume, ts).await
    }

    /// Insert or replace a schedule.
    async fn save_schedule(&self, schedule: &Schedule) -> DbResult<()>;

    /// Replace a schedule only if it still exists. Returns `false` when it was
    /// deleted in the meantime.
    async fn update_schedule(&self, schedule: &Schedule) -> DbResult<bool>;

    async fn load_schedule(&self, id: &str) -> DbResult<Option<Schedule>>;

    /// All schedules, oldest first.
    async fn list_schedules(&self) -> DbResult<Vec<Schedule>>;

    /// Returns `false` if no schedule had that id.
    async fn delete_schedule(&self, id: &str) -> DbResult<bool>;
}

const CREATE_CHECKPOINTS: &str = "CREATE TABLE IF NOT EXISTS sync_checkpoints (
    table_name TEXT NOT NULL,
    checkpoint TEXT NOT NULL,
    last_sync_time TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (table_name, checkpoint)
)";

const CREATE_SCHEDULES: &str = "CREATE TABLE IF NOT EXISTS sync_schedules (
    schedule_id TEXT PRIMARY KEY,
    definition TEXT NOT NULL,
    next_run_time TEXT NOT NULL,
    created_at TEXT NOT NULL
)";

fn sqlite_err(e: sqlx::Error) -> DbError {
    translate(e, DatabaseType::SQLite)
}

fn decode_schedule(definition: &str) -> DbResult<Schedule> {
    serde_json::from_str(definition)
        .map_err(|e| DbError::internal(format!("Corrupt schedule definition: {}", e)))
}

/// Metadata kept in a local SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Open (creating if needed) the metadata database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| {
                DbError::configuration(format!(
                    "Cannot open metadata store '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        for ddl in [CREATE_CHECKPOINTS, CREATE_SCHEDULES] {
            sqlx::query(ddl).execute(&pool).await.map_err(sqlite_err)?;
        }
        info!(path = %path.display(), "Metadata store opened");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_checkpoint(
        &self,
        table: &str,
        checkpoint: Checkpoint,
    ) -> DbResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_sync_time FROM sync_checkpoints WHERE table_name = ? AND checkpoint = ?",
        )
        .bind(table)
        .bind(checkpoint.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlite_err)?;
        match row {
            Some(row) => {
                let text: String = row.try_get("last_sync_time").map_err(sqlite_err)?;
                parse_timestamp(&text).map(Some).ok_or_else(|| {
                    DbError::internal(format!(
                        "Corrupt {} checkpoint for '{}': {}",
                        checkpoint.as_str(),
                        table,
                        text
                    ))
                })
            }
            None => Ok(None),
        }
    }

    async fn advance_checkpoint(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        ts: DateTime<Utc>,
    ) -> DbResult<DateTime<Utc>> {
        let now = format_timestamp(&Utc::now());
        sqlx::query(
            "INSERT INTO sync_checkpoints (table_name, checkpoint, last_sync_time, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(table_name, checkpoint) DO UPDATE SET
                 last_sync_time = excluded.last_sync_time,
                 updated_at = excluded.updated_at
             WHERE excluded.last_sync_time > sync_checkpoints.last_sync_time",
        )
        .bind(table)
        .bind(checkpoint.as_str())
        .bind(format_timestamp(&ts))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;

        let stored = self.get_checkpoint(table, checkpoint).await?.unwrap_or(ts);
        debug!(
            table = %table,
            checkpoint = checkpoint.as_str(),
            value = %stored,
            "Checkpoint advanced"
        );
        Ok(stored)
    }

    async fn save_schedule(&self, schedule: &Schedule) -> DbResult<()> {
        let definition = serde_json::to_string(schedule)
            .map_err(|e| DbError::internal(format!("Cannot encode schedule: {}", e)))?;
        sqlx::query(
            "INSERT INTO sync_schedules (schedule_id, definition, next_run_time, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(schedule_id) DO UPDATE SET
                 definition = excluded.definition,
                 next_run_time = excluded.next_run_time",
        )
        .bind(&schedule.schedule_id)
        .bind(definition)
        .bind(format_timestamp(&schedule.next_run_time))
        .bind(format_timestamp(&schedule.created_at))
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> DbResult<bool> {
        let definition = serde_json::to_string(schedule)
            .map_err(|e| DbError::internal(format!("Cannot encode schedule: {}", e)))?;
        let result = sqlx::query(
            "UPDATE sync_schedules SET definition = ?, next_run_time = ? WHERE schedule_id = ?",
        )
        .bind(definition)
        .bind(format_timestamp(&schedule.next_run_time))
        .bind(&schedule.schedule_id)
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_schedule(&self, id: &str) -> DbResult<Option<Schedule>> {
        let row = sqlx::query("SELECT definition FROM sync_schedules WHERE schedule_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlite_err)?;
        row.map(|row| {
            let definition: String = row.try_get("definition").map_err(sqlite_err)?;
            decode_schedule(&definition)
        })
        .transpose()
    }

    async fn list_schedules(&self) -> DbResult<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT definition FROM sync_schedules ORDER BY created_at ASC, schedule_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlite_err)?;
        rows.iter()
            .map(|row| {
                let definition: String = row.try_get("definition").map_err(sqlite_err)?;
                decode_schedule(&definition)
            })
            .collect()
    }

    async fn delete_schedule(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM sync_schedules WHERE schedule_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlite_err)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local metadata, lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    checkpoints: Mutex<HashMap<(String, Checkpoint), DateTime<Utc>>>,
    schedules: Mutex<BTreeMap<String, Schedule>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_checkpoint(
        &self,
        table: &str,
        checkpoint: Checkpoint,
    ) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(table.to_string(), checkpoint))
            .copied())
    }

    async fn advance_checkpoint(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        ts: DateTime<Utc>,
    ) -> DbResult<DateTime<Utc>> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = checkpoints
            .entry((table.to_string(), checkpoint))
            .or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
        Ok(*entry)
    }

    async fn save_schedule(&self, schedule: &Schedule) -> DbResult<()> {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(schedule.schedule_id.clone(), schedule.clone());
        Ok(())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> DbResult<bool> {
        let mut schedules = self.schedules.lock().unwrap_or_else(PoisonError::into_inner);
        match schedules.get_mut(&schedule.schedule_id) {
            Some(stored) => {
                *stored = schedule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_schedule(&self, id: &str) -> DbResult<Option<Schedule>> {
        Ok(self
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn list_schedules(&self) -> DbResult<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        schedules.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.schedule_id.cmp(&b.schedule_id))
        });
        Ok(schedules)
    }

    async fn delete_schedule(&self, id: &str) -> DbResult<bool> {
        Ok(self
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some())
    }
}
