//! Table synchronization between backend A and backend B.
//!
//! A run walks the source side in id order, one batch at a time, and looks up
//! the matching rows on the destination. Each pair is then skipped, copied,
//! or routed through the [`ConflictResolver`] when both sides changed after
//! the run's sync point: the persisted baseline for full and watermark runs,
//! `since` for incremental ones.
//!
//! A run persists two checkpoints. The watermark is where the next
//! incremental read resumes and is held back to the oldest failed row. The
//! baseline is the newest timestamp the run processed, so rows the run itself
//! wrote never look like fresh edits to the next one.
//!
//! Runs on the same table are serialized by a per-table lock. Runs on
//! different tables share a bounded number of permits.

use crate::db::Database;
use crate::db::dialect::SqlBuilder;
use crate::error::{DbError, DbResult, ErrorPayload};
use crate::models::record::{
    CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN, format_timestamp, row_is_deleted,
    row_modified_at, timestamp_of,
};
use crate::models::{
    Backend, ChosenSource, Conflict, ConflictType, ResolutionStrategy, Row, SqlValue,
    SyncDirection, SyncEvent, SyncResult, value_as_i64, value_as_id,
};
use crate::sync::comparison::compare_records;
use crate::sync::conflict::{ConflictResolver, CustomRule};
use crate::sync::metadata::{Checkpoint, MetadataStore};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = crate::config::DEFAULT_BATCH_SIZE;
pub const DEFAULT_MAX_CONCURRENT_TABLES: usize = crate::config::DEFAULT_MAX_CONCURRENT_TABLES;
const EVENT_CAPACITY: usize = 256;

/// Which rows a run reads and what it compares them against.
#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Every row; conflicts measured against the stored baseline
    Full,
    /// Rows touched at or after the instant
    Since(DateTime<Utc>),
    /// `Since(watermark)` when one is stored, otherwise `Full`
    FromWatermark,
}

/// What to do with one source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Skip,
    Copy { exists: bool },
    Conflict(ConflictType),
}

fn changed_since(row: &Row, point: Option<DateTime<Utc>>) -> bool {
    match point {
        None => true,
        Some(point) => row_modified_at(row).is_none_or(|ts| ts > point),
    }
}

fn created_since(row: &Row, point: DateTime<Utc>) -> bool {
    row.get(CREATED_AT_COLUMN)
        .and_then(timestamp_of)
        .is_none_or(|ts| ts > point)
}

fn plan(source: &Row, dest: Option<&Row>, sync_point: Option<DateTime<Utc>>) -> Plan {
    let Some(dest) = dest else {
        return Plan::Copy { exists: false };
    };
    if compare_records(source, dest).is_identical {
        return Plan::Skip;
    }
    match (changed_since(source, sync_point), changed_since(dest, sync_point)) {
        (true, true) => {
            let kind = if row_is_deleted(source) != row_is_deleted(dest) {
                ConflictType::DeleteUpdate
            } else if sync_point
                .is_none_or(|p| created_since(source, p) && created_since(dest, p))
            {
                ConflictType::InsertInsert
            } else {
                ConflictType::UpdateUpdate
            };
            Plan::Conflict(kind)
        }
        (true, false) => Plan::Copy { exists: true },
        (false, true) => Plan::Skip,
        (false, false) => {
            if row_modified_at(source) >= row_modified_at(dest) {
                Plan::Copy { exists: true }
            } else {
                Plan::Skip
            }
        }
    }
}

fn passes(direction: SyncDirection) -> &'static [(Backend, Backend)] {
    match direction {
        SyncDirection::AToB => &[(Backend::A, Backend::B)],
        SyncDirection::BToA => &[(Backend::B, Backend::A)],
        SyncDirection::Bidirectional => &[(Backend::A, Backend::B), (Backend::B, Backend::A)],
    }
}

fn writable(direction: SyncDirection, backend: Backend) -> bool {
    match direction {
        SyncDirection::AToB => backend == Backend::B,
        SyncDirection::BToA => backend == Backend::A,
        SyncDirection::Bidirectional => true,
    }
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    a.max(b)
}

fn earlier(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Mutable bookkeeping for one run.
struct Run {
    table: String,
    direction: SyncDirection,
    strategy: ResolutionStrategy,
    filter_since: Option<DateTime<Utc>>,
    sync_point: Option<DateTime<Utc>>,
    synchronized: u64,
    failed: u64,
    conflicts: Vec<Conflict>,
    resolved: u64,
    /// Ids that conflicted or failed; later passes leave them alone
    settled: HashSet<String>,
    max_processed: Option<DateTime<Utc>>,
    earliest_failure: Option<DateTime<Utc>>,
    processed: usize,
    total: usize,
}

impl Run {
    fn record_failure(&mut self, id: &str, row: &Row, err: &DbError) {
        warn!(table = %self.table, record_id = %id, error = %err, "Record failed to synchronize");
        self.failed += 1;
        self.settled.insert(id.to_string());
        self.earliest_failure = earlier(self.earliest_failure, row_modified_at(row));
    }

    /// Resumption point: the newest processed timestamp, held back to the
    /// oldest failure so the failed records are read again.
    fn last_sync_time(&self, fallback: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let reached = match self.earliest_failure {
            Some(failure) => earlier(self.max_processed, Some(failure)),
            None => self.max_processed,
        };
        reached.or(fallback)
    }
}

pub struct DataSynchronizer {
    db: Database,
    resolver: ConflictResolver,
    metadata: Arc<dyn MetadataStore>,
    custom_rule: Option<CustomRule>,
    table_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    permits: Arc<Semaphore>,
    max_concurrent_tables: usize,
    batch_size: usize,
    events: broadcast::Sender<SyncEvent>,
}

impl std::fmt::Debug for DataSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSynchronizer")
            .field("resolver", &self.resolver)
            .field("metadata", &self.metadata)
            .field("custom_rule", &self.custom_rule.is_some())
            .field("max_concurrent_tables", &self.max_concurrent_tables)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl DataSynchronizer {
    pub fn new(db: Database, metadata: Arc<dyn MetadataStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            resolver: ConflictResolver::new(),
            metadata,
            custom_rule: None,
            table_locks: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_TABLES)),
            max_concurrent_tables: DEFAULT_MAX_CONCURRENT_TABLES,
            batch_size: DEFAULT_BATCH_SIZE,
            events,
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Rule used by the `custom_rule` strategy.
    pub fn with_custom_rule(mut self, rule: CustomRule) -> Self {
        self.custom_rule = Some(rule);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_concurrent_tables(mut self, max: usize) -> Self {
        let max = max.max(1);
        self.max_concurrent_tables = max;
        self.permits = Arc::new(Semaphore::new(max));
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn has_custom_rule(&self) -> bool {
        self.custom_rule.is_some()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Receive events from every run started after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Full run resolving conflicts with `latest_wins`.
    pub async fn synchronize_table(&self, table: &str, direction: SyncDirection) -> SyncResult {
        self.synchronize_table_with(table, direction, ResolutionStrategy::LatestWins)
            .await
    }

    pub async fn synchronize_table_with(
        &self,
        table: &str,
        direction: SyncDirection,
        strategy: ResolutionStrategy,
    ) -> SyncResult {
        self.run(table, direction, strategy, Mode::Full).await
    }

    /// Bidirectional run over rows touched at or after `since`.
    pub async fn incremental_sync(&self, table: &str, since: DateTime<Utc>) -> SyncResult {
        self.incremental_sync_with(
            table,
            since,
            SyncDirection::Bidirectional,
            ResolutionStrategy::LatestWins,
        )
        .await
    }

    pub async fn incremental_sync_with(
        &self,
        table: &str,
        since: DateTime<Utc>,
        direction: SyncDirection,
        strategy: ResolutionStrategy,
    ) -> SyncResult {
        self.run(table, direction, strategy, Mode::Since(since)).await
    }

    /// Incremental from the stored watermark, or a full run if there is none.
    pub async fn sync_from_watermark(
        &self,
        table: &str,
        direction: SyncDirection,
        strategy: ResolutionStrategy,
    ) -> SyncResult {
        self.run(table, direction, strategy, Mode::FromWatermark).await
    }

    fn emit(&self, event: SyncEvent) {
        // Err only means nobody is subscribed.
        let _ = self.events.send(event);
    }

    fn table_lock(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.table_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.to_string())
            .or_default()
            .clone()
    }

    fn preflight(&self, table: &str, strategy: ResolutionStrategy) -> DbResult<()> {
        self.db.table_spec(table)?;
        if strategy == ResolutionStrategy::CustomRule && self.custom_rule.is_none() {
            return Err(DbError::invalid_field(
                "conflict_resolution",
                "custom_rule strategy requires a registered rule",
            ));
        }
        Ok(())
    }

    fn failed(
        &self,
        table: &str,
        direction: SyncDirection,
        err: DbError,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> SyncResult {
        error!(table = %table, direction = %direction, error = %err, "Synchronization failed");
        let payload = ErrorPayload::from(&err);
        self.emit(SyncEvent::Failed {
            table: table.to_string(),
            error: payload.clone(),
        });
        let now = self.db.clock().now();
        SyncResult {
            started_at: now,
            finished_at: now,
            ..SyncResult::failed(table, direction, payload, last_sync_time)
        }
    }

    async fn run(
        &self,
        table: &str,
        direction: SyncDirection,
        strategy: ResolutionStrategy,
        mode: Mode,
    ) -> SyncResult {
        if let Err(e) = self.preflight(table, strategy) {
            return self.failed(table, direction, e, None);
        }

        let lock = self.table_lock(table);
        let _table_guard = lock.lock().await;
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.failed(
                    table,
                    direction,
                    DbError::internal("synchronizer is shut down"),
                    None,
                );
            }
        };

        let checkpoints = futures_util::try_join!(
            self.metadata.get_watermark(table),
            self.metadata.get_checkpoint(table, Checkpoint::Baseline),
        );
        let (watermark, baseline) = match checkpoints {
            Ok(found) => found,
            Err(e) => return self.failed(table, direction, e, None),
        };
        let filter_since = match mode {
            Mode::Full => None,
            Mode::Since(since) => Some(since),
            Mode::FromWatermark => watermark,
        };
        let incremental = filter_since.is_some();
        let sync_point = match mode {
            Mode::Since(since) => Some(since),
            Mode::Full | Mode::FromWatermark => later(watermark, baseline),
        };
        let fallback = filter_since.or(watermark);

        let started_at = self.db.clock().now();
        info!(
            table = %table,
            direction = %direction,
            incremental,
            sync_point = ?sync_point,
            "Synchronization started"
        );
        self.emit(SyncEvent::Started {
            table: table.to_string(),
            direction,
            incremental,
            at: started_at,
        });

        let mut run = Run {
            table: table.to_string(),
            direction,
            strategy,
            filter_since,
            sync_point,
            synchronized: 0,
            failed: 0,
            conflicts: Vec::new(),
            resolved: 0,
            settled: HashSet::new(),
            max_processed: None,
            earliest_failure: None,
            processed: 0,
            total: 0,
        };

        let outcome = self.execute(&mut run).await;
        let mut result = SyncResult {
            table: table.to_string(),
            direction,
            success: true,
            records_synchronized: run.synchronized,
            records_failed: run.failed,
            conflicts: Vec::new(),
            conflicts_resolved: run.resolved,
            error: None,
            last_sync_time: fallback,
            started_at,
            finished_at: started_at,
        };

        match outcome {
            Ok(()) => {
                let last = run.last_sync_time(fallback);
                result.last_sync_time = last;
                if let Err(e) = self.persist_checkpoints(table, last, run.max_processed).await {
                    warn!(table = %table, error = %e, "Failed to persist checkpoints");
                    result.success = false;
                    result.error = Some(ErrorPayload::from(&e));
                }
            }
            Err(e) => {
                let e = if e.is_connectivity() {
                    DbError::sync_aborted(table, e.to_string())
                } else {
                    e
                };
                error!(
                    table = %table,
                    error = %e,
                    synchronized = run.synchronized,
                    "Synchronization aborted"
                );
                result.success = false;
                result.error = Some(ErrorPayload::from(&e));
            }
        }
        result.conflicts = run.conflicts;
        result.finished_at = self.db.clock().now();

        match &result.error {
            None => {
                info!(
                    table = %table,
                    synchronized = result.records_synchronized,
                    failed = result.records_failed,
                    conflicts = result.conflicts.len(),
                    "Synchronization completed"
                );
                self.emit(SyncEvent::Completed {
                    table: table.to_string(),
                    records_synchronized: result.records_synchronized,
                    conflicts: result.conflicts.len(),
                    at: result.finished_at,
                });
            }
            Some(payload) => self.emit(SyncEvent::Failed {
                table: table.to_string(),
                error: payload.clone(),
            }),
        }
        result
    }

    async fn persist_checkpoints(
        &self,
        table: &str,
        resume: Option<DateTime<Utc>>,
        baseline: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        if let Some(ts) = resume {
            self.metadata.advance_watermark(table, ts).await?;
        }
        if let Some(ts) = baseline {
            self.metadata
                .advance_checkpoint(table, Checkpoint::Baseline, ts)
                .await?;
        }
        Ok(())
    }

    async fn execute(&self, run: &mut Run) -> DbResult<()> {
        for (source, _) in passes(run.direction) {
            run.total += self.count_candidates(*source, run).await?;
        }
        for (source, dest) in passes(run.direction) {
            self.run_pass(run, *source, *dest).await?;
        }
        Ok(())
    }

    fn push_candidate_filter(b: &mut SqlBuilder, run: &Run) {
        b.push(" WHERE 1 = 1");
        if let Some(since) = run.filter_since {
            let since = format_timestamp(&since);
            b.push(" AND (")
                .push_ident(UPDATED_AT_COLUMN)
                .push(" >= ")
                .push_bind(since.as_str())
                .push(" OR ")
                .push_ident(CREATED_AT_COLUMN)
                .push(" >= ")
                .push_bind(since.as_str())
                .push(")");
        }
    }

    async fn count_candidates(&self, backend: Backend, run: &Run) -> DbResult<usize> {
        let mut b = SqlBuilder::new(self.db.db_type(backend));
        b.push("SELECT COUNT(*) AS total FROM ").push_ident(&run.table);
        Self::push_candidate_filter(&mut b, run);
        let (sql, params) = b.finish()?;
        let rows = self.db.query(&sql, &params, Some(backend)).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("total"))
            .and_then(value_as_i64)
            .unwrap_or(0)
            .max(0) as usize)
    }

    async fn fetch_batch(
        &self,
        backend: Backend,
        run: &Run,
        after: Option<&JsonValue>,
    ) -> DbResult<Vec<Row>> {
        let mut b = SqlBuilder::new(self.db.db_type(backend));
        b.push("SELECT * FROM ").push_ident(&run.table);
        Self::push_candidate_filter(&mut b, run);
        if let Some(after) = after {
            b.push(" AND ")
                .push_ident(ID_COLUMN)
                .push(" > ")
                .push_bind(SqlValue::from_json(after));
        }
        b.push(" ORDER BY ").push_ident(ID_COLUMN).push(" ASC");
        b.push_limit_offset(self.batch_size as u64, 0);
        let (sql, params) = b.finish()?;
        self.db.query(&sql, &params, Some(backend)).await
    }

    async fn fetch_by_ids(
        &self,
        backend: Backend,
        table: &str,
        ids: &[&JsonValue],
    ) -> DbResult<HashMap<String, Row>> {
        let mut b = SqlBuilder::new(self.db.db_type(backend));
        b.push("SELECT * FROM ")
            .push_ident(table)
            .push(" WHERE ")
            .push_ident(ID_COLUMN)
            .push(" IN ")
            .push_bind_list(ids.iter().map(|id| SqlValue::from_json(id)));
        let (sql, params) = b.finish()?;
        let rows = self.db.query(&sql, &params, Some(backend)).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get(ID_COLUMN).and_then(value_as_id)?;
                Some((id, row))
            })
            .collect())
    }

    async fn run_pass(&self, run: &mut Run, source: Backend, dest: Backend) -> DbResult<()> {
        let mut after: Option<JsonValue> = None;
        loop {
            let batch = self.fetch_batch(source, run, after.as_ref()).await?;
            let fetched = batch.len();
            if fetched == 0 {
                break;
            }
            after = batch.last().and_then(|row| row.get(ID_COLUMN)).cloned();

            let ids: Vec<&JsonValue> =
                batch.iter().filter_map(|row| row.get(ID_COLUMN)).collect();
            let counterparts = self.fetch_by_ids(dest, &run.table, &ids).await?;
            for row in &batch {
                let Some(id) = row.get(ID_COLUMN).and_then(value_as_id) else {
                    let err = DbError::invalid_field(ID_COLUMN, "row has no usable id");
                    run.record_failure("<missing id>", row, &err);
                    continue;
                };
                if run.settled.contains(&id) {
                    continue;
                }
                self.process_row(run, source, dest, &id, row, counterparts.get(&id))
                    .await?;
            }

            run.processed += fetched;
            self.emit(SyncEvent::Progress {
                table: run.table.clone(),
                processed: run.processed,
                total: run.total.max(run.processed),
            });
            debug!(
                table = %run.table,
                source = %source,
                processed = run.processed,
                "Batch processed"
            );

            if fetched < self.batch_size || after.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn process_row(
        &self,
        run: &mut Run,
        source: Backend,
        dest: Backend,
        id: &str,
        row: &Row,
        counterpart: Option<&Row>,
    ) -> DbResult<()> {
        match plan(row, counterpart, run.sync_point) {
            Plan::Skip => {}
            Plan::Copy { exists } => {
                if let Err(e) = self.write_row(dest, &run.table, row, exists).await {
                    if e.is_connectivity() {
                        return Err(e);
                    }
                    run.record_failure(id, row, &e);
                    return Ok(());
                }
                run.synchronized += 1;
            }
            Plan::Conflict(conflict_type) => {
                let (data_a, data_b) = match source {
                    Backend::A => (Some(row.clone()), counterpart.cloned()),
                    Backend::B => (counterpart.cloned(), Some(row.clone())),
                };
                let conflict = Conflict {
                    table: run.table.clone(),
                    record_id: id.to_string(),
                    conflict_type,
                    data_a,
                    data_b,
                    resolution: run.strategy,
                    detected_at: self.db.clock().now(),
                };
                self.emit(SyncEvent::ConflictDetected {
                    table: run.table.clone(),
                    record_id: id.to_string(),
                    conflict_type,
                });
                run.settled.insert(id.to_string());
                let resolution = self
                    .resolver
                    .resolve_conflict(&conflict, self.custom_rule.as_ref());
                run.conflicts.push(conflict);

                if resolution.success {
                    run.resolved += 1;
                    if let Some(data) = resolution.resolved_data {
                        let targets: &[Backend] = match resolution.chosen_source {
                            Some(ChosenSource::A) => &[Backend::B],
                            Some(ChosenSource::B) => &[Backend::A],
                            _ => &[Backend::A, Backend::B],
                        };
                        let direction = run.direction;
                        let data = with_id(data, row);
                        for target in targets.iter().copied().filter(|b| writable(direction, *b)) {
                            match self.write_row(target, &run.table, &data, true).await {
                                Ok(()) => run.synchronized += 1,
                                Err(e) if e.is_connectivity() => return Err(e),
                                Err(e) => run.record_failure(id, row, &e),
                            }
                        }
                    }
                }
            }
        }
        run.max_processed = later(run.max_processed, row_modified_at(row));
        Ok(())
    }

    /// Update the row in place, or insert it if it is not there.
    async fn write_row(
        &self,
        backend: Backend,
        table: &str,
        row: &Row,
        exists: bool,
    ) -> DbResult<()> {
        let db_type = self.db.db_type(backend);
        let id = row
            .get(ID_COLUMN)
            .ok_or_else(|| DbError::invalid_field(ID_COLUMN, "row has no id"))?;

        if exists {
            let mut b = SqlBuilder::new(db_type);
            b.push("UPDATE ").push_ident(table).push(" SET ");
            let mut columns = 0;
            for (column, value) in row.iter().filter(|(c, _)| c.as_str() != ID_COLUMN) {
                if columns > 0 {
                    b.push(", ");
                }
                b.push_ident(column)
                    .push(" = ")
                    .push_bind(SqlValue::from_json(value));
                columns += 1;
            }
            if columns == 0 {
                return Ok(());
            }
            b.push(" WHERE ")
                .push_ident(ID_COLUMN)
                .push(" = ")
                .push_bind(SqlValue::from_json(id));
            let (sql, params) = b.finish()?;
            if self.db.execute(&sql, &params, Some(backend)).await? > 0 {
                return Ok(());
            }
            debug!(table = %table, backend = %backend, "Row vanished before update, inserting");
        }

        let mut b = SqlBuilder::new(db_type);
        b.push("INSERT INTO ").push_ident(table).push(" (");
        b.push_idents(row.keys().map(String::as_str));
        b.push(") VALUES ")
            .push_bind_list(row.values().map(SqlValue::from_json));
        let (sql, params) = b.finish()?;
        self.db.execute(&sql, &params, Some(backend)).await?;
        Ok(())
    }
}

/// Custom rules may drop the id; put the source row's id back.
fn with_id(mut data: Row, source: &Row) -> Row {
    if let Some(id) = source.get(ID_COLUMN) {
        data.insert(ID_COLUMN.to_string(), id.clone());
    }
    data
}
