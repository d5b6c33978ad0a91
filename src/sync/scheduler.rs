//! Recurring synchronization schedules.
//!
//! Schedules live in the [`MetadataStore`], so they survive restarts. The
//! scheduler itself keeps no state beyond the handle of its tick loop.

use crate::clock::Clock;
use crate::error::{DbError, DbResult, ErrorPayload};
use crate::models::{
    ExecutionOutcome, ResolutionStrategy, Schedule, ScheduleConfig, ScheduleOutcome,
    SyncDirection, SyncInterval, SyncResult,
};
use crate::sync::metadata::MetadataStore;
use crate::sync::synchronizer::DataSynchronizer;
use futures_util::StreamExt;
use futures_util::stream;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct SyncScheduler {
    synchronizer: Arc<DataSynchronizer>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    /// Tables of one schedule run at most this many at a time; 1 is sequential
    table_concurrency: usize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("table_concurrency", &self.table_concurrency)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    pub fn new(synchronizer: Arc<DataSynchronizer>) -> Self {
        let metadata = synchronizer.metadata().clone();
        let clock = synchronizer.database().clock().clone();
        Self {
            synchronizer,
            metadata,
            clock,
            table_concurrency: 1,
            handle: Mutex::new(None),
        }
    }

    pub fn with_table_concurrency(mut self, n: usize) -> Self {
        self.table_concurrency = n.max(1);
        self
    }

    fn validate(
        &self,
        config: &ScheduleConfig,
    ) -> DbResult<(SyncInterval, SyncDirection, ResolutionStrategy)> {
        if config.tables.is_empty() {
            return Err(DbError::invalid_field("tables", "at least one table is required"));
        }
        let db = self.synchronizer.database();
        for table in &config.tables {
            db.table_spec(table)?;
        }

        let interval = SyncInterval::parse(&config.interval).ok_or_else(|| {
            let known: Vec<&str> = SyncInterval::ALL.iter().map(|i| i.as_str()).collect();
            DbError::invalid_field(
                "interval",
                format!(
                    "unknown interval '{}', expected one of {}",
                    config.interval,
                    known.join(", ")
                ),
            )
        })?;
        let direction = config
            .direction
            .parse::<SyncDirection>()
            .map_err(|e| DbError::invalid_field("direction", e))?;
        let strategy = match config.conflict_resolution.as_deref() {
            None => ResolutionStrategy::default(),
            Some(s) => ResolutionStrategy::parse(s).ok_or_else(|| {
                DbError::invalid_field(
                    "conflict_resolution",
                    format!(
                        "unknown strategy '{}', expected latest_wins, custom_rule or manual",
                        s
                    ),
                )
            })?,
        };
        if strategy == ResolutionStrategy::CustomRule && !self.synchronizer.has_custom_rule() {
            return Err(DbError::invalid_field(
                "conflict_resolution",
                "custom_rule requires a rule registered on the synchronizer",
            ));
        }
        Ok((interval, direction, strategy))
    }

    /// Validate and persist a new schedule. Nothing is stored if validation
    /// fails.
    pub async fn schedule_sync(&self, config: ScheduleConfig) -> ScheduleOutcome {
        let (interval, direction, conflict_resolution) = match self.validate(&config) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Rejected schedule");
                return ScheduleOutcome {
                    success: false,
                    schedule_id: None,
                    next_run_time: None,
                    error: Some(ErrorPayload::from(e)),
                };
            }
        };

        let now = self.clock.now();
        let schedule = Schedule {
            schedule_id: Uuid::new_v4().to_string(),
            tables: config.tables,
            interval,
            direction,
            conflict_resolution,
            next_run_time: interval.next_after(now),
            last_run_time: None,
            created_at: now,
        };
        if let Err(e) = self.metadata.save_schedule(&schedule).await {
            error!(error = %e, "Failed to persist schedule");
            return ScheduleOutcome {
                success: false,
                schedule_id: None,
                next_run_time: None,
                error: Some(ErrorPayload::from(e)),
            };
        }

        info!(
            schedule_id = %schedule.schedule_id,
            interval = %interval,
            tables = schedule.tables.len(),
            next_run = %schedule.next_run_time,
            "Schedule created"
        );
        ScheduleOutcome {
            success: true,
            schedule_id: Some(schedule.schedule_id),
            next_run_time: Some(schedule.next_run_time),
            error: None,
        }
    }

    async fn run_tables(&self, schedule: &Schedule) -> Vec<SyncResult> {
        let sync = &self.synchronizer;
        let direction = schedule.direction;
        let strategy = schedule.conflict_resolution;
        if self.table_concurrency <= 1 {
            let mut results = Vec::with_capacity(schedule.tables.len());
            for table in &schedule.tables {
                results.push(sync.sync_from_watermark(table, direction, strategy).await);
            }
            results
        } else {
            let runs: Vec<_> = schedule
                .tables
                .iter()
                .cloned()
                .map(|table| async move {
                    sync.sync_from_watermark(&table, direction, strategy).await
                })
                .collect();
            stream::iter(runs)
                .buffered(self.table_concurrency)
                .collect()
                .await
        }
    }

    /// Run every table of a schedule now and move its next run forward.
    ///
    /// One table failing does not stop the others.
    pub async fn execute_scheduled_sync(&self, schedule_id: &str) -> ExecutionOutcome {
        let executed_at = self.clock.now();
        let mut schedule = match self.metadata.load_schedule(schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                return ExecutionOutcome {
                    schedule_id: schedule_id.to_string(),
                    success: false,
                    executed_at,
                    sync_results: Vec::new(),
                    next_run_time: None,
                    error: Some(ErrorPayload::from(DbError::not_found("schedule", schedule_id))),
                };
            }
            Err(e) => {
                return ExecutionOutcome {
                    schedule_id: schedule_id.to_string(),
                    success: false,
                    executed_at,
                    sync_results: Vec::new(),
                    next_run_time: None,
                    error: Some(ErrorPayload::from(e)),
                };
            }
        };

        info!(schedule_id = %schedule_id, tables = schedule.tables.len(), "Executing schedule");
        let sync_results = self.run_tables(&schedule).await;
        let mut success = sync_results.iter().all(|r| r.success);

        schedule.last_run_time = Some(executed_at);
        schedule.next_run_time = schedule.interval.next_after(executed_at);
        // Update only: a schedule cancelled while its tables ran stays gone.
        let (next_run_time, error) = match self.metadata.update_schedule(&schedule).await {
            Ok(true) => (Some(schedule.next_run_time), None),
            Ok(false) => {
                info!(schedule_id = %schedule_id, "Schedule was cancelled during its run");
                (None, None)
            }
            Err(e) => {
                error!(schedule_id = %schedule_id, error = %e, "Failed to record schedule run");
                success = false;
                (Some(schedule.next_run_time), Some(ErrorPayload::from(e)))
            }
        };

        let failed = sync_results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            warn!(schedule_id = %schedule_id, failed, "Scheduled run finished with failures");
        } else {
            info!(
                schedule_id = %schedule_id,
                next_run = ?next_run_time,
                "Scheduled run finished"
            );
        }
        ExecutionOutcome {
            schedule_id: schedule_id.to_string(),
            success,
            executed_at,
            sync_results,
            next_run_time,
            error,
        }
    }

    /// Execute every schedule whose next run time has passed.
    pub async fn run_due_schedules(&self) -> DbResult<Vec<ExecutionOutcome>> {
        let now = self.clock.now();
        let due: Vec<Schedule> = self
            .metadata
            .list_schedules()
            .await?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for schedule in due {
            outcomes.push(self.execute_scheduled_sync(&schedule.schedule_id).await);
        }
        Ok(outcomes)
    }

    pub async fn list_schedules(&self) -> DbResult<Vec<Schedule>> {
        self.metadata.list_schedules().await
    }

    /// Remove a schedule. Returns `false` if it did not exist.
    pub async fn cancel_schedule(&self, schedule_id: &str) -> DbResult<bool> {
        let removed = self.metadata.delete_schedule(schedule_id).await?;
        if removed {
            info!(schedule_id = %schedule_id, "Schedule cancelled");
        }
        Ok(removed)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Check for due schedules every `tick` in the background.
    ///
    /// The loop holds only a weak reference and ends once the scheduler is
    /// dropped. Calling `start` again replaces the running loop.
    pub fn start(self: &Arc<Self>, tick: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(Self::tick_loop(weak, tick));
        if let Some(old) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            old.abort();
        }
        info!(tick_ms = tick.as_millis() as u64, "Scheduler started");
    }

    async fn tick_loop(scheduler: Weak<Self>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(scheduler) = scheduler.upgrade() else {
                break;
            };
            match scheduler.run_due_schedules().await {
                Ok(outcomes) if !outcomes.is_empty() => {
                    let failed = outcomes.iter().filter(|o| !o.success).count();
                    info!(executed = outcomes.len(), failed, "Due schedules executed");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to load schedules"),
            }
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("Scheduler stopped");
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
