//! Schedule validation, persistence and execution.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use common::{Harness, PROJECTS_DDL, at, projects_spec};
use db_sync_core::clock::ManualClock;
use db_sync_core::error::DbResult;
use db_sync_core::models::{
    Backend, ResolutionStrategy, Row, Schedule, ScheduleConfig, SyncDirection, SyncInterval,
    TableSpec,
};
use db_sync_core::sync::{
    Checkpoint, CustomRule, DataSynchronizer, InMemoryMetadataStore, MetadataStore,
    SqliteMetadataStore, SyncScheduler,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Fixture {
    h: Harness,
    clock: Arc<ManualClock>,
    metadata: Arc<InMemoryMetadataStore>,
    scheduler: SyncScheduler,
}

async fn fixture() -> Fixture {
    let h = Harness::new().await;
    let clock = Arc::new(ManualClock::new(at(9, 0)));
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let db = h.db.clone().with_clock(clock.clone());
    let scheduler = SyncScheduler::new(Arc::new(DataSynchronizer::new(db, metadata.clone())));
    Fixture {
        h,
        clock,
        metadata,
        scheduler,
    }
}

fn config(tables: &[&str], interval: &str, direction: &str) -> ScheduleConfig {
    ScheduleConfig {
        tables: tables.iter().map(|t| t.to_string()).collect(),
        interval: interval.to_string(),
        direction: direction.to_string(),
        conflict_resolution: None,
    }
}

#[tokio::test]
async fn test_schedule_without_tables_is_rejected() {
    let f = fixture().await;
    let outcome = f.scheduler.schedule_sync(config(&[], "hourly", "A_to_B")).await;
    assert!(!outcome.success);
    assert!(outcome.schedule_id.is_none());
    assert!(outcome.next_run_time.is_none());
    assert_eq!(outcome.error.unwrap().code, "VALIDATION_ERROR");
    assert!(f.scheduler.list_schedules().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_schedule_fields_are_rejected() {
    let f = fixture().await;
    let cases = [
        config(&["projects"], "every_minute", "A_to_B"),
        config(&["projects"], "hourly", "sideways"),
        config(&["invoices"], "hourly", "A_to_B"),
        ScheduleConfig {
            conflict_resolution: Some("coin_flip".to_string()),
            ..config(&["projects"], "hourly", "A_to_B")
        },
        ScheduleConfig {
            conflict_resolution: Some("custom_rule".to_string()),
            ..config(&["projects"], "hourly", "A_to_B")
        },
    ];
    for case in cases {
        let outcome = f.scheduler.schedule_sync(case.clone()).await;
        assert!(!outcome.success, "accepted {:?}", case);
        assert_eq!(outcome.error.unwrap().code, "VALIDATION_ERROR");
    }
    assert!(f.metadata.list_schedules().await.unwrap().is_empty());

    let outcome = f
        .scheduler
        .schedule_sync(config(&["projects"], "every_minute", "A_to_B"))
        .await;
    assert!(outcome.error.unwrap().message.contains("every_5_minutes"));
}

#[tokio::test]
async fn test_custom_rule_schedule_needs_registered_rule() {
    let h = Harness::new().await;
    let rule: CustomRule = Arc::new(|a: &Row, _: &Row| a.clone());
    let sync = DataSynchronizer::new(h.db.clone(), Arc::new(InMemoryMetadataStore::new()))
        .with_custom_rule(rule);
    let scheduler = SyncScheduler::new(Arc::new(sync));
    let outcome = scheduler
        .schedule_sync(ScheduleConfig {
            conflict_resolution: Some("custom_rule".to_string()),
            ..config(&["projects"], "daily", "bidirectional")
        })
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
}

#[tokio::test]
async fn test_valid_schedule_is_persisted() {
    let f = fixture().await;
    let outcome = f
        .scheduler
        .schedule_sync(config(&["projects"], "hourly", "bidirectional"))
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.next_run_time, Some(at(10, 0)));
    let id = outcome.schedule_id.unwrap();

    let stored = f.metadata.load_schedule(&id).await.unwrap().unwrap();
    assert_eq!(stored.tables, vec!["projects"]);
    assert_eq!(stored.interval, SyncInterval::Hourly);
    assert_eq!(stored.direction, SyncDirection::Bidirectional);
    assert_eq!(stored.conflict_resolution, ResolutionStrategy::LatestWins);
    assert_eq!(stored.created_at, at(9, 0));
    assert_eq!(stored.last_run_time, None);

    let listed = f.scheduler.list_schedules().await.unwrap();
    assert_eq!(listed, vec![stored]);
}

#[tokio::test]
async fn test_execute_runs_tables_and_moves_next_run() {
    let f = fixture().await;
    f.h.insert(Backend::A, "p-1", "Apollo", at(8, 0), at(8, 0)).await;
    let id = f
        .scheduler
        .schedule_sync(config(&["projects"], "every_15_minutes", "A_to_B"))
        .await
        .schedule_id
        .unwrap();

    f.clock.set(at(9, 40));
    let outcome = f.scheduler.execute_scheduled_sync(&id).await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.schedule_id, id);
    assert_eq!(outcome.executed_at, at(9, 40));
    assert_eq!(outcome.next_run_time, Some(at(9, 55)));
    assert_eq!(outcome.sync_results.len(), 1);
    assert_eq!(outcome.sync_results[0].table, "projects");
    assert_eq!(outcome.sync_results[0].records_synchronized, 1);
    assert_eq!(f.h.ids(Backend::B).await, vec!["p-1"]);

    let stored = f.metadata.load_schedule(&id).await.unwrap().unwrap();
    assert_eq!(stored.last_run_time, Some(at(9, 40)));
    assert_eq!(stored.next_run_time, at(9, 55));

    // The second run resumes from the watermark.
    f.clock.advance(TimeDelta::minutes(15));
    let again = f.scheduler.execute_scheduled_sync(&id).await;
    assert!(again.success);
    assert_eq!(again.sync_results[0].records_synchronized, 0);
}

#[tokio::test]
async fn test_failed_table_does_not_stop_the_rest() {
    let f = fixture().await;
    f.h.db
        .execute(&PROJECTS_DDL.replace("projects", "milestones"), &[], Some(Backend::B))
        .await
        .unwrap();
    f.h.insert(Backend::A, "p-1", "Apollo", at(8, 0), at(8, 0)).await;

    // Registered, but missing on the source backend.
    let db = f
        .h
        .db
        .clone()
        .with_clock(f.clock.clone())
        .with_tables([TableSpec::new("milestones"), projects_spec()]);
    let scheduler = SyncScheduler::new(Arc::new(DataSynchronizer::new(
        db,
        f.metadata.clone(),
    )));
    let id = scheduler
        .schedule_sync(config(&["milestones", "projects"], "hourly", "A_to_B"))
        .await
        .schedule_id
        .unwrap();

    let outcome = scheduler.execute_scheduled_sync(&id).await;
    assert!(!outcome.success);
    assert_eq!(outcome.sync_results.len(), 2);
    assert!(!outcome.sync_results[0].success);
    assert!(outcome.sync_results[1].success);
    assert_eq!(f.h.ids(Backend::B).await, vec!["p-1"]);
    assert_eq!(outcome.next_run_time, Some(at(10, 0)));
}

#[tokio::test]
async fn test_tables_can_run_concurrently() {
    let f = fixture().await;
    for backend in Backend::ALL {
        f.h.db
            .execute(&PROJECTS_DDL.replace("projects", "milestones"), &[], Some(backend))
            .await
            .unwrap();
    }
    f.h.insert(Backend::A, "p-1", "Apollo", at(8, 0), at(8, 0)).await;

    let db = f
        .h
        .db
        .clone()
        .with_clock(f.clock.clone())
        .with_tables([TableSpec::new("milestones"), projects_spec()]);
    let scheduler = SyncScheduler::new(Arc::new(DataSynchronizer::new(db, f.metadata.clone())))
        .with_table_concurrency(2);
    let id = scheduler
        .schedule_sync(config(&["projects", "milestones"], "hourly", "A_to_B"))
        .await
        .schedule_id
        .unwrap();

    let outcome = scheduler.execute_scheduled_sync(&id).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let tables: Vec<&str> = outcome.sync_results.iter().map(|r| r.table.as_str()).collect();
    assert_eq!(tables, vec!["projects", "milestones"]);
}

#[tokio::test]
async fn test_unknown_schedule_is_not_found() {
    let f = fixture().await;
    let outcome = f.scheduler.execute_scheduled_sync("nope").await;
    assert!(!outcome.success);
    assert!(outcome.sync_results.is_empty());
    assert_eq!(outcome.error.unwrap().code, "NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_removes_schedule() {
    let f = fixture().await;
    let id = f
        .scheduler
        .schedule_sync(config(&["projects"], "daily", "B_to_A"))
        .await
        .schedule_id
        .unwrap();

    assert!(f.scheduler.cancel_schedule(&id).await.unwrap());
    assert!(!f.scheduler.cancel_schedule(&id).await.unwrap());
    assert!(f.scheduler.list_schedules().await.unwrap().is_empty());
    assert_eq!(
        f.scheduler.execute_scheduled_sync(&id).await.error.unwrap().code,
        "NOT_FOUND"
    );
}

/// Deletes one schedule the first time a table run reads its checkpoints,
/// as a concurrent `cancel_schedule` would.
#[derive(Debug, Default)]
struct CancelMidRun {
    inner: InMemoryMetadataStore,
    cancel: Mutex<Option<String>>,
}

#[async_trait]
impl MetadataStore for CancelMidRun {
    async fn get_checkpoint(
        &self,
        table: &str,
        checkpoint: Checkpoint,
    ) -> DbResult<Option<DateTime<Utc>>> {
        let pending = self.cancel.lock().unwrap().take();
        if let Some(id) = pending {
            assert!(self.inner.delete_schedule(&id).await?);
        }
        self.inner.get_checkpoint(table, checkpoint).await
    }

    async fn advance_checkpoint(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        ts: DateTime<Utc>,
    ) -> DbResult<DateTime<Utc>> {
        self.inner.advance_checkpoint(table, checkpoint, ts).await
    }

    async fn save_schedule(&self, schedule: &Schedule) -> DbResult<()> {
        self.inner.save_schedule(schedule).await
    }

    async fn update_schedule(&self, schedule: &Schedule) -> DbResult<bool> {
        self.inner.update_schedule(schedule).await
    }

    async fn load_schedule(&self, id: &str) -> DbResult<Option<Schedule>> {
        self.inner.load_schedule(id).await
    }

    async fn list_schedules(&self) -> DbResult<Vec<Schedule>> {
        self.inner.list_schedules().await
    }

    async fn delete_schedule(&self, id: &str) -> DbResult<bool> {
        self.inner.delete_schedule(id).await
    }
}

#[tokio::test]
async fn test_cancel_during_run_is_not_undone() {
    let f = fixture().await;
    f.h.insert(Backend::A, "p-1", "Apollo", at(8, 0), at(8, 0)).await;
    let store = Arc::new(CancelMidRun::default());
    let db = f.h.db.clone().with_clock(f.clock.clone());
    let scheduler = SyncScheduler::new(Arc::new(DataSynchronizer::new(db, store.clone())));
    let id = scheduler
        .schedule_sync(config(&["projects"], "hourly", "A_to_B"))
        .await
        .schedule_id
        .unwrap();
    *store.cancel.lock().unwrap() = Some(id.clone());

    let outcome = scheduler.execute_scheduled_sync(&id).await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.sync_results[0].records_synchronized, 1);
    assert!(outcome.next_run_time.is_none());
    assert!(store.load_schedule(&id).await.unwrap().is_none());
    assert!(scheduler.list_schedules().await.unwrap().is_empty());
    assert!(!scheduler.cancel_schedule(&id).await.unwrap());
}

#[tokio::test]
async fn test_run_due_schedules_only_runs_due_ones() {
    let f = fixture().await;
    let hourly = f
        .scheduler
        .schedule_sync(config(&["projects"], "hourly", "A_to_B"))
        .await
        .schedule_id
        .unwrap();
    let daily = f
        .scheduler
        .schedule_sync(config(&["projects"], "daily", "A_to_B"))
        .await
        .schedule_id
        .unwrap();

    f.clock.set(at(9, 30));
    assert!(f.scheduler.run_due_schedules().await.unwrap().is_empty());

    f.clock.set(at(10, 0));
    let outcomes = f.scheduler.run_due_schedules().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].schedule_id, hourly);
    assert_eq!(outcomes[0].next_run_time, Some(at(11, 0)));

    // Not due again until the next hour.
    assert!(f.scheduler.run_due_schedules().await.unwrap().is_empty());

    let stored = f.metadata.load_schedule(&daily).await.unwrap().unwrap();
    assert_eq!(stored.last_run_time, None);
}

#[tokio::test]
async fn test_background_loop_executes_due_schedules() {
    let f = fixture().await;
    f.h.insert(Backend::A, "p-1", "Apollo", at(8, 0), at(8, 0)).await;
    let id = f
        .scheduler
        .schedule_sync(config(&["projects"], "every_5_minutes", "A_to_B"))
        .await
        .schedule_id
        .unwrap();
    f.clock.set(at(9, 5));

    let scheduler = Arc::new(f.scheduler);
    assert!(!scheduler.is_running());
    scheduler.start(Duration::from_millis(20));
    assert!(scheduler.is_running());

    let mut synced = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !f.h.ids(Backend::B).await.is_empty() {
            synced = true;
            break;
        }
    }
    assert!(synced);

    scheduler.stop();
    tokio::task::yield_now().await;
    assert!(!scheduler.is_running());

    let stored = f.metadata.load_schedule(&id).await.unwrap().unwrap();
    assert_eq!(stored.last_run_time, Some(at(9, 5)));
    assert_eq!(stored.next_run_time, at(9, 10));
}

#[tokio::test]
async fn test_schedules_survive_restart() {
    let h = Harness::new().await;
    let path = h.dir.path().join("metadata.db");

    let id = {
        let store = Arc::new(SqliteMetadataStore::open(&path).await.unwrap());
        let scheduler = SyncScheduler::new(Arc::new(DataSynchronizer::new(
            h.db.clone(),
            store.clone(),
        )));
        let id = scheduler
            .schedule_sync(config(&["projects"], "weekly", "bidirectional"))
            .await
            .schedule_id
            .unwrap();
        store.close().await;
        id
    };

    let store = Arc::new(SqliteMetadataStore::open(&path).await.unwrap());
    let scheduler = SyncScheduler::new(Arc::new(DataSynchronizer::new(h.db.clone(), store)));
    let listed = scheduler.list_schedules().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].schedule_id, id);
    assert_eq!(listed[0].interval, SyncInterval::Weekly);
    assert!(scheduler.execute_scheduled_sync(&id).await.success);
}
