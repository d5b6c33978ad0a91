//! Full and incremental synchronization between two SQLite backends.

mod common;

use common::{Harness, at, projects_spec};
use db_sync_core::models::record::format_timestamp;
use db_sync_core::models::{
    Backend, ConflictType, ResolutionStrategy, Row, SqlValue, SyncDirection, SyncEvent, TableSpec,
};
use db_sync_core::config::PoolOptions;
use db_sync_core::sync::{
    Checkpoint, ConsistencyChecker, CustomRule, DataSynchronizer, InMemoryMetadataStore,
    MetadataStore, SqliteMetadataStore,
};
use serde_json::json;
use sqlx::{Connection, SqliteConnection};
use std::sync::Arc;

fn synchronizer(h: &Harness) -> (DataSynchronizer, Arc<InMemoryMetadataStore>) {
    let metadata = Arc::new(InMemoryMetadataStore::new());
    (DataSynchronizer::new(h.db.clone(), metadata.clone()), metadata)
}

/// Both sides hold the same row and the watermark sits at its timestamp.
async fn baseline(h: &Harness, sync: &DataSynchronizer) {
    h.insert_both("p-1", "Base", at(8, 0), at(8, 0)).await;
    let result = sync
        .synchronize_table("projects", SyncDirection::Bidirectional)
        .await;
    assert!(result.success);
    assert_eq!(result.records_synchronized, 0);
    assert_eq!(result.last_sync_time, Some(at(8, 0)));
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_full_sync_copies_missing_rows() {
    let h = Harness::new().await;
    let (sync, metadata) = synchronizer(&h);
    h.insert(Backend::A, "p-1", "Apollo", at(9, 0), at(9, 0)).await;
    h.insert(Backend::A, "p-2", "Gemini", at(9, 0), at(9, 30)).await;

    let result = sync.synchronize_table("projects", SyncDirection::AToB).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.records_synchronized, 2);
    assert_eq!(result.records_failed, 0);
    assert!(result.conflicts.is_empty());
    assert_eq!(result.last_sync_time, Some(at(9, 30)));

    assert_eq!(h.ids(Backend::B).await, vec!["p-1", "p-2"]);
    assert_eq!(h.row(Backend::A, "p-2").await, h.row(Backend::B, "p-2").await);
    assert_eq!(
        metadata.get_watermark("projects").await.unwrap(),
        Some(at(9, 30))
    );

    let report = ConsistencyChecker::new(h.db.clone())
        .check_table_consistency("projects")
        .await
        .unwrap();
    assert!(report.is_consistent);
}

#[tokio::test]
async fn test_one_way_sync_leaves_source_alone() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    h.insert(Backend::B, "p-9", "Only B", at(9, 0), at(9, 0)).await;

    let result = sync.synchronize_table("projects", SyncDirection::AToB).await;
    assert!(result.success);
    assert_eq!(result.records_synchronized, 0);
    assert!(h.ids(Backend::A).await.is_empty());

    let result = sync.synchronize_table("projects", SyncDirection::BToA).await;
    assert_eq!(result.records_synchronized, 1);
    assert_eq!(h.ids(Backend::A).await, vec!["p-9"]);
}

#[tokio::test]
async fn test_repeated_incremental_sync_is_a_no_op() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    h.insert(Backend::A, "p-1", "Apollo", at(9, 0), at(9, 0)).await;
    h.insert(Backend::B, "p-2", "Gemini", at(9, 0), at(9, 15)).await;

    let first = sync.incremental_sync("projects", at(8, 0)).await;
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.direction, SyncDirection::Bidirectional);
    assert_eq!(first.records_synchronized, 2);

    let second = sync.incremental_sync("projects", at(8, 0)).await;
    assert!(second.success);
    assert_eq!(second.records_synchronized, 0);
    assert!(second.conflicts.is_empty());

    assert_eq!(h.ids(Backend::A).await, h.ids(Backend::B).await);
}

#[tokio::test]
async fn test_incremental_sync_ignores_older_rows() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    h.insert(Backend::A, "p-old", "Old", at(7, 0), at(7, 0)).await;
    h.insert(Backend::A, "p-new", "New", at(9, 0), at(9, 0)).await;

    let result = sync.incremental_sync("projects", at(8, 0)).await;
    assert_eq!(result.records_synchronized, 1);
    assert_eq!(h.ids(Backend::B).await, vec!["p-new"]);
}

#[tokio::test]
async fn test_one_sided_change_is_copied_without_conflict() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    baseline(&h, &sync).await;

    h.touch(Backend::B, "p-1", "Edited on B", at(9, 0)).await;
    let result = sync
        .synchronize_table("projects", SyncDirection::Bidirectional)
        .await;
    assert!(result.success);
    assert!(result.conflicts.is_empty());
    assert_eq!(result.records_synchronized, 1);
    assert_eq!(h.name_of(Backend::A, "p-1").await.as_deref(), Some("Edited on B"));
}

#[tokio::test]
async fn test_update_update_conflict_latest_wins() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    baseline(&h, &sync).await;

    h.touch(Backend::A, "p-1", "From A", at(9, 0)).await;
    h.touch(Backend::B, "p-1", "From B", at(10, 0)).await;

    let result = sync
        .synchronize_table("projects", SyncDirection::Bidirectional)
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert_eq!(conflict.record_id, "p-1");
    assert_eq!(conflict.conflict_type, ConflictType::UpdateUpdate);
    assert_eq!(conflict.resolution, ResolutionStrategy::LatestWins);
    assert_eq!(conflict.data_a.as_ref().unwrap()["name"], json!("From A"));
    assert_eq!(conflict.data_b.as_ref().unwrap()["name"], json!("From B"));
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.records_synchronized, 1);

    assert_eq!(h.name_of(Backend::A, "p-1").await.as_deref(), Some("From B"));
    assert_eq!(h.row(Backend::A, "p-1").await, h.row(Backend::B, "p-1").await);
}

#[tokio::test]
async fn test_equal_timestamps_prefer_backend_a() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    baseline(&h, &sync).await;

    h.touch(Backend::A, "p-1", "From A", at(10, 0)).await;
    h.touch(Backend::B, "p-1", "From B", at(10, 0)).await;

    let result = sync
        .synchronize_table("projects", SyncDirection::Bidirectional)
        .await;
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(h.name_of(Backend::A, "p-1").await.as_deref(), Some("From A"));
    assert_eq!(h.name_of(Backend::B, "p-1").await.as_deref(), Some("From A"));
}

#[tokio::test]
async fn test_conflict_winner_respects_direction() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    baseline(&h, &sync).await;

    h.touch(Backend::A, "p-1", "From A", at(9, 0)).await;
    h.touch(Backend::B, "p-1", "From B", at(10, 0)).await;

    // B wins, but an A_to_B run may not write to A.
    let result = sync.synchronize_table("projects", SyncDirection::AToB).await;
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.records_synchronized, 0);
    assert_eq!(h.name_of(Backend::A, "p-1").await.as_deref(), Some("From A"));
    assert_eq!(h.name_of(Backend::B, "p-1").await.as_deref(), Some("From B"));
}

#[tokio::test]
async fn test_first_sync_of_diverged_rows_is_insert_insert() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    h.insert(Backend::A, "p-1", "Created on A", at(9, 0), at(9, 0)).await;
    h.insert(Backend::B, "p-1", "Created on B", at(9, 5), at(9, 5)).await;

    let result = sync
        .synchronize_table("projects", SyncDirection::Bidirectional)
        .await;
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].conflict_type, ConflictType::InsertInsert);
    assert_eq!(h.name_of(Backend::A, "p-1").await.as_deref(), Some("Created on B"));
}

#[tokio::test]
async fn test_delete_update_conflict() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    baseline(&h, &sync).await;

    h.db.execute(
        "UPDATE projects SET deleted_at = ?, updated_at = ?, version = version + 1 \
         WHERE id = 'p-1'",
        &[
            SqlValue::from(format_timestamp(&at(9, 0))),
            SqlValue::from(format_timestamp(&at(9, 0))),
        ],
        Some(Backend::A),
    )
    .await
    .unwrap();
    h.touch(Backend::B, "p-1", "Still alive", at(9, 30)).await;

    let result = sync
        .synchronize_table("projects", SyncDirection::Bidirectional)
        .await;
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].conflict_type, ConflictType::DeleteUpdate);
    let a = h.row(Backend::A, "p-1").await.unwrap();
    assert!(a["deleted_at"].is_null());
    assert_eq!(a["name"], json!("Still alive"));
}

#[tokio::test]
async fn test_manual_conflicts_are_queued_untouched() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    baseline(&h, &sync).await;

    h.touch(Backend::A, "p-1", "From A", at(9, 0)).await;
    h.touch(Backend::B, "p-1", "From B", at(10, 0)).await;

    let result = sync
        .synchronize_table_with(
            "projects",
            SyncDirection::Bidirectional,
            ResolutionStrategy::Manual,
        )
        .await;
    assert!(result.success);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts_resolved, 0);
    assert_eq!(result.records_synchronized, 0);

    assert_eq!(h.name_of(Backend::A, "p-1").await.as_deref(), Some("From A"));
    assert_eq!(h.name_of(Backend::B, "p-1").await.as_deref(), Some("From B"));

    let queued = sync.resolver().take_pending_manual();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].record_id, "p-1");
    assert!(sync.resolver().pending_manual().is_empty());
}

#[tokio::test]
async fn test_custom_rule_merges_both_sides() {
    let h = Harness::new().await;
    let rule: CustomRule = Arc::new(|a: &Row, b: &Row| {
        let mut merged = b.clone();
        merged.remove("id");
        let name = format!(
            "{} + {}",
            a["name"].as_str().unwrap_or_default(),
            b["name"].as_str().unwrap_or_default()
        );
        merged.insert("name".into(), json!(name));
        merged
    });
    let sync = DataSynchronizer::new(h.db.clone(), Arc::new(InMemoryMetadataStore::new()))
        .with_custom_rule(rule);
    baseline(&h, &sync).await;

    h.touch(Backend::A, "p-1", "From A", at(9, 0)).await;
    h.touch(Backend::B, "p-1", "From B", at(10, 0)).await;

    let result = sync
        .synchronize_table_with(
            "projects",
            SyncDirection::Bidirectional,
            ResolutionStrategy::CustomRule,
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.records_synchronized, 2);
    for backend in Backend::ALL {
        assert_eq!(
            h.name_of(backend, "p-1").await.as_deref(),
            Some("From A + From B")
        );
    }
}

#[tokio::test]
async fn test_custom_rule_strategy_requires_a_rule() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    let result = sync
        .synchronize_table_with("projects", SyncDirection::AToB, ResolutionStrategy::CustomRule)
        .await;
    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_unknown_table_fails_without_touching_data() {
    let h = Harness::new().await;
    let (sync, metadata) = synchronizer(&h);
    let mut events = sync.subscribe();

    let result = sync.synchronize_table("invoices", SyncDirection::AToB).await;
    assert!(!result.success);
    assert_eq!(result.records_synchronized, 0);
    assert_eq!(result.error.as_ref().unwrap().code, "VALIDATION_ERROR");
    assert_eq!(metadata.get_watermark("invoices").await.unwrap(), None);

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], SyncEvent::Failed { table, .. } if table == "invoices"));
}

#[tokio::test]
async fn test_lost_connectivity_aborts_run() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    h.insert(Backend::A, "p-1", "Apollo", at(9, 0), at(9, 0)).await;
    h.pool.close().await.unwrap();

    let result = sync.synchronize_table("projects", SyncDirection::AToB).await;
    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, "SYNC_ABORTED");
}

#[tokio::test]
async fn test_events_trace_a_batched_run() {
    let h = Harness::new().await;
    let sync = DataSynchronizer::new(h.db.clone(), Arc::new(InMemoryMetadataStore::new()))
        .with_batch_size(2);
    assert_eq!(sync.batch_size(), 2);
    for i in 1..=5 {
        h.insert(Backend::A, &format!("p-{}", i), "Row", at(9, 0), at(9, i)).await;
    }
    let mut rx = sync.subscribe();

    let result = sync.synchronize_table("projects", SyncDirection::AToB).await;
    assert_eq!(result.records_synchronized, 5);

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(SyncEvent::Started { incremental: false, .. })));
    assert!(matches!(
        events.last(),
        Some(SyncEvent::Completed { records_synchronized: 5, conflicts: 0, .. })
    ));
    let progress: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Progress { processed, total, .. } => Some((*processed, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(2, 5), (4, 5), (5, 5)]);
    assert!(events.iter().all(|e| e.table() == "projects"));
}

#[tokio::test]
async fn test_conflict_events_are_published() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    baseline(&h, &sync).await;
    h.touch(Backend::A, "p-1", "From A", at(9, 0)).await;
    h.touch(Backend::B, "p-1", "From B", at(10, 0)).await;

    let mut rx = sync.subscribe();
    sync.synchronize_table("projects", SyncDirection::Bidirectional)
        .await;
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::ConflictDetected { record_id, conflict_type: ConflictType::UpdateUpdate, .. }
            if record_id == "p-1"
    )));
}

#[tokio::test]
async fn test_concurrent_runs_on_one_table_are_serialized() {
    let h = Harness::new().await;
    let (sync, _) = synchronizer(&h);
    h.insert(Backend::A, "p-1", "Apollo", at(9, 0), at(9, 0)).await;
    h.insert(Backend::A, "p-2", "Gemini", at(9, 0), at(9, 0)).await;

    let (first, second) = tokio::join!(
        sync.synchronize_table("projects", SyncDirection::AToB),
        sync.synchronize_table("projects", SyncDirection::AToB)
    );
    assert!(first.success && second.success);
    assert_eq!(first.records_failed + second.records_failed, 0);
    assert_eq!(first.records_synchronized + second.records_synchronized, 2);
    assert_eq!(h.ids(Backend::B).await, vec!["p-1", "p-2"]);
}

/// `tasks` on both sides, where B rejects the title "bad". A holds t-1 "bad"
/// at 10:00 and t-2 "good" at 11:00.
async fn tasks_with_rejected_row(h: &Harness) -> (DataSynchronizer, Arc<InMemoryMetadataStore>) {
    h.db.execute(
        "CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT, created_at TEXT, \
         updated_at TEXT, deleted_at TEXT)",
        &[],
        Some(Backend::A),
    )
    .await
    .unwrap();
    h.db.execute(
        "CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT CHECK (title <> 'bad'), \
         created_at TEXT, updated_at TEXT, deleted_at TEXT)",
        &[],
        Some(Backend::B),
    )
    .await
    .unwrap();
    for (id, title, updated) in [("t-1", "bad", at(10, 0)), ("t-2", "good", at(11, 0))] {
        h.db.execute(
            "INSERT INTO tasks (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            &[
                SqlValue::from(id),
                SqlValue::from(title),
                SqlValue::from(format_timestamp(&at(9, 0))),
                SqlValue::from(format_timestamp(&updated)),
            ],
            Some(Backend::A),
        )
        .await
        .unwrap();
    }

    let db = h.db.clone().with_tables([projects_spec(), TableSpec::new("tasks")]);
    let metadata = Arc::new(InMemoryMetadataStore::new());
    (DataSynchronizer::new(db, metadata.clone()), metadata)
}

async fn task_title(h: &Harness, backend: Backend, id: &str) -> Option<String> {
    h.db.query(
        "SELECT title FROM tasks WHERE id = ?",
        &[SqlValue::from(id)],
        Some(backend),
    )
    .await
    .unwrap()
    .into_iter()
    .next()
    .and_then(|row| row.get("title").and_then(|v| v.as_str()).map(String::from))
}

#[tokio::test]
async fn test_row_failure_holds_back_watermark() {
    let h = Harness::new().await;
    let (sync, metadata) = tasks_with_rejected_row(&h).await;

    let result = sync.synchronize_table("tasks", SyncDirection::AToB).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.records_synchronized, 1);
    assert_eq!(result.records_failed, 1);
    assert_eq!(result.last_sync_time, Some(at(10, 0)));
    assert_eq!(metadata.get_watermark("tasks").await.unwrap(), Some(at(10, 0)));
    assert_eq!(
        metadata
            .get_checkpoint("tasks", Checkpoint::Baseline)
            .await
            .unwrap(),
        Some(at(11, 0))
    );
}

#[tokio::test]
async fn test_failed_row_leaves_copied_rows_out_of_conflicts() {
    let h = Harness::new().await;
    let (sync, metadata) = tasks_with_rejected_row(&h).await;

    let first = sync.synchronize_table("tasks", SyncDirection::AToB).await;
    assert_eq!((first.records_synchronized, first.records_failed), (1, 1));
    assert_eq!(first.last_sync_time, Some(at(10, 0)));

    // Only A edits t-2 after it was copied.
    h.db.execute(
        "UPDATE tasks SET title = ?, updated_at = ? WHERE id = ?",
        &[
            SqlValue::from("better"),
            SqlValue::from(format_timestamp(&at(12, 0))),
            SqlValue::from("t-2"),
        ],
        Some(Backend::A),
    )
    .await
    .unwrap();

    let second = sync
        .synchronize_table_with("tasks", SyncDirection::AToB, ResolutionStrategy::Manual)
        .await;
    assert!(second.success, "{:?}", second.error);
    assert!(second.conflicts.is_empty(), "{:?}", second.conflicts);
    assert_eq!(second.records_synchronized, 1);
    assert_eq!(second.records_failed, 1);
    assert!(sync.resolver().pending_manual().is_empty());
    assert_eq!(task_title(&h, Backend::B, "t-2").await.as_deref(), Some("better"));
    assert_eq!(metadata.get_watermark("tasks").await.unwrap(), Some(at(10, 0)));
    assert_eq!(
        metadata
            .get_checkpoint("tasks", Checkpoint::Baseline)
            .await
            .unwrap(),
        Some(at(12, 0))
    );
}

#[tokio::test]
async fn test_locked_destination_fails_rows_without_aborting() {
    let h = Harness::with_options(PoolOptions {
        busy_timeout_ms: Some(100),
        ..Default::default()
    })
    .await;
    let (sync, _) = synchronizer(&h);
    h.insert(Backend::A, "p-1", "Apollo", at(9, 0), at(9, 0)).await;
    h.insert(Backend::A, "p-2", "Gemini", at(9, 0), at(9, 30)).await;

    let path = h.dir.path().join("backend_b.db");
    let mut holder = SqliteConnection::connect(&format!("sqlite:{}", path.display()))
        .await
        .unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut holder)
        .await
        .unwrap();

    let locked = sync.synchronize_table("projects", SyncDirection::AToB).await;
    assert!(locked.success, "{:?}", locked.error);
    assert!(locked.error.is_none());
    assert_eq!(locked.records_synchronized, 0);
    assert_eq!(locked.records_failed, 2);

    sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();
    holder.close().await.unwrap();

    let retried = sync.synchronize_table("projects", SyncDirection::AToB).await;
    assert!(retried.success, "{:?}", retried.error);
    assert_eq!(retried.records_synchronized, 2);
    assert_eq!(h.ids(Backend::B).await, vec!["p-1", "p-2"]);
}

#[tokio::test]
async fn test_watermark_survives_in_sqlite_store() {
    let h = Harness::new().await;
    let path = h.dir.path().join("metadata.db");
    let store = Arc::new(SqliteMetadataStore::open(&path).await.unwrap());
    let sync = DataSynchronizer::new(h.db.clone(), store.clone());
    h.insert(Backend::A, "p-1", "Apollo", at(9, 0), at(9, 45)).await;

    let result = sync.synchronize_table("projects", SyncDirection::AToB).await;
    assert!(result.success);
    store.close().await;

    let reopened = SqliteMetadataStore::open(&path).await.unwrap();
    assert_eq!(
        reopened.get_watermark("projects").await.unwrap(),
        Some(at(9, 45))
    );

    // The next watermark run starts from the stored point and finds nothing.
    let sync = DataSynchronizer::new(h.db.clone(), Arc::new(reopened));
    let result = sync
        .sync_from_watermark("projects", SyncDirection::AToB, ResolutionStrategy::LatestWins)
        .await;
    assert!(result.success);
    assert_eq!(result.records_synchronized, 0);
    assert_eq!(result.last_sync_time, Some(at(9, 45)));
}
