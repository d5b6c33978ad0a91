//! db-sync - command-line entry point.
//!
//! Connects to backends A and B, runs one command and prints its result as
//! JSON on stdout. Logs go to stderr.

use clap::Parser;
use db_sync_core::config::{Command, Config, CoreSettings, ScheduleCommand};
use db_sync_core::db::{Database, PoolManager};
use db_sync_core::models::record::parse_timestamp;
use db_sync_core::models::{ResolutionStrategy, ScheduleConfig, SyncDirection};
use db_sync_core::sync::{
    ConsistencyChecker, DataComparisonEngine, DataSynchronizer, MetadataStore,
    SqliteMetadataStore, SyncScheduler,
};
use serde::Serialize;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn invalid(message: String) -> Box<dyn Error> {
    message.into()
}

async fn synchronizer(
    settings: &CoreSettings,
    db: &Database,
) -> Result<Arc<DataSynchronizer>, Box<dyn Error>> {
    let metadata: Arc<dyn MetadataStore> =
        Arc::new(SqliteMetadataStore::open(&settings.metadata_path).await?);
    Ok(Arc::new(
        DataSynchronizer::new(db.clone(), metadata)
            .with_batch_size(settings.batch_size)
            .with_max_concurrent_tables(settings.max_concurrent_tables),
    ))
}

fn table_names(requested: &[String], db: &Database) -> Vec<String> {
    if requested.is_empty() {
        db.tables().into_iter().map(|spec| spec.name).collect()
    } else {
        requested.to_vec()
    }
}

/// Run one command. `Ok(false)` means it ran but reported failure.
async fn run(
    command: &Command,
    settings: &CoreSettings,
    pool: &Arc<PoolManager>,
    db: &Database,
) -> Result<bool, Box<dyn Error>> {
    match command {
        Command::Health => {
            let status = pool.health_check().await;
            print_json(&status)?;
            Ok(status.is_healthy)
        }
        Command::Status => {
            print_json(&pool.get_pool_status().await)?;
            Ok(true)
        }
        Command::Check { tables } => {
            let checker = ConsistencyChecker::new(db.clone()).with_tables(table_names(tables, db));
            let report = checker.validate_all_tables().await;
            print_json(&report)?;
            Ok(report.overall_consistency)
        }
        Command::Compare { tables, strict } => {
            let engine = DataComparisonEngine::new(db.clone()).with_strict_schema(*strict);
            let report = engine
                .generate_comparison_report(&table_names(tables, db))
                .await;
            print_json(&report)?;
            Ok(report.summary.errored == 0)
        }
        Command::Sync {
            table,
            direction,
            since,
            conflict_resolution,
        } => {
            let direction: SyncDirection = direction.parse().map_err(invalid)?;
            let strategy = ResolutionStrategy::parse(conflict_resolution).ok_or_else(|| {
                invalid(format!("unknown conflict resolution '{}'", conflict_resolution))
            })?;
            let sync = synchronizer(settings, db).await?;
            let result = match since {
                Some(since) => {
                    let since = parse_timestamp(since)
                        .ok_or_else(|| invalid(format!("cannot parse timestamp '{}'", since)))?;
                    sync.incremental_sync_with(table, since, direction, strategy)
                        .await
                }
                None => sync.synchronize_table_with(table, direction, strategy).await,
            };
            print_json(&result)?;
            Ok(result.success)
        }
        Command::Schedule { action } => {
            let scheduler = SyncScheduler::new(synchronizer(settings, db).await?);
            match action {
                ScheduleCommand::Add {
                    tables,
                    interval,
                    direction,
                    conflict_resolution,
                } => {
                    let outcome = scheduler
                        .schedule_sync(ScheduleConfig {
                            tables: tables.clone(),
                            interval: interval.clone(),
                            direction: direction.clone(),
                            conflict_resolution: conflict_resolution.clone(),
                        })
                        .await;
                    print_json(&outcome)?;
                    Ok(outcome.success)
                }
                ScheduleCommand::List => {
                    print_json(&scheduler.list_schedules().await?)?;
                    Ok(true)
                }
                ScheduleCommand::Run { schedule_id } => {
                    let outcome = scheduler.execute_scheduled_sync(schedule_id).await;
                    print_json(&outcome)?;
                    Ok(outcome.success)
                }
                ScheduleCommand::Cancel { schedule_id } => {
                    let cancelled = scheduler.cancel_schedule(schedule_id).await?;
                    print_json(&serde_json::json!({
                        "schedule_id": schedule_id,
                        "cancelled": cancelled,
                    }))?;
                    Ok(cancelled)
                }
            }
        }
        Command::Scheduler { tick } => {
            let scheduler = Arc::new(
                SyncScheduler::new(synchronizer(settings, db).await?)
                    .with_table_concurrency(settings.max_concurrent_tables),
            );
            pool.start_health_monitor(settings.health_interval);
            scheduler.start(Duration::from_secs((*tick).max(1)));
            info!("Scheduler running, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            scheduler.stop();
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let settings = match config.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    info!(
        backend_a = %settings.backend_a.masked_connection_string(),
        backend_b = %settings.backend_b.masked_connection_string(),
        "Starting db-sync v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = Arc::new(
        PoolManager::new(settings.backend_a.clone(), settings.backend_b.clone())
            .with_retry_policy(settings.retry)
            .with_health_deadline(settings.health_deadline),
    );
    if let Err(e) = pool.initialize().await {
        error!(error = %e, "Failed to open backend pools");
        return Err(e.into());
    }

    let db = Database::new(Arc::clone(&pool))
        .with_query_timeout(settings.query_timeout)
        .with_tables(settings.tables.clone());

    let outcome = run(&config.command, &settings, &pool, &db).await;

    if let Err(e) = pool.close().await {
        warn!(error = %e, "Error closing pools");
    }

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            Err(e)
        }
    }
}
