//! Dual-backend pool manager.
//!
//! Owns one pool per backend and hands out [`PooledConnection`]s.
//!
//! # Design
//!
//! - **Semaphore per backend**: sized to `max_connections`, gates checkouts so
//!   `connections_in_use` can never exceed the configured maximum
//! - **`std::sync::Mutex` for counters**: `in_use` and `waiting` are only touched
//!   in acquire and release, never across an await
//! - **`RwLock` on the backend map**: held only long enough to clone an `Arc`
//! - **Weak reference in the health monitor**: the background task never keeps
//!   the manager alive and exits once it is dropped
//!
//! # State machine
//!
//! ```text
//! uninitialized -> initializing -> open <-> degraded -> closing -> closed
//!        ^              |                                            |
//!        +--- failed ---+                        initialize again ---+
//! ```

use crate::clock::{Sleeper, TokioSleeper};
use crate::config::MAX_HEALTH_DEADLINE_MS;
use crate::db::pool::{ConnectionSource, Connector, DbConnection, SqlxConnector};
use crate::db::retry::{RetryPolicy, retry_with_backoff};
use crate::error::{DbError, DbResult};
use crate::models::{Backend, ConnectionConfig, DatabaseType};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of the manager as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Uninitialized,
    Initializing,
    Open,
    /// At least one backend failed its last health check
    Degraded,
    Closing,
    Closed,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Open => "open",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Healthy,
    Unhealthy,
    Uninitialized,
}

/// Point-in-time counters for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendPoolStatus {
    pub is_initialized: bool,
    pub connections_open: u32,
    pub connections_in_use: u32,
    pub idle: u32,
    pub waiting: u32,
    pub status: BackendState,
    pub max_connections: u32,
}

impl BackendPoolStatus {
    fn uninitialized() -> Self {
        Self {
            is_initialized: false,
            connections_open: 0,
            connections_in_use: 0,
            idle: 0,
            waiting: 0,
            status: BackendState::Uninitialized,
            max_connections: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub state: PoolState,
    pub backends: BTreeMap<Backend, BackendPoolStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub healthy: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub response_time_ms: u64,
    pub per_backend: BTreeMap<Backend, BackendHealth>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    in_use: u32,
    waiting: u32,
}

#[derive(Debug)]
struct BackendPool {
    backend: Backend,
    source: Arc<dyn ConnectionSource>,
    permits: Arc<Semaphore>,
    counters: Mutex<PoolCounters>,
    healthy: AtomicBool,
    acquire_attempts: AtomicU64,
    next_id: AtomicU64,
    max_connections: u32,
    increment: u32,
    acquire_timeout: Duration,
}

impl BackendPool {
    fn counters(&self) -> std::sync::MutexGuard<'_, PoolCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> BackendPoolStatus {
        let (in_use, waiting) = {
            let c = self.counters();
            (c.in_use, c.waiting)
        };
        let open = self.source.size().max(in_use).min(self.max_connections);
        BackendPoolStatus {
            is_initialized: true,
            connections_open: open,
            connections_in_use: in_use,
            idle: open.saturating_sub(in_use),
            waiting,
            status: if self.healthy.load(Ordering::Acquire) {
                BackendState::Healthy
            } else {
                BackendState::Unhealthy
            },
            max_connections: self.max_connections,
        }
    }

    /// Open up to `increment` more physical connections in the background
    /// when the pool has nothing idle left.
    fn maybe_grow(self: &Arc<Self>) {
        if self.source.num_idle() > 0 || self.source.size() >= self.max_connections {
            return;
        }
        let room = self.max_connections - self.source.size();
        let count = self.increment.min(room);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut opened = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match pool.source.acquire().await {
                    Ok(conn) => opened.push(conn),
                    Err(e) => {
                        debug!(backend = %pool.backend, error = %e, "Pool growth stopped early");
                        break;
                    }
                }
            }
            debug!(backend = %pool.backend, opened = opened.len(), "Pool grown");
        });
    }
}

/// Decrements `waiting` however the acquire ends, including cancellation.
struct WaitingGuard<'a> {
    pool: &'a BackendPool,
}

impl<'a> WaitingGuard<'a> {
    fn new(pool: &'a BackendPool) -> Self {
        pool.counters().waiting += 1;
        Self { pool }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let mut c = self.pool.counters();
        c.waiting = c.waiting.saturating_sub(1);
    }
}

/// A connection checked out of the manager.
///
/// Exclusively owned by one caller. Dropping it, or calling
/// [`release`](Self::release), returns it to its backend pool; releasing twice
/// is a no-op.
pub struct PooledConnection {
    id: u64,
    backend: Backend,
    created_at: DateTime<Utc>,
    healthy: bool,
    conn: Option<DbConnection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<BackendPool>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("in_use", &self.in_use())
            .field("healthy", &self.healthy)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn in_use(&self) -> bool {
        self.conn.is_some()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.source.db_type()
    }

    /// The underlying driver connection.
    pub fn connection(&mut self) -> DbResult<&mut DbConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("connection already released"))
    }

    /// Close the physical connection on release instead of reusing it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Return the connection to its pool.
    pub fn release(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        {
            let mut c = self.pool.counters();
            c.in_use = c.in_use.saturating_sub(1);
        }
        if !self.healthy {
            conn.close_on_drop();
            debug!(backend = %self.backend, id = self.id, "Discarding unhealthy connection");
        }
        drop(conn);
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
struct BackendSlot {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
}

/// Manages the two backend pools.
#[derive(Debug)]
pub struct PoolManager {
    slot_a: BackendSlot,
    slot_b: BackendSlot,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    health_deadline: Duration,
    state: Mutex<PoolState>,
    pools: RwLock<HashMap<Backend, Arc<BackendPool>>>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Create a manager for two backends. Nothing connects until
    /// [`initialize`](Self::initialize).
    pub fn new(config_a: ConnectionConfig, config_b: ConnectionConfig) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(SqlxConnector);
        Self {
            slot_a: BackendSlot {
                config: config_a,
                connector: Arc::clone(&connector),
            },
            slot_b: BackendSlot {
                config: config_b,
                connector,
            },
            retry: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            health_deadline: Duration::from_millis(MAX_HEALTH_DEADLINE_MS),
            state: Mutex::new(PoolState::Uninitialized),
            pools: RwLock::new(HashMap::new()),
            monitor_handle: Mutex::new(None),
        }
    }

    /// Use a custom connector for one backend.
    pub fn with_connector(mut self, backend: Backend, connector: Arc<dyn Connector>) -> Self {
        self.slot_mut(backend).connector = connector;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Probe deadline for [`health_check`](Self::health_check), capped at 500ms.
    pub fn with_health_deadline(mut self, deadline: Duration) -> Self {
        self.health_deadline = deadline.min(Duration::from_millis(MAX_HEALTH_DEADLINE_MS));
        self
    }

    fn slot(&self, backend: Backend) -> &BackendSlot {
        match backend {
            Backend::A => &self.slot_a,
            Backend::B => &self.slot_b,
        }
    }

    fn slot_mut(&mut self, backend: Backend) -> &mut BackendSlot {
        match backend {
            Backend::A => &mut self.slot_a,
            Backend::B => &mut self.slot_b,
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PoolState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            debug!(from = %*current, to = %state, "Pool manager state change");
            *current = state;
        }
    }

    pub fn db_type(&self, backend: Backend) -> DatabaseType {
        self.slot(backend).config.db_type
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Open both backend pools.
    ///
    /// Each backend gets the full retry budget. If either side still fails the
    /// other is closed again and the manager returns to `uninitialized`.
    pub async fn initialize(&self) -> DbResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                PoolState::Uninitialized | PoolState::Closed => {
                    *state = PoolState::Initializing;
                }
                other => {
                    return Err(DbError::internal(format!(
                        "cannot initialize pool manager in state '{}'",
                        other
                    )));
                }
            }
        }

        let started = Instant::now();
        let (a, b) = tokio::join!(
            self.open_backend(Backend::A),
            self.open_backend(Backend::B)
        );

        match (a, b) {
            (Ok(a), Ok(b)) => {
                {
                    let mut pools = self.pools.write().await;
                    pools.insert(Backend::A, a);
                    pools.insert(Backend::B, b);
                }
                self.set_state(PoolState::Open);
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Pool manager initialized"
                );
                Ok(())
            }
            (a, b) => {
                let mut first_error = None;
                for result in [a, b] {
                    match result {
                        Ok(pool) => {
                            if let Err(e) = pool.source.close().await {
                                warn!(
                                    backend = %pool.backend,
                                    error = %e,
                                    "Failed to close pool after aborted initialize"
                                );
                            }
                        }
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                self.set_state(PoolState::Uninitialized);
                let err = first_error
                    .unwrap_or_else(|| DbError::internal("pool initialization failed"));
                error!(error = %err, "Pool manager initialization failed");
                Err(err)
            }
        }
    }

    async fn open_backend(&self, backend: Backend) -> DbResult<Arc<BackendPool>> {
        let slot = self.slot(backend);
        let opts = &slot.config.pool_options;
        let is_sqlite = slot.config.db_type == DatabaseType::SQLite;
        let max_connections = opts.max_connections_or_default(is_sqlite);
        let min_connections = opts.min_connections_or_default(is_sqlite);

        let operation = format!("connect backend {}", backend);
        let source = retry_with_backoff(&self.retry, self.sleeper.as_ref(), &operation, || {
            slot.connector.connect(&slot.config)
        })
        .await?;

        // Hold `min` connections at once so that many are physically open.
        let mut warm = Vec::with_capacity(min_connections as usize);
        for _ in 0..min_connections {
            match source.acquire().await {
                Ok(conn) => warm.push(conn),
                Err(e) => {
                    drop(warm);
                    if let Err(close_err) = source.close().await {
                        warn!(
                            backend = %backend,
                            error = %close_err,
                            "Failed to close pool after warm-up failure"
                        );
                    }
                    return Err(e);
                }
            }
        }
        drop(warm);

        info!(
            backend = %backend,
            db_type = %slot.config.db_type,
            min_connections,
            max_connections,
            "Backend pool opened"
        );

        Ok(Arc::new(BackendPool {
            backend,
            source,
            permits: Arc::new(Semaphore::new(max_connections as usize)),
            counters: Mutex::new(PoolCounters::default()),
            healthy: AtomicBool::new(true),
            acquire_attempts: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            max_connections,
            increment: opts.increment_or_default(),
            acquire_timeout: Duration::from_secs(opts.acquire_timeout_or_default()),
        }))
    }

    async fn backend_pool(&self, backend: Backend) -> DbResult<Arc<BackendPool>> {
        let pools = self.pools.read().await;
        pools.get(&backend).cloned().ok_or_else(|| {
            DbError::connection_for(backend, format!("pool for backend {} is not open", backend))
        })
    }

    /// Check out a connection within the backend's configured acquire timeout.
    pub async fn get_connection(&self, backend: Backend) -> DbResult<PooledConnection> {
        let timeout = self.backend_pool(backend).await?.acquire_timeout;
        self.get_connection_within(backend, timeout).await
    }

    /// Check out a connection, waiting at most `timeout` for a free slot.
    ///
    /// Fails with `PoolExhausted` when no slot frees up in time. Transient
    /// failures opening the physical connection are retried per the retry
    /// policy before surfacing.
    pub async fn get_connection_within(
        &self,
        backend: Backend,
        timeout: Duration,
    ) -> DbResult<PooledConnection> {
        let pool = self.backend_pool(backend).await?;

        let permit = {
            let _waiting = WaitingGuard::new(&pool);
            match tokio::time::timeout(timeout, Arc::clone(&pool.permits).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(DbError::connection_for(
                        backend,
                        format!("pool for backend {} is closed", backend),
                    ));
                }
                Err(_) => {
                    warn!(
                        backend = %backend,
                        timeout_ms = timeout.as_millis() as u64,
                        "Connection pool exhausted"
                    );
                    return Err(DbError::pool_exhausted(backend, self.retry.base_delay));
                }
            }
        };

        let conn = retry_with_backoff(
            &self.retry,
            self.sleeper.as_ref(),
            "acquire connection",
            || {
                pool.acquire_attempts.fetch_add(1, Ordering::Relaxed);
                pool.source.acquire()
            },
        )
        .await?;

        pool.counters().in_use += 1;
        pool.maybe_grow();

        let id = pool.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            id,
            backend,
            created_at: Utc::now(),
            healthy: true,
            conn: Some(conn),
            permit: Some(permit),
            pool,
        })
    }

    /// Return a connection to its pool. Safe to call more than once.
    pub fn release_connection(&self, conn: &mut PooledConnection) {
        conn.release();
    }

    /// Total physical acquire attempts made for `backend`, retries included.
    pub async fn acquire_attempts(&self, backend: Backend) -> u64 {
        match self.pools.read().await.get(&backend) {
            Some(pool) => pool.acquire_attempts.load(Ordering::Relaxed),
            None => 0,
        }
    }

    pub async fn get_pool_status(&self) -> PoolStatus {
        let pools: Vec<(Backend, Option<Arc<BackendPool>>)> = {
            let map = self.pools.read().await;
            Backend::ALL
                .iter()
                .map(|b| (*b, map.get(b).cloned()))
                .collect()
        };
        let backends = pools
            .into_iter()
            .map(|(backend, pool)| {
                let status = match pool {
                    Some(pool) => pool.status(),
                    None => BackendPoolStatus::uninitialized(),
                };
                (backend, status)
            })
            .collect();
        PoolStatus {
            state: self.state(),
            backends,
        }
    }

    /// Probe both backends concurrently under the health deadline.
    ///
    /// A backend whose every slot is checked out is reported healthy without a
    /// probe, since it is demonstrably serving queries.
    pub async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let pools: Vec<(Backend, Option<Arc<BackendPool>>)> = {
            let map = self.pools.read().await;
            Backend::ALL
                .iter()
                .map(|b| (*b, map.get(b).cloned()))
                .collect()
        };

        let deadline = self.health_deadline;
        let probes = pools.into_iter().map(|(backend, pool)| async move {
            (backend, probe_backend(pool, deadline).await)
        });
        let per_backend: BTreeMap<Backend, BackendHealth> =
            join_all(probes).await.into_iter().collect();

        let is_healthy = per_backend.values().all(|h| h.healthy);
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match (*state, is_healthy) {
                (PoolState::Open, false) => *state = PoolState::Degraded,
                (PoolState::Degraded, true) => *state = PoolState::Open,
                _ => {}
            }
        }
        for (backend, health) in &per_backend {
            if !health.healthy {
                warn!(
                    backend = %backend,
                    error = health.error.as_deref().unwrap_or("unknown"),
                    "Backend failed health check"
                );
            }
        }

        HealthStatus {
            is_healthy,
            response_time_ms: started.elapsed().as_millis() as u64,
            per_backend,
            checked_at: Utc::now(),
        }
    }

    /// Run [`health_check`](Self::health_check) every `interval` until
    /// [`close`](Self::close) or the manager is dropped.
    pub fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(Self::health_monitor_task(weak, interval));
        let mut slot = self
            .monitor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    async fn health_monitor_task(weak_manager: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;

            let Some(manager) = weak_manager.upgrade() else {
                info!("Pool manager dropped, health monitor exiting");
                return;
            };
            let status = manager.health_check().await;
            debug!(
                is_healthy = status.is_healthy,
                response_time_ms = status.response_time_ms,
                "Periodic health check"
            );
        }
    }

    fn stop_health_monitor(&self) {
        let mut slot = self
            .monitor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Close both pools.
    ///
    /// A failure closing one backend is logged and does not keep the other
    /// open. Checked-out connections should be released first; closing waits
    /// for them.
    pub async fn close(&self) -> DbResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                PoolState::Uninitialized | PoolState::Closed | PoolState::Closing => {
                    return Ok(());
                }
                PoolState::Initializing => {
                    return Err(DbError::internal(
                        "cannot close pool manager while it is initializing",
                    ));
                }
                PoolState::Open | PoolState::Degraded => *state = PoolState::Closing,
            }
        }

        self.stop_health_monitor();

        let mut drained: Vec<(Backend, Arc<BackendPool>)> =
            self.pools.write().await.drain().collect();
        drained.sort_by_key(|(backend, _)| *backend);

        let mut failures = Vec::new();
        for (backend, pool) in drained {
            pool.permits.close();
            match pool.source.close().await {
                Ok(()) => info!(backend = %backend, "Backend pool closed"),
                Err(e) => {
                    error!(backend = %backend, error = %e, "Failed to close backend pool");
                    failures.push(format!("{}: {}", backend, e));
                }
            }
        }

        self.set_state(PoolState::Closed);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DbError::internal(format!(
                "failed to close backend pools: {}",
                failures.join("; ")
            )))
        }
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .monitor_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn probe_backend(pool: Option<Arc<BackendPool>>, deadline: Duration) -> BackendHealth {
    let Some(pool) = pool else {
        return BackendHealth {
            healthy: false,
            response_time_ms: 0,
            error: Some("pool not initialized".to_string()),
        };
    };

    let started = Instant::now();
    let result = if pool.permits.available_permits() == 0 {
        Ok(())
    } else {
        match tokio::time::timeout(deadline, pool.source.ping()).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout("health check", deadline)),
        }
    };

    let healthy = result.is_ok();
    pool.healthy.store(healthy, Ordering::Release);
    BackendHealth {
        healthy,
        response_time_ms: started.elapsed().as_millis() as u64,
        error: result.err().map(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;

    fn sqlite_config(backend: Backend, max: u32) -> ConnectionConfig {
        ConnectionConfig::new(
            backend,
            "sqlite::memory:",
            PoolOptions {
                max_connections: Some(max),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_uninitialized_manager() {
        let manager = PoolManager::new(
            sqlite_config(Backend::A, 2),
            sqlite_config(Backend::B, 2),
        );
        assert_eq!(manager.state(), PoolState::Uninitialized);
        let err = manager.get_connection(Backend::A).await.unwrap_err();
        assert!(err.is_connectivity());

        let status = manager.get_pool_status().await;
        assert!(!status.backends[&Backend::A].is_initialized);

        // Closing something never opened is a no-op.
        manager.close().await.unwrap();
        assert_eq!(manager.state(), PoolState::Uninitialized);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let manager = PoolManager::new(
            sqlite_config(Backend::A, 2),
            sqlite_config(Backend::B, 2),
        );
        manager.initialize().await.unwrap();
        assert_eq!(manager.state(), PoolState::Open);

        let mut conn = manager.get_connection(Backend::A).await.unwrap();
        assert!(conn.in_use());
        let status = manager.get_pool_status().await;
        assert_eq!(status.backends[&Backend::A].connections_in_use, 1);

        manager.release_connection(&mut conn);
        manager.release_connection(&mut conn);
        assert!(!conn.in_use());
        assert!(conn.connection().is_err());
        let status = manager.get_pool_status().await;
        assert_eq!(status.backends[&Backend::A].connections_in_use, 0);

        drop(conn);
        manager.close().await.unwrap();
        assert_eq!(manager.state(), PoolState::Closed);
    }

    #[tokio::test]
    async fn test_initialize_twice_rejected() {
        let manager = PoolManager::new(
            sqlite_config(Backend::A, 1),
            sqlite_config(Backend::B, 1),
        );
        manager.initialize().await.unwrap();
        assert!(manager.initialize().await.is_err());
        manager.close().await.unwrap();
        // A closed manager can be opened again.
        manager.initialize().await.unwrap();
        manager.close().await.unwrap();
    }

    #[test]
    fn test_health_deadline_is_capped() {
        let manager = PoolManager::new(
            sqlite_config(Backend::A, 1),
            sqlite_config(Backend::B, 1),
        )
        .with_health_deadline(Duration::from_secs(5));
        assert_eq!(manager.health_deadline, Duration::from_millis(500));
    }
}
