//! Pool-backed database handle for rdbc-router
//!
//! [`PooledDatabase`] turns a [`ConnectionFactory`] into a [`Database`] handle:
//! - Lazy dialing (opening a handle never touches the network)
//! - Limits adjustable at runtime (max idle, max open, lifetime, idle time)
//! - Optional validation on borrow
//! - Sessions pinned for the life of prepared statements and transactions
//! - Metrics and statistics
//!
//! # Example
//!
//! ```rust,ignore
//! use rdbc_router::prelude::*;
//!
//! let driver = PoolDriver::new("postgres", Arc::new(PgConnectionFactory))
//!     .with_config(PoolConfig::default().with_max_open(20));
//! let db = driver.open("postgres://localhost/db").await?;
//! db.execute("UPDATE jobs SET state = 'done' WHERE id = $1", &[Value::Int64(7)]).await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::connection::{
    redact_url, Connection, ConnectionConfig, ConnectionFactory, PreparedStatement, Transaction,
    TransactionOptions,
};
use crate::database::{Database, Driver};
use crate::error::{Error, ErrorCategory, Result};
use crate::types::{ExecResult, Row, Value};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Maximum idle sessions kept for reuse (0 keeps none)
    pub max_idle: usize,
    /// Maximum open sessions (0 = unlimited)
    pub max_open: usize,
    /// Maximum session lifetime (None = forever)
    pub max_lifetime: Option<Duration>,
    /// Maximum time a session may sit idle (None = forever)
    pub max_idle_time: Option<Duration>,
    /// Maximum time to wait for a session when `max_open` is reached
    pub acquire_timeout: Duration,
    /// Whether to validate idle sessions before handing them out
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_idle: 2,
            max_open: 0,
            max_lifetime: None,
            max_idle_time: None,
            acquire_timeout: Duration::from_secs(30),
            test_on_borrow: false,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set maximum idle sessions
    pub fn with_max_idle(mut self, n: usize) -> Self {
        self.max_idle = n;
        self
    }

    /// Set maximum open sessions
    pub fn with_max_open(mut self, n: usize) -> Self {
        self.max_open = n;
        self
    }

    /// Set maximum session lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Set maximum idle time
    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = Some(idle);
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions currently open (idle + in use)
    pub open: usize,
    /// Sessions currently idle
    pub idle: usize,
    /// Total number of sessions created
    pub connections_created: u64,
    /// Total number of sessions closed
    pub connections_closed: u64,
    /// Total number of session acquisitions
    pub acquisitions: u64,
    /// Number of times an acquire timed out at `max_open`
    pub exhausted_count: u64,
    /// Total wait time for sessions (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of failed validations
    pub health_check_failures: u64,
}

impl PoolStats {
    /// Sessions currently handed out
    pub fn in_use(&self) -> usize {
        self.open.saturating_sub(self.idle)
    }
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` session closes
    pub fn record_closed(&self, n: u64) {
        self.connections_closed.fetch_add(n, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }

    fn snapshot(&self, open: usize, idle: usize) -> PoolStats {
        PoolStats {
            open,
            idle,
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PoolLimits {
    max_idle: usize,
    max_open: usize,
    max_lifetime: Option<Duration>,
    max_idle_time: Option<Duration>,
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    returned_at: Instant,
}

impl PoolEntry {
    fn new(conn: Box<dyn Connection>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            returned_at: now,
        }
    }

    fn is_expired(&self, limits: &PoolLimits) -> bool {
        limits
            .max_lifetime
            .is_some_and(|max| self.created_at.elapsed() > max)
            || limits
                .max_idle_time
                .is_some_and(|max| self.returned_at.elapsed() > max)
    }
}

struct PoolState {
    /// Idle sessions, most recently returned last
    idle: Vec<PoolEntry>,
    /// Idle plus checked-out sessions, including dials in flight
    open: usize,
    limits: PoolLimits,
}

impl PoolState {
    /// Remove expired idle sessions and any beyond `max_idle`
    fn prune(&mut self) -> Vec<PoolEntry> {
        let limits = self.limits;
        let (expired, mut kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.idle)
            .into_iter()
            .partition(|e| e.is_expired(&limits));
        let mut removed = expired;
        if kept.len() > limits.max_idle {
            let excess = kept.len() - limits.max_idle;
            removed.extend(kept.drain(..excess));
        }
        self.idle = kept;
        self.open -= removed.len();
        removed
    }
}

enum Acquire {
    Reuse(PoolEntry),
    Dial,
    Wait,
}

/// A [`Database`] backed by a pool of sessions from a [`ConnectionFactory`]
pub struct PooledDatabase {
    connection: ConnectionConfig,
    acquire_timeout: Duration,
    test_on_borrow: bool,
    driver: Arc<PoolDriver>,
    state: Mutex<PoolState>,
    released: Notify,
    stats: AtomicPoolStats,
    closed: AtomicBool,
    self_ref: Weak<Self>,
}

impl PooledDatabase {
    /// Create a pool; no session is dialed until first use.
    pub fn new(config: PoolConfig, driver: PoolDriver) -> Arc<Self> {
        let limits = PoolLimits {
            max_idle: clamp_idle(config.max_idle, config.max_open),
            max_open: config.max_open,
            max_lifetime: config.max_lifetime,
            max_idle_time: config.max_idle_time,
        };
        Arc::new_cyclic(|self_ref| Self {
            connection: config.connection,
            acquire_timeout: config.acquire_timeout,
            test_on_borrow: config.test_on_borrow,
            driver: Arc::new(driver),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                limits,
            }),
            released: Notify::new(),
            stats: AtomicPoolStats::new(),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Connection string this pool dials, with the password redacted
    pub fn redacted_url(&self) -> String {
        redact_url(&self.connection.url)
    }

    fn self_arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| Error::internal("pool has been dropped"))
    }

    /// Check out a session, dialing a new one if none is idle.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.acquire_timeout;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let notified = self.released.notified();
            let (action, discarded) = {
                let mut state = self.state.lock();
                let discarded = state.prune();
                let action = match state.idle.pop() {
                    Some(entry) => Acquire::Reuse(entry),
                    None if state.limits.max_open == 0 || state.open < state.limits.max_open => {
                        state.open += 1;
                        Acquire::Dial
                    }
                    None => Acquire::Wait,
                };
                (action, discarded)
            };
            self.close_detached(discarded);

            match action {
                Acquire::Reuse(entry) => {
                    // Checked out before validating so a dropped caller returns it
                    let conn = PooledConnection::new(entry, self.self_arc()?);
                    if self.test_on_borrow && !conn.is_valid().await {
                        self.stats.record_health_check_failure();
                        conn.discard();
                        continue;
                    }
                    self.stats
                        .record_acquisition(start.elapsed().as_millis() as u64);
                    return Ok(conn);
                }
                Acquire::Dial => {
                    let slot = DialSlot::new(self);
                    let conn = self.factory().connect(&self.connection).await?;
                    let pool = self.self_arc()?;
                    slot.commit();
                    self.stats.record_created();
                    self.stats
                        .record_acquisition(start.elapsed().as_millis() as u64);
                    debug!(url = %self.redacted_url(), "Dialed new session");
                    return Ok(PooledConnection::new(PoolEntry::new(conn), pool));
                }
                Acquire::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.stats.record_exhausted();
                        return Err(Error::pool_exhausted(format!(
                            "timeout waiting for session ({}ms)",
                            self.acquire_timeout.as_millis()
                        )));
                    }
                }
            }
        }
    }

    fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.driver.factory
    }

    /// Put a session back, or close it if the pool does not want it.
    fn release(&self, mut entry: PoolEntry) {
        entry.returned_at = Instant::now();
        let surplus = {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::Acquire)
                || state.idle.len() >= state.limits.max_idle
                || entry.is_expired(&state.limits)
            {
                state.open -= 1;
                Some(entry)
            } else {
                state.idle.push(entry);
                None
            }
        };
        self.released.notify_one();
        if let Some(entry) = surplus {
            self.close_detached(vec![entry]);
        }
    }

    /// Drop a session that must not be reused.
    fn forget(&self, entry: PoolEntry) {
        self.state.lock().open -= 1;
        self.released.notify_one();
        self.close_detached(vec![entry]);
    }

    fn close_detached(&self, entries: Vec<PoolEntry>) {
        if entries.is_empty() {
            return;
        }
        self.stats.record_closed(entries.len() as u64);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for entry in entries {
                    if let Err(e) = entry.conn.close().await {
                        debug!(error = %e, "Failed to close discarded session");
                    }
                }
            });
        }
    }

    fn update_limits(&self, update: impl FnOnce(&mut PoolLimits)) {
        let discarded = {
            let mut state = self.state.lock();
            update(&mut state.limits);
            state.limits.max_idle = clamp_idle(state.limits.max_idle, state.limits.max_open);
            state.prune()
        };
        self.close_detached(discarded);
        // Raised limits may unblock waiters
        self.released.notify_waiters();
    }
}

/// An `open` slot reserved for a dial in flight.
///
/// Dropping it without [`commit`](Self::commit) hands the slot back, whether
/// the dial failed or the acquiring future was dropped mid-dial.
struct DialSlot<'a> {
    pool: &'a PooledDatabase,
    committed: bool,
}

impl<'a> DialSlot<'a> {
    fn new(pool: &'a PooledDatabase) -> Self {
        Self {
            pool,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.state.lock().open -= 1;
            self.pool.released.notify_one();
        }
    }
}

fn clamp_idle(max_idle: usize, max_open: usize) -> usize {
    if max_open > 0 {
        max_idle.min(max_open)
    } else {
        max_idle
    }
}

fn discard_if_broken<T>(conn: PooledConnection, result: Result<T>) -> Result<T> {
    match &result {
        Err(e) if e.category() == ErrorCategory::Connection => conn.discard(),
        _ => drop(conn),
    }
    result
}

#[async_trait]
impl Database for PooledDatabase {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let conn = self.acquire().await?;
        let result = conn.query(sql, params).await;
        discard_if_broken(conn, result)
    }

    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let conn = self.acquire().await?;
        let result = conn.query_one(sql, params).await;
        discard_if_broken(conn, result)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let conn = self.acquire().await?;
        let result = conn.execute(sql, params).await;
        discard_if_broken(conn, result)
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        let conn = self.acquire().await?;
        let inner = match conn.prepare(sql).await {
            Ok(inner) => inner,
            Err(e) => return discard_if_broken(conn, Err(e)),
        };
        Ok(Box::new(PooledStatement {
            inner,
            conn: Mutex::new(Some(conn)),
        }))
    }

    async fn begin(&self, options: TransactionOptions) -> Result<Box<dyn Transaction>> {
        let conn = self.acquire().await?;
        let inner = match conn.begin(options).await {
            Ok(inner) => inner,
            Err(e) => return discard_if_broken(conn, Err(e)),
        };
        Ok(Box::new(PooledTransaction { inner, conn }))
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.acquire().await?;
        let result = conn.ping().await;
        if result.is_err() {
            self.stats.record_health_check_failure();
            conn.discard();
        }
        result
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let idle = {
            let mut state = self.state.lock();
            let idle = std::mem::take(&mut state.idle);
            state.open -= idle.len();
            idle
        };
        self.released.notify_waiters();
        self.stats.record_closed(idle.len() as u64);

        let mut first_error = None;
        for entry in idle {
            if let Err(e) = entry.conn.close().await {
                warn!(url = %self.redacted_url(), error = %e, "Failed to close idle session");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn set_max_idle_conns(&self, n: usize) {
        self.update_limits(|limits| limits.max_idle = n);
    }

    fn set_max_open_conns(&self, n: usize) {
        self.update_limits(|limits| limits.max_open = n);
    }

    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.update_limits(|limits| limits.max_lifetime = lifetime);
    }

    fn set_conn_max_idle_time(&self, idle: Option<Duration>) {
        self.update_limits(|limits| limits.max_idle_time = idle);
    }

    fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        self.stats.snapshot(state.open, state.idle.len())
    }
}

/// A session checked out of a [`PooledDatabase`]
///
/// Returned to the pool when dropped.
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    pool: Arc<PooledDatabase>,
}

impl PooledConnection {
    fn new(entry: PoolEntry, pool: Arc<PooledDatabase>) -> Self {
        Self {
            entry: Some(entry),
            pool,
        }
    }

    /// Close the session instead of returning it to the pool
    pub fn discard(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.forget(entry);
        }
    }

    /// How long ago the session was dialed
    pub fn age(&self) -> Duration {
        self.entry
            .as_ref()
            .map(|e| e.created_at.elapsed())
            .unwrap_or_default()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.entry
            .as_ref()
            .expect("connection already returned")
            .conn
            .as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry);
        }
    }
}

/// Prepared statement pinned to one pooled session
struct PooledStatement {
    inner: Box<dyn PreparedStatement>,
    conn: Mutex<Option<PooledConnection>>,
}

#[async_trait]
impl PreparedStatement for PooledStatement {
    async fn execute(&self, params: &[Value]) -> Result<ExecResult> {
        self.inner.execute(params).await
    }

    async fn query(&self, params: &[Value]) -> Result<Vec<Row>> {
        self.inner.query(params).await
    }

    async fn query_one(&self, params: &[Value]) -> Result<Option<Row>> {
        self.inner.query_one(params).await
    }

    fn sql(&self) -> &str {
        self.inner.sql()
    }

    async fn close(&self) -> Result<()> {
        let result = self.inner.close().await;
        // Hand the session back whatever the outcome
        drop(self.conn.lock().take());
        result
    }
}

/// Transaction pinned to one pooled session
struct PooledTransaction {
    inner: Box<dyn Transaction>,
    conn: PooledConnection,
}

#[async_trait]
impl Transaction for PooledTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.inner.execute(sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { inner, conn } = *self;
        let result = inner.commit().await;
        discard_if_broken(conn, result)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { inner, conn } = *self;
        let result = inner.rollback().await;
        discard_if_broken(conn, result)
    }
}

/// A [`Driver`] that opens [`PooledDatabase`] handles over a [`ConnectionFactory`]
#[derive(Clone)]
pub struct PoolDriver {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    template: PoolConfig,
}

impl PoolDriver {
    /// Create a driver with default pool settings
    pub fn new(name: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            template: PoolConfig::default(),
        }
    }

    /// Pool settings applied to every handle this driver opens
    ///
    /// The template's URL is ignored; each handle uses its own DSN.
    pub fn with_config(mut self, template: PoolConfig) -> Self {
        self.template = template;
        self
    }

    /// Open a concrete pool (the [`Driver::open`] form erases the type)
    pub fn open_pool(&self, dsn: &str) -> Arc<PooledDatabase> {
        let mut config = self.template.clone();
        config.connection.url = dsn.to_string();
        PooledDatabase::new(config, self.clone())
    }
}

impl std::fmt::Debug for PoolDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDriver")
            .field("name", &self.name)
            .field("template", &self.template)
            .finish()
    }
}

#[async_trait]
impl Driver for PoolDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, dsn: &str) -> Result<Arc<dyn Database>> {
        let pool: Arc<dyn Database> = self.open_pool(dsn);
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new("postgres://localhost/test")
            .with_max_idle(5)
            .with_max_open(20)
            .with_max_lifetime(Duration::from_secs(60))
            .with_acquire_timeout(Duration::from_secs(10))
            .with_test_on_borrow(true);

        assert_eq!(config.max_idle, 5);
        assert_eq!(config.max_open, 20);
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(60)));
        assert_eq!(config.max_idle_time, None);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));
        assert!(config.test_on_borrow);
    }

    #[test]
    fn test_clamp_idle() {
        assert_eq!(clamp_idle(10, 0), 10);
        assert_eq!(clamp_idle(10, 4), 4);
        assert_eq!(clamp_idle(2, 4), 2);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::new();

        stats.record_created();
        stats.record_created();
        stats.record_acquisition(100);
        stats.record_acquisition(200);
        stats.record_closed(1);
        stats.record_exhausted();
        stats.record_health_check_failure();

        let snapshot = stats.snapshot(2, 1);
        assert_eq!(snapshot.open, 2);
        assert_eq!(snapshot.idle, 1);
        assert_eq!(snapshot.in_use(), 1);
        assert_eq!(snapshot.connections_created, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.acquisitions, 2);
        assert_eq!(snapshot.total_wait_time_ms, 300);
        assert_eq!(snapshot.exhausted_count, 1);
        assert_eq!(snapshot.health_check_failures, 1);

        assert!((stats.avg_wait_time_ms() - 150.0).abs() < 0.01);
    }
}
