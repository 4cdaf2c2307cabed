//! Client-facing read/write router
//!
//! Writes and transactions go to the primary. Reads go to the next replica
//! in rotation, or to the primary when there are no replicas. Prepared
//! statements are routed the same way by [`RoutedStatement`].
//!
//! # Example
//!
//! ```rust,ignore
//! use rdbc_router::prelude::*;
//!
//! let router = Router::open("postgres", "postgres://rw/app;postgres://ro1/app;postgres://ro2/app").await?;
//! router.exec("INSERT INTO events (kind) VALUES ($1)", &["signup".into()]).await?;
//! let rows = router.query("SELECT kind FROM events", &[]).await?;
//!
//! let stmt = router.prepare("SELECT * FROM users WHERE id = $1").await?;
//! let user = stmt.query_row(&[Value::Int64(42)]).await?;
//! stmt.close().await?;
//! router.close().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::config::RouterConfig;
use crate::connection::{Transaction, TransactionOptions};
use crate::context::Context;
use crate::database::{Database, Driver};
use crate::error::Result;
use crate::pool::PoolStats;
use crate::routing::ReadWriteSplit;
use crate::set::ConnectionSet;
use crate::statement::RoutedStatement;
use crate::types::{ExecResult, Row, Value};

/// Logical database over one primary and its replicas
///
/// Cloning is cheap; clones share handles and the replica rotation.
#[derive(Clone, Debug)]
pub struct Router {
    set: Arc<ConnectionSet>,
}

impl Router {
    /// Route over already-open handles
    pub fn new(primary: Arc<dyn Database>, replicas: Vec<Arc<dyn Database>>) -> Self {
        Self::from_set(ConnectionSet::new(primary, replicas))
    }

    /// Route over already-open handles; the first one is the primary.
    ///
    /// Fails with [`Error::Construction`](crate::Error::Construction) when
    /// `handles` is empty.
    pub fn from_handles(handles: Vec<Arc<dyn Database>>) -> Result<Self> {
        ConnectionSet::from_handles(handles).map(Self::from_set)
    }

    /// Route over an existing connection set
    pub fn from_set(set: ConnectionSet) -> Self {
        Self { set: Arc::new(set) }
    }

    /// Open a `;`-delimited connection spec through a registered driver
    pub async fn open(driver_name: &str, spec: &str) -> Result<Self> {
        ConnectionSet::open(driver_name, spec)
            .await
            .map(Self::from_set)
    }

    /// Open a `;`-delimited connection spec through `driver`
    pub async fn open_with_driver(driver: Arc<dyn Driver>, spec: &str) -> Result<Self> {
        ConnectionSet::open_with_driver(driver, spec)
            .await
            .map(Self::from_set)
    }

    /// Open the targets of `config` and apply its pool settings
    pub async fn from_config(config: &RouterConfig) -> Result<Self> {
        config.validate()?;
        let driver = crate::database::lookup_driver(&config.driver)?;
        let set = ConnectionSet::open_targets(driver, &config.targets()).await?;
        config.pool.apply(&set);
        Ok(Self::from_set(set))
    }

    /// Underlying connection set
    pub fn connection_set(&self) -> &ConnectionSet {
        &self.set
    }

    /// Handle for writes: always the primary
    pub fn read_write(&self) -> &dyn Database {
        self.set.read_write()
    }

    /// Handle for reads: the next replica, or the primary without replicas
    pub fn read_only(&self) -> &dyn Database {
        self.set.read_only()
    }

    /// Number of replicas
    pub fn replica_count(&self) -> usize {
        self.set.replica_count()
    }

    /// Execute a statement on the primary
    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.set.ensure_open()?;
        self.read_write().execute(sql, params).await
    }

    /// Execute a statement on the primary, bounded by `ctx`
    pub async fn exec_with_context(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<ExecResult> {
        self.set.ensure_open()?;
        ctx.run(self.read_write().execute(sql, params)).await
    }

    /// Run a query on the next replica
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.set.ensure_open()?;
        self.read_only().query(sql, params).await
    }

    /// Run a query on the next replica, bounded by `ctx`
    pub async fn query_with_context(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        self.set.ensure_open()?;
        ctx.run(self.read_only().query(sql, params)).await
    }

    /// First row of a query on the next replica
    pub async fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        self.set.ensure_open()?;
        self.read_only().query_one(sql, params).await
    }

    /// First row of a query on the next replica, bounded by `ctx`
    pub async fn query_row_with_context(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Row>> {
        self.set.ensure_open()?;
        ctx.run(self.read_only().query_one(sql, params)).await
    }

    /// Begin a transaction on the primary with driver defaults
    pub async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.set.ensure_open()?;
        self.read_write().begin(TransactionOptions::default()).await
    }

    /// Begin a transaction on the primary.
    ///
    /// `ctx` bounds starting the transaction; once started, its lifetime is
    /// governed by commit or rollback.
    pub async fn begin_with_options(
        &self,
        ctx: &Context,
        options: TransactionOptions,
    ) -> Result<Box<dyn Transaction>> {
        self.set.ensure_open()?;
        ctx.run(self.read_write().begin(options)).await
    }

    /// Prepare a statement on the primary and every replica
    pub async fn prepare(&self, sql: &str) -> Result<RoutedStatement> {
        RoutedStatement::prepare(&self.set, sql).await
    }

    /// Prepare a statement on every target, bounded by `ctx`.
    ///
    /// `ctx` bounds preparation only, not later executions.
    pub async fn prepare_with_context(&self, ctx: &Context, sql: &str) -> Result<RoutedStatement> {
        RoutedStatement::prepare_with_context(&self.set, ctx, sql).await
    }

    /// Verify every handle
    pub async fn ping(&self) -> Result<()> {
        self.set.ping().await
    }

    /// Verify every handle, bounded by `ctx`
    pub async fn ping_with_context(&self, ctx: &Context) -> Result<()> {
        self.set.ping_with_context(ctx).await
    }

    /// Close every handle; terminal for this router and all its clones
    pub async fn close(&self) -> Result<()> {
        self.set.close().await
    }

    /// Driver of the primary handle
    pub fn driver(&self) -> Arc<dyn Driver> {
        self.set.driver()
    }

    /// Maximum idle sessions per handle
    pub fn set_max_idle_conns(&self, n: usize) {
        self.set.set_max_idle_conns(n);
    }

    /// Maximum open sessions per handle (0 = unlimited)
    pub fn set_max_open_conns(&self, n: usize) {
        self.set.set_max_open_conns(n);
    }

    /// Maximum session lifetime per handle (None = forever)
    pub fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.set.set_conn_max_lifetime(lifetime);
    }

    /// Maximum session idle time per handle (None = forever)
    pub fn set_conn_max_idle_time(&self, idle: Option<Duration>) {
        self.set.set_conn_max_idle_time(idle);
    }

    /// Pool statistics per handle, primary first
    pub fn stats(&self) -> Vec<PoolStats> {
        self.set.stats()
    }
}
