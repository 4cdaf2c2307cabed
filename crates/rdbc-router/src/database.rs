//! Database handles and drivers
//!
//! A [`Database`] is a logical handle to one physical database: it owns its
//! own pool of sessions and exposes the usual client surface. The router
//! holds one handle per target and never looks inside it.
//!
//! A [`Driver`] turns a connection string into a handle. Drivers are
//! registered by name so that a router can be opened from a driver name and
//! a `;`-delimited connection spec.
//!
//! # Example
//!
//! ```rust,ignore
//! use rdbc_router::prelude::*;
//!
//! register_driver("postgres", Arc::new(PoolDriver::new("postgres", Arc::new(PgFactory))));
//! let router = Router::open("postgres", "postgres://primary/app;postgres://replica/app").await?;
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::{PreparedStatement, Transaction, TransactionOptions};
use crate::error::{Error, Result};
use crate::pool::PoolStats;
use crate::types::{ExecResult, Row, Value};

/// A pooled handle to one physical database
#[async_trait]
pub trait Database: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a query and return the first row
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Execute a statement that modifies data
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult>;

    /// Prepare a statement for repeated execution
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>>;

    /// Begin a transaction
    async fn begin(&self, options: TransactionOptions) -> Result<Box<dyn Transaction>>;

    /// Verify the database is reachable, dialing if needed
    async fn ping(&self) -> Result<()>;

    /// Close the handle and every session it owns
    async fn close(&self) -> Result<()>;

    /// Maximum number of idle sessions kept (0 keeps none)
    fn set_max_idle_conns(&self, n: usize);

    /// Maximum number of open sessions (0 means unlimited)
    fn set_max_open_conns(&self, n: usize);

    /// Maximum age of a session before it is recycled (None means forever)
    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>);

    /// Maximum idle time of a session before it is recycled (None means forever)
    fn set_conn_max_idle_time(&self, idle: Option<Duration>);

    /// Driver that opened this handle
    fn driver(&self) -> Arc<dyn Driver>;

    /// Pool statistics
    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }
}

/// Opens database handles from connection strings
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registered name of the driver
    fn name(&self) -> &str;

    /// Open a handle for one connection string
    async fn open(&self, dsn: &str) -> Result<Arc<dyn Database>>;
}

type Registry = RwLock<HashMap<String, Arc<dyn Driver>>>;

fn registry() -> &'static Registry {
    static DRIVERS: OnceLock<Registry> = OnceLock::new();
    DRIVERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a driver under a name, replacing any previous registration
pub fn register_driver(name: impl Into<String>, driver: Arc<dyn Driver>) {
    let name = name.into();
    let previous = registry().write().insert(name.clone(), driver);
    if previous.is_some() {
        warn!(driver = %name, "Replaced previously registered driver");
    } else {
        debug!(driver = %name, "Registered driver");
    }
}

/// Remove a registered driver
pub fn deregister_driver(name: &str) -> Option<Arc<dyn Driver>> {
    registry().write().remove(name)
}

/// Look up a registered driver
pub fn lookup_driver(name: &str) -> Result<Arc<dyn Driver>> {
    registry()
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::config(format!("unknown driver '{}' (forgotten register?)", name)))
}

/// Names of all registered drivers, sorted
pub fn registered_drivers() -> Vec<String> {
    let mut names: Vec<_> = registry().read().keys().cloned().collect();
    names.sort();
    names
}
