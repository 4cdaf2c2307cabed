//! Primary and replica handles managed as one unit
//!
//! Lifecycle calls that talk to the network (open, close, ping) fan out to
//! every target concurrently. Pool configuration is applied sequentially,
//! primary first, because the handles apply it locally without I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::parse_connection_spec;
use crate::connection::redact_url;
use crate::context::Context;
use crate::database::{lookup_driver, Database, Driver};
use crate::error::{Error, Result};
use crate::fanout::{fan_out, fan_out_collect, partition};
use crate::pool::PoolStats;
use crate::routing::{ReadWriteSplit, Replicated, RoundRobin};

/// One primary and zero or more replica handles
pub struct ConnectionSet {
    targets: Replicated<Arc<dyn Database>>,
    selector: Arc<RoundRobin>,
    closed: AtomicBool,
}

impl ConnectionSet {
    /// Group already-open handles
    pub fn new(primary: Arc<dyn Database>, replicas: Vec<Arc<dyn Database>>) -> Self {
        Self {
            targets: Replicated::new(primary, replicas),
            selector: Arc::new(RoundRobin::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Group already-open handles; the first one is the primary.
    ///
    /// Fails with [`Error::Construction`] when `handles` is empty.
    pub fn from_handles(handles: Vec<Arc<dyn Database>>) -> Result<Self> {
        let targets = Replicated::from_vec(handles)
            .ok_or_else(|| Error::construction("at least one read-write handle is required"))?;
        Ok(Self {
            targets,
            selector: Arc::new(RoundRobin::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Open every target of a `;`-delimited connection spec through a
    /// registered driver.
    ///
    /// An unknown driver fails with [`Error::Connection`] carrying the
    /// registry's error as its source.
    pub async fn open(driver_name: &str, spec: &str) -> Result<Self> {
        let driver = lookup_driver(driver_name).map_err(|e| {
            Error::connection_with_source(format!("cannot open with driver '{}'", driver_name), e)
        })?;
        Self::open_with_driver(driver, spec).await
    }

    /// Open every target of a `;`-delimited connection spec.
    pub async fn open_with_driver(driver: Arc<dyn Driver>, spec: &str) -> Result<Self> {
        let dsns = parse_connection_spec(spec)?;
        Self::open_targets(driver, &dsns).await
    }

    /// Open one handle per connection string concurrently; the first is the
    /// primary.
    ///
    /// If any target fails, the handles that did open are closed again and
    /// an [`Error::Connection`] carrying the per-target failures is returned.
    pub async fn open_targets(driver: Arc<dyn Driver>, dsns: &[String]) -> Result<Self> {
        if dsns.is_empty() {
            return Err(Error::construction("no connection strings supplied"));
        }
        info!(
            driver = %driver.name(),
            primary = %redact_url(&dsns[0]),
            replicas = dsns.len() - 1,
            "Opening connection set"
        );

        let results = fan_out_collect(dsns.len(), |i| {
            let driver = driver.clone();
            let dsn = dsns[i].clone();
            async move { driver.open(&dsn).await }
        })
        .await;

        let (opened, failed) = partition(results);
        if failed.is_empty() {
            return Self::from_handles(opened.into_iter().map(|(_, db)| db).collect());
        }

        for failure in &failed {
            warn!(
                target_index = failure.index,
                dsn = %redact_url(&dsns[failure.index]),
                error = %failure.error,
                "Failed to open target"
            );
        }
        rollback(opened.into_iter().map(|(_, db)| db).collect()).await;

        let message = format!("failed to open {} of {} targets", failed.len(), dsns.len());
        Err(match Error::aggregate(failed) {
            Some(source) => Error::Connection {
                message,
                source: Some(Box::new(source)),
            },
            None => Error::connection(message),
        })
    }

    /// Fail with [`Error::Closed`] once the set has been closed
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Handle by fan-out index (0 is the primary)
    pub fn target(&self, index: usize) -> Result<Arc<dyn Database>> {
        self.targets
            .get(index)
            .cloned()
            .ok_or_else(|| Error::internal(format!("no target at index {}", index)))
    }

    /// Primary and replica handles
    pub fn targets(&self) -> &Replicated<Arc<dyn Database>> {
        &self.targets
    }

    /// Selector shared with every statement prepared from this set
    pub fn selector(&self) -> &Arc<RoundRobin> {
        &self.selector
    }

    /// Number of handles, primary included
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Always false; a primary is always present
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Number of replica handles
    pub fn replica_count(&self) -> usize {
        self.targets.replica_count()
    }

    /// Close every handle concurrently.
    ///
    /// Close is terminal: the set rejects every later call, including a
    /// second close, with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        info!(targets = self.len(), "Closing connection set");

        let result = fan_out(self.len(), |i| {
            let target = self.target(i);
            async move { target?.close().await }
        })
        .await;
        if let Err(e) = &result {
            warn!(error = %e, "Connection set closed with errors");
        }
        result
    }

    /// Verify every handle concurrently
    pub async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        let result = fan_out(self.len(), |i| {
            let target = self.target(i);
            async move { target?.ping().await }
        })
        .await;
        if let Err(e) = &result {
            warn!(error = %e, "Ping failed");
        }
        result
    }

    /// Verify every handle concurrently, bounded by `ctx`
    pub async fn ping_with_context(&self, ctx: &Context) -> Result<()> {
        ctx.run(self.ping()).await
    }

    /// Maximum idle sessions per handle
    pub fn set_max_idle_conns(&self, n: usize) {
        if self.skip_when_closed() {
            return;
        }
        debug!(max_idle = n, "Applying max idle sessions");
        self.targets.for_each(|db| db.set_max_idle_conns(n));
    }

    /// Maximum open sessions per handle (0 = unlimited)
    pub fn set_max_open_conns(&self, n: usize) {
        if self.skip_when_closed() {
            return;
        }
        debug!(max_open = n, "Applying max open sessions");
        self.targets.for_each(|db| db.set_max_open_conns(n));
    }

    /// Maximum session lifetime per handle (None = forever)
    pub fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        if self.skip_when_closed() {
            return;
        }
        debug!(?lifetime, "Applying max session lifetime");
        self.targets.for_each(|db| db.set_conn_max_lifetime(lifetime));
    }

    /// Maximum session idle time per handle (None = forever)
    pub fn set_conn_max_idle_time(&self, idle: Option<Duration>) {
        if self.skip_when_closed() {
            return;
        }
        debug!(?idle, "Applying max session idle time");
        self.targets.for_each(|db| db.set_conn_max_idle_time(idle));
    }

    /// Pool settings are ignored once the set is closed
    fn skip_when_closed(&self) -> bool {
        let closed = self.is_closed();
        if closed {
            debug!("Ignoring pool setting on closed connection set");
        }
        closed
    }

    /// Driver of the primary handle.
    ///
    /// Still answers after [`close`](Self::close); it does no I/O.
    pub fn driver(&self) -> Arc<dyn Driver> {
        self.targets.read_write().driver()
    }

    /// Pool statistics per handle, primary first.
    ///
    /// Still answers after [`close`](Self::close), reporting the final counters.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.targets.iter().map(|db| db.stats()).collect()
    }
}

impl ReadWriteSplit for ConnectionSet {
    type Target = dyn Database;

    fn read_write(&self) -> &Self::Target {
        self.targets.read_write().as_ref()
    }

    fn read_only(&self) -> &Self::Target {
        self.targets.read_only(&self.selector).as_ref()
    }
}

impl std::fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("replicas", &self.replica_count())
            .field("selections", &self.selector.position())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Close handles left behind by a failed open
async fn rollback(handles: Vec<Arc<dyn Database>>) {
    if handles.is_empty() {
        return;
    }
    debug!(handles = handles.len(), "Rolling back partially opened set");
    let handles = &handles;
    if let Err(e) = fan_out(handles.len(), move |i| handles[i].close()).await {
        warn!(error = %e, "Rollback of partially opened set failed");
    }
}
