//! Prepared statements routed like the connection set they came from
//!
//! A [`RoutedStatement`] holds one prepared handle per target. Executions go
//! to the primary's handle; queries rotate over the replicas' handles using
//! the set's own [`RoundRobin`], so statement reads and plain reads advance
//! one shared sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::PreparedStatement;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::fanout::{fan_out, fan_out_collect, partition};
use crate::routing::{ReadWriteSplit, Replicated, RoundRobin};
use crate::set::ConnectionSet;
use crate::types::{ExecResult, Row, Value};

/// A statement prepared on the primary and on every replica
pub struct RoutedStatement {
    sql: String,
    handles: Replicated<Box<dyn PreparedStatement>>,
    selector: Arc<RoundRobin>,
    closed: AtomicBool,
}

impl RoutedStatement {
    /// Prepare `sql` on every target of `set` concurrently.
    ///
    /// If any target fails, the handles that were prepared are closed again
    /// and an [`Error::Preparation`] carrying the per-target failures is
    /// returned.
    pub async fn prepare(set: &ConnectionSet, sql: &str) -> Result<Self> {
        Self::prepare_with_context(set, &Context::background(), sql).await
    }

    /// Prepare `sql` on every target of `set`, each bounded by `ctx`.
    ///
    /// A target that outlives the context counts as a failed target, so
    /// handles already prepared elsewhere are released like any other
    /// partial failure. Later executions are not bounded by `ctx`.
    pub async fn prepare_with_context(
        set: &ConnectionSet,
        ctx: &Context,
        sql: &str,
    ) -> Result<Self> {
        set.ensure_open()?;
        ctx.check()?;

        let results = fan_out_collect(set.len(), |i| {
            let target = set.target(i);
            let sql = sql.to_string();
            async move { ctx.run(async { target?.prepare(&sql).await }).await }
        })
        .await;

        let (prepared, failed) = partition(results);
        if failed.is_empty() {
            let handles = Replicated::from_vec(prepared.into_iter().map(|(_, s)| s).collect())
                .ok_or_else(|| Error::internal("connection set has no primary"))?;
            debug!(sql = %sql, targets = handles.len(), "Prepared routed statement");
            return Ok(Self {
                sql: sql.to_string(),
                handles,
                selector: set.selector().clone(),
                closed: AtomicBool::new(false),
            });
        }

        for failure in &failed {
            warn!(target_index = failure.index, error = %failure.error, sql = %sql, "Failed to prepare statement");
        }
        let prepared: Vec<_> = prepared.into_iter().map(|(_, s)| s).collect();
        let prepared = &prepared;
        if let Err(e) = fan_out(prepared.len(), move |i| prepared[i].close()).await {
            warn!(error = %e, "Failed to release partially prepared statement");
        }

        let message = format!(
            "failed to prepare on {} of {} targets",
            failed.len(),
            set.len()
        );
        Err(match Error::aggregate(failed) {
            Some(source) => Error::Preparation {
                message,
                sql: Some(sql.to_string()),
                source: Some(Box::new(source)),
            },
            None => Error::preparation(message, sql),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::StatementClosed)
        } else {
            Ok(())
        }
    }

    /// SQL the statement was prepared from
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of replica handles
    pub fn replica_count(&self) -> usize {
        self.handles.replica_count()
    }

    /// Execute on the primary
    pub async fn exec(&self, params: &[Value]) -> Result<ExecResult> {
        self.ensure_open()?;
        self.read_write().execute(params).await
    }

    /// Execute on the primary, bounded by `ctx`
    pub async fn exec_with_context(&self, ctx: &Context, params: &[Value]) -> Result<ExecResult> {
        self.ensure_open()?;
        ctx.run(self.read_write().execute(params)).await
    }

    /// Query the next replica in rotation
    pub async fn query(&self, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.read_only().query(params).await
    }

    /// Query the next replica in rotation, bounded by `ctx`
    pub async fn query_with_context(&self, ctx: &Context, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        ctx.run(self.read_only().query(params)).await
    }

    /// First row from the next replica in rotation
    pub async fn query_row(&self, params: &[Value]) -> Result<Option<Row>> {
        self.ensure_open()?;
        self.read_only().query_one(params).await
    }

    /// First row from the next replica in rotation, bounded by `ctx`
    pub async fn query_row_with_context(
        &self,
        ctx: &Context,
        params: &[Value],
    ) -> Result<Option<Row>> {
        self.ensure_open()?;
        ctx.run(self.read_only().query_one(params)).await
    }

    /// Release every prepared handle concurrently.
    ///
    /// Every handle is closed even if some fail. Later calls, including a
    /// second close, fail with [`Error::StatementClosed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::StatementClosed);
        }

        let handles = &self.handles;
        let result = fan_out(handles.len(), move |i| async move {
            match handles.get(i) {
                Some(stmt) => stmt.close().await,
                None => Err(Error::internal(format!("no statement at index {}", i))),
            }
        })
        .await;
        if let Err(e) = &result {
            warn!(sql = %self.sql, error = %e, "Closed routed statement with errors");
        }
        result
    }
}

impl ReadWriteSplit for RoutedStatement {
    type Target = dyn PreparedStatement;

    fn read_write(&self) -> &Self::Target {
        self.handles.read_write().as_ref()
    }

    fn read_only(&self) -> &Self::Target {
        self.handles.read_only(&self.selector).as_ref()
    }
}

impl std::fmt::Debug for RoutedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedStatement")
            .field("sql", &self.sql)
            .field("replicas", &self.replica_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
