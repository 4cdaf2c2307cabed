//! Instrumented in-memory fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rdbc_router::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rdbc_router=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Ordered record of calls across several fakes
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Name of the target that produced a result set
pub fn served_by(rows: &[Row]) -> String {
    rows.first()
        .and_then(|r| r.get_by_name("target"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn target_row(name: &str) -> Row {
    Row::new(vec!["target".into()], vec![Value::from(name)])
}

// ==================== Database fake ====================

pub struct FakeDatabase {
    pub name: String,
    driver: Arc<dyn Driver>,
    journal: Journal,
    pub close_calls: AtomicUsize,
    pub ping_calls: AtomicUsize,
    pub prepare_calls: AtomicUsize,
    pub fail_close: AtomicBool,
    pub fail_ping: AtomicBool,
    pub fail_prepare: AtomicBool,
    pub fail_stmt_close: AtomicBool,
    pub delay_ms: AtomicU64,
    pub stmt_close_calls: Arc<AtomicUsize>,
    pub max_idle: Mutex<Option<usize>>,
    pub max_open: Mutex<Option<usize>>,
    pub max_lifetime: Mutex<Option<Option<Duration>>>,
    pub max_idle_time: Mutex<Option<Option<Duration>>>,
}

impl FakeDatabase {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_parts(name, Arc::new(FakeDriver::new("fake")), journal())
    }

    pub fn with_parts(name: &str, driver: Arc<dyn Driver>, journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            driver,
            journal,
            close_calls: AtomicUsize::new(0),
            ping_calls: AtomicUsize::new(0),
            prepare_calls: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            fail_prepare: AtomicBool::new(false),
            fail_stmt_close: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            stmt_close_calls: Arc::new(AtomicUsize::new(0)),
            max_idle: Mutex::new(None),
            max_open: Mutex::new(None),
            max_lifetime: Mutex::new(None),
            max_idle_time: Mutex::new(None),
        })
    }

    pub fn closes(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn stmt_closes(&self) -> usize {
        self.stmt_close_calls.load(Ordering::SeqCst)
    }

    fn record(&self, op: impl AsRef<str>) {
        self.journal
            .lock()
            .push(format!("{}:{}", self.name, op.as_ref()));
    }

    async fn delay(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.delay().await;
        self.record(format!("query {}", sql));
        Ok(vec![target_row(&self.name)])
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<ExecResult> {
        self.delay().await;
        self.record(format!("execute {}", sql));
        Ok(ExecResult::new(1))
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::query_with_sql(
                format!("{} rejected statement", self.name),
                sql,
            ));
        }
        Ok(Box::new(FakeStatement {
            target: self.name.clone(),
            sql: sql.to_string(),
            close_calls: self.stmt_close_calls.clone(),
            fail_close: self.fail_stmt_close.load(Ordering::SeqCst),
        }))
    }

    async fn begin(&self, options: TransactionOptions) -> Result<Box<dyn Transaction>> {
        self.delay().await;
        self.record(format!("begin read_only={}", options.read_only));
        Ok(Box::new(FakeTransaction {
            target: self.name.clone(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("{} unreachable", self.name)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("{} close failed", self.name)));
        }
        Ok(())
    }

    fn set_max_idle_conns(&self, n: usize) {
        self.record(format!("max_idle={}", n));
        *self.max_idle.lock() = Some(n);
    }

    fn set_max_open_conns(&self, n: usize) {
        self.record(format!("max_open={}", n));
        *self.max_open.lock() = Some(n);
    }

    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.record(format!("max_lifetime={:?}", lifetime));
        *self.max_lifetime.lock() = Some(lifetime);
    }

    fn set_conn_max_idle_time(&self, idle: Option<Duration>) {
        self.record(format!("max_idle_time={:?}", idle));
        *self.max_idle_time.lock() = Some(idle);
    }

    fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }
}

pub struct FakeStatement {
    target: String,
    sql: String,
    close_calls: Arc<AtomicUsize>,
    fail_close: bool,
}

#[async_trait]
impl PreparedStatement for FakeStatement {
    async fn execute(&self, _params: &[Value]) -> Result<ExecResult> {
        Ok(ExecResult::new(1))
    }

    async fn query(&self, _params: &[Value]) -> Result<Vec<Row>> {
        Ok(vec![target_row(&self.target)])
    }

    fn sql(&self) -> &str {
        &self.sql
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(Error::internal(format!("{} statement close failed", self.target)));
        }
        Ok(())
    }
}

pub struct FakeTransaction {
    pub target: String,
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Ok(vec![target_row(&self.target)])
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<ExecResult> {
        Ok(ExecResult::new(1))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A primary named "primary" and replicas named "replica-0", "replica-1", ...
pub struct Cluster {
    pub primary: Arc<FakeDatabase>,
    pub replicas: Vec<Arc<FakeDatabase>>,
    pub journal: Journal,
}

impl Cluster {
    pub fn new(replicas: usize) -> Self {
        let journal = journal();
        let driver: Arc<dyn Driver> = Arc::new(FakeDriver::new("fake"));
        let primary = FakeDatabase::with_parts("primary", driver.clone(), journal.clone());
        let replicas = (0..replicas)
            .map(|i| {
                FakeDatabase::with_parts(&format!("replica-{}", i), driver.clone(), journal.clone())
            })
            .collect();
        Self {
            primary,
            replicas,
            journal,
        }
    }

    pub fn all(&self) -> Vec<Arc<FakeDatabase>> {
        std::iter::once(self.primary.clone())
            .chain(self.replicas.iter().cloned())
            .collect()
    }

    pub fn handles(&self) -> Vec<Arc<dyn Database>> {
        self.all()
            .into_iter()
            .map(|db| db as Arc<dyn Database>)
            .collect()
    }

    pub fn router(&self) -> Router {
        init_test_logging();
        Router::from_handles(self.handles()).expect("cluster has a primary")
    }

    pub fn journal_entries(&self) -> Vec<String> {
        self.journal.lock().clone()
    }
}

// ==================== Driver fake ====================

/// Opens a [`FakeDatabase`] per DSN; DSNs containing "fail" are refused.
#[derive(Clone)]
pub struct FakeDriver {
    name: String,
    pub opened: Arc<Mutex<Vec<Arc<FakeDatabase>>>>,
    journal: Journal,
}

impl FakeDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            opened: Arc::new(Mutex::new(Vec::new())),
            journal: journal(),
        }
    }

    pub fn opened(&self) -> Vec<Arc<FakeDatabase>> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, dsn: &str) -> Result<Arc<dyn Database>> {
        if dsn.contains("fail") {
            return Err(Error::connection(format!("cannot reach {}", dsn)));
        }
        let db = FakeDatabase::with_parts(dsn, Arc::new(self.clone()), self.journal.clone());
        self.opened.lock().push(db.clone());
        Ok(db)
    }
}

// ==================== Connection factory fake ====================

/// Dials [`FakeConnection`]s with sequential ids, starting at 1.
#[derive(Default)]
pub struct FakeFactory {
    pub dialed: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub fail_connect: AtomicBool,
    pub connect_delay_ms: AtomicU64,
    pub healthy: Arc<AtomicBool>,
    pub urls: Mutex<Vec<String>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        init_test_logging();
        let factory = Self::default();
        factory.healthy.store(true, Ordering::SeqCst);
        Arc::new(factory)
    }

    pub fn dials(&self) -> usize {
        self.dialed.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection("connection refused"));
        }
        let id = self.dialed.fetch_add(1, Ordering::SeqCst) + 1;
        self.urls.lock().push(config.url.clone());
        Ok(Box::new(FakeConnection {
            id,
            closed: self.closed.clone(),
            healthy: self.healthy.clone(),
        }))
    }
}

pub struct FakeConnection {
    id: usize,
    closed: Arc<AtomicUsize>,
    healthy: Arc<AtomicBool>,
}

fn conn_row(id: usize) -> Row {
    Row::new(vec!["conn".into()], vec![Value::Int64(id as i64)])
}

/// Id of the session that produced a result set
pub fn conn_id(rows: &[Row]) -> i64 {
    rows.first()
        .and_then(|r| r.get_by_name("conn"))
        .and_then(|v| v.as_i64())
        .unwrap_or(-1)
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        if sql.contains("BREAK") {
            return Err(Error::connection("socket reset"));
        }
        Ok(vec![conn_row(self.id)])
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<ExecResult> {
        Ok(ExecResult::new(1))
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        Ok(Box::new(FakeConnStatement {
            id: self.id,
            sql: sql.to_string(),
        }))
    }

    async fn begin(&self, _options: TransactionOptions) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(FakeTransaction {
            target: format!("conn-{}", self.id),
        }))
    }

    async fn ping(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::connection("ping failed"))
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeConnStatement {
    id: usize,
    sql: String,
}

#[async_trait]
impl PreparedStatement for FakeConnStatement {
    async fn execute(&self, _params: &[Value]) -> Result<ExecResult> {
        Ok(ExecResult::new(1))
    }

    async fn query(&self, _params: &[Value]) -> Result<Vec<Row>> {
        Ok(vec![conn_row(self.id)])
    }

    fn sql(&self) -> &str {
        &self.sql
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Let detached close tasks spawned by the pool finish
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
