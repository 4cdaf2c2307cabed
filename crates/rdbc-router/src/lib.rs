//! # rdbc-router
//!
//! Read/write splitting over one primary and any number of replica databases.
//!
//! A [`Router`] presents a single logical database: writes and transactions
//! go to the primary, reads rotate over the replicas, and lifecycle calls
//! (open, close, ping, prepare) fan out to every database concurrently.
//!
//! ## Features
//!
//! - **Round-robin reads**: one atomic rotation shared by plain queries and
//!   prepared statements
//! - **Concurrent lifecycle**: open, close, ping and prepare run against every
//!   target at once, with per-target error reporting
//! - **Rollback on partial failure**: a failed open or prepare releases
//!   whatever already succeeded
//! - **Pluggable drivers**: implement [`database::Driver`] directly, or
//!   implement [`connection::ConnectionFactory`] and get pooling through
//!   [`pool::PoolDriver`]
//! - **Deadlines and cancellation** via [`context::Context`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rdbc_router::prelude::*;
//!
//! register_driver("postgres", Arc::new(PoolDriver::new("postgres", Arc::new(PgFactory))));
//!
//! let router = Router::open(
//!     "postgres",
//!     "postgres://rw-host/app;postgres://ro-1/app;postgres://ro-2/app",
//! )
//! .await?;
//! router.set_max_open_conns(20);
//!
//! router.exec("UPDATE users SET active = true WHERE id = $1", &[Value::Int64(1)]).await?;
//! let rows = router.query("SELECT * FROM users", &[]).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod context;
pub mod database;
pub mod error;
pub mod fanout;
pub mod pool;
pub mod router;
pub mod routing;
pub mod set;
pub mod statement;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result, TargetError};

    // Value types
    pub use crate::types::{ExecResult, Row, Value};

    // Driver-facing traits
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, IsolationLevel, PreparedStatement,
        Transaction, TransactionOptions,
    };

    // Handles and drivers
    pub use crate::database::{
        deregister_driver, lookup_driver, register_driver, registered_drivers, Database, Driver,
    };

    // Pooling
    pub use crate::pool::{PoolConfig, PoolDriver, PoolStats, PooledDatabase};

    // Routing
    pub use crate::config::{parse_connection_spec, PoolSettings, RouterConfig};
    pub use crate::context::Context;
    pub use crate::router::Router;
    pub use crate::routing::{ReadWriteSplit, Replicated, RoundRobin};
    pub use crate::set::ConnectionSet;
    pub use crate::statement::RoutedStatement;
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use router::Router;
pub use statement::RoutedStatement;
pub use types::Value;
