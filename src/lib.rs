// ============================================================================
// txsession Library
// ============================================================================

//! Units of work over pooled database connections.
//!
//! An [`Executor`] owns a connection [`Pool`]. Application code runs either
//! single statements through [`Executor::query`] or whole units of work
//! through [`Executor::task`] and [`Executor::tx`], which pin one connection
//! for the duration of a callback and hand the callback a [`Session`].
//!
//! Inside a session, plain queries run concurrently while nested
//! `task`/`tx` calls get the connection exclusively, in submission order.
//! Nested transactions map to savepoints `sp2`, `sp3`, ... named after their
//! depth. A connection left in an unknown transaction state is discarded
//! instead of going back to the pool.

pub mod classify;
pub mod config;
pub mod connection;
pub mod core;
pub mod interface;
pub mod query;
pub mod result;
pub mod session;
mod executor;

// Re-export main types for convenience
pub use core::{DbError, DriverError, DriverErrorKind, Result, Value};
pub use query::Query;
pub use result::{QueryResult, Row};

// Re-export execution API
pub use config::{ExecutorConfig, QueryErrorHandler};
pub use executor::Executor;
pub use interface::Queryable;
pub use session::{NestedHandle, QueryHandle, Session, SessionPhase, SessionStats};

// Re-export connection API
pub use connection::{
    Connection,
    Pool,
    memory::{Event, MemoryConnection, MemoryPool, PoolStats},
};
