pub mod memory;

use crate::core::{DriverError, Result};
use crate::query::Query;
use crate::result::QueryResult;
use async_trait::async_trait;
use std::sync::Arc;

/// A single physical database link.
///
/// Implementations wrap a real driver client. The session layer guarantees
/// that statements of a nested transaction never overlap plain queries on the
/// same connection, but plain queries of one session may be in flight
/// together; drivers are expected to pipeline or serialize them.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run one statement and return its rows
    async fn execute(&self, query: &Query) -> std::result::Result<QueryResult, DriverError>;

    /// Hand the connection back to its pool.
    ///
    /// With `discard` set the pool must destroy the link instead of reusing it.
    fn release(self: Arc<Self>, discard: bool);
}

/// Source of connections, usually a driver's connection pool.
#[async_trait]
pub trait Pool: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
impl<P: Pool + ?Sized> Pool for Arc<P> {
    async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        (**self).acquire().await
    }
}
