use crate::config::ExecutorConfig;
use crate::connection::{Connection, Pool};
use crate::core::{DbError, Result};
use crate::query::Query;
use crate::result::QueryResult;
use crate::session::Session;
use crate::session::scheduler::{CallSite, ConnectionLink};
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

/// Entry point for application code.
///
/// Owns the pool and the configuration. Every `task`/`tx` call gets its own
/// connection for the whole unit of work; `query` borrows one for a single
/// statement.
///
/// # Examples
///
/// ```
/// use txsession::{DbError, Executor, ExecutorConfig, MemoryPool, Query};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), DbError> {
/// let db = Executor::new(MemoryPool::new(), ExecutorConfig::new());
///
/// db.tx(|tx| async move {
///     let (a, b) = tokio::join!(
///         tx.query(Query::new("INSERT INTO users VALUES ($1)").bind("alice")),
///         tx.query(Query::new("INSERT INTO users VALUES ($1)").bind("bob")),
///     );
///     a?;
///     b?;
///     Ok::<_, DbError>(())
/// })
/// .await?;
///
/// assert_eq!(db.query("SELECT * FROM users").await?.row_count(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Executor {
    pool: Arc<dyn Pool>,
    config: Arc<ExecutorConfig>,
}

impl Executor {
    pub fn new<P: Pool + 'static>(pool: P, config: ExecutorConfig) -> Self {
        Self::with_pool(Arc::new(pool), config)
    }

    pub fn with_pool(pool: Arc<dyn Pool>, config: ExecutorConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    /// Run one statement on a freshly borrowed connection
    #[track_caller]
    pub fn query<Q: Into<Query>>(
        &self,
        query: Q,
    ) -> impl Future<Output = Result<QueryResult>> + Send + use<Q> {
        let query = query.into();
        let call_site = self.call_site(Location::caller());
        let pool = Arc::clone(&self.pool);
        let config = Arc::clone(&self.config);

        async move {
            let connection = pool.acquire().await.map_err(|err| err.traced(call_site))?;
            let lease = Lease::new(Arc::clone(&connection));

            debug!(query = %query, params = query.params().len(), "direct query");
            match connection.execute(&query).await {
                Ok(rows) => {
                    lease.release(false);
                    Ok(rows)
                }
                Err(err) => {
                    lease.release(err.is_connection_error());
                    Err(config.handle_query_error(err, &query).traced(call_site))
                }
            }
        }
    }

    /// Unit of work on one connection, outside any transaction
    #[track_caller]
    pub fn task<F, Fut, T, E>(
        &self,
        f: F,
    ) -> impl Future<Output = std::result::Result<T, E>> + use<F, Fut, T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<DbError>,
    {
        self.unit_of_work(f, false, Location::caller())
    }

    /// Unit of work wrapped in `BEGIN` ... `COMMIT`, rolled back when `f` fails
    #[track_caller]
    pub fn tx<F, Fut, T, E>(
        &self,
        f: F,
    ) -> impl Future<Output = std::result::Result<T, E>> + use<F, Fut, T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<DbError>,
    {
        self.unit_of_work(f, true, Location::caller())
    }

    fn unit_of_work<F, Fut, T, E>(
        &self,
        f: F,
        is_tx: bool,
        caller: &'static Location<'static>,
    ) -> impl Future<Output = std::result::Result<T, E>> + use<F, Fut, T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<DbError>,
    {
        let call_site = self.call_site(caller);
        let pool = Arc::clone(&self.pool);
        let config = Arc::clone(&self.config);
        let unit = Uuid::new_v4();
        let kind = if is_tx { "tx" } else { "task" };
        let span = info_span!("unit_of_work", %unit, kind);

        async move {
            let connection = pool
                .acquire()
                .await
                .map_err(|err| E::from(err.traced(call_site)))?;
            let lease = Lease::new(Arc::clone(&connection));
            let link = Arc::new(ConnectionLink::new(connection));

            let session = Session::root(unit, config);
            let outcome = session.clone().run(Arc::clone(&link), f, is_tx).await;

            // A transaction left open (or a failed unwind) makes the connection unusable
            let level = session.level();
            let dirty = level > 0 || link.is_poisoned();
            if dirty {
                warn!(level, poisoned = link.is_poisoned(), "discarding connection in unknown transaction state");
            }
            lease.release(dirty);
            outcome
        }
        .instrument(span)
    }

    fn call_site(&self, caller: &'static Location<'static>) -> CallSite {
        self.config.debug.then_some(caller)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Borrowed connection that must go back to its pool.
///
/// Dropped without an explicit release (the unit of work was cancelled or
/// panicked), the connection is discarded since its state is unknown.
struct Lease {
    connection: Option<Arc<dyn Connection>>,
}

impl Lease {
    fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    fn release(mut self, discard: bool) {
        if let Some(connection) = self.connection.take() {
            connection.release(discard);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            warn!("connection lease dropped before its unit of work finished, discarding");
            connection.release(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::{Event, MemoryPool};

    #[tokio::test]
    async fn test_direct_query_releases_connection() {
        let pool = Arc::new(MemoryPool::new());
        let db = Executor::with_pool(pool.clone(), ExecutorConfig::new());

        db.query(Query::new("INSERT INTO t VALUES ($1)").bind(1)).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.available_connections, 1);
        assert!(pool.events().contains(&Event::Released {
            connection: 1,
            discard: false
        }));
    }

    #[tokio::test]
    async fn test_dropped_lease_discards() {
        let pool = Arc::new(MemoryPool::new());
        let connection = pool.acquire().await.unwrap();

        drop(Lease::new(connection));

        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().total_connections, 0);
    }
}
