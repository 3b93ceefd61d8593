//! Units of work bound to one physical connection.
//!
//! A [`Session`] is handed to the callback of `task`/`tx`. Inside it, plain
//! queries may run concurrently, while nested `task`/`tx` calls get the
//! connection to themselves: they wait for in-flight queries to finish, and
//! queries issued while they run wait for them to close. Nested transactions
//! below the top level are expressed with savepoints named after their depth.

mod savepoint;
pub(crate) mod scheduler;

use crate::config::ExecutorConfig;
use crate::core::{DbError, Result};
use crate::query::Query;
use crate::result::QueryResult;
use savepoint::TxStatement;
use scheduler::{CallSite, ConnectionLink, SessionShared};
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle of a session: `Created -> Live -> Closing -> Dead`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Built, opening statement not yet confirmed
    Created,
    /// Holds the connection and admits work
    Live,
    /// Callback settled; waiting for in-flight work and the closing statement
    Closing,
    Dead,
}

/// Point-in-time view of a session's scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub level: usize,
    pub phase: SessionPhase,
    pub pending_queries: usize,
    pub pending_nested: bool,
    pub queued: usize,
    /// Queued nested sessions that arrived while queries were in flight
    pub queued_exclusive: usize,
}

/// Handle to a unit of work.
///
/// Cloning is cheap; all clones refer to the same session. Once the callback
/// that received the session returns, every further operation fails with
/// [`DbError::Misuse`].
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn root(unit: Uuid, config: Arc<ExecutorConfig>) -> Self {
        Self {
            shared: SessionShared::new(unit, config, 0),
        }
    }

    /// Transaction depth: 0 outside any transaction, 1 inside `BEGIN`, N for savepoint `spN`
    pub fn level(&self) -> usize {
        self.shared.level()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    pub fn is_live(&self) -> bool {
        self.phase() == SessionPhase::Live
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    /// Identifier of the top-level unit of work this session belongs to
    pub fn unit_id(&self) -> Uuid {
        self.shared.unit()
    }

    /// Run a statement on the session's connection.
    ///
    /// The statement is submitted immediately and runs even if the handle is
    /// never awaited. It waits only while a nested session holds the
    /// connection.
    #[track_caller]
    pub fn query(&self, query: impl Into<Query>) -> QueryHandle {
        let call_site = self.call_site(Location::caller());
        QueryHandle {
            receiver: self.shared.submit_query(query.into(), call_site),
        }
    }

    /// Nested unit of work on this session's connection, without a transaction of its own
    #[track_caller]
    pub fn task<F, Fut, T, E>(&self, f: F) -> NestedHandle<T, E>
    where
        F: FnOnce(Session) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        self.nested(f, false, Location::caller())
    }

    /// Nested transaction: `BEGIN` at depth 1, savepoint `spN` at depth N.
    ///
    /// An `Err` from the callback rolls back this level only and is returned
    /// unchanged.
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
    ///     tx.query(Query::new("INSERT INTO log VALUES ($1)").bind("kept")).await?;
    ///
    ///     let inner = tx.tx(|sp| async move {
    ///         sp.query(Query::new("INSERT INTO log VALUES ($1)").bind("undone")).await?;
    ///         Err::<(), _>(DbError::misuse("changed my mind"))
    ///     });
    ///     assert!(inner.await.is_err());
    ///     Ok::<_, DbError>(())
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    #[track_caller]
    pub fn tx<F, Fut, T, E>(&self, f: F) -> NestedHandle<T, E>
    where
        F: FnOnce(Session) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        self.nested(f, true, Location::caller())
    }

    fn nested<F, Fut, T, E>(
        &self,
        f: F,
        is_tx: bool,
        caller: &'static Location<'static>,
    ) -> NestedHandle<T, E>
    where
        F: FnOnce(Session) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        let call_site = self.call_site(caller);
        let admission = self.shared.submit_nested();
        let unit = self.shared.unit();
        let config = Arc::clone(self.shared.config());

        let handle = tokio::spawn(async move {
            let permit = match admission {
                Ok(admission) => admission.admitted().await,
                Err(err) => Err(err),
            }
            .map_err(|err| E::from(err.traced(call_site)))?;

            let child = Session {
                shared: SessionShared::new(unit, config, permit.level()),
            };
            let link = Arc::clone(permit.link());
            let result = child.run(link, f, is_tx).await;

            // The parent regains the connection only after the child is fully closed
            drop(permit);
            result
        });

        NestedHandle { handle }
    }

    fn call_site(&self, caller: &'static Location<'static>) -> CallSite {
        self.shared.config().debug.then_some(caller)
    }

    /// Drive the session through its whole lifecycle around `f`.
    pub(crate) async fn run<F, Fut, T, E>(
        self,
        link: Arc<ConnectionLink>,
        f: F,
        is_tx: bool,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<DbError>,
    {
        let shared = Arc::clone(&self.shared);
        let mut teardown = Teardown {
            shared: &shared,
            link: &link,
            armed: true,
        };

        let level = if is_tx {
            let level = shared.raise_level();
            if let Err(err) = link.control(TxStatement::Open.sql(level)).await {
                // A nested open failure leaves the link to the parent's unwind,
                // a root one is discarded because its level stays raised
                error!(level, error = %err, "failed to open transaction");
                teardown.disarm();
                shared.mark_dead();
                return Err(E::from(DbError::Driver(err)));
            }
            Some(level)
        } else {
            None
        };

        shared.go_live(Arc::clone(&link));
        debug!(level = shared.level(), is_tx, "session live");

        let outcome = f(self).await;

        shared.close();
        // In-flight statements must not race the closing statement
        shared.wait_idle().await;

        if let Some(level) = level {
            let statement = TxStatement::closing(outcome.is_err());
            if let Err(err) = link.control(statement.sql(level)).await {
                error!(level, error = %err, "failed to close transaction, connection will be discarded");
                link.poison();
                teardown.disarm();
                shared.mark_dead();
                return match outcome {
                    Ok(_) => Err(E::from(DbError::Driver(err))),
                    Err(original) => Err(original),
                };
            }
            shared.lower_level();
        }

        teardown.disarm();
        shared.mark_dead();
        outcome
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Session")
            .field("unit", &self.unit_id())
            .field("level", &stats.level)
            .field("phase", &stats.phase)
            .finish()
    }
}

/// Cleans up a session whose lifecycle was cut short by a panic or cancellation
struct Teardown<'a> {
    shared: &'a Arc<SessionShared>,
    link: &'a Arc<ConnectionLink>,
    armed: bool,
}

impl Teardown<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("session abandoned before closing, connection will be discarded");
            self.link.poison();
            self.shared.close();
            self.shared.mark_dead();
        }
    }
}

/// Result of [`Session::query`].
///
/// Dropping the handle does not cancel the query.
#[must_use = "the query runs regardless, but its result is lost unless awaited"]
pub struct QueryHandle {
    receiver: oneshot::Receiver<Result<QueryResult>>,
}

impl Future for QueryHandle {
    type Output = Result<QueryResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|reply| reply.unwrap_or_else(|_| Err(DbError::Aborted)))
    }
}

/// Result of [`Session::task`] / [`Session::tx`].
///
/// The nested unit runs as its own task; dropping the handle detaches it and
/// the parent session still waits for it before closing.
#[must_use = "the nested unit runs regardless, but its result is lost unless awaited"]
pub struct NestedHandle<T, E> {
    handle: JoinHandle<std::result::Result<T, E>>,
}

impl<T, E: From<DbError>> Future for NestedHandle<T, E> {
    type Output = std::result::Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.handle).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Poll::Ready(Err(E::from(DbError::Aborted))),
        }
    }
}
