//! Per-session admission control.
//!
//! Every session owns one [`SessionState`]. Plain queries may run together;
//! a nested session needs the connection to itself. Requests that cannot be
//! admitted on arrival wait in a FIFO queue that is drained on a later
//! runtime tick, after the operation that blocked them has completed.
//!
//! Admission is handed out as RAII permits. Dropping a permit gives the slot
//! back and schedules a drain, whether the operation finished, failed,
//! panicked or was abandoned by its caller.

use super::{SessionPhase, SessionStats};
use crate::config::ExecutorConfig;
use crate::connection::Connection;
use crate::core::{DbError, DriverError, Result};
use crate::query::Query;
use crate::result::QueryResult;
use std::collections::VecDeque;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, oneshot};
use tracing::debug;
use uuid::Uuid;

pub(crate) type CallSite = Option<&'static Location<'static>>;

type QueryReply = oneshot::Sender<Result<QueryResult>>;
type NestedReply = oneshot::Sender<Result<NestedPermit>>;

/// The physical connection shared by a root session and all of its children
pub(crate) struct ConnectionLink {
    connection: Arc<dyn Connection>,
    poisoned: AtomicBool,
}

impl ConnectionLink {
    pub(crate) fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            poisoned: AtomicBool::new(false),
        }
    }

    /// Flag the link as unfit for reuse
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Run a statement unless the link was poisoned.
    ///
    /// A poisoned connection may already be back in its pool or discarded, so
    /// detached nested units must not reach it any more.
    pub(crate) async fn execute(&self, query: &Query) -> std::result::Result<QueryResult, DriverError> {
        if self.is_poisoned() {
            debug!(query = %query, "statement refused on poisoned connection");
            return Err(DriverError::connection(
                "connection was discarded after its unit of work was abandoned or failed to unwind",
            ));
        }
        self.connection.execute(query).await
    }

    /// Send a transaction control statement, bypassing the query error hook
    pub(crate) async fn control(&self, sql: String) -> std::result::Result<(), DriverError> {
        debug!(sql = %sql, "transaction control");
        self.execute(&Query::new(sql)).await.map(|_| ())
    }
}

/// A request that arrived while it could not be admitted
pub(crate) enum QueuedOperation {
    Query {
        query: Query,
        reply: QueryReply,
        call_site: CallSite,
    },
    Nested {
        reply: NestedReply,
        /// Queued while plain queries were in flight
        exclusive: bool,
    },
}

impl QueuedOperation {
    fn admissible(&self, pending_queries: usize, pending_nested: bool) -> bool {
        match self {
            Self::Query { .. } => !pending_nested,
            Self::Nested { .. } => !pending_nested && pending_queries == 0,
        }
    }

    fn reject(self) {
        match self {
            Self::Query {
                reply, call_site, ..
            } => {
                let _ = reply.send(Err(DbError::Aborted.traced(call_site)));
            }
            Self::Nested { reply, .. } => {
                let _ = reply.send(Err(DbError::Aborted));
            }
        }
    }
}

/// Operations admitted by a drain pass, started once the lock is released
enum Admitted {
    Query {
        permit: QueryPermit,
        query: Query,
        reply: QueryReply,
        call_site: CallSite,
    },
    Nested {
        permit: NestedPermit,
        reply: NestedReply,
    },
}

pub(crate) struct SessionState {
    phase: SessionPhase,
    level: usize,
    pending_queries: usize,
    pending_nested: bool,
    queue: VecDeque<QueuedOperation>,
    connection: Option<Arc<ConnectionLink>>,
}

pub(crate) struct SessionShared {
    unit: Uuid,
    config: Arc<ExecutorConfig>,
    state: Mutex<SessionState>,
    idle: Notify,
}

impl SessionShared {
    pub(crate) fn new(unit: Uuid, config: Arc<ExecutorConfig>, level: usize) -> Arc<Self> {
        Arc::new(Self {
            unit,
            config,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Created,
                level,
                pending_queries: 0,
                pending_nested: false,
                queue: VecDeque::new(),
                connection: None,
            }),
            idle: Notify::new(),
        })
    }

    // The state is never left half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn unit(&self) -> Uuid {
        self.unit
    }

    pub(crate) fn config(&self) -> &Arc<ExecutorConfig> {
        &self.config
    }

    pub(crate) fn level(&self) -> usize {
        self.lock().level
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    pub(crate) fn stats(&self) -> SessionStats {
        let state = self.lock();
        SessionStats {
            level: state.level,
            phase: state.phase,
            pending_queries: state.pending_queries,
            pending_nested: state.pending_nested,
            queued: state.queue.len(),
            queued_exclusive: state
                .queue
                .iter()
                .filter(|op| matches!(op, QueuedOperation::Nested { exclusive: true, .. }))
                .count(),
        }
    }

    /// Enter the next transaction depth and return it
    pub(crate) fn raise_level(&self) -> usize {
        let mut state = self.lock();
        state.level += 1;
        state.level
    }

    pub(crate) fn lower_level(&self) {
        let mut state = self.lock();
        state.level = state.level.saturating_sub(1);
    }

    pub(crate) fn go_live(&self, link: Arc<ConnectionLink>) {
        let mut state = self.lock();
        state.connection = Some(link);
        state.phase = SessionPhase::Live;
    }

    /// Stop admitting work and reject everything still queued
    pub(crate) fn close(&self) {
        let rejected: Vec<QueuedOperation> = {
            let mut state = self.lock();
            state.connection = None;
            if state.phase != SessionPhase::Dead {
                state.phase = SessionPhase::Closing;
            }
            state.queue.drain(..).collect()
        };

        if !rejected.is_empty() {
            debug!(count = rejected.len(), "rejecting operations queued on a finished session");
        }
        for op in rejected {
            op.reject();
        }
    }

    pub(crate) fn mark_dead(&self) {
        let mut state = self.lock();
        state.connection = None;
        state.phase = SessionPhase::Dead;
    }

    /// Wait until no query or nested session is in flight
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            {
                let state = self.lock();
                if state.pending_queries == 0 && !state.pending_nested {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Admit or queue a plain query; the reply resolves with its rows.
    pub(crate) fn submit_query(
        self: &Arc<Self>,
        query: Query,
        call_site: CallSite,
    ) -> oneshot::Receiver<Result<QueryResult>> {
        let (reply, receiver) = oneshot::channel();
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(link) = state.connection.clone() else {
            drop(guard);
            let err = DbError::misuse("running query in finished task/tx");
            let _ = reply.send(Err(err.traced(call_site)));
            return receiver;
        };

        if state.pending_nested || !state.queue.is_empty() {
            debug!(
                pending_nested = state.pending_nested,
                queued = state.queue.len(),
                "query deferred"
            );
            state.queue.push_back(QueuedOperation::Query {
                query,
                reply,
                call_site,
            });
            return receiver;
        }

        let permit = QueryPermit::new(state, Arc::clone(self), link);
        drop(guard);
        dispatch(permit, query, reply, call_site);
        receiver
    }

    /// Admit or queue a nested session
    pub(crate) fn submit_nested(self: &Arc<Self>) -> Result<NestedAdmission> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(link) = state.connection.clone() else {
            return Err(DbError::misuse("running sub task/tx in finished task/tx"));
        };

        if state.pending_queries == 0 && !state.pending_nested && state.queue.is_empty() {
            let permit = NestedPermit::new(state, Arc::clone(self), link);
            return Ok(NestedAdmission::Ready(permit));
        }

        let (reply, receiver) = oneshot::channel();
        let exclusive = state.pending_queries > 0;
        debug!(
            exclusive,
            pending_queries = state.pending_queries,
            pending_nested = state.pending_nested,
            "nested session deferred"
        );
        state
            .queue
            .push_back(QueuedOperation::Nested { reply, exclusive });
        Ok(NestedAdmission::Queued(receiver))
    }

    fn drain(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            let Some(link) = state.connection.clone() else {
                return;
            };

            while let Some(op) = state.queue.front() {
                if !op.admissible(state.pending_queries, state.pending_nested) {
                    break;
                }
                let Some(op) = state.queue.pop_front() else {
                    break;
                };

                match op {
                    QueuedOperation::Query {
                        query,
                        reply,
                        call_site,
                    } => {
                        let permit = QueryPermit::new(state, Arc::clone(self), Arc::clone(&link));
                        admitted.push(Admitted::Query {
                            permit,
                            query,
                            reply,
                            call_site,
                        });
                    }
                    QueuedOperation::Nested { reply, exclusive } => {
                        debug!(exclusive, "admitting queued nested session");
                        let permit = NestedPermit::new(state, Arc::clone(self), Arc::clone(&link));
                        admitted.push(Admitted::Nested { permit, reply });
                    }
                }
            }
        }

        for op in admitted {
            match op {
                Admitted::Query {
                    permit,
                    query,
                    reply,
                    call_site,
                } => dispatch(permit, query, reply, call_site),
                Admitted::Nested { permit, reply } => {
                    // A caller that went away hands the permit back here; dropping it frees the slot.
                    let _ = reply.send(Ok(permit));
                }
            }
        }
    }

    /// Run a drain pass on a later tick of the runtime
    fn schedule_drain(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(self);
                runtime.spawn(async move { shared.drain() });
            }
            Err(_) => debug!("no runtime available, queued operations stay parked"),
        }
    }

    fn finish_query(self: &Arc<Self>) {
        let idle = {
            let mut state = self.lock();
            state.pending_queries -= 1;
            state.pending_queries == 0
        };

        if idle {
            self.idle.notify_waiters();
            self.schedule_drain();
        }
    }

    fn finish_nested(self: &Arc<Self>) {
        self.lock().pending_nested = false;
        self.idle.notify_waiters();
        self.schedule_drain();
    }
}

/// Start an admitted query on the shared connection.
///
/// The query runs whether or not anyone awaits the reply.
fn dispatch(permit: QueryPermit, query: Query, reply: QueryReply, call_site: CallSite) {
    tokio::spawn(async move {
        debug!(query = %query, params = query.params().len(), "query dispatched");
        let result = permit.link.execute(&query).await;
        let config = Arc::clone(permit.shared.config());
        drop(permit);

        let result =
            result.map_err(|err| config.handle_query_error(err, &query).traced(call_site));
        let _ = reply.send(result);
    });
}

/// One unit of `pending_queries`
pub(crate) struct QueryPermit {
    shared: Arc<SessionShared>,
    link: Arc<ConnectionLink>,
}

impl QueryPermit {
    fn new(state: &mut SessionState, shared: Arc<SessionShared>, link: Arc<ConnectionLink>) -> Self {
        debug_assert!(!state.pending_nested, "query admitted while a nested session is active");
        state.pending_queries += 1;
        Self { shared, link }
    }
}

impl Drop for QueryPermit {
    fn drop(&mut self) {
        self.shared.finish_query();
    }
}

/// Exclusive use of the parent's connection by a nested session
pub(crate) struct NestedPermit {
    shared: Arc<SessionShared>,
    link: Arc<ConnectionLink>,
    level: usize,
}

impl NestedPermit {
    fn new(state: &mut SessionState, shared: Arc<SessionShared>, link: Arc<ConnectionLink>) -> Self {
        debug_assert!(
            state.pending_queries == 0 && !state.pending_nested,
            "nested session admitted while the connection is busy"
        );
        state.pending_nested = true;
        Self {
            shared,
            link,
            level: state.level,
        }
    }

    pub(crate) fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    /// Parent level at admission; the child starts from it
    pub(crate) fn level(&self) -> usize {
        self.level
    }
}

impl Drop for NestedPermit {
    fn drop(&mut self) {
        self.shared.finish_nested();
    }
}

pub(crate) enum NestedAdmission {
    Ready(NestedPermit),
    Queued(oneshot::Receiver<Result<NestedPermit>>),
}

impl NestedAdmission {
    pub(crate) async fn admitted(self) -> Result<NestedPermit> {
        match self {
            Self::Ready(permit) => Ok(permit),
            Self::Queued(receiver) => receiver.await.unwrap_or_else(|_| Err(DbError::Aborted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryPool;
    use crate::connection::Pool;

    async fn live_session() -> Arc<SessionShared> {
        let pool = MemoryPool::new();
        let connection = pool.acquire().await.unwrap();
        let shared = SessionShared::new(Uuid::new_v4(), Arc::new(ExecutorConfig::new()), 1);
        shared.go_live(Arc::new(ConnectionLink::new(connection)));
        shared
    }

    #[tokio::test]
    async fn test_poisoned_link_refuses_statements() {
        let pool = MemoryPool::new();
        let link = ConnectionLink::new(pool.acquire().await.unwrap());

        link.control("BEGIN".to_string()).await.unwrap();
        link.poison();

        let err = link.control("COMMIT".to_string()).await.unwrap_err();
        assert!(err.is_connection_error());
        let err = link.execute(&Query::new("SELECT 1")).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(pool.statements(), vec!["BEGIN"]);
    }

    #[test]
    fn test_admission_predicates() {
        let (reply, _rx) = oneshot::channel();
        let query = QueuedOperation::Query {
            query: Query::new("SELECT 1"),
            reply,
            call_site: None,
        };
        assert!(query.admissible(3, false));
        assert!(!query.admissible(0, true));

        let (reply, _rx) = oneshot::channel();
        let nested = QueuedOperation::Nested {
            reply,
            exclusive: true,
        };
        assert!(nested.admissible(0, false));
        assert!(!nested.admissible(1, false));
        assert!(!nested.admissible(0, true));
    }

    #[tokio::test]
    async fn test_nested_queued_behind_queries() {
        let shared = live_session().await;

        let first = shared.submit_query(Query::new("SELECT 1"), None);
        let admission = shared.submit_nested().unwrap();
        assert!(matches!(admission, NestedAdmission::Queued(_)));

        let stats = shared.stats();
        assert_eq!(stats.pending_queries, 1);
        assert!(!stats.pending_nested);
        assert_eq!(stats.queued_exclusive, 1);

        first.await.unwrap().unwrap();
        let permit = admission.admitted().await.unwrap();
        assert_eq!(permit.level(), 1);
        assert!(shared.stats().pending_nested);

        drop(permit);
        shared.wait_idle().await;
        assert!(!shared.stats().pending_nested);
    }

    #[tokio::test]
    async fn test_dropped_nested_permit_frees_queue() {
        let shared = live_session().await;

        let admission = shared.submit_nested().unwrap();
        let queued = shared.submit_query(Query::new("SELECT 1"), None);
        assert_eq!(shared.stats().queued, 1);

        // Abandoning the nested request hands the connection back
        drop(admission);
        let rows = queued.await.unwrap();
        assert!(rows.is_ok());
    }

    #[tokio::test]
    async fn test_close_rejects_queue() {
        let shared = live_session().await;

        let admission = shared.submit_nested().unwrap();
        let queued = shared.submit_query(Query::new("SELECT 1"), None);

        shared.close();
        let err = queued.await.unwrap().unwrap_err();
        assert!(err.is_aborted());

        let err = shared.submit_nested().err().unwrap();
        assert!(err.is_misuse());
        drop(admission);
    }
}
