//! In-memory connection pool.
//!
//! Every connection of a [`MemoryPool`] works against one shared single-column
//! table and understands just enough SQL to exercise transaction handling:
//! `BEGIN`, `COMMIT`, `ROLLBACK`, `SAVEPOINT`, `RELEASE SAVEPOINT`,
//! `ROLLBACK TO SAVEPOINT`, `INSERT` (stores the first parameter) and
//! `SELECT` (returns every visible row). Anything else succeeds with no rows.
//!
//! Latency and failures are injected with [`MemoryPool::delay_on`] and
//! [`MemoryPool::fail_on`]; every statement is recorded in a journal of
//! [`Event`]s so tests can check ordering.

use super::{Connection, Pool};
use crate::core::{DbError, DriverError, DriverErrorKind, Result, Value};
use crate::query::Query;
use crate::result::QueryResult;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

lazy_static! {
    static ref SAVEPOINT: Regex = Regex::new(r"(?i)^SAVEPOINT\s+(\w+)$").expect("valid regex");
    static ref RELEASE: Regex =
        Regex::new(r"(?i)^RELEASE\s+(?:SAVEPOINT\s+)?(\w+)$").expect("valid regex");
    static ref ROLLBACK_TO: Regex =
        Regex::new(r"(?i)^ROLLBACK\s+TO\s+(?:SAVEPOINT\s+)?(\w+)$").expect("valid regex");
    static ref KEYWORD: Regex = Regex::new(r"^\s*(\w+)").expect("valid regex");
}

const COLUMN: &str = "value";

/// Journal entry recorded by the pool
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started { connection: u64, sql: String },
    Finished { connection: u64, sql: String, ok: bool },
    Released { connection: u64, discard: bool },
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
    pub discarded: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}, {} discarded",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections,
            self.discarded
        )
    }
}

enum Rule {
    Delay(String, Duration),
    Fail(String, DriverError),
}

struct PoolShared {
    max_connections: usize,
    connect_timeout: Duration,
    available: Mutex<VecDeque<Arc<MemoryConnection>>>,
    total_connections: AtomicUsize,
    discarded: AtomicUsize,
    next_id: AtomicU64,
    committed: Mutex<Vec<Value>>,
    rules: Mutex<Vec<Rule>>,
    journal: Mutex<Vec<Event>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PoolShared {
    fn record(&self, event: Event) {
        lock(&self.journal).push(event);
    }

    fn delay_for(&self, sql: &str) -> Option<Duration> {
        lock(&self.rules).iter().find_map(|rule| match rule {
            Rule::Delay(pattern, delay) if sql.contains(pattern.as_str()) => Some(*delay),
            _ => None,
        })
    }

    fn failure_for(&self, sql: &str) -> Option<DriverError> {
        lock(&self.rules).iter().find_map(|rule| match rule {
            Rule::Fail(pattern, err) if sql.contains(pattern.as_str()) => Some(err.clone()),
            _ => None,
        })
    }
}

/// Bounded pool of in-memory connections sharing one table
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::with_limits(10, Duration::from_secs(30))
    }

    pub fn with_limits(max_connections: usize, connect_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                max_connections: max_connections.max(1),
                connect_timeout,
                available: Mutex::new(VecDeque::new()),
                total_connections: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                committed: Mutex::new(Vec::new()),
                rules: Mutex::new(Vec::new()),
                journal: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Sleep before executing statements containing `pattern`
    pub fn delay_on(&self, pattern: impl Into<String>, delay: Duration) -> &Self {
        lock(&self.shared.rules).push(Rule::Delay(pattern.into(), delay));
        self
    }

    /// Fail statements containing `pattern` with `err`
    pub fn fail_on(&self, pattern: impl Into<String>, err: DriverError) -> &Self {
        lock(&self.shared.rules).push(Rule::Fail(pattern.into(), err));
        self
    }

    /// Rows visible outside any transaction
    pub fn committed(&self) -> Vec<Value> {
        lock(&self.shared.committed).clone()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.shared.journal).clone()
    }

    /// SQL text of every started statement, in start order
    pub fn statements(&self) -> Vec<String> {
        lock(&self.shared.journal)
            .iter()
            .filter_map(|event| match event {
                Event::Started { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let available = lock(&self.shared.available).len();
        let total = self.shared.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available,
            active_connections: total.saturating_sub(available),
            max_connections: self.shared.max_connections,
            discarded: self.shared.discarded.load(Ordering::SeqCst),
        }
    }

    fn try_get_available(&self) -> Option<Arc<MemoryConnection>> {
        lock(&self.shared.available).pop_front()
    }

    fn try_create_connection(&self) -> Option<Arc<MemoryConnection>> {
        let created = self.shared.total_connections.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |total| (total < self.shared.max_connections).then_some(total + 1),
        );
        created.ok()?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        Some(Arc::new(MemoryConnection {
            id,
            pool: Arc::clone(&self.shared),
            tx: Mutex::new(None),
        }))
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pool for MemoryPool {
    async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        let start = Instant::now();

        loop {
            if let Some(connection) = self.try_get_available() {
                return Ok(connection);
            }

            if let Some(connection) = self.try_create_connection() {
                return Ok(connection);
            }

            if start.elapsed() > self.shared.connect_timeout {
                return Err(DbError::Pool(
                    "Connection pool timeout: no connections available".into(),
                ));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Open transaction on one connection: working copy plus savepoint snapshots
struct TxFrame {
    rows: Vec<Value>,
    savepoints: Vec<(String, Vec<Value>)>,
    aborted: bool,
}

enum Statement<'a> {
    Begin,
    Commit,
    Rollback,
    Savepoint(&'a str),
    Release(&'a str),
    RollbackTo(&'a str),
    Insert,
    Select,
    Other,
}

impl<'a> Statement<'a> {
    fn parse(sql: &'a str) -> Self {
        let sql = sql.trim().trim_end_matches(';').trim();

        if let Some(caps) = ROLLBACK_TO.captures(sql) {
            return caps.get(1).map_or(Self::Other, |m| Self::RollbackTo(m.as_str()));
        }
        if let Some(caps) = SAVEPOINT.captures(sql) {
            return caps.get(1).map_or(Self::Other, |m| Self::Savepoint(m.as_str()));
        }
        if let Some(caps) = RELEASE.captures(sql) {
            return caps.get(1).map_or(Self::Other, |m| Self::Release(m.as_str()));
        }

        let keyword = KEYWORD
            .captures(sql)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_ascii_uppercase());

        match keyword.as_deref() {
            Some("BEGIN") | Some("START") => Self::Begin,
            Some("COMMIT") | Some("END") => Self::Commit,
            Some("ROLLBACK") | Some("ABORT") => Self::Rollback,
            Some("INSERT") => Self::Insert,
            Some("SELECT") => Self::Select,
            _ => Self::Other,
        }
    }

    fn ends_transaction(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollback | Self::RollbackTo(_))
    }
}

/// Connection handed out by [`MemoryPool`]
pub struct MemoryConnection {
    id: u64,
    pool: Arc<PoolShared>,
    tx: Mutex<Option<TxFrame>>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_in_transaction(&self) -> bool {
        lock(&self.tx).is_some()
    }

    fn apply(&self, query: &Query) -> std::result::Result<QueryResult, DriverError> {
        let statement = Statement::parse(query.text());
        let mut tx = lock(&self.tx);

        if let Some(frame) = tx.as_mut() {
            if frame.aborted && !statement.ends_transaction() {
                return Err(DriverError::new(
                    DriverErrorKind::Other,
                    "current transaction is aborted, commands ignored until end of transaction block",
                )
                .with_code("25P02"));
            }
        }

        if let Some(err) = self.pool.failure_for(query.text()) {
            if let Some(frame) = tx.as_mut() {
                frame.aborted = true;
            }
            return Err(err);
        }

        match statement {
            Statement::Begin => {
                if tx.is_some() {
                    return Err(DriverError::new(
                        DriverErrorKind::Other,
                        "there is already a transaction in progress",
                    ));
                }
                *tx = Some(TxFrame {
                    rows: lock(&self.pool.committed).clone(),
                    savepoints: Vec::new(),
                    aborted: false,
                });
            }
            Statement::Commit => {
                // Committing an aborted transaction rolls it back
                if let Some(frame) = tx.take() {
                    if !frame.aborted {
                        *lock(&self.pool.committed) = frame.rows;
                    }
                }
            }
            Statement::Rollback => {
                *tx = None;
            }
            Statement::Savepoint(name) => {
                let frame = tx.as_mut().ok_or_else(|| outside_tx("SAVEPOINT"))?;
                frame.savepoints.push((name.to_string(), frame.rows.clone()));
            }
            Statement::Release(name) => {
                let frame = tx.as_mut().ok_or_else(|| outside_tx("RELEASE SAVEPOINT"))?;
                let idx = find_savepoint(frame, name)?;
                frame.savepoints.truncate(idx);
            }
            Statement::RollbackTo(name) => {
                let frame = tx.as_mut().ok_or_else(|| outside_tx("ROLLBACK TO SAVEPOINT"))?;
                let idx = find_savepoint(frame, name)?;
                frame.rows = frame.savepoints[idx].1.clone();
                frame.savepoints.truncate(idx + 1);
                frame.aborted = false;
            }
            Statement::Insert => {
                let value = query
                    .params()
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Value::Text(query.text().trim().to_string()));
                match tx.as_mut() {
                    Some(frame) => frame.rows.push(value),
                    None => lock(&self.pool.committed).push(value),
                }
                return Ok(QueryResult::new(vec![COLUMN.to_string()], Vec::new()));
            }
            Statement::Select => {
                let rows = match tx.as_ref() {
                    Some(frame) => frame.rows.clone(),
                    None => lock(&self.pool.committed).clone(),
                };
                return Ok(QueryResult::new(
                    vec![COLUMN.to_string()],
                    rows.into_iter().map(|value| vec![value]).collect(),
                ));
            }
            Statement::Other => {}
        }

        Ok(QueryResult::empty())
    }
}

fn outside_tx(statement: &str) -> DriverError {
    DriverError::new(
        DriverErrorKind::Other,
        format!("{} can only be used in transaction blocks", statement),
    )
    .with_code("25P01")
}

fn find_savepoint(frame: &TxFrame, name: &str) -> std::result::Result<usize, DriverError> {
    frame
        .savepoints
        .iter()
        .rposition(|(sp, _)| sp == name)
        .ok_or_else(|| {
            DriverError::new(
                DriverErrorKind::Other,
                format!("savepoint \"{}\" does not exist", name),
            )
            .with_code("3B001")
        })
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&self, query: &Query) -> std::result::Result<QueryResult, DriverError> {
        let sql = query.text().trim().to_string();
        self.pool.record(Event::Started {
            connection: self.id,
            sql: sql.clone(),
        });

        if let Some(delay) = self.pool.delay_for(&sql) {
            tokio::time::sleep(delay).await;
        }

        let result = self.apply(query);
        self.pool.record(Event::Finished {
            connection: self.id,
            sql,
            ok: result.is_ok(),
        });
        result
    }

    fn release(self: Arc<Self>, discard: bool) {
        self.pool.record(Event::Released {
            connection: self.id,
            discard,
        });

        if discard {
            self.pool.total_connections.fetch_sub(1, Ordering::SeqCst);
            self.pool.discarded.fetch_add(1, Ordering::SeqCst);
            return;
        }

        // A reused connection starts clean, like a server-side session reset
        *lock(&self.tx) = None;
        let pool = Arc::clone(&self.pool);
        lock(&pool.available).push_back(self);
    }
}
