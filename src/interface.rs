use async_trait::async_trait;
use crate::core::Result;
use crate::executor::Executor;
use crate::query::Query;
use crate::result::QueryResult;
use crate::session::Session;

/// Anything that can run a statement.
///
/// Implemented by [`Executor`] (borrows a connection per statement) and by
/// [`Session`] (runs on the unit of work's connection). Repository code
/// written against this trait works the same inside and outside a
/// transaction.
///
/// Call sites recorded in debug mode point at this module, not the caller;
/// use the inherent methods when the location matters.
///
/// # Examples
///
/// ```
/// use txsession::{DbError, Executor, ExecutorConfig, MemoryPool, Query, Queryable};
///
/// async fn add_user(db: &impl Queryable, name: &str) -> Result<(), DbError> {
///     db.query(Query::new("INSERT INTO users VALUES ($1)").bind(name)).await?;
///     Ok(())
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), DbError> {
/// let db = Executor::new(MemoryPool::new(), ExecutorConfig::new());
///
/// add_user(&db, "alice").await?;
/// db.tx(|tx| async move { add_user(&tx, "bob").await }).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Queryable: Send + Sync {
    async fn query(&self, query: Query) -> Result<QueryResult>;
}

#[async_trait]
impl Queryable for Executor {
    async fn query(&self, query: Query) -> Result<QueryResult> {
        Executor::query(self, query).await
    }
}

#[async_trait]
impl Queryable for Session {
    async fn query(&self, query: Query) -> Result<QueryResult> {
        Session::query(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::connection::memory::MemoryPool;
    use crate::core::DbError;

    async fn count(db: &dyn Queryable) -> Result<usize> {
        Ok(db.query(Query::new("SELECT * FROM t")).await?.row_count())
    }

    #[tokio::test]
    async fn test_same_code_inside_and_outside_tx() {
        let db = Executor::new(MemoryPool::new(), ExecutorConfig::new());
        Queryable::query(&db, Query::new("INSERT INTO t VALUES ($1)").bind(1))
            .await
            .unwrap();

        let inside = db
            .tx(|tx| async move {
                Queryable::query(&tx, Query::new("INSERT INTO t VALUES ($1)").bind(2)).await?;
                count(&tx).await
            })
            .await
            .unwrap();

        assert_eq!(inside, 2);
        assert_eq!(count(&db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dead_session_misuse() {
        let db = Executor::new(MemoryPool::new(), ExecutorConfig::new());
        let leaked = db.task(|s| async move { Ok::<_, DbError>(s) }).await.unwrap();

        let err = count(&leaked).await.unwrap_err();
        assert!(err.is_misuse());
    }
}
