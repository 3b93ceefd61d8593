/// Connection lifecycle tests
///
/// Connections go back to the pool only when their transaction state is
/// known to be clean; anything else is discarded.
/// Run with: cargo test --test connection_lifecycle_tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use txsession::{
    Connection, DbError, DriverError, Event, Executor, ExecutorConfig, MemoryPool, Pool, Query,
};

fn setup() -> (MemoryPool, Executor) {
    let pool = MemoryPool::new();
    let db = Executor::new(pool.clone(), ExecutorConfig::new());
    (pool, db)
}

fn released(pool: &MemoryPool) -> Vec<bool> {
    pool.events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Released { discard, .. } => Some(discard),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_clean_units_reuse_connection() {
    let (pool, db) = setup();

    db.tx(|tx| async move {
        tx.query("INSERT INTO t VALUES (1)").await?;
        Ok::<_, DbError>(())
    })
    .await
    .unwrap();
    db.task(|task| async move {
        task.query("SELECT * FROM t").await?;
        Ok::<_, DbError>(())
    })
    .await
    .unwrap();
    db.tx(|_tx| async move { Err::<(), _>(DbError::misuse("rolled back")) })
        .await
        .unwrap_err();

    assert_eq!(released(&pool), vec![false, false, false]);
    let stats = pool.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.discarded, 0);
}

#[tokio::test]
async fn test_failed_commit_discards_connection() {
    let (pool, db) = setup();
    pool.fail_on("COMMIT", DriverError::connection("server closed the connection unexpectedly"));

    let err = db
        .tx(|tx| async move {
            tx.query("INSERT INTO t VALUES (1)").await?;
            Ok::<_, DbError>(())
        })
        .await
        .unwrap_err();

    assert!(err.driver_error().unwrap().is_connection_error());
    assert_eq!(released(&pool), vec![true]);
    assert_eq!(pool.stats().total_connections, 0);
    assert!(pool.committed().is_empty());
}

#[tokio::test]
async fn test_failed_rollback_keeps_callback_error() {
    let (pool, db) = setup();
    pool.fail_on("ROLLBACK", DriverError::connection("connection reset by peer"));

    let err = db
        .tx(|_tx| async move { Err::<(), _>(DbError::misuse("original failure")) })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Misuse: original failure");
    assert_eq!(released(&pool), vec![true]);
}

#[tokio::test]
async fn test_failed_savepoint_release_discards_root() {
    let (pool, db) = setup();
    pool.fail_on("RELEASE SAVEPOINT", DriverError::connection("connection lost"));

    let err = db
        .tx(|tx| async move {
            tx.tx(|_sp| async move { Ok::<_, DbError>(()) }).await?;
            Ok::<_, DbError>(())
        })
        .await
        .unwrap_err();

    assert!(err.driver_error().is_some());
    assert_eq!(released(&pool), vec![true]);
}

#[tokio::test]
async fn test_failed_begin_skips_callback() {
    let (pool, db) = setup();
    pool.fail_on("BEGIN", DriverError::connection("connection refused"));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let err = db
        .tx(move |_tx| async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap_err();

    assert!(!ran.load(Ordering::SeqCst));
    assert!(err.driver_error().is_some());
    // The transaction level was already raised when BEGIN failed
    assert_eq!(released(&pool), vec![true]);
}

#[tokio::test]
async fn test_panicking_callback_discards_connection() {
    let (pool, db) = setup();

    let unit = tokio::spawn(db.tx(|tx| async move {
        tx.query("INSERT INTO t VALUES (1)").await?;
        if tx.level() == 1 {
            panic!("callback blew up");
        }
        Ok::<_, DbError>(())
    }));

    let err = unit.await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(released(&pool), vec![true]);
    assert_eq!(pool.stats().discarded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_unit_discards_connection() {
    let (pool, db) = setup();
    pool.delay_on("slow", Duration::from_secs(10));

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        db.tx(|tx| async move {
            tx.query("SELECT /* slow */ 1").await?;
            Ok::<_, DbError>(())
        }),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(released(&pool), vec![true]);
    assert_eq!(pool.stats().total_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_unit_stops_nested_work() {
    let (pool, db) = setup();

    let result = tokio::time::timeout(
        Duration::from_millis(5),
        db.tx(|tx| async move {
            tx.tx(|sp| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                sp.query("INSERT INTO t VALUES ('inner')").await?;
                Ok::<_, DbError>(())
            })
            .await
        }),
    )
    .await;
    assert!(result.is_err());

    // Let the detached savepoint wake up and try to finish
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = pool.events();
    let discarded = events
        .iter()
        .position(|e| matches!(e, Event::Released { discard: true, .. }))
        .unwrap();
    assert!(
        events[discarded..]
            .iter()
            .all(|e| !matches!(e, Event::Started { .. }))
    );
    assert_eq!(pool.statements(), vec!["BEGIN", "SAVEPOINT sp2"]);
    assert!(pool.committed().is_empty());
}

#[tokio::test]
async fn test_failed_savepoint_open_unwinds_through_parent() {
    let (pool, db) = setup();
    pool.fail_on("SAVEPOINT sp2", DriverError::syntax("savepoint rejected"));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let err = db
        .tx(|tx| async move {
            tx.tx(move |_sp| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, DbError>(())
            })
            .await?;
            Ok::<_, DbError>(())
        })
        .await
        .unwrap_err();

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(err.to_string(), "Syntax error: savepoint rejected");
    assert_eq!(pool.statements(), vec!["BEGIN", "SAVEPOINT sp2", "ROLLBACK"]);
    // The parent rolled back cleanly, so the connection is reusable
    assert_eq!(released(&pool), vec![false]);
}

#[tokio::test]
async fn test_direct_query_releases_by_error_kind() {
    let (pool, db) = setup();
    pool.fail_on("SELEC ", DriverError::syntax("syntax error at or near \"SELEC\""));
    pool.fail_on("pg_terminate", DriverError::connection("terminating connection"));

    db.query(Query::new("INSERT INTO t VALUES ($1)").bind(1)).await.unwrap();
    assert_err!(db.query("SELEC 1").await);
    assert_err!(db.query("SELECT pg_terminate()").await);

    assert_eq!(released(&pool), vec![false, false, true]);
    assert_eq!(pool.stats().discarded, 1);
}

#[tokio::test]
async fn test_pool_exhaustion_propagates() {
    let pool = MemoryPool::with_limits(1, Duration::from_millis(50));
    let db = Executor::new(pool.clone(), ExecutorConfig::new());

    let held = pool.acquire().await.unwrap();
    let err = db.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, DbError::Pool(_)));

    held.release(false);
    assert_ok!(db.query("SELECT 1").await);
}
