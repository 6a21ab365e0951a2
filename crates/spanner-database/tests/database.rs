//! Database handle tests against the in-memory service.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use spanner_client::{Config, Error, RunTransactionOptions, SessionKind};
use spanner_database::{Database, DatabaseConfig, SessionMode};
use spanner_protocol::{Code, TimestampBound, TransactionOptions, TransactionSelector, Value};
use spanner_session_pool::PoolConfig;
use spanner_testing::{Method, MockSpanner, TEST_DATABASE, aborted};

fn database(mock: &Arc<MockSpanner>, mode: SessionMode) -> Database {
    let config = DatabaseConfig::new(Config::from_database_path(TEST_DATABASE).unwrap())
        .pool(PoolConfig::new().min(1).max(2))
        .mode(mode);
    Database::new(mock.clone(), config).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}

fn borrowed(db: &Database) -> u32 {
    db.session_factory().pool().status().borrowed
}

/// Read-write sessions are prepared in the background before they return
/// to the pool.
async fn all_released(db: &Database) {
    eventually(|| borrowed(db) == 0).await;
}

// =============================================================================
// Single-use Queries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_uses_single_use_snapshot() {
    let mock = Arc::new(MockSpanner::new());
    mock.set_rows(vec![vec![Value::from(7i64)]]);
    let db = database(&mock, SessionMode::Pool);

    let result = db.run("SELECT SingerId FROM Singers").await.unwrap();
    assert_eq!(result.rows, vec![vec![Value::from(7i64)]]);

    let executed = mock.executed_sql();
    assert_eq!(executed.len(), 1);
    assert_eq!(
        executed[0].transaction,
        TransactionSelector::SingleUse(TransactionOptions::ReadOnly(TimestampBound::Strong))
    );
    all_released(&db).await;
}

#[tokio::test(start_paused = true)]
async fn test_run_with_bound() {
    let mock = Arc::new(MockSpanner::new());
    let db = database(&mock, SessionMode::Multiplexed);
    let bound = TimestampBound::MaxStaleness(Duration::from_secs(15));

    db.run_with_bound("SELECT 1", bound).await.unwrap();
    assert_eq!(
        mock.executed_sql()[0].transaction,
        TransactionSelector::SingleUse(TransactionOptions::ReadOnly(bound))
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_renews_expired_session() {
    let mock = Arc::new(MockSpanner::new());
    let db = database(&mock, SessionMode::Pool);
    eventually(|| db.session_factory().pool().status().available == 1).await;
    mock.expire_all_sessions();

    db.run("SELECT 1").await.unwrap();
    assert_eq!(mock.calls(Method::ExecuteSql), 2);
    assert_eq!(mock.deleted_sessions().len(), 1);
    assert_eq!(mock.calls(Method::BeginTransaction), 0);
    all_released(&db).await;
}

#[tokio::test(start_paused = true)]
async fn test_run_returns_fatal_errors() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(
        Method::ExecuteSql,
        spanner_protocol::ServiceError::new(Code::InvalidArgument, "Syntax error"),
    );
    let db = database(&mock, SessionMode::Pool);

    let err = db.run("SELEC 1").await.unwrap_err();
    assert_eq!(err.code(), Some(Code::InvalidArgument));
    assert_eq!(mock.calls(Method::ExecuteSql), 1);
    all_released(&db).await;
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_transaction_retries_aborted_commit() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(Method::Commit, aborted());
    let db = database(&mock, SessionMode::Pool);
    let calls = Arc::new(AtomicU32::new(0));

    let count = db
        .run_transaction(|txn| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let count = txn.run_update("UPDATE Singers SET Active = TRUE WHERE TRUE").await?;
                txn.commit().await?;
                Ok(count)
            }
        })
        .await
        .unwrap();

    assert_eq!(count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(mock.commits().len(), 1);
    all_released(&db).await;
}

#[tokio::test(start_paused = true)]
async fn test_run_transaction_async_returns_user_error() {
    let mock = Arc::new(MockSpanner::new());
    let db = database(&mock, SessionMode::Pool);
    let calls = Arc::new(AtomicU32::new(0));

    let err = db
        .run_transaction_async(|_txn| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::custom("insufficient funds"))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Custom(_)));
    assert_eq!(err.to_string(), "insufficient funds");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    all_released(&db).await;
}

#[tokio::test(start_paused = true)]
async fn test_run_transaction_deadline() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_times(Method::Commit, 100, aborted());
    let db = database(&mock, SessionMode::Pool);

    let err = db
        .run_transaction_async_with_options(
            RunTransactionOptions::default().timeout(Duration::from_secs(10)),
            |txn| async move {
                txn.commit().await?;
                Ok(())
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Deadline(_)));
    assert_eq!(err.code(), Some(Code::DeadlineExceeded));
    all_released(&db).await;
}

#[tokio::test(start_paused = true)]
async fn test_run_transaction_on_multiplexed_session() {
    let mock = Arc::new(MockSpanner::new());
    let db = database(&mock, SessionMode::Multiplexed);

    db.run_transaction(|txn| async move {
        txn.insert("Singers", &["SingerId"], vec![vec![Value::from(1i64)]])?;
        txn.commit().await?;
        Ok(())
    })
    .await
    .unwrap();

    let commits = mock.commits();
    assert_eq!(commits.len(), 1);
    let session = db.session_factory().multiplexed().current().unwrap();
    assert_eq!(commits[0].session, session.name().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_run_partitioned_update() {
    let mock = Arc::new(MockSpanner::new());
    mock.set_row_count(42);
    let db = database(&mock, SessionMode::Pool);

    let count = db
        .run_partitioned_update("DELETE FROM Albums WHERE TRUE")
        .await
        .unwrap();
    assert_eq!(count, 42);
    assert_eq!(mock.calls(Method::BeginTransaction), 1);
    all_released(&db).await;
}

// =============================================================================
// Sessions and Closing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_get_session_and_release() {
    let mock = Arc::new(MockSpanner::new());
    let db = database(&mock, SessionMode::Pool);

    let lease = db.get_session(SessionKind::ReadOnly).await.unwrap();
    assert_eq!(borrowed(&db), 1);
    db.release(&lease.session).unwrap();
    all_released(&db).await;
}

#[tokio::test(start_paused = true)]
async fn test_close_rejects_later_calls() {
    let mock = Arc::new(MockSpanner::new());
    let db = database(&mock, SessionMode::Pool);
    db.run("SELECT 1").await.unwrap();

    db.close().await.unwrap();
    let err = db.run("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::SessionUnavailable(_)));
    assert!(err.to_string().contains("Database is closed."));
}

#[tokio::test(start_paused = true)]
async fn test_close_reports_leaked_sessions() {
    let mock = Arc::new(MockSpanner::new());
    let db = database(&mock, SessionMode::Pool);
    let _lease = db.get_session(SessionKind::ReadWrite).await.unwrap();

    let err = db.close().await.unwrap_err();
    assert!(err.to_string().contains("1 session leak(s) detected."));
}
