//! Transaction runner tests against the in-memory service.
//!
//! Time is paused, so backoff sleeps complete instantly while
//! `Instant::elapsed` still reports the virtual time spent.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use spanner_client::{
    Code, Error, RunTransactionOptions, RunnerState, ServiceError, Session, SessionSource,
    SpannerRpc, TransactionRunner,
};
use spanner_protocol::{SessionTemplate, TransactionOptions, TransactionSelector};
use spanner_testing::{Method, MockSpanner, TEST_DATABASE, aborted, aborted_with_delay};
use tokio::time::Instant;

async fn create_session(mock: &Arc<MockSpanner>) -> Arc<Session> {
    let rpc: Arc<dyn SpannerRpc> = mock.clone();
    let session = Session::new(rpc, TEST_DATABASE, SessionTemplate::default());
    session.create().await.unwrap();
    Arc::new(session)
}

fn runner(session: &Arc<Session>, options: RunTransactionOptions) -> TransactionRunner {
    TransactionRunner::new(Arc::clone(session), None, options)
}

// =============================================================================
// Retry Classification
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retries_aborted_commit_until_success() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_times(Method::Commit, 3, aborted());
    let session = create_session(&mock).await;

    let invocations = Arc::new(AtomicU32::new(0));
    let mut runner = runner(&session, RunTransactionOptions::default());
    let result = runner
        .run_async(|txn| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                let rows = txn.run_update("UPDATE Accounts SET Balance = 0 WHERE TRUE").await?;
                txn.commit().await?;
                Ok(rows)
            }
        })
        .await
        .unwrap();

    assert_eq!(result, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(runner.attempts(), 3);
    assert_eq!(runner.state(), RunnerState::Succeeded);
    assert_eq!(mock.calls(Method::Commit), 4);
    assert_eq!(mock.commits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_is_retried() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(Method::Commit, ServiceError::new(Code::Unknown, "transport reset"));
    let session = create_session(&mock).await;

    let mut runner = runner(&session, RunTransactionOptions::default());
    runner
        .run_async(|txn| async move {
            txn.commit().await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(runner.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_returned_unchanged() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(
        Method::ExecuteSql,
        ServiceError::new(Code::NotFound, "Table not found: Accounts"),
    );
    let session = create_session(&mock).await;

    let mut runner = runner(&session, RunTransactionOptions::default());
    let err = runner
        .run_async(|txn| async move { txn.run_update("UPDATE Accounts SET x = 1 WHERE TRUE").await })
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(Code::NotFound));
    assert!(!err.is_session_not_found());
    assert_eq!(runner.attempts(), 0);
    assert_eq!(runner.state(), RunnerState::UserError);
}

#[tokio::test(start_paused = true)]
async fn test_user_error_is_not_retried() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;

    let invocations = Arc::new(AtomicU32::new(0));
    let mut runner = runner(&session, RunTransactionOptions::default());
    let err = runner
        .run_async(|_txn| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::custom("insufficient funds"))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "insufficient funds");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Delays
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_info_delay_is_honored() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(Method::Commit, aborted_with_delay(Duration::from_millis(250)));
    let session = create_session(&mock).await;

    let start = Instant::now();
    let mut runner = runner(&session, RunTransactionOptions::default());
    runner
        .run_async(|txn| async move {
            txn.commit().await?;
            Ok(())
        })
        .await
        .unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_without_retry_info() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_times(Method::Commit, 2, aborted());
    let session = create_session(&mock).await;

    let start = Instant::now();
    let mut runner = runner(&session, RunTransactionOptions::default());
    runner
        .run_async(|txn| async move {
            txn.commit().await?;
            Ok(())
        })
        .await
        .unwrap();

    // 2s and 4s base delays, each with under a second of jitter.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(6));
    assert!(elapsed < Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn test_session_not_found_retries_without_delay() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(Method::Commit, ServiceError::session_not_found("gone"));
    let session = create_session(&mock).await;

    let source = Arc::new(RenewingSource {
        mock: Arc::clone(&mock),
        renewed: AtomicU32::new(0),
    });
    let start = Instant::now();
    let mut runner = runner(&session, RunTransactionOptions::default())
        .with_session_source(source.clone());
    runner
        .run_async(|txn| async move {
            txn.commit().await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(runner.attempts(), 1);
    assert_eq!(source.renewed.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_without_source_is_fatal() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    mock.expire_session(session.name().unwrap());

    let invocations = Arc::new(AtomicU32::new(0));
    let mut runner = runner(
        &session,
        RunTransactionOptions::default().timeout(Duration::from_millis(300)),
    );
    let err = runner
        .run_async(|txn| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                txn.run("SELECT 1").await?;
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_session_not_found());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(runner.attempts(), 0);
    assert_eq!(runner.state(), RunnerState::UserError);
    assert_eq!(mock.calls(Method::ExecuteSql), 1);
    assert_eq!(mock.calls(Method::BeginTransaction), 0);
}

// =============================================================================
// Deadline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_exceeded_wraps_last_error() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_times(Method::Commit, 100, aborted());
    let session = create_session(&mock).await;

    let start = Instant::now();
    let mut runner = runner(&session, RunTransactionOptions::default().timeout(Duration::from_secs(10)));
    let err = runner
        .run_async(|txn| async move {
            txn.commit().await?;
            Ok(())
        })
        .await
        .unwrap_err();

    let Error::Deadline(deadline) = &err else {
        panic!("expected deadline error, got {err:?}");
    };
    assert_eq!(deadline.code(), Code::DeadlineExceeded);
    assert_eq!(deadline.last_error().map(|e| e.code), Some(Code::Aborted));
    assert_eq!(err.to_string(), "Deadline for Transaction exceeded.");
    assert_eq!(err.code(), Some(Code::DeadlineExceeded));
    assert_eq!(runner.state(), RunnerState::DeadlineExceeded);
    // Never sleeps past the deadline.
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_first_attempt_runs_with_zero_timeout() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;

    let mut runner = runner(&session, RunTransactionOptions::default().timeout(Duration::ZERO));
    let value = runner
        .run_async(|txn| async move {
            txn.commit().await?;
            Ok("done")
        })
        .await
        .unwrap();

    assert_eq!(value, "done");
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_fails_after_first_retryable_error() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(Method::Commit, aborted());
    let session = create_session(&mock).await;

    let invocations = Arc::new(AtomicU32::new(0));
    let mut runner = runner(&session, RunTransactionOptions::default().timeout(Duration::ZERO));
    let err = runner
        .run_async(|txn| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                txn.commit().await?;
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Deadline(_)));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Transactions Across Attempts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_seqno_strictly_increases_across_attempts() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_times(Method::Commit, 2, aborted());
    let session = create_session(&mock).await;

    let mut runner = runner(&session, RunTransactionOptions::default());
    runner
        .run_async(|txn| async move {
            txn.run_update("UPDATE A SET x = 1 WHERE TRUE").await?;
            txn.run_update("UPDATE B SET y = 2 WHERE TRUE").await?;
            txn.commit().await?;
            Ok(())
        })
        .await
        .unwrap();

    let seqnos: Vec<u64> = mock.executed_sql().iter().map(|r| r.seqno).collect();
    assert_eq!(seqnos.len(), 6);
    assert!(seqnos.windows(2).all(|pair| pair[0] < pair[1]), "{seqnos:?}");
}

/// Runs `statements` updates then a commit, with the first `retries`
/// commits aborted, and returns the sequence numbers the server saw.
fn seqnos_across_retries(retries: u32, statements: usize) -> Vec<u64> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async {
        let mock = Arc::new(MockSpanner::new());
        mock.fail_times(Method::Commit, retries as usize, aborted());
        let session = create_session(&mock).await;

        let mut runner = runner(&session, RunTransactionOptions::default());
        runner
            .run_async(|txn| async move {
                for i in 0..statements {
                    txn.run_update(format!("UPDATE T SET x = {i} WHERE TRUE")).await?;
                }
                txn.commit().await?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(runner.attempts(), retries);

        mock.executed_sql().iter().map(|r| r.seqno).collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_seqno_increases_over_retries(retries in 0u32..4, statements in 1usize..5) {
        let seqnos = seqnos_across_retries(retries, statements);
        prop_assert_eq!(seqnos.len(), (retries as usize + 1) * statements);
        prop_assert!(seqnos.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", seqnos);
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_uses_fresh_begun_transaction() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(Method::Commit, aborted());
    let session = create_session(&mock).await;

    let transactions = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut runner = runner(&session, RunTransactionOptions::default());
    runner
        .run_async(|txn| {
            let transactions = Arc::clone(&transactions);
            async move {
                transactions.lock().push(Arc::clone(&txn));
                txn.run_update("UPDATE A SET x = 1 WHERE TRUE").await?;
                txn.commit().await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let transactions = transactions.lock();
    assert_eq!(transactions.len(), 2);
    assert!(transactions[0].is_ended());
    assert_eq!(transactions[1].attempts(), 1);
    assert_eq!(transactions[1].timeout(), Some(Duration::from_secs(3600)));
    // Attempt 0 begins inline; the retry begins explicitly.
    assert_eq!(mock.calls(Method::BeginTransaction), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pre_bound_transaction_used_for_first_attempt() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;

    let prepared = session.transaction().unwrap();
    prepared.begin().await.unwrap();
    let prepared_id = prepared.id();

    let mut runner = TransactionRunner::new(
        Arc::clone(&session),
        Some(Arc::clone(&prepared)),
        RunTransactionOptions::default(),
    );
    let seen = runner
        .run_async(|txn| async move {
            let id = txn.id();
            txn.commit().await?;
            Ok(id)
        })
        .await
        .unwrap();

    assert_eq!(seen, prepared_id);
}

struct RenewingSource {
    mock: Arc<MockSpanner>,
    renewed: AtomicU32,
}

#[async_trait]
impl SessionSource for RenewingSource {
    async fn renew(&self, _stale: Arc<Session>) -> spanner_client::Result<Arc<Session>> {
        self.renewed.fetch_add(1, Ordering::SeqCst);
        Ok(create_session(&self.mock).await)
    }
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_is_renewed() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    let stale_name = session.name().unwrap().to_string();
    mock.expire_session(&stale_name);

    let source = Arc::new(RenewingSource {
        mock: Arc::clone(&mock),
        renewed: AtomicU32::new(0),
    });
    let mut runner = runner(&session, RunTransactionOptions::default())
        .with_session_source(source.clone());

    runner
        .run_async(|txn| async move {
            txn.run_update("UPDATE A SET x = 1 WHERE TRUE").await?;
            txn.commit().await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(source.renewed.load(Ordering::SeqCst), 1);
    assert_ne!(runner.session().name(), Some(stale_name.as_str()));
    assert_eq!(mock.commits()[0].session, runner.session().name().unwrap());
}

struct PreparingSource {
    mock: Arc<MockSpanner>,
}

#[async_trait]
impl SessionSource for PreparingSource {
    async fn renew(&self, _stale: Arc<Session>) -> spanner_client::Result<Arc<Session>> {
        let session = create_session(&self.mock).await;
        let transaction = session.begin_transaction(TransactionOptions::ReadWrite).await?;
        session.set_prepared_transaction(transaction);
        Ok(session)
    }
}

#[tokio::test(start_paused = true)]
async fn test_renewed_session_prepared_transaction_is_used() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    mock.expire_session(session.name().unwrap());

    let source = Arc::new(PreparingSource {
        mock: Arc::clone(&mock),
    });
    let mut runner = runner(&session, RunTransactionOptions::default()).with_session_source(source);

    let used = runner
        .run_async(|txn| async move {
            txn.run_update("UPDATE A SET x = 1 WHERE TRUE").await?;
            let id = txn.id();
            txn.commit().await?;
            Ok(id)
        })
        .await
        .unwrap();

    assert_eq!(runner.attempts(), 1);
    assert_eq!(mock.calls(Method::BeginTransaction), 1);
    assert!(!runner.session().has_prepared_transaction());
    let used = used.unwrap();
    assert_eq!(mock.commits()[0].transaction, TransactionSelector::Id(used));
}

// =============================================================================
// Intercepting Mode
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_intercepted_errors_never_reach_user_code() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_times(Method::ExecuteSql, 2, aborted());
    let session = create_session(&mock).await;

    let observed = Arc::new(AtomicU32::new(0));
    let mut runner = runner(&session, RunTransactionOptions::default());
    let rows = runner
        .run(|txn| {
            let observed = Arc::clone(&observed);
            async move {
                let rows = match txn.run_update("UPDATE A SET x = 1 WHERE TRUE").await {
                    Ok(rows) => rows,
                    Err(err) => {
                        observed.fetch_add(1, Ordering::SeqCst);
                        return Err(err);
                    }
                };
                txn.commit().await?;
                Ok(rows)
            }
        })
        .await
        .unwrap();

    assert_eq!(rows, 1);
    assert_eq!(observed.load(Ordering::SeqCst), 0);
    assert_eq!(runner.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_intercepting_runner_passes_fatal_errors_through() {
    let mock = Arc::new(MockSpanner::new());
    mock.fail_next(
        Method::ExecuteSql,
        ServiceError::new(Code::InvalidArgument, "Syntax error"),
    );
    let session = create_session(&mock).await;

    let observed = Arc::new(AtomicU32::new(0));
    let mut runner = runner(&session, RunTransactionOptions::default());
    let err = runner
        .run(|txn| {
            let observed = Arc::clone(&observed);
            async move {
                let result = txn.run_update("UPDATE A SET").await;
                if result.is_err() {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
                result
            }
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(Code::InvalidArgument));
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(runner.state(), RunnerState::UserError);
}
