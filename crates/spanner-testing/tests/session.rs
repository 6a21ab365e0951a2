//! Session and transaction tests against the in-memory service.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use futures_util::StreamExt;
use spanner_client::{Error, KEEP_ALIVE_SQL, Session, SessionKind, SpannerRpc};
use spanner_protocol::{
    KeySet, Mutation, SessionTemplate, TimestampBound, TransactionOptions, TransactionSelector,
};
use spanner_testing::{Method, MockSpanner, TEST_DATABASE};

fn rpc(mock: &Arc<MockSpanner>) -> Arc<dyn SpannerRpc> {
    mock.clone()
}

async fn create_session(mock: &Arc<MockSpanner>) -> Arc<Session> {
    let session = Session::new(rpc(mock), TEST_DATABASE, SessionTemplate::default());
    session.create().await.unwrap();
    Arc::new(session)
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test]
async fn test_create_assigns_name_once() {
    let mock = Arc::new(MockSpanner::new());
    let session = Session::new(rpc(&mock), TEST_DATABASE, SessionTemplate::default());
    assert!(session.name().is_none());
    assert!(matches!(session.delete().await, Err(Error::SessionNotCreated)));

    session.create().await.unwrap();
    let name = session.name().unwrap().to_string();
    assert!(name.starts_with(TEST_DATABASE));
    assert!(session.create_time().is_some());

    // Second create is a no-op.
    session.create().await.unwrap();
    assert_eq!(session.name(), Some(name.as_str()));
    assert_eq!(mock.calls(Method::CreateSession), 1);
}

#[tokio::test]
async fn test_batch_create_may_return_fewer() {
    let mock = Arc::new(MockSpanner::new());
    mock.set_batch_limit(2);

    let sessions = Session::batch_create(&rpc(&mock), TEST_DATABASE, &SessionTemplate::default(), 5)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.name().is_some()));
    assert_ne!(sessions[0].id(), sessions[1].id());
}

#[tokio::test]
async fn test_multiplexed_template() {
    let mock = Arc::new(MockSpanner::new());
    let template = SessionTemplate {
        multiplexed: true,
        ..SessionTemplate::default()
    };
    let session = Session::new(rpc(&mock), TEST_DATABASE, template);
    assert!(session.is_multiplexed());
    session.create().await.unwrap();
    assert!(session.is_multiplexed());

    let info = session.get_metadata().await.unwrap();
    assert!(info.multiplexed);
}

#[tokio::test]
async fn test_keep_alive_runs_select_one() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;

    session.keep_alive().await.unwrap();

    let executed = mock.executed_sql();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].statement.sql, KEEP_ALIVE_SQL);
    assert!(matches!(
        executed[0].transaction,
        TransactionSelector::SingleUse(TransactionOptions::ReadOnly(TimestampBound::Strong))
    ));
}

#[tokio::test]
async fn test_keep_alive_on_expired_session() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    mock.expire_session(session.name().unwrap());

    let err = session.keep_alive().await.unwrap_err();
    assert!(err.is_session_not_found());
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_prepared_transaction_slot() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    assert_eq!(session.kind(), SessionKind::ReadOnly);
    assert!(!session.has_prepared_transaction());

    let txn = session.begin_transaction(TransactionOptions::ReadWrite).await.unwrap();
    session.set_prepared_transaction(txn);
    session.set_kind(SessionKind::ReadWrite);
    assert!(session.has_prepared_transaction());

    let taken = session.take_prepared_transaction().unwrap();
    assert!(taken.id().is_some());
    assert!(!session.has_prepared_transaction());
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test]
async fn test_inline_begin_records_id() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    let txn = session.transaction().unwrap();
    assert!(txn.id().is_none());

    txn.run("SELECT 1").await.unwrap();
    let id = txn.id().unwrap();
    assert!(txn.begin_time().is_some());

    txn.run("SELECT 2").await.unwrap();
    let executed = mock.executed_sql();
    assert!(matches!(executed[0].transaction, TransactionSelector::Begin(_)));
    assert_eq!(executed[1].transaction, TransactionSelector::Id(id));
}

#[tokio::test]
async fn test_seqno_increments_per_statement() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    let txn = session.transaction().unwrap();
    assert_eq!(txn.seqno(), 1);

    txn.run_update("UPDATE A SET x = 1 WHERE TRUE").await.unwrap();
    txn.run_update("UPDATE A SET x = 2 WHERE TRUE").await.unwrap();
    let mut stream = txn.run_stream("SELECT * FROM A").await.unwrap();
    while stream.next().await.is_some() {}

    let seqnos: Vec<u64> = mock.executed_sql().iter().map(|r| r.seqno).collect();
    assert_eq!(seqnos, vec![1, 2, 3]);
    assert_eq!(txn.seqno(), 4);

    // Never moves backwards.
    txn.resume_sequence_from(2);
    assert_eq!(txn.seqno(), 4);
    txn.resume_sequence_from(10);
    assert_eq!(txn.seqno(), 10);
}

#[tokio::test]
async fn test_commit_sends_buffered_mutations() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    let txn = session.transaction().unwrap();

    txn.insert("Singers", &["SingerId", "Name"], vec![vec![1.into(), "Marc".into()]])
        .unwrap();
    txn.delete_rows("Albums", KeySet::all()).unwrap();
    let response = txn.commit().await.unwrap();
    assert!(response.commit_timestamp.is_some());
    assert!(txn.is_ended());

    let commits = mock.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].mutations.len(), 2);
    assert!(matches!(commits[0].mutations[0], Mutation::Insert(_)));
    // Never begun, so it commits as a single-use transaction.
    assert!(matches!(commits[0].transaction, TransactionSelector::SingleUse(_)));

    assert!(matches!(txn.commit().await, Err(Error::TransactionEnded)));
    assert!(matches!(txn.run("SELECT 1").await, Err(Error::TransactionEnded)));
}

#[tokio::test]
async fn test_rollback_requires_begun_transaction() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;

    let txn = session.transaction().unwrap();
    let err = txn.rollback().await.unwrap_err();
    assert_eq!(err.to_string(), "Transaction ID is unknown, nothing to rollback.");

    let txn = session.begin_transaction(TransactionOptions::ReadWrite).await.unwrap();
    txn.rollback().await.unwrap();
    assert!(txn.is_ended());
    assert_eq!(mock.calls(Method::Rollback), 1);
}

#[tokio::test]
async fn test_read_only_transaction_rejects_writes() {
    let mock = Arc::new(MockSpanner::new());
    let session = create_session(&mock).await;
    let snapshot = session.snapshot(TimestampBound::Strong).unwrap();

    assert!(matches!(
        snapshot.run_update("UPDATE A SET x = 1 WHERE TRUE").await,
        Err(Error::ReadOnly(_))
    ));
    assert!(matches!(
        snapshot.insert("A", &["x"], vec![vec![1.into()]]),
        Err(Error::ReadOnly(_))
    ));
    assert!(matches!(snapshot.commit().await, Err(Error::ReadOnly(_))));

    snapshot.read("A", &["x"], KeySet::all()).await.unwrap();
    assert!(snapshot.id().is_some());
}
