//! Session factory routing tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use spanner_client::{Config, Error, SessionKind, SessionSource};
use spanner_database::{
    DatabaseConfig, MULTIPLEXED_PARTITIONED_OPS_ENV, MULTIPLEXED_SESSIONS_ENV, SessionFactory,
    SessionMode,
};
use spanner_session_pool::PoolConfig;
use spanner_testing::{Method, MockSpanner, TEST_DATABASE};

fn config(mode: SessionMode) -> DatabaseConfig {
    DatabaseConfig::new(Config::from_database_path(TEST_DATABASE).unwrap())
        .pool(PoolConfig::new().min(2).max(4))
        .mode(mode)
}

fn factory(mock: &Arc<MockSpanner>, config: &DatabaseConfig) -> SessionFactory {
    SessionFactory::new(mock.clone(), config).unwrap()
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

// =============================================================================
// Construction
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pool_mode_opens_pool_only() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Pool));
    assert_eq!(factory.mode(), SessionMode::Pool);
    assert!(!factory.is_multiplexed_enabled());

    eventually(|| factory.pool().status().available == 2).await;
    assert!(factory.pool().is_open());
    assert_eq!(mock.calls(Method::CreateSession), 0);
    assert!(factory.multiplexed().current().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_multiplexed_mode_creates_both() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Multiplexed));
    assert!(factory.is_multiplexed_enabled());

    eventually(|| factory.multiplexed().current().is_some()).await;
    eventually(|| factory.pool().status().available == 2).await;
    assert_eq!(mock.calls(Method::CreateSession), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mock = Arc::new(MockSpanner::new());
    let config = config(SessionMode::Pool).pool(PoolConfig::new().min(5).max(2));
    let err = SessionFactory::new(mock.clone(), &config).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_mode_from_environment() {
    let mock = Arc::new(MockSpanner::new());
    let client = Config::from_database_path(TEST_DATABASE).unwrap();
    let config = DatabaseConfig::new(client)
        .pool(PoolConfig::new().min(1).max(2))
        .with_env_lookup(|key| {
            (key == MULTIPLEXED_SESSIONS_ENV || key == MULTIPLEXED_PARTITIONED_OPS_ENV)
                .then(|| "true".to_string())
        });

    let factory = factory(&mock, &config);
    assert!(factory.is_multiplexed_enabled());
    assert!(factory.is_multiplexed_enabled_for_partitioned_ops());
}

#[tokio::test(start_paused = true)]
async fn test_client_role_and_labels_reach_sessions() {
    let mock = Arc::new(MockSpanner::new());
    let client = Config::from_database_path(TEST_DATABASE)
        .unwrap()
        .database_role("auditor")
        .label("env", "test");
    let config = DatabaseConfig::new(client)
        .pool(PoolConfig::new().min(1).max(2))
        .mode(SessionMode::Multiplexed);
    let factory = factory(&mock, &config);

    let pooled = factory.pool().get_session(SessionKind::ReadOnly).await.unwrap();
    let info = pooled.get_metadata().await.unwrap();
    assert_eq!(info.creator_role.as_deref(), Some("auditor"));
    assert_eq!(info.labels.get("env").map(String::as_str), Some("test"));

    let lease = factory.get_session(SessionKind::ReadOnly).await.unwrap();
    let info = lease.session.get_metadata().await.unwrap();
    assert!(info.multiplexed);
    assert_eq!(info.creator_role.as_deref(), Some("auditor"));
    assert_eq!(info.labels.get("env").map(String::as_str), Some("test"));
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pool_leases_must_be_released_once() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Pool));

    let lease = factory.get_session(SessionKind::ReadOnly).await.unwrap();
    assert!(!lease.session.is_multiplexed());
    assert_eq!(lease.transaction.session_name(), lease.session.name().unwrap());
    assert_eq!(factory.pool().status().borrowed, 1);

    factory.release(&lease.session).unwrap();
    let err = factory.release(&lease.session).unwrap_err();
    assert!(matches!(err, Error::SessionUnavailable(_)));
    assert!(err.to_string().contains("Unable to release unknown session."));
}

#[tokio::test(start_paused = true)]
async fn test_write_lease_uses_prepared_transaction() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Pool));

    let lease = factory.get_session(SessionKind::ReadWrite).await.unwrap();
    assert!(lease.transaction.id().is_some());
    assert!(!lease.session.has_prepared_transaction());
    factory.release(&lease.session).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_multiplexed_release_is_noop() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Multiplexed));

    let first = factory.get_session(SessionKind::ReadWrite).await.unwrap();
    let second = factory.get_session(SessionKind::ReadOnly).await.unwrap();
    assert!(first.session.is_multiplexed());
    assert!(Arc::ptr_eq(&first.session, &second.session));

    factory.release(&first.session).unwrap();
    factory.release(&first.session).unwrap();
    assert_eq!(factory.pool().status().borrowed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_ops_need_both_toggles() {
    let mock = Arc::new(MockSpanner::new());

    let only_regular = factory(&mock, &config(SessionMode::Multiplexed));
    let lease = only_regular.get_session_for_partitioned_ops().await.unwrap();
    assert!(!lease.session.is_multiplexed());
    only_regular.release(&lease.session).unwrap();

    let both = factory(
        &mock,
        &config(SessionMode::Multiplexed).multiplexed_partitioned_ops(true),
    );
    let lease = both.get_session_for_partitioned_ops().await.unwrap();
    assert!(lease.session.is_multiplexed());

    let pool_only = factory(
        &mock,
        &config(SessionMode::Pool).multiplexed_partitioned_ops(true),
    );
    let lease = pool_only.get_session_for_partitioned_ops().await.unwrap();
    assert!(!lease.session.is_multiplexed());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_maps_to_session_unavailable() {
    let mock = Arc::new(MockSpanner::new());
    let config = config(SessionMode::Pool).pool(PoolConfig::new().min(1).max(1).fail(true));
    let factory = factory(&mock, &config);

    let _held = factory.get_session(SessionKind::ReadOnly).await.unwrap();
    let err = factory.get_session(SessionKind::ReadOnly).await.unwrap_err();
    assert!(matches!(err, Error::SessionUnavailable(_)));
    assert_eq!(err.to_string(), "session unavailable: No resources available.");
}

// =============================================================================
// Renewal
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_renew_discards_pooled_session() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Pool));

    let stale = factory.get_session(SessionKind::ReadWrite).await.unwrap().session;
    let stale_name = stale.name().unwrap().to_string();
    mock.expire_session(&stale_name);

    let renewed = factory.renew(Arc::clone(&stale)).await.unwrap();
    assert_ne!(renewed.name(), stale.name());
    assert!(mock.deleted_sessions().contains(&stale_name));
    assert_eq!(factory.pool().status().borrowed, 1);
    factory.release(&renewed).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_renew_for_reads_skips_transaction_preparation() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Pool));
    eventually(|| factory.pool().status().available == 2).await;

    let stale = factory.get_session(SessionKind::ReadOnly).await.unwrap().session;
    mock.expire_session(stale.name().unwrap());

    let renewed = factory.renew_for(stale, SessionKind::ReadOnly).await.unwrap();
    assert!(!renewed.has_prepared_transaction());
    assert_eq!(mock.calls(Method::BeginTransaction), 0);
    factory.release(&renewed).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_renew_for_writes_keeps_prepared_transaction() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Pool));
    eventually(|| factory.pool().status().available == 2).await;

    let stale = factory.get_session(SessionKind::ReadOnly).await.unwrap().session;
    mock.expire_session(stale.name().unwrap());

    let renewed = factory.renew_for(stale, SessionKind::ReadWrite).await.unwrap();
    assert!(renewed.has_prepared_transaction());
    assert_eq!(mock.calls(Method::BeginTransaction), 1);
    factory.release(&renewed).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_renew_replaces_multiplexed_session() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Multiplexed));

    let stale = factory.get_session(SessionKind::ReadWrite).await.unwrap().session;
    mock.expire_session(stale.name().unwrap());

    let renewed = factory.renew(Arc::clone(&stale)).await.unwrap();
    assert!(renewed.is_multiplexed());
    assert!(!Arc::ptr_eq(&stale, &renewed));
    assert_eq!(factory.multiplexed().generation(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_closes_pool() {
    let mock = Arc::new(MockSpanner::new());
    let factory = factory(&mock, &config(SessionMode::Multiplexed));
    eventually(|| factory.pool().status().available == 2).await;

    factory.close().await.unwrap();
    assert!(factory.pool().is_closed());
    assert!(!factory.multiplexed().is_maintained());
    assert_eq!(mock.deleted_sessions().len(), 2);
}
