//! Pool sharing tests. These never reach a server: pools are lazy and point at
//! a port nothing listens on.

use atomic_pg::error::DbError;
use atomic_pg::models::FilterSpec;
use atomic_pg::{DatabaseSettings, DbAdapter, PoolRegistry};
use std::sync::Arc;

fn unreachable_settings(database: &str) -> DatabaseSettings {
    let mut settings = DatabaseSettings::new(database, "svc", "secret")
        .with_host("127.0.0.1", 1)
        .with_pool_size(0, 2);
    settings.acquire_timeout_secs = 1;
    settings
}

#[tokio::test]
async fn test_adapters_with_equal_settings_share_pool() {
    let registry = Arc::new(PoolRegistry::new());
    let a = DbAdapter::with_registry(unreachable_settings("app"), Arc::clone(&registry));
    let b = DbAdapter::with_registry(unreachable_settings("app"), Arc::clone(&registry));
    let c = DbAdapter::with_registry(unreachable_settings("reports"), Arc::clone(&registry));

    let pa = a.pool().await.unwrap();
    let pb = b.pool().await.unwrap();
    let pc = c.pool().await.unwrap();

    assert!(pa.same_pool(&pb));
    assert!(!pa.same_pool(&pc));
    assert_eq!(registry.pool_count().await, 2);
}

#[tokio::test]
async fn test_concurrent_first_use_creates_one_pool() {
    let registry = Arc::new(PoolRegistry::new());
    let settings = unreachable_settings("app");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        let settings = settings.clone();
        handles.push(tokio::spawn(async move {
            registry.get_pool(&settings, None).await
        }));
    }

    let mut pools = Vec::new();
    for handle in handles {
        pools.push(handle.await.unwrap().unwrap());
    }

    let first = &pools[0];
    assert!(pools.iter().all(|p| p.same_pool(first)));
    assert_eq!(registry.pool_count().await, 1);
}

#[tokio::test]
async fn test_close_affects_every_adapter_on_the_pool() {
    let registry = Arc::new(PoolRegistry::new());
    let a = DbAdapter::with_registry(unreachable_settings("app"), Arc::clone(&registry));
    let b = a.clone();

    let before = b.pool().await.unwrap();
    assert!(a.close().await);
    assert!(before.is_closed());
    assert!(!b.close().await);

    let after = b.pool().await.unwrap();
    assert!(!after.same_pool(&before));
    assert!(!after.is_closed());

    registry.close_all().await;
    assert!(after.is_closed());
    assert_eq!(registry.pool_count().await, 0);
}

#[tokio::test]
async fn test_delete_without_filters_never_leases() {
    let registry = Arc::new(PoolRegistry::new());
    let adapter = DbAdapter::with_registry(unreachable_settings("app"), registry);

    // An unreachable server would surface as a connection error; this must
    // fail before any lease is attempted.
    let err = adapter
        .delete(None, "users", &FilterSpec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::MissingPredicate { .. }), "{err:?}");
}

#[tokio::test]
async fn test_malformed_filters_never_lease() {
    let registry = Arc::new(PoolRegistry::new());
    let adapter = DbAdapter::with_registry(unreachable_settings("app"), registry);

    let filters = FilterSpec::new().with("age__between", 3);
    let err = adapter
        .where_(None, "users", &filters, None, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnsupportedOperator { .. }), "{err:?}");

    let err = adapter
        .update(
            None,
            "users; drop table users",
            &FilterSpec::new().with("id", 1),
            &atomic_pg::ValueMap::new().set("name", "x"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidIdentifier { .. }), "{err:?}");
}

#[tokio::test]
async fn test_unreachable_server_is_retryable_connection_error() {
    let registry = Arc::new(PoolRegistry::new());
    let adapter = DbAdapter::with_registry(unreachable_settings("app"), registry);

    let err = adapter
        .delete(None, "users", &FilterSpec::new().with("id", 1))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
    if let DbError::Timeout { elapsed_secs, .. } = &err {
        assert_eq!(*elapsed_secs, Some(1));
    }

    let report = adapter
        .atomic_report()
        .run(None, |tx| Box::pin(async move { tx.simple("SELECT 1").await }))
        .await;
    assert!(report.is_failed());
}
