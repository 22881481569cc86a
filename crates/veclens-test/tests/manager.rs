//! Connection registry behavior over real adapters.

use std::collections::HashMap;

use veclens_core::{
    ConnectionContext, ConnectionManager, ConnectionState, ErrorKind, MAX_CONNECTIONS,
};
use veclens_test::fixture::{self, ALL_BACKENDS};
use veclens_vector::ConnectionConfig;

#[tokio::test]
async fn test_registry_is_bounded() {
    let mut manager = ConnectionManager::new();
    for i in 0..MAX_CONNECTIONS {
        let kind = ALL_BACKENDS[i % ALL_BACKENDS.len()];
        manager
            .register(format!("conn-{}", i), fixture::adapter(kind, ConnectionContext::new()))
            .unwrap();
    }

    let err = manager
        .register(
            "one-too-many",
            fixture::adapter(ALL_BACKENDS[0], ConnectionContext::new()),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);
    assert_eq!(manager.len(), MAX_CONNECTIONS);

    let first = manager.list()[0].id;
    manager.remove(first).await.unwrap();
    manager
        .register(
            "replacement",
            fixture::adapter(ALL_BACKENDS[0], ConnectionContext::new()),
        )
        .unwrap();
}

#[tokio::test]
async fn test_connect_tracks_state() {
    let mut manager = ConnectionManager::new();
    let ids: Vec<_> = ALL_BACKENDS
        .iter()
        .map(|kind| {
            manager
                .register(kind.to_string(), fixture::adapter(*kind, ConnectionContext::new()))
                .unwrap()
        })
        .collect();

    for id in &ids {
        assert_eq!(manager.state(*id).unwrap(), ConnectionState::Disconnected);
        manager.connect(*id).await.unwrap();
        assert_eq!(manager.state(*id).unwrap(), ConnectionState::Connected);
    }
    assert_eq!(manager.active(), Some(ids[0]));

    let adapter = manager.get(ids[1]).unwrap();
    assert!(adapter.lock().await.list_collections().await.unwrap().is_empty());

    manager.disconnect_all().await.unwrap();
    assert!(
        manager
            .list()
            .iter()
            .all(|summary| summary.state == ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn test_profile_to_registered_columnar_connection() {
    let profile = HashMap::new();
    let config = ConnectionConfig::from_profile("columnar", &profile).unwrap();
    let context = ConnectionContext::new().with_profile_name("scratch");

    let mut manager = ConnectionManager::new();
    let id = manager
        .register("scratch", config.build(context).unwrap())
        .unwrap();
    manager.connect(id).await.unwrap();

    let summary = &manager.list()[0];
    assert_eq!(summary.name, "scratch");
    assert_eq!(summary.backend.to_string(), config.backend_name());
    assert_eq!(summary.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_unknown_connection() {
    let manager = ConnectionManager::new();
    let err = manager.get(uuid::Uuid::new_v4()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
