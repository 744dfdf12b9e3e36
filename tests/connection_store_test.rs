//! File-backed connection store used through the `ConnectionDirectory` seam.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use conduit::connections::{ConnectionContext, ConnectionDirectory, ConnectionStore, Credentials};
use conduit::WorkerError;
use serde_json::{json, Map};

fn key(byte: u8) -> String {
    BASE64.encode([byte; 32])
}

fn context() -> ConnectionContext {
    let mut settings = Map::new();
    settings.insert("include_shared_drives".to_string(), json!(false));
    ConnectionContext {
        connection_id: "conn-1".to_string(),
        customer_id: "cust-1".to_string(),
        integration_id: Some("google-drive".to_string()),
        provider: "google-drive".to_string(),
        external_id: Some("Alice@Example.com".to_string()),
        credentials: Credentials::bearer("ya29.secret"),
        settings,
        cursor: Some(json!({"page_token": "42"})),
    }
}

#[tokio::test]
async fn test_connections_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("connections.db");

    {
        let store = ConnectionStore::open(&path, &key(7)).unwrap();
        store.upsert(&context()).unwrap();
    }

    let store = ConnectionStore::open(&path, &key(7)).unwrap();
    let ctx = store.fetch_connection_config("conn-1").await.unwrap();
    assert_eq!(ctx.credentials.access_token, "ya29.secret");
    assert!(!ctx.setting_bool("include_shared_drives", true));
    assert_eq!(ctx.cursor, Some(json!({"page_token": "42"})));

    let resolution = store.resolve_by_external_id("alice@example.com").await.unwrap().unwrap();
    assert_eq!(resolution.connection_id, "conn-1");
    assert_eq!(resolution.customer_id, "cust-1");
    assert_eq!(resolution.resolved_via, "store");
}

#[tokio::test]
async fn test_unknown_connection_and_identity() {
    let store = ConnectionStore::open(":memory:", &key(1)).unwrap();
    let err = store.fetch_connection_config("conn-9").await.unwrap_err();
    assert!(matches!(err, WorkerError::NotFound(_)));
    assert!(!err.is_retriable());
    assert!(store.resolve_by_external_id("nobody@example.com").await.unwrap().is_none());
}

#[tokio::test]
async fn test_wrong_key_cannot_read_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("connections.db");
    ConnectionStore::open(&path, &key(7)).unwrap().upsert(&context()).unwrap();

    let store = ConnectionStore::open(&path, &key(8)).unwrap();
    let err = store.fetch_connection_config("conn-1").await.unwrap_err();
    assert!(matches!(err, WorkerError::Transport(_)));
}
