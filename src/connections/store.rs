//! SQLite-backed connection directory.

use super::{ConnectionContext, ConnectionDirectory, ConnectionResolution, Credentials, TokenCipher};
use crate::error::{WorkerError, WorkerResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    connection_id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    integration_id TEXT,
    provider TEXT NOT NULL,
    external_id TEXT,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    expires_at TEXT,
    settings TEXT NOT NULL DEFAULT '{}',
    cursor TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_connections_external_id ON connections(external_id);
CREATE INDEX IF NOT EXISTS idx_connections_customer ON connections(customer_id);
"#;

const SELECT_COLUMNS: &str = "connection_id, customer_id, integration_id, provider, external_id, \
     access_token, refresh_token, expires_at, settings, cursor";

/// Connection records with access and refresh tokens sealed at rest.
///
/// `external_id` is stored lower-cased so email lookups are
/// case-insensitive.
pub struct ConnectionStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

/// Columns as read, before tokens are opened.
struct StoredRow {
    connection_id: String,
    customer_id: String,
    integration_id: Option<String>,
    provider: String,
    external_id: Option<String>,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<String>,
    settings: String,
    cursor: Option<String>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            connection_id: row.get(0)?,
            customer_id: row.get(1)?,
            integration_id: row.get(2)?,
            provider: row.get(3)?,
            external_id: row.get(4)?,
            access_token: row.get(5)?,
            refresh_token: row.get(6)?,
            expires_at: row.get(7)?,
            settings: row.get(8)?,
            cursor: row.get(9)?,
        })
    }
}

impl ConnectionStore {
    /// Open or create the store at `db_path` (`":memory:"` works too).
    pub fn open<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = TokenCipher::from_base64(encryption_key).context("Invalid connections encryption key")?;
        let conn = Connection::open(db_path).context("Failed to open connections database")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create connections schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Insert or replace a connection.
    pub fn upsert(&self, context: &ConnectionContext) -> Result<()> {
        let access_token = self
            .cipher
            .seal(&context.credentials.access_token)
            .context("Failed to seal access token")?;
        let refresh_token = context
            .credentials
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.seal(t))
            .transpose()
            .context("Failed to seal refresh token")?;
        let settings = serde_json::to_string(&context.settings).context("Failed to encode settings")?;
        let cursor = context
            .cursor
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode cursor")?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO connections (
                    connection_id, customer_id, integration_id, provider, external_id,
                    access_token, refresh_token, expires_at, settings, cursor,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                ON CONFLICT(connection_id) DO UPDATE SET
                    customer_id = excluded.customer_id,
                    integration_id = excluded.integration_id,
                    provider = excluded.provider,
                    external_id = excluded.external_id,
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    settings = excluded.settings,
                    cursor = excluded.cursor,
                    updated_at = excluded.updated_at
                "#,
                params![
                    context.connection_id,
                    context.customer_id,
                    context.integration_id,
                    context.provider,
                    context.external_id.as_deref().map(str::to_lowercase),
                    access_token,
                    refresh_token,
                    context.credentials.expires_at.map(|t| t.to_rfc3339()),
                    settings,
                    cursor,
                    now,
                ],
            )
            .context("Failed to upsert connection")?;

        debug!(connection_id = %context.connection_id, "Stored connection");
        Ok(())
    }

    pub fn get(&self, connection_id: &str) -> Result<Option<ConnectionContext>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {} FROM connections WHERE connection_id = ?1", SELECT_COLUMNS),
                params![connection_id],
                StoredRow::from_row,
            )
            .optional()
            .context("Failed to query connection")?
        };
        row.map(|r| self.decode(r)).transpose()
    }

    pub fn find_by_external_id(&self, external_id: &str) -> Result<Option<ConnectionContext>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!(
                    "SELECT {} FROM connections WHERE external_id = ?1 ORDER BY updated_at DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![external_id.to_lowercase()],
                StoredRow::from_row,
            )
            .optional()
            .context("Failed to query connection by external id")?
        };
        row.map(|r| self.decode(r)).transpose()
    }

    /// Persist a new continuation cursor.
    pub fn update_cursor(&self, connection_id: &str, cursor: &Value) -> Result<bool> {
        let encoded = serde_json::to_string(cursor).context("Failed to encode cursor")?;
        let rows = self
            .conn
            .lock()
            .execute(
                "UPDATE connections SET cursor = ?1, updated_at = ?2 WHERE connection_id = ?3",
                params![encoded, Utc::now().to_rfc3339(), connection_id],
            )
            .context("Failed to update cursor")?;
        Ok(rows > 0)
    }

    pub fn delete(&self, connection_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .execute("DELETE FROM connections WHERE connection_id = ?1", params![connection_id])
            .context("Failed to delete connection")?;
        Ok(rows > 0)
    }

    pub fn list_by_customer(&self, customer_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT connection_id FROM connections WHERE customer_id = ?1 ORDER BY connection_id")
            .context("Failed to prepare query")?;
        let ids = stmt
            .query_map(params![customer_id], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("Failed to read results")?;
        Ok(ids)
    }

    fn decode(&self, row: StoredRow) -> Result<ConnectionContext> {
        let access_token = self.cipher.open(&row.access_token).context("Failed to open access token")?;
        let refresh_token = row
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.open(t))
            .transpose()
            .context("Failed to open refresh token")?;
        let expires_at = row
            .expires_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .context("Failed to parse expires_at")?;
        let settings: Map<String, Value> = serde_json::from_str(&row.settings).context("Corrupt settings column")?;
        let cursor = row
            .cursor
            .map(|c| serde_json::from_str(&c))
            .transpose()
            .context("Corrupt cursor column")?;

        Ok(ConnectionContext {
            connection_id: row.connection_id,
            customer_id: row.customer_id,
            integration_id: row.integration_id,
            provider: row.provider,
            external_id: row.external_id,
            credentials: Credentials {
                access_token,
                refresh_token,
                expires_at,
            },
            settings,
            cursor,
        })
    }
}

fn store_error(e: anyhow::Error) -> WorkerError {
    WorkerError::Transport(format!("connection store: {:#}", e))
}

#[async_trait]
impl ConnectionDirectory for ConnectionStore {
    async fn fetch_connection_config(&self, connection_id: &str) -> WorkerResult<ConnectionContext> {
        self.get(connection_id)
            .map_err(store_error)?
            .ok_or_else(|| WorkerError::NotFound(format!("connection '{}'", connection_id)))
    }

    async fn resolve_by_external_id(&self, external_id: &str) -> WorkerResult<Option<ConnectionResolution>> {
        let found = self.find_by_external_id(external_id).map_err(store_error)?;
        Ok(found.map(|ctx| ConnectionResolution {
            external_id: external_id.to_string(),
            connection_id: ctx.connection_id,
            customer_id: ctx.customer_id,
            credentials: ctx.credentials,
            resolved_via: "store".to_string(),
            resolved_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::json;

    fn test_store() -> ConnectionStore {
        ConnectionStore::open(":memory:", &BASE64.encode([0u8; 32])).unwrap()
    }

    fn test_context(id: &str, email: &str) -> ConnectionContext {
        let mut settings = Map::new();
        settings.insert("sync_files".to_string(), json!(true));
        ConnectionContext {
            connection_id: id.to_string(),
            customer_id: "cust-1".to_string(),
            integration_id: Some("drive".to_string()),
            provider: "drive".to_string(),
            external_id: Some(email.to_string()),
            credentials: Credentials {
                access_token: "access-123".to_string(),
                refresh_token: Some("refresh-456".to_string()),
                expires_at: Some(Utc::now()),
            },
            settings,
            cursor: None,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = test_store();
        store.upsert(&test_context("conn-1", "a@example.com")).unwrap();

        let ctx = store.get("conn-1").unwrap().unwrap();
        assert_eq!(ctx.customer_id, "cust-1");
        assert_eq!(ctx.credentials.access_token, "access-123");
        assert_eq!(ctx.credentials.refresh_token.as_deref(), Some("refresh-456"));
        assert!(ctx.setting_bool("sync_files", false));
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_tokens_are_sealed_at_rest() {
        let store = test_store();
        store.upsert(&test_context("conn-1", "a@example.com")).unwrap();

        let raw: String = store
            .conn
            .lock()
            .query_row("SELECT access_token FROM connections", [], |r| r.get(0))
            .unwrap();
        assert!(!raw.contains("access-123"));
    }

    #[test]
    fn test_external_id_lookup_is_case_insensitive() {
        let store = test_store();
        store.upsert(&test_context("conn-1", "Alice@Example.com")).unwrap();

        let ctx = store.find_by_external_id("alice@example.COM").unwrap().unwrap();
        assert_eq!(ctx.connection_id, "conn-1");
    }

    #[test]
    fn test_cursor_update_and_delete() {
        let store = test_store();
        store.upsert(&test_context("conn-1", "a@example.com")).unwrap();

        assert!(store.update_cursor("conn-1", &json!({"page_token": "42"})).unwrap());
        assert_eq!(store.get("conn-1").unwrap().unwrap().cursor, Some(json!({"page_token": "42"})));

        assert_eq!(store.list_by_customer("cust-1").unwrap(), vec!["conn-1"]);
        assert!(store.delete("conn-1").unwrap());
        assert!(!store.delete("conn-1").unwrap());
    }

    #[tokio::test]
    async fn test_directory_contract() {
        let store = test_store();
        store.upsert(&test_context("conn-1", "a@example.com")).unwrap();

        let err = store.fetch_connection_config("nope").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));

        let resolved = store.resolve_by_external_id("a@example.com").await.unwrap().unwrap();
        assert_eq!(resolved.connection_id, "conn-1");
        assert_eq!(resolved.resolved_via, "store");
        assert!(store.resolve_by_external_id("b@example.com").await.unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("connections.db");
        let key = BASE64.encode([3u8; 32]);

        ConnectionStore::open(&path, &key)
            .unwrap()
            .upsert(&test_context("conn-1", "a@example.com"))
            .unwrap();

        let reopened = ConnectionStore::open(&path, &key).unwrap();
        assert!(reopened.get("conn-1").unwrap().is_some());
    }
}
