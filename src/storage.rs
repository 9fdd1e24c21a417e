//! Durable preference storage
//!
//! Timeline preferences are the only durable state the core owns. The
//! Postgres store serializes them as JSON in a single-row-per-viewer table;
//! the in-memory store backs tests and single-node runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_postgres::{Client, NoTls};

use crate::resolver::TimelinePreferences;

/// Errors surfaced by the preference store
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("data error: {0}")]
    Data(String),
}

/// Persistence seam for timeline preferences
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    async fn save(&self, viewer_id: &str, prefs: &TimelinePreferences) -> Result<(), StorageError>;

    async fn fetch(&self, viewer_id: &str) -> Result<Option<TimelinePreferences>, StorageError>;
}

/// Postgres-backed store
pub struct PostgresPreferencesStore {
    client: Arc<Mutex<Client>>,
}

impl PostgresPreferencesStore {
    /// Connect and make sure the schema exists
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                eprintln!("preferences store connection error: {}", e);
            }
        });

        let store = Self { client: Arc::new(Mutex::new(client)) };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let sql = r#"
            CREATE TABLE IF NOT EXISTS timeline_preferences (
                viewer_id TEXT PRIMARY KEY,
                prefs TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#;
        let client = self.client.lock().await;
        client
            .execute(sql, &[])
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PreferencesStore for PostgresPreferencesStore {
    async fn save(&self, viewer_id: &str, prefs: &TimelinePreferences) -> Result<(), StorageError> {
        let raw = serde_json::to_string(prefs).map_err(|e| StorageError::Data(e.to_string()))?;
        let sql = r#"
            INSERT INTO timeline_preferences (viewer_id, prefs, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (viewer_id) DO UPDATE SET
                prefs = EXCLUDED.prefs,
                updated_at = NOW()
        "#;
        let client = self.client.lock().await;
        client
            .execute(sql, &[&viewer_id, &raw])
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(())
    }

    async fn fetch(&self, viewer_id: &str) -> Result<Option<TimelinePreferences>, StorageError> {
        let sql = "SELECT prefs FROM timeline_preferences WHERE viewer_id = $1";
        let client = self.client.lock().await;
        let rows = client
            .query(sql, &[&viewer_id])
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        match rows.first() {
            Some(row) => {
                let raw: String = row.get(0);
                let prefs =
                    serde_json::from_str(&raw).map_err(|e| StorageError::Data(e.to_string()))?;
                Ok(Some(prefs))
            }
            None => Ok(None),
        }
    }
}

/// In-memory store for tests and single-node deployments
pub struct MemoryPreferencesStore {
    entries: RwLock<HashMap<String, TimelinePreferences>>,
}

impl MemoryPreferencesStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPreferencesStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferencesStore for MemoryPreferencesStore {
    async fn save(&self, viewer_id: &str, prefs: &TimelinePreferences) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .insert(viewer_id.to_string(), prefs.clone());
        Ok(())
    }

    async fn fetch(&self, viewer_id: &str) -> Result<Option<TimelinePreferences>, StorageError> {
        Ok(self.entries.read().await.get(viewer_id).cloned())
    }
}
