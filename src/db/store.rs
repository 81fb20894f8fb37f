use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::error;

use crate::errors::AppError;

/// Durable string-keyed map of JSON documents.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn keys(&self) -> Result<Vec<String>, AppError>;
    async fn get(&self, key: &str) -> Result<Option<Value>, AppError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), AppError>;
    /// Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), AppError>;
}

/// SQLite-backed store. Each instance sees only the rows of its namespace.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    namespace: &'static str,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, namespace: &'static str) -> Self {
        Self { pool, namespace }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn keys(&self) -> Result<Vec<String>, AppError> {
        sqlx::query_scalar::<_, String>("SELECT key FROM kv_store WHERE namespace = $1 ORDER BY key")
            .bind(self.namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list keys in {}: {e}", self.namespace);
                AppError::store_query(format!("Failed to list keys in {}", self.namespace), e)
            })
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        let raw = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_store WHERE namespace = $1 AND key = $2",
        )
        .bind(self.namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read {}/{key}: {e}", self.namespace);
            AppError::store_query(format!("Failed to read {key}"), e)
        })?;

        raw.map(|text| serde_json::from_str(&text).map_err(AppError::from))
            .transpose()
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), AppError> {
        let text = serde_json::to_string(&value)?;
        sqlx::query(
            "INSERT INTO kv_store (namespace, key, value, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (namespace, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(self.namespace)
        .bind(key)
        .bind(text)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to write {}/{key}: {e}", self.namespace);
            AppError::store_query(format!("Failed to write {key}"), e)
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM kv_store WHERE namespace = $1 AND key = $2")
            .bind(self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete {}/{key}: {e}", self.namespace);
                AppError::store_query(format!("Failed to delete {key}"), e)
            })?;
        Ok(())
    }
}

/// Process-local store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn keys(&self) -> Result<Vec<String>, AppError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), AppError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Store whose every call fails while `failing` is set.
#[cfg(test)]
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStore {
    pub fn broken() -> Self {
        Self { inner: MemoryStore::new(), failing: std::sync::atomic::AtomicBool::new(true) }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError::store_query("store offline", sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl KeyValueStore for FailingStore {
    async fn keys(&self) -> Result<Vec<String>, AppError> {
        self.check()?;
        self.inner.keys().await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), AppError> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.check()?;
        self.inner.delete(key).await
    }
}
