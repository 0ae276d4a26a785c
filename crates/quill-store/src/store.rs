//! Key-value store trait and the in-memory implementation

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};

/// Asynchronous key-value persistence.
///
/// Writes are durable once they return `Ok`. Failures are propagated to the
/// caller; implementations never retry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when the key is absent
    async fn get(&self, store: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Insert or overwrite a value
    async fn put(&self, store: &str, key: &str, value: Value) -> StoreResult<()>;

    /// Remove a value; removing an absent key is not an error
    async fn delete(&self, store: &str, key: &str) -> StoreResult<()>;

    /// List the keys of a store
    async fn keys(&self, store: &str) -> StoreResult<Vec<String>>;
}

/// Read and deserialize a value.
pub async fn load<T: DeserializeOwned>(
    backend: &dyn KeyValueStore,
    store: &str,
    key: &str,
) -> StoreResult<Option<T>> {
    match backend.get(store, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and write a value.
pub async fn save<T: Serialize + ?Sized>(
    backend: &dyn KeyValueStore,
    store: &str,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    backend.put(store, key, serde_json::to_value(value)?).await
}

/// Remove a value.
pub async fn delete(backend: &dyn KeyValueStore, store: &str, key: &str) -> StoreResult<()> {
    backend.delete(store, key).await
}

/// Reject keys that cannot double as file names.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// In-memory store for testing
#[derive(Default)]
pub struct InMemoryStore {
    stores: Arc<RwLock<HashMap<String, HashMap<String, Value>>>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, store: &str, key: &str) -> StoreResult<Option<Value>> {
        validate_key(key)?;
        Ok(self
            .stores
            .read()
            .await
            .get(store)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, store: &str, key: &str, value: Value) -> StoreResult<()> {
        validate_key(key)?;
        self.stores
            .write()
            .await
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        if let Some(entries) = self.stores.write().await.get_mut(store) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, store: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .stores
            .read()
            .await
            .get(store)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryStore::new();
        store
            .put("settings", "app", serde_json::json!({"a": 1}))
            .await
            .unwrap();

        let value = store.get("settings", "app").await.unwrap();
        assert_eq!(value, Some(serde_json::json!({"a": 1})));
        assert_eq!(store.get("sessions", "app").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let store = InMemoryStore::new();
        let sample = Sample {
            name: "notes".to_string(),
            count: 3,
        };

        save(&store, "settings", "sample", &sample).await.unwrap();
        let loaded: Option<Sample> = load(&store, "settings", "sample").await.unwrap();

        assert_eq!(loaded, Some(sample));
    }

    #[tokio::test]
    async fn test_delete_and_keys() {
        let store = InMemoryStore::new();
        store.put("sessions", "b", Value::Null).await.unwrap();
        store.put("sessions", "a", Value::Null).await.unwrap();

        assert_eq!(store.keys("sessions").await.unwrap(), vec!["a", "b"]);

        store.delete("sessions", "a").await.unwrap();
        store.delete("sessions", "missing").await.unwrap();
        assert_eq!(store.keys("sessions").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let store = InMemoryStore::new();
        let err = store.put("sessions", "../escape", Value::Null).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
