//! Per-key state store contract
//!
//! The evaluator never implements persistent state itself. It resolves a
//! [`StateInternals`] for each (step, key) pair and hands it to the user
//! function. Implementations are expected to be non-blocking.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StateError, StateResult};
use crate::window::Window;

/// State store bound to exactly one (step, key) pair
///
/// Keys and values are byte-oriented. Use [`StateInternalsExt`] for typed
/// access and [`namespaced_key`] to scope state to a window.
#[async_trait]
pub trait StateInternals: Send + Sync {
    /// Retrieve a value for the given key
    ///
    /// Returns `Ok(None)` if the key does not exist or has expired.
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    /// Store a value for the given key, overwriting any previous value
    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &[u8]) -> StateResult<()>;

    /// List all keys with the given prefix. Empty prefix matches all keys.
    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>>;

    /// Clear all state
    async fn clear(&self) -> StateResult<()> {
        let keys = self.list_keys(b"").await?;
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }

    /// Get the number of keys
    async fn count(&self) -> StateResult<usize> {
        Ok(self.list_keys(b"").await?.len())
    }

    /// Check if a key exists
    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Typed access on top of the byte-oriented store
#[async_trait]
pub trait StateInternalsExt: StateInternals {
    /// Read and decode a value
    async fn read_value<T>(&self, key: &[u8]) -> StateResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => bincode::deserialize(&bytes).map(Some).map_err(|e| {
                StateError::DeserializationFailed {
                    key: String::from_utf8_lossy(key).into_owned(),
                    reason: e.to_string(),
                }
            }),
            None => Ok(None),
        }
    }

    /// Encode and store a value
    async fn write_value<T>(&self, key: &[u8], value: &T) -> StateResult<()>
    where
        T: Serialize + Sync,
    {
        let bytes = bincode::serialize(value).map_err(|e| StateError::SerializationFailed {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })?;
        self.put(key, &bytes).await
    }
}

impl<S: StateInternals + ?Sized> StateInternalsExt for S {}

/// Build a state key scoped to a window
pub fn namespaced_key(window: &Window, tag: &str) -> Vec<u8> {
    format!("{}/{}", window.id, tag).into_bytes()
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn test_key(id: u32) -> Vec<u8> {
        format!("test:{}", id).into_bytes()
    }

    // Generic tests that any StateInternals implementation should pass
    pub async fn test_state_basic_ops<S: StateInternals>(state: S) {
        state.put(&test_key(1), b"value1").await.unwrap();
        assert_eq!(state.get(&test_key(1)).await.unwrap(), Some(b"value1".to_vec()));

        assert_eq!(state.get(&test_key(999)).await.unwrap(), None);

        state.put(&test_key(1), b"new_value").await.unwrap();
        assert_eq!(state.get(&test_key(1)).await.unwrap(), Some(b"new_value".to_vec()));

        state.delete(&test_key(1)).await.unwrap();
        assert_eq!(state.get(&test_key(1)).await.unwrap(), None);

        // Deleting a missing key is fine
        state.delete(&test_key(999)).await.unwrap();
    }

    pub async fn test_state_list_keys<S: StateInternals>(state: S) {
        state.clear().await.unwrap();

        state.put(b"global/offset", b"1").await.unwrap();
        state.put(b"global/count", b"2").await.unwrap();
        state.put(b"1000_2000/count", b"3").await.unwrap();

        assert_eq!(state.list_keys(b"global/").await.unwrap().len(), 2);
        assert_eq!(state.list_keys(b"").await.unwrap().len(), 3);
    }

    pub async fn test_state_typed_values<S: StateInternals>(state: S) {
        let key = namespaced_key(&Window::global(), "offset");
        assert_eq!(key, b"global/offset".to_vec());

        state.write_value(&key, &42u64).await.unwrap();
        let value: Option<u64> = state.read_value(&key).await.unwrap();
        assert_eq!(value, Some(42));

        state.put(b"broken", b"\x01").await.unwrap();
        let err = state.read_value::<String>(b"broken").await.unwrap_err();
        assert!(matches!(err, StateError::DeserializationFailed { .. }));
    }
}
