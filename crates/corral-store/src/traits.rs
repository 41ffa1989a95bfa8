//! The shared store interface used by every coordination primitive.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::script::Script;
use crate::script::ScriptOutcome;

/// Network key-value store shared by all processes.
///
/// Implementations must honour store-native TTLs: an expired key is absent
/// for every operation, whether or not it has been physically removed.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Write a value with `ttl` only if the key does not exist.
    ///
    /// Returns true if the value was written. This is a single atomic
    /// operation, never an existence check followed by a write.
    async fn set_if_not_exists(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError>;

    /// Delete a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Execute an atomic read-modify-write on the store side.
    async fn eval(&self, script: Script) -> Result<ScriptOutcome, StoreError>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

#[async_trait]
impl<T: SharedStore + ?Sized> SharedStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn set_if_not_exists(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_if_not_exists(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key).await
    }

    async fn eval(&self, script: Script) -> Result<ScriptOutcome, StoreError> {
        (**self).eval(script).await
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}
