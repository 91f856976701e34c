//! Cache operation interface.

use crate::adapter::SharedTranscoder;
use crate::backend::CacheValue;
use crate::config::ServerAddr;
use crate::error::MemcacheResult;
use crate::transcoder::Transcoder;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Stable cache operations, independent of the underlying client.
///
/// Every method that talks to a server fails with exactly one of
/// [`MemcacheError::Timeout`](crate::MemcacheError::Timeout) or
/// [`MemcacheError::Operation`](crate::MemcacheError::Operation).
///
/// Expirations are in seconds, `0` meaning "never". Values above 30 days are
/// interpreted by the server as absolute unix timestamps.
///
/// The `_with` forms take an application [`Transcoder`]. Pass the same
/// [`SharedTranscoder`] handle on every call so the client can reuse the
/// adapter built for it.
#[async_trait]
pub trait MemcacheClient: Send + Sync {
    /// Store `value` only if `key` is absent.
    ///
    /// Returns `false` without touching the stored value if `key` exists.
    async fn add(&self, key: &str, expiration: u32, value: &CacheValue) -> MemcacheResult<bool>;

    /// Store `value` only if `key` is absent, encoded with `transcoder`.
    async fn add_with<T>(
        &self,
        key: &str,
        expiration: u32,
        value: &T,
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<bool>
    where
        T: Send + Sync + 'static;

    /// Store `value` unconditionally.
    async fn set(&self, key: &str, expiration: u32, value: &CacheValue) -> MemcacheResult<bool>;

    /// Store `value` unconditionally, encoded with `transcoder`.
    async fn set_with<T>(
        &self,
        key: &str,
        expiration: u32,
        value: &T,
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<bool>
    where
        T: Send + Sync + 'static;

    /// Fetch `key`. A miss is `Ok(None)`.
    async fn get(&self, key: &str) -> MemcacheResult<Option<CacheValue>>;

    /// Fetch `key` and decode it with `transcoder`.
    async fn get_with<T>(
        &self,
        key: &str,
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<Option<T>>
    where
        T: Send + Sync + 'static;

    /// Like [`get_with`](Self::get_with), waiting at most `timeout` instead of
    /// the configured operation timeout.
    async fn get_with_timeout<T>(
        &self,
        key: &str,
        transcoder: &SharedTranscoder<T>,
        timeout: Duration,
    ) -> MemcacheResult<Option<T>>
    where
        T: Send + Sync + 'static;

    /// Fetch many keys. Absent keys are omitted; nothing found is an empty map.
    async fn get_bulk(&self, keys: &[String]) -> MemcacheResult<HashMap<String, CacheValue>>;

    /// Fetch many keys and decode them with `transcoder`.
    async fn get_bulk_with<T>(
        &self,
        keys: &[String],
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<HashMap<String, T>>
    where
        T: Send + Sync + 'static;

    /// Increment an existing counter. Returns `None` if `key` is absent.
    async fn incr(&self, key: &str, by: u64) -> MemcacheResult<Option<u64>>;

    /// Increment a counter, creating it with `default` if absent.
    async fn incr_or(&self, key: &str, by: u64, default: u64) -> MemcacheResult<u64>;

    /// Increment a counter, creating it with `default` and `expiration` if absent.
    ///
    /// `expiration` is the lifetime of the created counter on the server. It
    /// is unrelated to the operation timeout, which only bounds the wait.
    async fn incr_or_with_expiration(
        &self,
        key: &str,
        by: u64,
        default: u64,
        expiration: u32,
    ) -> MemcacheResult<u64>;

    /// Decrement an existing counter, saturating at zero. Returns `None` if
    /// `key` is absent.
    async fn decr(&self, key: &str, by: u64) -> MemcacheResult<Option<u64>>;

    /// Decrement a counter, creating it with `default` if absent.
    async fn decr_or(&self, key: &str, by: u64, default: u64) -> MemcacheResult<u64>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> MemcacheResult<bool>;

    /// Remove every key on every server.
    ///
    /// **Warning:** This affects all applications sharing the cluster.
    async fn flush(&self) -> MemcacheResult<()>;

    /// Release the underlying client. Never fails; teardown errors are logged.
    async fn shutdown(&self);

    /// Snapshot of the servers currently reachable. Empty rather than failing.
    fn available_servers(&self) -> Vec<ServerAddr>;

    /// The underlying client's own codec, usable as an application transcoder.
    fn default_transcoder(&self) -> Arc<dyn Transcoder<CacheValue>>;
}
