//! [`MemcacheClient`] implementation over any underlying client.

use crate::adapter::{AdapterCache, SharedTranscoder, TranscoderWrapper};
use crate::backend::{self, BackendTranscoder, CacheValue, CounterInit, MemcachedBackend};
use crate::config::ServerAddr;
use crate::error::{BackendError, BackendResult, MemcacheError, MemcacheResult};
use crate::listener::ReconnectListener;
use crate::traits::MemcacheClient;
use crate::transcoder::Transcoder;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum Counter {
    Incr,
    Decr,
}

impl Counter {
    fn name(self) -> &'static str {
        match self {
            Self::Incr => "incr",
            Self::Decr => "decr",
        }
    }
}

/// The cache client handed to applications.
///
/// Owns the underlying client and the adapters built for application
/// transcoders. Calls on the underlying client are blocking, so each one runs
/// on tokio's blocking pool and is bounded by the operation timeout.
pub struct MemcacheClientWrapper {
    client: Arc<dyn MemcachedBackend>,
    adapters: AdapterCache,
    reconnect: Option<Arc<ReconnectListener>>,
    shut_down: AtomicBool,
}

impl MemcacheClientWrapper {
    /// Wrap an underlying client.
    pub fn new(client: Arc<dyn MemcachedBackend>) -> Self {
        Self {
            client,
            adapters: AdapterCache::new(),
            reconnect: None,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Keep a handle on the reconnect listener registered with the client.
    pub fn with_reconnect_listener(mut self, listener: Arc<ReconnectListener>) -> Self {
        self.reconnect = Some(listener);
        self
    }

    /// The reconnect listener, when the client was built with a maximum away time.
    pub fn reconnect_listener(&self) -> Option<&Arc<ReconnectListener>> {
        self.reconnect.as_ref()
    }

    /// Default wait budget of every operation.
    pub fn op_timeout(&self) -> Duration {
        self.client.op_timeout()
    }

    /// Number of transcoder adapters created so far.
    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    /// Whether [`shutdown`](MemcacheClient::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Run a blocking call against the underlying client within `budget`.
    ///
    /// This is the only place outward errors are produced.
    async fn execute<R, F>(&self, op: &'static str, budget: Duration, call: F) -> MemcacheResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn MemcachedBackend) -> BackendResult<R> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(MemcacheError::Operation(BackendError::Shutdown));
        }

        let client = Arc::clone(&self.client);
        let task = tokio::task::spawn_blocking(move || call(client.as_ref()));

        let result = match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result.map_err(MemcacheError::from),
            Ok(Err(join)) => Err(MemcacheError::Operation(BackendError::Interrupted(
                join.to_string(),
            ))),
            Err(_) => Err(MemcacheError::Timeout),
        };

        if let Err(e) = &result {
            armature_log::debug!("Memcached {} failed: {}", op, e);
        }
        result
    }

    fn encode_default(&self, value: &CacheValue) -> MemcacheResult<backend::CachedData> {
        let data = self
            .client
            .default_transcoder()
            .encode(value)
            .map_err(BackendError::from)?;
        Ok(data)
    }

    fn encode_with<T: 'static>(
        &self,
        value: &T,
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<backend::CachedData> {
        let data = self
            .adapters
            .get_or_create(transcoder)
            .encode(value)
            .map_err(BackendError::from)?;
        Ok(data)
    }

    async fn counter(
        &self,
        op: Counter,
        key: &str,
        by: u64,
        init: Option<CounterInit>,
    ) -> MemcacheResult<Option<u64>> {
        let key = key.to_string();
        self.execute(op.name(), self.op_timeout(), move |client| match op {
            Counter::Incr => client.incr(&key, by, init),
            Counter::Decr => client.decr(&key, by, init),
        })
        .await
    }
}

#[async_trait]
impl MemcacheClient for MemcacheClientWrapper {
    async fn add(&self, key: &str, expiration: u32, value: &CacheValue) -> MemcacheResult<bool> {
        let data = self.encode_default(value)?;
        let key = key.to_string();
        self.execute("add", self.op_timeout(), move |client| {
            client.add(&key, expiration, data)
        })
        .await
    }

    async fn add_with<T>(
        &self,
        key: &str,
        expiration: u32,
        value: &T,
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<bool>
    where
        T: Send + Sync + 'static,
    {
        let data = self.encode_with(value, transcoder)?;
        let key = key.to_string();
        self.execute("add", self.op_timeout(), move |client| {
            client.add(&key, expiration, data)
        })
        .await
    }

    async fn set(&self, key: &str, expiration: u32, value: &CacheValue) -> MemcacheResult<bool> {
        let data = self.encode_default(value)?;
        let key = key.to_string();
        self.execute("set", self.op_timeout(), move |client| {
            client.set(&key, expiration, data)
        })
        .await
    }

    async fn set_with<T>(
        &self,
        key: &str,
        expiration: u32,
        value: &T,
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<bool>
    where
        T: Send + Sync + 'static,
    {
        let data = self.encode_with(value, transcoder)?;
        let key = key.to_string();
        self.execute("set", self.op_timeout(), move |client| {
            client.set(&key, expiration, data)
        })
        .await
    }

    async fn get(&self, key: &str) -> MemcacheResult<Option<CacheValue>> {
        let key = key.to_string();
        self.execute("get", self.op_timeout(), move |client| {
            let transcoder = client.default_transcoder();
            backend::get_with(client, &key, transcoder.as_ref())
        })
        .await
    }

    async fn get_with<T>(
        &self,
        key: &str,
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<Option<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get_with_timeout(key, transcoder, self.op_timeout())
            .await
    }

    async fn get_with_timeout<T>(
        &self,
        key: &str,
        transcoder: &SharedTranscoder<T>,
        timeout: Duration,
    ) -> MemcacheResult<Option<T>>
    where
        T: Send + Sync + 'static,
    {
        let adapter = self.adapters.get_or_create(transcoder);
        let key = key.to_string();
        self.execute("get", timeout, move |client| {
            backend::get_with(client, &key, adapter.as_ref())
        })
        .await
    }

    async fn get_bulk(&self, keys: &[String]) -> MemcacheResult<HashMap<String, CacheValue>> {
        let keys = keys.to_vec();
        self.execute("get_bulk", self.op_timeout(), move |client| {
            let transcoder = client.default_transcoder();
            backend::get_multi_with(client, &keys, transcoder.as_ref())
        })
        .await
    }

    async fn get_bulk_with<T>(
        &self,
        keys: &[String],
        transcoder: &SharedTranscoder<T>,
    ) -> MemcacheResult<HashMap<String, T>>
    where
        T: Send + Sync + 'static,
    {
        let adapter = self.adapters.get_or_create(transcoder);
        let keys = keys.to_vec();
        self.execute("get_bulk", self.op_timeout(), move |client| {
            backend::get_multi_with(client, &keys, adapter.as_ref())
        })
        .await
    }

    async fn incr(&self, key: &str, by: u64) -> MemcacheResult<Option<u64>> {
        self.counter(Counter::Incr, key, by, None).await
    }

    async fn incr_or(&self, key: &str, by: u64, default: u64) -> MemcacheResult<u64> {
        self.incr_or_with_expiration(key, by, default, 0).await
    }

    async fn incr_or_with_expiration(
        &self,
        key: &str,
        by: u64,
        default: u64,
        expiration: u32,
    ) -> MemcacheResult<u64> {
        let init = CounterInit {
            initial: default,
            expiration,
        };
        let value = self.counter(Counter::Incr, key, by, Some(init)).await?;
        Ok(value.unwrap_or(default))
    }

    async fn decr(&self, key: &str, by: u64) -> MemcacheResult<Option<u64>> {
        self.counter(Counter::Decr, key, by, None).await
    }

    async fn decr_or(&self, key: &str, by: u64, default: u64) -> MemcacheResult<u64> {
        let init = CounterInit {
            initial: default,
            expiration: 0,
        };
        let value = self.counter(Counter::Decr, key, by, Some(init)).await?;
        Ok(value.unwrap_or(default))
    }

    async fn delete(&self, key: &str) -> MemcacheResult<bool> {
        let key = key.to_string();
        self.execute("delete", self.op_timeout(), move |client| client.delete(&key))
            .await
    }

    async fn flush(&self) -> MemcacheResult<()> {
        self.execute("flush", self.op_timeout(), |client| client.flush_all())
            .await
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let client = Arc::clone(&self.client);
        match tokio::task::spawn_blocking(move || client.shutdown()).await {
            Ok(Ok(())) => armature_log::info!("Memcached client shut down"),
            Ok(Err(e)) => armature_log::warn!("Error while shutting down memcached client: {}", e),
            Err(e) => armature_log::warn!("Memcached client shutdown did not complete: {}", e),
        }
    }

    fn available_servers(&self) -> Vec<ServerAddr> {
        self.client.available_servers().unwrap_or_default()
    }

    fn default_transcoder(&self) -> Arc<dyn Transcoder<CacheValue>> {
        Arc::new(TranscoderWrapper::new(self.client.default_transcoder()))
    }
}
