//! Boundary with the underlying memcached client.
//!
//! Everything the wrapper needs from a concrete client library is expressed
//! by [`BackendBuilder`] and [`MemcachedBackend`]. Calls on a backend are
//! blocking; the wrapper runs them on tokio's blocking pool.

mod codec;
mod locator;
mod memory;

#[cfg(feature = "memcached")]
mod memcached;

pub use codec::{
    BackendTranscoder, CacheValue, CachedData, FLAG_BOOLEAN, FLAG_BYTES, FLAG_INTEGER, FLAG_JSON,
    FLAG_TEXT, SerializingTranscoder,
};
pub use locator::{ServerLocator, SessionLocator};
pub use memory::{InMemoryBackend, InMemoryBackendBuilder, InMemoryCluster};

#[cfg(feature = "memcached")]
pub use memcached::{NetworkBackend, NetworkBackendBuilder};

use crate::config::ServerAddr;
use crate::error::{BackendError, BackendResult};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Command encoding used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandProtocol {
    /// ASCII text protocol.
    #[default]
    Text,
    /// Binary protocol.
    Binary,
}

/// Create-if-absent step of a counter mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterInit {
    /// Value stored when the counter does not exist yet
    pub initial: u64,
    /// Expiration of the created counter in seconds (0 = never)
    pub expiration: u32,
}

/// Observer of per-server connection state changes.
///
/// Callbacks receive the client so a listener can act on it.
pub trait ConnectionStateListener: Send + Sync {
    /// A connection to `server` is (re-)established.
    fn on_connected(&self, client: &dyn MemcachedBackend, server: &ServerAddr);

    /// The connection to `server` was lost.
    fn on_disconnected(&self, client: &dyn MemcachedBackend, server: &ServerAddr);

    /// An operation against `server` failed.
    fn on_exception(&self, _client: &dyn MemcachedBackend, _server: &ServerAddr, _error: &BackendError) {
    }

    /// The client is shutting down.
    fn on_shutdown(&self, _client: &dyn MemcachedBackend) {}
}

/// Configures and builds an underlying client.
pub trait BackendBuilder: Send {
    /// Connections opened per server.
    fn set_connection_pool_size(&mut self, size: usize);

    /// Server selection strategy.
    fn set_session_locator(&mut self, locator: SessionLocator);

    /// Wire protocol variant.
    fn set_command_protocol(&mut self, protocol: CommandProtocol);

    /// Build the client, connecting to every server.
    fn build(self: Box<Self>) -> io::Result<Arc<dyn MemcachedBackend>>;
}

/// Raw operations of an underlying client.
///
/// Implementations must be internally thread safe.
pub trait MemcachedBackend: Send + Sync {
    /// Store only if `key` is absent. Returns whether the value was stored.
    fn add(&self, key: &str, expiration: u32, value: CachedData) -> BackendResult<bool>;

    /// Store unconditionally.
    fn set(&self, key: &str, expiration: u32, value: CachedData) -> BackendResult<bool>;

    /// Fetch one key.
    fn get(&self, key: &str) -> BackendResult<Option<CachedData>>;

    /// Fetch many keys. Missing keys are absent from the map; a backend may
    /// return `None` when nothing was found.
    fn get_multi(&self, keys: &[String]) -> BackendResult<Option<HashMap<String, CachedData>>>;

    /// Increment a counter. Returns `None` when the key is missing and no
    /// `init` was given.
    fn incr(&self, key: &str, delta: u64, init: Option<CounterInit>) -> BackendResult<Option<u64>>;

    /// Decrement a counter, saturating at zero.
    fn decr(&self, key: &str, delta: u64, init: Option<CounterInit>) -> BackendResult<Option<u64>>;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, key: &str) -> BackendResult<bool>;

    /// Remove every key on every server.
    fn flush_all(&self) -> BackendResult<()>;

    /// Remove every key on one server.
    fn flush_server(&self, server: &ServerAddr) -> BackendResult<()>;

    /// Servers currently reachable, `None` if the client cannot tell.
    fn available_servers(&self) -> Option<Vec<ServerAddr>>;

    /// Per-operation timeout.
    fn op_timeout(&self) -> Duration;

    /// Change the per-operation timeout.
    fn set_op_timeout(&self, timeout: Duration);

    /// Register a connection state listener.
    fn add_state_listener(&self, listener: Arc<dyn ConnectionStateListener>);

    /// Codec used when no application transcoder is supplied.
    fn default_transcoder(&self) -> Arc<dyn BackendTranscoder<CacheValue>>;

    /// Close every connection.
    fn shutdown(&self) -> io::Result<()>;
}

/// Fetch and decode one key.
pub fn get_with<T>(
    client: &dyn MemcachedBackend,
    key: &str,
    transcoder: &dyn BackendTranscoder<T>,
) -> BackendResult<Option<T>> {
    client
        .get(key)?
        .map(|data| transcoder.decode(&data).map_err(BackendError::from))
        .transpose()
}

/// Fetch and decode many keys. Missing keys are omitted.
pub fn get_multi_with<T>(
    client: &dyn MemcachedBackend,
    keys: &[String],
    transcoder: &dyn BackendTranscoder<T>,
) -> BackendResult<HashMap<String, T>> {
    let Some(found) = client.get_multi(keys)? else {
        return Ok(HashMap::new());
    };

    found
        .into_iter()
        .map(|(key, data)| -> BackendResult<(String, T)> { Ok((key, transcoder.decode(&data)?)) })
        .collect()
}
