//! Memcached client layer for Armature framework.
//!
//! Applications talk to one stable interface, [`MemcacheClient`], while the
//! underlying client library stays replaceable behind [`MemcachedBackend`].
//! Custom value types plug in through application [`Transcoder`]s.
//!
//! # Features
//!
//! - `memcached` - Real memcached servers via the `memcache` crate (requires explicit opt-in)
//! - `memcached-tls` - TLS connections (requires openssl)
//! - **Two-kind errors** - every operation fails with either a timeout or an operation failure
//! - **Consistent hashing** - ketama server selection
//! - **Reconnect monitoring** - servers away too long are flushed when they return
//!
//! # Examples
//!
//! ## In-memory cluster
//!
//! ```
//! use armature_memcache::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), MemcacheError> {
//!     let config = ConnectionConfig::builder()
//!         .server(ServerAddr::new("127.0.0.1", 11211))
//!         .build();
//!
//!     let factory = ClientFactory::in_memory(InMemoryCluster::new());
//!     let client = factory.create_from_config(&config).expect("valid config");
//!
//!     client.set("greeting", 60, &CacheValue::from("hello")).await?;
//!     assert_eq!(
//!         client.get("greeting").await?,
//!         Some(CacheValue::from("hello"))
//!     );
//!
//!     let users: SharedTranscoder<Vec<String>> = Arc::new(JsonTranscoder::new());
//!     client.set_with("users", 0, &vec!["alice".to_string()], &users).await?;
//!     assert_eq!(client.get_with("users", &users).await?.map(|u| u.len()), Some(1));
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Memcached servers (requires `memcached` feature)
//!
//! ```ignore
//! use armature_memcache::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // MEMCACHED_SERVERS=cache-1:11211,cache-2:11211
//!     let config = ConnectionConfig::from_env().consistent_hashing(true).build();
//!     let client = ClientFactory::memcached().create_from_config(&config)?;
//!
//!     let hits = client.incr_or_with_expiration("hits", 1, 0, 3600).await?;
//!     println!("hits: {}", hits);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod backend;
pub mod config;
pub mod error;
pub mod factory;
pub mod listener;
pub mod traits;
pub mod transcoder;
pub mod wrapper;

pub use adapter::{AdapterCache, SharedTranscoder, TranscoderAdapter, TranscoderWrapper};
pub use backend::{
    BackendBuilder, CacheValue, CachedData, CommandProtocol, ConnectionStateListener,
    InMemoryCluster, MemcachedBackend, SessionLocator,
};
pub use config::{ConnectionConfig, ConnectionConfigBuilder, ServerAddr};
pub use error::{BackendError, MemcacheError, MemcacheResult, TranscoderError};
pub use factory::{ClientFactory, MemcacheClientFactory};
pub use listener::{ConnectionState, ReconnectListener};
pub use traits::MemcacheClient;
pub use transcoder::{BytesTranscoder, CachedObject, JsonTranscoder, StringTranscoder, Transcoder};
pub use wrapper::MemcacheClientWrapper;

/// Prelude for common imports.
///
/// ```
/// use armature_memcache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::adapter::SharedTranscoder;
    pub use crate::backend::{CacheValue, InMemoryCluster};
    pub use crate::config::{ConnectionConfig, ServerAddr};
    pub use crate::error::{MemcacheError, MemcacheResult};
    pub use crate::factory::{ClientFactory, MemcacheClientFactory};
    pub use crate::traits::MemcacheClient;
    pub use crate::transcoder::{
        BytesTranscoder, CachedObject, JsonTranscoder, StringTranscoder, Transcoder,
    };
    pub use crate::wrapper::MemcacheClientWrapper;
}
