//! Client construction.

use crate::backend::{
    BackendBuilder, CommandProtocol, InMemoryBackend, InMemoryCluster, SessionLocator,
};
use crate::config::{ConnectionConfig, ServerAddr};
use crate::listener::ReconnectListener;
use crate::wrapper::MemcacheClientWrapper;
use std::io;
use std::sync::Arc;

/// Connections opened per server. Concurrency comes from the underlying
/// client's own request multiplexing, not from parallel sockets.
const CONNECTION_POOL_SIZE: usize = 1;

/// Builds ready-to-use clients.
pub trait MemcacheClientFactory {
    /// Build a client for `servers`.
    ///
    /// Fails with the underlying client's I/O error if it cannot be built or
    /// connected. There is no retry.
    fn create(
        &self,
        servers: &[ServerAddr],
        config: &ConnectionConfig,
    ) -> io::Result<MemcacheClientWrapper>;

    /// Build a client for the servers listed in `config`.
    fn create_from_config(&self, config: &ConnectionConfig) -> io::Result<MemcacheClientWrapper> {
        self.create(&config.servers, config)
    }
}

type BuilderProvider = Box<dyn Fn(&[ServerAddr]) -> Box<dyn BackendBuilder> + Send + Sync>;

/// Factory over one kind of underlying client.
///
/// This is the only place that knows which underlying client is in use.
///
/// # Examples
///
/// ```
/// use armature_memcache::prelude::*;
///
/// let config = ConnectionConfig::builder()
///     .server("127.0.0.1:11211".parse().unwrap())
///     .consistent_hashing(true)
///     .build();
///
/// let factory = ClientFactory::in_memory(InMemoryCluster::new());
/// let client = factory.create_from_config(&config).unwrap();
/// assert_eq!(client.adapter_count(), 0);
/// ```
pub struct ClientFactory {
    backend: &'static str,
    provider: BuilderProvider,
}

impl ClientFactory {
    /// Create a factory from a function returning a fresh builder per call.
    pub fn new<F>(backend: &'static str, provider: F) -> Self
    where
        F: Fn(&[ServerAddr]) -> Box<dyn BackendBuilder> + Send + Sync + 'static,
    {
        Self {
            backend,
            provider: Box::new(provider),
        }
    }

    /// Factory for clients of an in-process cluster.
    pub fn in_memory(cluster: InMemoryCluster) -> Self {
        Self::new("in-memory", move |servers| {
            Box::new(InMemoryBackend::builder(&cluster, servers))
        })
    }

    /// Factory for clients of real memcached servers.
    #[cfg(feature = "memcached")]
    pub fn memcached() -> Self {
        Self::new("memcached", |servers| {
            Box::new(crate::backend::NetworkBackend::builder(servers))
        })
    }

    /// Name of the underlying client kind.
    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

impl MemcacheClientFactory for ClientFactory {
    fn create(
        &self,
        servers: &[ServerAddr],
        config: &ConnectionConfig,
    ) -> io::Result<MemcacheClientWrapper> {
        let effective = ConnectionConfig {
            servers: servers.to_vec(),
            ..config.clone()
        };
        effective.validate()?;

        let mut builder = (self.provider)(servers);
        builder.set_connection_pool_size(CONNECTION_POOL_SIZE);
        builder.set_session_locator(if config.consistent_hashing {
            SessionLocator::Ketama
        } else {
            SessionLocator::Array
        });
        builder.set_command_protocol(if config.use_binary_protocol {
            CommandProtocol::Binary
        } else {
            CommandProtocol::Text
        });

        let client = builder.build()?;
        client.set_op_timeout(config.operation_timeout);

        let reconnect = config.max_away_time.map(|max_away_time| {
            let listener = Arc::new(ReconnectListener::new(max_away_time));
            client.add_state_listener(listener.clone());
            listener
        });

        armature_log::info!(
            "Created {} memcached client for {} server(s) (consistent_hashing={}, binary={}, timeout={:?})",
            self.backend,
            servers.len(),
            config.consistent_hashing,
            config.use_binary_protocol,
            config.operation_timeout
        );

        let wrapper = MemcacheClientWrapper::new(client);
        Ok(match reconnect {
            Some(listener) => wrapper.with_reconnect_listener(listener),
            None => wrapper,
        })
    }
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackendBuilder, MemcachedBackend};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Keeps a handle on the built client so tests can inspect its settings.
    struct Recording {
        inner: InMemoryBackendBuilder,
        built: Arc<Mutex<Option<InMemoryBackend>>>,
    }

    impl BackendBuilder for Recording {
        fn set_connection_pool_size(&mut self, size: usize) {
            self.inner.set_connection_pool_size(size);
        }

        fn set_session_locator(&mut self, locator: SessionLocator) {
            self.inner.set_session_locator(locator);
        }

        fn set_command_protocol(&mut self, protocol: CommandProtocol) {
            self.inner.set_command_protocol(protocol);
        }

        fn build(self: Box<Self>) -> io::Result<Arc<dyn MemcachedBackend>> {
            let this = *self;
            let backend = this.inner.build_backend()?;
            *this.built.lock() = Some(backend.clone());
            Ok(Arc::new(backend))
        }
    }

    fn recording_factory() -> (ClientFactory, Arc<Mutex<Option<InMemoryBackend>>>) {
        let cluster = InMemoryCluster::new();
        let built = Arc::new(Mutex::new(None));
        let slot = built.clone();
        let factory = ClientFactory::new("recording", move |servers| {
            Box::new(Recording {
                inner: InMemoryBackend::builder(&cluster, servers),
                built: slot.clone(),
            })
        });
        (factory, built)
    }

    fn servers() -> Vec<ServerAddr> {
        vec![
            ServerAddr::new("10.0.0.1", 11211),
            ServerAddr::new("10.0.0.2", 11211),
        ]
    }

    #[test]
    fn test_defaults_select_array_and_text() {
        let (factory, built) = recording_factory();
        let config = ConnectionConfig::default();

        let client = factory.create(&servers(), &config).unwrap();

        let backend = built.lock().clone().unwrap();
        assert_eq!(backend.connection_pool_size(), 1);
        assert_eq!(backend.session_locator(), SessionLocator::Array);
        assert_eq!(backend.command_protocol(), CommandProtocol::Text);
        assert_eq!(backend.op_timeout(), Duration::from_millis(1000));
        assert_eq!(backend.listener_count(), 0);
        assert!(client.reconnect_listener().is_none());
    }

    #[test]
    fn test_flags_select_ketama_binary_and_listener() {
        let (factory, built) = recording_factory();
        let config = ConnectionConfig::builder()
            .consistent_hashing(true)
            .use_binary_protocol(true)
            .operation_timeout(Duration::from_millis(250))
            .max_away_time(Duration::from_secs(30))
            .build();

        let client = factory.create(&servers(), &config).unwrap();

        let backend = built.lock().clone().unwrap();
        assert_eq!(backend.connection_pool_size(), 1);
        assert_eq!(backend.session_locator(), SessionLocator::Ketama);
        assert_eq!(backend.command_protocol(), CommandProtocol::Binary);
        assert_eq!(backend.listener_count(), 1);
        assert_eq!(client.op_timeout(), Duration::from_millis(250));
        assert_eq!(
            client.reconnect_listener().map(|l| l.max_away_time()),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_construction_failure_is_returned_unchanged() {
        let cluster = InMemoryCluster::new();
        cluster.refuse_connections(&servers()[1]);
        let factory = ClientFactory::in_memory(cluster);

        let err = factory
            .create(&servers(), &ConnectionConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let factory = ClientFactory::in_memory(InMemoryCluster::new());
        let err = factory
            .create(&[], &ConnectionConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let config = ConnectionConfig::builder()
            .operation_timeout(Duration::ZERO)
            .build();
        let err = factory.create(&servers(), &config).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
