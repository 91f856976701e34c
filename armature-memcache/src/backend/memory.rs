//! In-process backend.
//!
//! [`InMemoryCluster`] holds one map per server address and can be shared by
//! several clients, like a real cluster. It also exposes fault injection
//! (disconnects, stalls, interrupted calls, failing teardown) so the client
//! layer can be exercised without a memcached deployment.

use super::{
    BackendBuilder, BackendTranscoder, CacheValue, CachedData, CommandProtocol,
    ConnectionStateListener, CounterInit, MemcachedBackend, SerializingTranscoder, ServerLocator,
    SessionLocator,
};
use crate::config::ServerAddr;
use crate::error::{BackendError, BackendResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Expirations above this many seconds are absolute unix timestamps.
const RELATIVE_EXPIRATION_LIMIT: u32 = 60 * 60 * 24 * 30;

struct Entry {
    data: CachedData,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: CachedData, expiration: u32) -> Self {
        Self {
            data,
            expires_at: expires_at(expiration),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn expires_at(expiration: u32) -> Option<Instant> {
    match expiration {
        0 => None,
        secs if secs <= RELATIVE_EXPIRATION_LIMIT => {
            Some(Instant::now() + Duration::from_secs(u64::from(secs)))
        }
        secs => {
            let target = UNIX_EPOCH + Duration::from_secs(u64::from(secs));
            let remaining = target.duration_since(SystemTime::now()).unwrap_or_default();
            Some(Instant::now() + remaining)
        }
    }
}

struct Node {
    up: bool,
    entries: HashMap<String, Entry>,
    flushes: usize,
}

impl Node {
    fn new() -> Self {
        Self {
            up: true,
            entries: HashMap::new(),
            flushes: 0,
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.flushes += 1;
    }
}

#[derive(Default)]
struct Faults {
    interrupt_next: bool,
    stall_next: Option<Duration>,
    fail_shutdown: bool,
    refused: HashSet<ServerAddr>,
}

#[derive(Default)]
struct ClusterInner {
    nodes: Mutex<HashMap<ServerAddr, Node>>,
    clients: Mutex<Vec<Weak<BackendInner>>>,
    faults: Mutex<Faults>,
}

/// Shared in-process server set.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    inner: Arc<ClusterInner>,
}

impl InMemoryCluster {
    /// Create an empty cluster. Servers come into existence when a client connects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `server` down and notify connected clients.
    pub fn disconnect(&self, server: &ServerAddr) {
        self.set_up(server, false);
    }

    /// Bring `server` back and notify connected clients. Its data survives.
    pub fn reconnect(&self, server: &ServerAddr) {
        self.set_up(server, true);
    }

    /// Make new clients fail to connect to `server`.
    pub fn refuse_connections(&self, server: &ServerAddr) {
        self.inner.faults.lock().refused.insert(server.clone());
    }

    /// Make the next operation panic, as if its thread were interrupted.
    pub fn interrupt_next(&self) {
        self.inner.faults.lock().interrupt_next = true;
    }

    /// Make the next operation block for `delay` before running.
    pub fn stall_next(&self, delay: Duration) {
        self.inner.faults.lock().stall_next = Some(delay);
    }

    /// Make client shutdown report an I/O error.
    pub fn fail_shutdown(&self) {
        self.inner.faults.lock().fail_shutdown = true;
    }

    /// Whether `server` holds a live entry for `key`.
    pub fn contains(&self, server: &ServerAddr, key: &str) -> bool {
        self.inner
            .nodes
            .lock()
            .get_mut(server)
            .is_some_and(|node| node.live(key).is_some())
    }

    /// Number of entries stored on `server`, including not yet purged expired ones.
    pub fn len(&self, server: &ServerAddr) -> usize {
        self.inner
            .nodes
            .lock()
            .get(server)
            .map_or(0, |node| node.entries.len())
    }

    /// How many times `server` has been flushed.
    pub fn flush_count(&self, server: &ServerAddr) -> usize {
        self.inner
            .nodes
            .lock()
            .get(server)
            .map_or(0, |node| node.flushes)
    }

    fn set_up(&self, server: &ServerAddr, up: bool) {
        {
            let mut nodes = self.inner.nodes.lock();
            let Some(node) = nodes.get_mut(server) else {
                return;
            };
            if node.up == up {
                return;
            }
            node.up = up;
        }

        let clients: Vec<InMemoryBackend> = {
            let mut clients = self.inner.clients.lock();
            clients.retain(|weak| weak.strong_count() > 0);
            clients
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|inner| inner.servers.contains(server))
                .map(|inner| InMemoryBackend { inner })
                .collect()
        };

        for client in clients {
            for listener in client.listeners() {
                if up {
                    listener.on_connected(&client, server);
                } else {
                    listener.on_disconnected(&client, server);
                }
            }
        }
    }

    fn before_operation(&self) {
        let (interrupt, stall) = {
            let mut faults = self.inner.faults.lock();
            (
                std::mem::take(&mut faults.interrupt_next),
                faults.stall_next.take(),
            )
        };
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        if interrupt {
            panic!("simulated interruption while waiting for a response");
        }
    }
}

struct BackendInner {
    cluster: InMemoryCluster,
    servers: Vec<ServerAddr>,
    locator: ServerLocator,
    protocol: CommandProtocol,
    pool_size: usize,
    op_timeout: Mutex<Duration>,
    listeners: RwLock<Vec<Arc<dyn ConnectionStateListener>>>,
    shut_down: AtomicBool,
}

/// Client over an [`InMemoryCluster`].
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<BackendInner>,
}

impl InMemoryBackend {
    /// Start configuring a client for `servers` in `cluster`.
    pub fn builder(cluster: &InMemoryCluster, servers: &[ServerAddr]) -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            cluster: cluster.clone(),
            servers: servers.to_vec(),
            locator: SessionLocator::default(),
            protocol: CommandProtocol::default(),
            pool_size: 1,
        }
    }

    /// Cluster this client talks to.
    pub fn cluster(&self) -> &InMemoryCluster {
        &self.inner.cluster
    }

    /// Configured server list.
    pub fn servers(&self) -> &[ServerAddr] {
        &self.inner.servers
    }

    /// Configured server selection strategy.
    pub fn session_locator(&self) -> SessionLocator {
        self.inner.locator.kind()
    }

    /// Configured wire protocol.
    pub fn command_protocol(&self) -> CommandProtocol {
        self.inner.protocol
    }

    /// Configured connections per server.
    pub fn connection_pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Number of registered state listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Server that owns `key` right now.
    pub fn server_for(&self, key: &str) -> Option<ServerAddr> {
        let nodes = self.inner.cluster.inner.nodes.lock();
        self.locate(&nodes, key).map(|idx| self.inner.servers[idx].clone())
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionStateListener>> {
        self.inner.listeners.read().clone()
    }

    fn locate(&self, nodes: &HashMap<ServerAddr, Node>, key: &str) -> Option<usize> {
        self.inner.locator.locate(key, |idx| {
            nodes
                .get(&self.inner.servers[idx])
                .is_some_and(|node| node.up)
        })
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(BackendError::Shutdown);
        }
        Ok(())
    }

    fn with_node<R>(&self, key: &str, f: impl FnOnce(&mut Node) -> R) -> BackendResult<R> {
        self.check_open()?;
        self.inner.cluster.before_operation();

        let mut nodes = self.inner.cluster.inner.nodes.lock();
        let idx = self
            .locate(&nodes, key)
            .ok_or_else(|| BackendError::Unavailable(format!("no server available for key {}", key)))?;
        let node = nodes
            .get_mut(&self.inner.servers[idx])
            .ok_or_else(|| BackendError::Unavailable(self.inner.servers[idx].to_string()))?;
        Ok(f(node))
    }

    fn mutate_counter(
        &self,
        key: &str,
        init: Option<CounterInit>,
        apply: impl FnOnce(u64) -> u64,
    ) -> BackendResult<Option<u64>> {
        self.with_node(key, |node| -> BackendResult<Option<u64>> {
            match node.live(key) {
                Some(entry) => {
                    let current = std::str::from_utf8(&entry.data.data)
                        .ok()
                        .and_then(|s| s.trim().parse::<u64>().ok())
                        .ok_or_else(|| {
                            BackendError::Server(
                                "CLIENT_ERROR cannot increment or decrement non-numeric value"
                                    .to_string(),
                            )
                        })?;
                    let next = apply(current);
                    entry.data.data = next.to_string().into_bytes();
                    Ok(Some(next))
                }
                None => Ok(init.map(|init| {
                    let data =
                        CachedData::new(super::FLAG_TEXT, init.initial.to_string().into_bytes());
                    node.entries
                        .insert(key.to_string(), Entry::new(data, init.expiration));
                    init.initial
                })),
            }
        })?
    }
}

impl MemcachedBackend for InMemoryBackend {
    fn add(&self, key: &str, expiration: u32, value: CachedData) -> BackendResult<bool> {
        self.with_node(key, |node| {
            if node.live(key).is_some() {
                return false;
            }
            node.entries
                .insert(key.to_string(), Entry::new(value, expiration));
            true
        })
    }

    fn set(&self, key: &str, expiration: u32, value: CachedData) -> BackendResult<bool> {
        self.with_node(key, |node| {
            node.entries
                .insert(key.to_string(), Entry::new(value, expiration));
            true
        })
    }

    fn get(&self, key: &str) -> BackendResult<Option<CachedData>> {
        self.with_node(key, |node| node.live(key).map(|entry| entry.data.clone()))
    }

    fn get_multi(&self, keys: &[String]) -> BackendResult<Option<HashMap<String, CachedData>>> {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(data) = self.get(key)? {
                found.insert(key.clone(), data);
            }
        }
        // Like several real clients, report "nothing found" as no map at all.
        Ok((!found.is_empty()).then_some(found))
    }

    fn incr(&self, key: &str, delta: u64, init: Option<CounterInit>) -> BackendResult<Option<u64>> {
        self.mutate_counter(key, init, |current| current.wrapping_add(delta))
    }

    fn decr(&self, key: &str, delta: u64, init: Option<CounterInit>) -> BackendResult<Option<u64>> {
        self.mutate_counter(key, init, |current| current.saturating_sub(delta))
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        self.with_node(key, |node| {
            let existed = node.live(key).is_some();
            node.entries.remove(key);
            existed
        })
    }

    fn flush_all(&self) -> BackendResult<()> {
        self.check_open()?;
        self.inner.cluster.before_operation();

        let mut nodes = self.inner.cluster.inner.nodes.lock();
        for server in &self.inner.servers {
            if let Some(node) = nodes.get_mut(server).filter(|node| node.up) {
                node.clear();
            }
        }
        Ok(())
    }

    fn flush_server(&self, server: &ServerAddr) -> BackendResult<()> {
        self.check_open()?;

        let mut nodes = self.inner.cluster.inner.nodes.lock();
        match nodes.get_mut(server) {
            Some(node) if node.up && self.inner.servers.contains(server) => {
                node.clear();
                Ok(())
            }
            _ => Err(BackendError::Unavailable(server.to_string())),
        }
    }

    fn available_servers(&self) -> Option<Vec<ServerAddr>> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return None;
        }
        let nodes = self.inner.cluster.inner.nodes.lock();
        Some(
            self.inner
                .servers
                .iter()
                .filter(|server| nodes.get(*server).is_some_and(|node| node.up))
                .cloned()
                .collect(),
        )
    }

    fn op_timeout(&self) -> Duration {
        *self.inner.op_timeout.lock()
    }

    fn set_op_timeout(&self, timeout: Duration) {
        *self.inner.op_timeout.lock() = timeout;
    }

    fn add_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.inner.listeners.write().push(listener);
    }

    fn default_transcoder(&self) -> Arc<dyn BackendTranscoder<CacheValue>> {
        Arc::new(SerializingTranscoder)
    }

    fn shutdown(&self) -> io::Result<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for listener in self.listeners() {
            listener.on_shutdown(self);
        }

        let cluster = &self.inner.cluster.inner;
        cluster
            .clients
            .lock()
            .retain(|weak| weak.upgrade().is_some_and(|inner| !Arc::ptr_eq(&inner, &self.inner)));

        if std::mem::take(&mut cluster.faults.lock().fail_shutdown) {
            return Err(io::Error::other("simulated failure closing connections"));
        }
        Ok(())
    }
}

/// Builder for [`InMemoryBackend`].
pub struct InMemoryBackendBuilder {
    cluster: InMemoryCluster,
    servers: Vec<ServerAddr>,
    locator: SessionLocator,
    protocol: CommandProtocol,
    pool_size: usize,
}

impl InMemoryBackendBuilder {
    /// Build the concrete client.
    pub fn build_backend(self) -> io::Result<InMemoryBackend> {
        if self.servers.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one server is required",
            ));
        }

        let cluster = self.cluster;
        {
            let faults = cluster.inner.faults.lock();
            if let Some(server) = self.servers.iter().find(|s| faults.refused.contains(*s)) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("connection refused: {}", server),
                ));
            }
        }
        {
            let mut nodes = cluster.inner.nodes.lock();
            for server in &self.servers {
                nodes.entry(server.clone()).or_insert_with(Node::new);
            }
        }

        let names: Vec<String> = self.servers.iter().map(ToString::to_string).collect();
        let inner = Arc::new(BackendInner {
            locator: ServerLocator::new(self.locator, &names),
            cluster: cluster.clone(),
            servers: self.servers,
            protocol: self.protocol,
            pool_size: self.pool_size,
            op_timeout: Mutex::new(Duration::from_secs(1)),
            listeners: RwLock::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });
        cluster.inner.clients.lock().push(Arc::downgrade(&inner));

        Ok(InMemoryBackend { inner })
    }
}

impl BackendBuilder for InMemoryBackendBuilder {
    fn set_connection_pool_size(&mut self, size: usize) {
        self.pool_size = size;
    }

    fn set_session_locator(&mut self, locator: SessionLocator) {
        self.locator = locator;
    }

    fn set_command_protocol(&mut self, protocol: CommandProtocol) {
        self.protocol = protocol;
    }

    fn build(self: Box<Self>) -> io::Result<Arc<dyn MemcachedBackend>> {
        let backend = (*self).build_backend()?;
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(n: u16) -> Vec<ServerAddr> {
        (0..n).map(|i| ServerAddr::new("127.0.0.1", 11211 + i)).collect()
    }

    fn text(s: &str) -> CachedData {
        CachedData::new(super::super::FLAG_TEXT, s.as_bytes().to_vec())
    }

    fn backend(n: u16) -> InMemoryBackend {
        InMemoryBackend::builder(&InMemoryCluster::new(), &servers(n))
            .build_backend()
            .unwrap()
    }

    #[test]
    fn test_add_does_not_overwrite() {
        let client = backend(1);
        assert!(client.add("k", 0, text("v1")).unwrap());
        assert!(!client.add("k", 0, text("v2")).unwrap());
        assert_eq!(client.get("k").unwrap(), Some(text("v1")));
    }

    #[test]
    fn test_absolute_expiration_in_the_past_expires_immediately() {
        let client = backend(1);
        client.set("k", RELATIVE_EXPIRATION_LIMIT + 1, text("v")).unwrap();
        assert_eq!(client.get("k").unwrap(), None);
        assert!(client.add("k", 0, text("fresh")).unwrap());
    }

    #[test]
    fn test_counters() {
        let client = backend(1);
        assert_eq!(client.incr("hits", 1, None).unwrap(), None);

        let init = CounterInit {
            initial: 10,
            expiration: 0,
        };
        assert_eq!(client.incr("hits", 5, Some(init)).unwrap(), Some(10));
        assert_eq!(client.incr("hits", 5, Some(init)).unwrap(), Some(15));
        assert_eq!(client.decr("hits", 20, None).unwrap(), Some(0));

        client.set("name", 0, text("alice")).unwrap();
        assert!(matches!(
            client.incr("name", 1, None),
            Err(BackendError::Server(_))
        ));
    }

    #[test]
    fn test_get_multi_returns_none_when_nothing_found() {
        let client = backend(2);
        assert!(client.get_multi(&["a".into(), "b".into()]).unwrap().is_none());

        client.set("a", 0, text("1")).unwrap();
        let found = client.get_multi(&["a".into(), "b".into()]).unwrap().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["a"], text("1"));
    }

    #[test]
    fn test_keys_move_to_surviving_server() {
        let client = backend(3);
        let home = client.server_for("user:1").unwrap();
        client.cluster().disconnect(&home);

        let fallback = client.server_for("user:1").unwrap();
        assert_ne!(home, fallback);
        assert!(client.set("user:1", 0, text("x")).unwrap());
        assert!(client.cluster().contains(&fallback, "user:1"));
        assert_eq!(client.available_servers().unwrap().len(), 2);
    }

    #[test]
    fn test_all_servers_down_is_unavailable() {
        let client = backend(1);
        client.cluster().disconnect(&servers(1)[0]);
        assert!(matches!(client.get("k"), Err(BackendError::Unavailable(_))));
        assert_eq!(client.available_servers(), Some(vec![]));
    }

    #[test]
    fn test_refused_connection_fails_build() {
        let cluster = InMemoryCluster::new();
        cluster.refuse_connections(&servers(1)[0]);
        let err = InMemoryBackend::builder(&cluster, &servers(1))
            .build_backend()
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_shutdown_rejects_further_calls() {
        let client = backend(1);
        client.shutdown().unwrap();
        assert!(matches!(client.get("k"), Err(BackendError::Shutdown)));
        assert!(client.available_servers().is_none());
        assert!(client.shutdown().is_ok());
    }
}
