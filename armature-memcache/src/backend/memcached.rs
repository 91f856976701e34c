//! Network backend over the `memcache` crate.
//!
//! The `memcache` client shards keys on its own, but offers no per-server
//! view. This backend keeps one pooled `memcache::Client` per server and
//! does key placement itself, which gives it consistent hashing, per-server
//! flushes and connection state tracking.
//!
//! Over the text protocol the `memcache` client reports `NOT_STORED` as
//! success, so `add` goes through a small dedicated ASCII connection that
//! reads the reply itself.

use super::{
    BackendBuilder, BackendTranscoder, CacheValue, CachedData, CommandProtocol,
    ConnectionStateListener, CounterInit, FLAG_TEXT, MemcachedBackend, SerializingTranscoder,
    ServerLocator, SessionLocator,
};
use crate::config::ServerAddr;
use crate::error::{BackendError, BackendResult};
use memcache::{ClientError, CommandError, MemcacheError as RawError, ServerError, ToMemcacheValue};
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default minimum delay between reconnect probes of a server marked down.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Longest key the protocol accepts.
const MAX_KEY_LENGTH: usize = 250;

/// Borrowed value written through the `memcache` client with its own flags.
struct Payload<'a>(&'a CachedData);

impl<W: Write> ToMemcacheValue<W> for Payload<'_> {
    fn get_flags(&self) -> u32 {
        self.0.flag
    }

    fn get_length(&self) -> usize {
        self.0.data.len()
    }

    fn write_to(&self, stream: &mut W) -> io::Result<()> {
        stream.write_all(&self.0.data)
    }
}

/// ASCII connection used for `add`, which must observe `NOT_STORED`.
struct StoreConnection {
    reader: BufReader<TcpStream>,
}

impl StoreConnection {
    fn connect(addr: &ServerAddr, timeout: Duration) -> io::Result<Self> {
        let mut last_error = None;
        for socket in (addr.host(), addr.port()).to_socket_addrs()? {
            match TcpStream::connect_timeout(&socket, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(Self {
                        reader: BufReader::new(stream),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", addr),
            )
        }))
    }

    fn add(&mut self, key: &str, value: &CachedData, expiration: u32) -> Result<bool, RawError> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(ClientError::KeyTooLong.into());
        }

        let mut request = format!(
            "add {} {} {} {}\r\n",
            key,
            value.flag,
            expiration,
            value.data.len()
        )
        .into_bytes();
        request.extend_from_slice(&value.data);
        request.extend_from_slice(b"\r\n");
        self.reader.get_mut().write_all(&request)?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )
            .into());
        }

        match line.trim_end() {
            "STORED" => Ok(true),
            "NOT_STORED" | "EXISTS" => Ok(false),
            "ERROR" => Err(CommandError::InvalidCommand.into()),
            reply if reply.starts_with("CLIENT_ERROR") => {
                Err(ClientError::Error(Cow::Owned(reply.to_string())).into())
            }
            reply if reply.starts_with("SERVER_ERROR") => {
                Err(ServerError::Error(reply.to_string()).into())
            }
            reply => Err(ServerError::BadResponse(Cow::Owned(reply.to_string())).into()),
        }
    }
}

struct Server {
    addr: ServerAddr,
    client: memcache::Client,
    store: Mutex<Option<StoreConnection>>,
    up: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
}

/// Memcached client speaking to real servers.
pub struct NetworkBackend {
    servers: Vec<Server>,
    locator: ServerLocator,
    protocol: CommandProtocol,
    probe_interval: Duration,
    op_timeout: Mutex<Duration>,
    listeners: RwLock<Vec<Arc<dyn ConnectionStateListener>>>,
    shut_down: AtomicBool,
}

impl NetworkBackend {
    /// Start configuring a client for `servers`.
    pub fn builder(servers: &[ServerAddr]) -> NetworkBackendBuilder {
        NetworkBackendBuilder {
            servers: servers.to_vec(),
            pool_size: 1,
            locator: SessionLocator::default(),
            protocol: CommandProtocol::default(),
            connect_timeout: None,
            probe_interval: PROBE_INTERVAL,
        }
    }

    /// Configured wire protocol.
    pub fn command_protocol(&self) -> CommandProtocol {
        self.protocol
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionStateListener>> {
        self.listeners.read().clone()
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BackendError::Shutdown);
        }
        Ok(())
    }

    fn notify_exception(&self, server: &Server, error: &BackendError) {
        for listener in self.listeners() {
            listener.on_exception(self, &server.addr, error);
        }
    }

    fn mark_down(&self, server: &Server, error: &BackendError) {
        if server.up.swap(false, Ordering::AcqRel) {
            armature_log::warn!("Lost connection to memcached server {}: {}", server.addr, error);
            *server.last_probe.lock() = Some(Instant::now());
            *server.store.lock() = None;
            for listener in self.listeners() {
                listener.on_disconnected(self, &server.addr);
            }
        }
    }

    fn mark_up(&self, server: &Server) {
        if !server.up.swap(true, Ordering::AcqRel) {
            armature_log::info!("Reconnected to memcached server {}", server.addr);
            for listener in self.listeners() {
                listener.on_connected(self, &server.addr);
            }
        }
    }

    /// Probe servers marked down, at most once per probe interval each.
    ///
    /// A failed probe is reported as an exception for that server, so
    /// listeners keep hearing about servers that stay away.
    fn probe_down_servers(&self) {
        for server in self.servers.iter().filter(|s| !s.up.load(Ordering::Acquire)) {
            {
                let mut last = server.last_probe.lock();
                if last.is_some_and(|at| at.elapsed() < self.probe_interval) {
                    continue;
                }
                *last = Some(Instant::now());
            }
            match server.client.version() {
                Ok(_) => self.mark_up(server),
                Err(raw) => {
                    let error = BackendError::from(raw);
                    armature_log::debug!("Memcached server {} still down: {}", server.addr, error);
                    self.notify_exception(server, &error);
                }
            }
        }
    }

    fn locate(&self, key: &str) -> BackendResult<usize> {
        self.locator
            .locate(key, |idx| self.servers[idx].up.load(Ordering::Acquire))
            .ok_or_else(|| BackendError::Unavailable(format!("no server available for key {}", key)))
    }

    /// Run `op` against one server, tracking connection loss.
    fn call<R>(
        &self,
        server: &Server,
        op: impl FnOnce(&Server) -> Result<R, RawError>,
    ) -> BackendResult<R> {
        op(server).map_err(|raw| {
            let error = BackendError::from(raw);
            if error.is_connection_error() {
                self.mark_down(server, &error);
            }
            self.notify_exception(server, &error);
            error
        })
    }

    fn with_key<R>(
        &self,
        key: &str,
        op: impl FnOnce(&Server) -> Result<R, RawError>,
    ) -> BackendResult<R> {
        self.check_open()?;
        self.probe_down_servers();
        let idx = self.locate(key)?;
        self.call(&self.servers[idx], op)
    }

    /// Store `value` only if `key` is absent on `server`.
    fn store_if_absent(
        &self,
        server: &Server,
        key: &str,
        value: &CachedData,
        expiration: u32,
    ) -> Result<bool, RawError> {
        match self.protocol {
            CommandProtocol::Binary => match server.client.add(key, Payload(value), expiration) {
                Ok(()) => Ok(true),
                Err(RawError::CommandError(CommandError::KeyExists)) => Ok(false),
                Err(e) => Err(e),
            },
            CommandProtocol::Text => {
                let mut slot = server.store.lock();
                let mut connection = match slot.take() {
                    Some(connection) => connection,
                    None => StoreConnection::connect(&server.addr, self.op_timeout())?,
                };
                let result = connection.add(key, value, expiration);
                // Anything else leaves an unread or partial reply on the socket.
                let in_sync = !matches!(
                    result,
                    Err(RawError::IOError(_) | RawError::ServerError(ServerError::BadResponse(_)))
                );
                if in_sync {
                    *slot = Some(connection);
                }
                result
            }
        }
    }

    fn mutate_counter(
        &self,
        key: &str,
        init: Option<CounterInit>,
        apply: impl Fn(&memcache::Client) -> Result<u64, RawError>,
    ) -> BackendResult<Option<u64>> {
        self.with_key(key, |server| match apply(&server.client) {
            Ok(value) => Ok(Some(value)),
            Err(RawError::CommandError(CommandError::KeyNotFound)) => {
                let Some(init) = init else {
                    return Ok(None);
                };
                let initial = CachedData::new(FLAG_TEXT, init.initial.to_string().into_bytes());
                if self.store_if_absent(server, key, &initial, init.expiration)? {
                    Ok(Some(init.initial))
                } else {
                    // Created concurrently by another client.
                    apply(&server.client).map(Some)
                }
            }
            Err(e) => Err(e),
        })
    }
}

impl MemcachedBackend for NetworkBackend {
    fn add(&self, key: &str, expiration: u32, value: CachedData) -> BackendResult<bool> {
        self.with_key(key, |server| {
            self.store_if_absent(server, key, &value, expiration)
        })
    }

    fn set(&self, key: &str, expiration: u32, value: CachedData) -> BackendResult<bool> {
        self.with_key(key, |server| {
            server.client.set(key, Payload(&value), expiration)
        })?;
        Ok(true)
    }

    fn get(&self, key: &str) -> BackendResult<Option<CachedData>> {
        let found = self.with_key(key, |server| server.client.get::<(Vec<u8>, u32)>(key))?;
        Ok(found.map(|(data, flag)| CachedData::new(flag, data)))
    }

    fn get_multi(&self, keys: &[String]) -> BackendResult<Option<HashMap<String, CachedData>>> {
        self.check_open()?;
        self.probe_down_servers();

        let mut by_server: HashMap<usize, Vec<&str>> = HashMap::new();
        for key in keys {
            by_server.entry(self.locate(key)?).or_default().push(key);
        }

        let mut found = HashMap::new();
        for (idx, batch) in by_server {
            let values = self.call(&self.servers[idx], |server| {
                server.client.gets::<(Vec<u8>, u32)>(&batch)
            })?;
            found.extend(
                values
                    .into_iter()
                    .map(|(key, (data, flag))| (key, CachedData::new(flag, data))),
            );
        }
        Ok(Some(found))
    }

    fn incr(&self, key: &str, delta: u64, init: Option<CounterInit>) -> BackendResult<Option<u64>> {
        self.mutate_counter(key, init, |client| client.increment(key, delta))
    }

    fn decr(&self, key: &str, delta: u64, init: Option<CounterInit>) -> BackendResult<Option<u64>> {
        self.mutate_counter(key, init, |client| client.decrement(key, delta))
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        self.with_key(key, |server| server.client.delete(key))
    }

    fn flush_all(&self) -> BackendResult<()> {
        self.check_open()?;
        self.probe_down_servers();
        for server in self.servers.iter().filter(|s| s.up.load(Ordering::Acquire)) {
            self.call(server, |server| server.client.flush())?;
        }
        Ok(())
    }

    fn flush_server(&self, addr: &ServerAddr) -> BackendResult<()> {
        self.check_open()?;
        let server = self
            .servers
            .iter()
            .find(|s| &s.addr == addr)
            .ok_or_else(|| BackendError::Unavailable(addr.to_string()))?;
        self.call(server, |server| server.client.flush())
    }

    fn available_servers(&self) -> Option<Vec<ServerAddr>> {
        if self.shut_down.load(Ordering::Acquire) {
            return None;
        }
        Some(
            self.servers
                .iter()
                .filter(|s| s.up.load(Ordering::Acquire))
                .map(|s| s.addr.clone())
                .collect(),
        )
    }

    fn op_timeout(&self) -> Duration {
        *self.op_timeout.lock()
    }

    fn set_op_timeout(&self, timeout: Duration) {
        *self.op_timeout.lock() = timeout;
        for server in &self.servers {
            // Reopened with the new timeout on next use.
            *server.store.lock() = None;
            let applied = server
                .client
                .set_read_timeout(Some(timeout))
                .and_then(|()| server.client.set_write_timeout(Some(timeout)));
            if let Err(e) = applied {
                armature_log::warn!("Failed to apply timeout to {}: {}", server.addr, e);
            }
        }
    }

    fn add_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.listeners.write().push(listener);
    }

    fn default_transcoder(&self) -> Arc<dyn BackendTranscoder<CacheValue>> {
        Arc::new(SerializingTranscoder)
    }

    fn shutdown(&self) -> io::Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for listener in self.listeners() {
            listener.on_shutdown(self);
        }
        for server in &self.servers {
            *server.store.lock() = None;
        }
        // Pooled connections close when the pools drop with the backend.
        armature_log::debug!("Memcached backend shut down");
        Ok(())
    }
}

/// Builder for [`NetworkBackend`].
pub struct NetworkBackendBuilder {
    servers: Vec<ServerAddr>,
    pool_size: usize,
    locator: SessionLocator,
    protocol: CommandProtocol,
    connect_timeout: Option<Duration>,
    probe_interval: Duration,
}

impl NetworkBackendBuilder {
    /// How long to wait for a pooled connection before giving up.
    ///
    /// Also bounds how long an operation against an unreachable server takes
    /// to report it down. Defaults to the `memcache` pool default (30s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Minimum delay between reconnect probes of a server marked down.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    fn server_url(&self, addr: &ServerAddr) -> String {
        let mut params = Vec::new();
        if self.protocol == CommandProtocol::Text {
            params.push("protocol=ascii".to_string());
        }
        if let Some(timeout) = self.connect_timeout {
            params.push(format!("connect_timeout={}", timeout.as_secs_f64()));
        }

        if params.is_empty() {
            addr.to_url()
        } else {
            format!("{}?{}", addr.to_url(), params.join("&"))
        }
    }

    /// Connect to every server.
    pub fn build_backend(self) -> io::Result<NetworkBackend> {
        if self.servers.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one server is required",
            ));
        }
        let pool_size = u32::try_from(self.pool_size.max(1)).unwrap_or(u32::MAX);

        let mut servers = Vec::with_capacity(self.servers.len());
        for addr in &self.servers {
            let url = self.server_url(addr);
            let client = memcache::Client::with_pool_size(url.as_str(), pool_size)
                .map_err(|e| io::Error::other(format!("Failed to connect to {}: {}", addr, e)))?;
            servers.push(Server {
                addr: addr.clone(),
                client,
                store: Mutex::new(None),
                up: AtomicBool::new(true),
                last_probe: Mutex::new(None),
            });
        }

        let names: Vec<String> = self.servers.iter().map(ToString::to_string).collect();
        Ok(NetworkBackend {
            servers,
            locator: ServerLocator::new(self.locator, &names),
            protocol: self.protocol,
            probe_interval: self.probe_interval,
            op_timeout: Mutex::new(Duration::from_secs(1)),
            listeners: RwLock::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }
}

impl BackendBuilder for NetworkBackendBuilder {
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
    use crate::error::MemcacheError;
    use std::net::TcpListener;

    /// Scripted ASCII memcached server on a loopback port.
    ///
    /// While `down` is set it closes every connection without answering.
    /// While `stall` is set it never answers retrievals.
    #[derive(Default)]
    struct ScriptedState {
        items: Mutex<HashMap<String, (u32, Vec<u8>)>>,
        commands: Mutex<Vec<String>>,
        down: AtomicBool,
        stall: AtomicBool,
        /// Stored just before the next `add` for the key is processed.
        race_add: Mutex<Option<(String, Vec<u8>)>>,
    }

    struct ScriptedServer {
        addr: ServerAddr,
        state: Arc<ScriptedState>,
    }

    impl ScriptedServer {
        fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let state = Arc::new(ScriptedState::default());
            let shared = state.clone();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    if shared.down.load(Ordering::SeqCst) {
                        continue;
                    }
                    let state = shared.clone();
                    std::thread::spawn(move || serve(stream, &state));
                }
            });
            Self {
                addr: ServerAddr::new("127.0.0.1", port),
                state,
            }
        }

        fn set_down(&self, down: bool) {
            self.state.down.store(down, Ordering::SeqCst);
        }

        fn commands(&self, prefix: &str) -> Vec<String> {
            self.state
                .commands
                .lock()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .cloned()
                .collect()
        }
    }

    fn serve(stream: TcpStream, state: &ScriptedState) {
        let Ok(mut writer) = stream.try_clone() else { return };
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).unwrap_or(0) == 0 || state.down.load(Ordering::SeqCst) {
                return;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            let Some((&command, args)) = parts.split_first() else {
                continue;
            };
            if command != "version" {
                state.commands.lock().push(line.trim_end().to_string());
            }

            let reply: Vec<u8> = match (command, args) {
                ("version", _) => b"VERSION 1.6.21\r\n".to_vec(),
                ("set" | "add", [key, flags, _, len]) => {
                    let len: usize = len.parse().unwrap();
                    let mut data = vec![0u8; len + 2];
                    if std::io::Read::read_exact(&mut reader, &mut data).is_err() {
                        return;
                    }
                    data.truncate(len);

                    let mut items = state.items.lock();
                    if command == "add" {
                        let raced = state.race_add.lock().take_if(|(k, _)| k.as_str() == *key);
                        if let Some((k, v)) = raced {
                            items.insert(k, (FLAG_TEXT, v));
                        }
                        if items.contains_key(*key) {
                            b"NOT_STORED\r\n".to_vec()
                        } else {
                            items.insert(key.to_string(), (flags.parse().unwrap(), data));
                            b"STORED\r\n".to_vec()
                        }
                    } else {
                        items.insert(key.to_string(), (flags.parse().unwrap(), data));
                        b"STORED\r\n".to_vec()
                    }
                }
                ("get" | "gets", keys) => {
                    if state.stall.load(Ordering::SeqCst) {
                        continue;
                    }
                    let items = state.items.lock();
                    let mut out = Vec::new();
                    for key in keys {
                        if let Some((flags, data)) = items.get(*key) {
                            let cas = if command == "gets" { " 1" } else { "" };
                            let header = format!("VALUE {} {} {}{}\r\n", key, flags, data.len(), cas);
                            out.extend_from_slice(header.as_bytes());
                            out.extend_from_slice(data);
                            out.extend_from_slice(b"\r\n");
                        }
                    }
                    out.extend_from_slice(b"END\r\n");
                    out
                }
                ("incr" | "decr", [key, by]) => {
                    let by: u64 = by.parse().unwrap();
                    let mut items = state.items.lock();
                    match items.get_mut(*key) {
                        Some((_, data)) => {
                            let current: u64 = String::from_utf8_lossy(data).parse().unwrap();
                            let next = if command == "incr" {
                                current.wrapping_add(by)
                            } else {
                                current.saturating_sub(by)
                            };
                            *data = next.to_string().into_bytes();
                            format!("{}\r\n", next).into_bytes()
                        }
                        None => b"NOT_FOUND\r\n".to_vec(),
                    }
                }
                ("delete", [key]) => match state.items.lock().remove(*key) {
                    Some(_) => b"DELETED\r\n".to_vec(),
                    None => b"NOT_FOUND\r\n".to_vec(),
                },
                ("flush_all", _) => {
                    state.items.lock().clear();
                    b"OK\r\n".to_vec()
                }
                _ => b"ERROR\r\n".to_vec(),
            };

            if writer.write_all(&reply).is_err() {
                return;
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn saw(&self, event: &str) -> bool {
            self.events.lock().iter().any(|e| e == event)
        }
    }

    impl ConnectionStateListener for Recorder {
        fn on_connected(&self, _client: &dyn MemcachedBackend, _server: &ServerAddr) {
            self.events.lock().push("connected".to_string());
        }

        fn on_disconnected(&self, _client: &dyn MemcachedBackend, _server: &ServerAddr) {
            self.events.lock().push("disconnected".to_string());
        }

        fn on_exception(&self, _client: &dyn MemcachedBackend, _server: &ServerAddr, _error: &BackendError) {
            self.events.lock().push("exception".to_string());
        }
    }

    fn connect(servers: &[ServerAddr]) -> NetworkBackend {
        NetworkBackend::builder(servers)
            .connect_timeout(Duration::from_millis(200))
            .probe_interval(Duration::from_millis(20))
            .build_backend()
            .unwrap()
    }

    fn text(value: &str) -> CachedData {
        CachedData::new(FLAG_TEXT, value.as_bytes().to_vec())
    }

    #[test]
    fn test_server_url_selects_protocol() {
        let addr = ServerAddr::new("cache-1", 11211);
        let mut builder = NetworkBackend::builder(std::slice::from_ref(&addr));
        assert_eq!(
            builder.server_url(&addr),
            "memcache://cache-1:11211?protocol=ascii"
        );

        builder.set_command_protocol(CommandProtocol::Binary);
        assert_eq!(builder.server_url(&addr), "memcache://cache-1:11211");

        let builder = builder.connect_timeout(Duration::from_millis(500));
        assert_eq!(
            builder.server_url(&addr),
            "memcache://cache-1:11211?connect_timeout=0.5"
        );
    }

    #[test]
    fn test_payload_writes_raw_bytes() {
        let data = CachedData::new(7, b"abc".to_vec());
        let payload = Payload(&data);
        let mut out = Vec::new();
        ToMemcacheValue::<Vec<u8>>::write_to(&payload, &mut out).unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(ToMemcacheValue::<Vec<u8>>::get_flags(&payload), 7);
        assert_eq!(ToMemcacheValue::<Vec<u8>>::get_length(&payload), 3);
    }

    #[test]
    fn test_empty_server_list_is_rejected() {
        let err = NetworkBackend::builder(&[]).build_backend().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_text_add_reports_not_stored() {
        let server = ScriptedServer::start();
        let backend = connect(std::slice::from_ref(&server.addr));

        assert!(backend.add("existing", 0, text("first")).unwrap());
        assert!(!backend.add("existing", 0, text("second")).unwrap());
        assert_eq!(backend.get("existing").unwrap(), Some(text("first")));
        assert_eq!(server.commands("add ").len(), 2);
    }

    #[test]
    fn test_counter_created_when_absent() {
        let server = ScriptedServer::start();
        let backend = connect(std::slice::from_ref(&server.addr));
        let init = CounterInit {
            initial: 7,
            expiration: 60,
        };

        assert_eq!(backend.incr("fresh", 1, None).unwrap(), None);
        assert_eq!(backend.incr("fresh", 1, Some(init)).unwrap(), Some(7));
        assert_eq!(backend.incr("fresh", 1, Some(init)).unwrap(), Some(8));
        assert_eq!(backend.decr("fresh", 20, Some(init)).unwrap(), Some(0));

        let adds = server.commands("add fresh");
        assert_eq!(adds, vec!["add fresh 0 60 1".to_string()]);
    }

    #[test]
    fn test_counter_created_concurrently_is_retried() {
        let server = ScriptedServer::start();
        let backend = connect(std::slice::from_ref(&server.addr));
        *server.state.race_add.lock() = Some(("hits".to_string(), b"10".to_vec()));

        let init = CounterInit {
            initial: 1,
            expiration: 0,
        };
        assert_eq!(backend.incr("hits", 5, Some(init)).unwrap(), Some(15));
        assert_eq!(server.commands("incr hits").len(), 2);
    }

    #[test]
    fn test_get_multi_batches_per_server() {
        let first = ScriptedServer::start();
        let second = ScriptedServer::start();
        let backend = connect(&[first.addr.clone(), second.addr.clone()]);

        let keys: Vec<String> = (0..20).map(|i| format!("key:{}", i)).collect();
        for key in keys.iter().step_by(2) {
            backend.set(key, 0, text(key)).unwrap();
        }

        let found = backend.get_multi(&keys).unwrap().unwrap();
        assert_eq!(found.len(), 10);
        assert_eq!(found["key:4"], text("key:4"));

        let first_batches = first.commands("gets ");
        let second_batches = second.commands("gets ");
        assert_eq!(first_batches.len(), 1);
        assert_eq!(second_batches.len(), 1);

        let mut requested: Vec<&str> = first_batches[0]
            .split_whitespace()
            .chain(second_batches[0].split_whitespace())
            .filter(|part| *part != "gets")
            .collect();
        requested.sort_unstable();
        let mut expected: Vec<&str> = keys.iter().map(String::as_str).collect();
        expected.sort_unstable();
        assert_eq!(requested, expected);
    }

    #[test]
    fn test_lost_server_is_marked_down_and_back_up() {
        let server = ScriptedServer::start();
        let backend = connect(std::slice::from_ref(&server.addr));
        let recorder = Arc::new(Recorder::default());
        backend.add_state_listener(recorder.clone());

        backend.set("k", 0, text("v")).unwrap();

        server.set_down(true);
        let err = backend.get("k").unwrap_err();
        assert!(err.is_connection_error());
        assert!(recorder.saw("disconnected"));
        assert!(recorder.saw("exception"));
        assert_eq!(backend.available_servers(), Some(vec![]));

        server.set_down(false);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(backend.get("k").unwrap(), Some(text("v")));
        assert!(recorder.saw("connected"));
        assert_eq!(backend.available_servers(), Some(vec![server.addr.clone()]));
    }

    #[test]
    fn test_failed_probe_reports_exception() {
        let server = ScriptedServer::start();
        let backend = connect(std::slice::from_ref(&server.addr));
        let recorder = Arc::new(Recorder::default());
        backend.add_state_listener(recorder.clone());

        server.set_down(true);
        backend.get("k").unwrap_err();
        recorder.events.lock().clear();

        std::thread::sleep(Duration::from_millis(50));
        backend.get("k").unwrap_err();
        assert_eq!(*recorder.events.lock(), vec!["exception".to_string()]);
    }

    #[test]
    fn test_read_timeout_is_a_timeout() {
        let server = ScriptedServer::start();
        let backend = connect(std::slice::from_ref(&server.addr));
        backend.set_op_timeout(Duration::from_millis(150));
        server.state.stall.store(true, Ordering::SeqCst);

        let err = backend.get("k").unwrap_err();
        assert!(matches!(err, BackendError::Timeout));
        assert!(MemcacheError::from(err).is_timeout());

        // A slow server is not a lost one.
        assert_eq!(backend.available_servers(), Some(vec![server.addr.clone()]));
    }

    #[test]
    fn test_raw_error_mapping() {
        let timed_out = RawError::IOError(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(BackendError::from(timed_out), BackendError::Timeout));

        let reset = RawError::IOError(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(BackendError::from(reset).is_connection_error());

        let exists = RawError::CommandError(CommandError::KeyExists);
        assert!(matches!(BackendError::from(exists), BackendError::Server(_)));
    }
}
