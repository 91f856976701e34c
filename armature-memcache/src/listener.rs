//! Connection-state observer flagging servers that stayed away too long.
//!
//! The listener never reconnects anything itself; the underlying client owns
//! retry and backoff. It only tracks disconnect episodes per server and, when
//! an episode exceeds the configured maximum away time, marks the server as
//! timed out (once per episode) and flushes it when it comes back, because
//! the keys it held were served by other servers in the meantime.
//!
//! Inside a tokio runtime every episode arms a timer for its deadline, so a
//! server that never returns is still flagged. Without a runtime the limit
//! is checked on the next event for the server or on [`ReconnectListener::check_away`].

use crate::backend::{ConnectionStateListener, MemcachedBackend};
use crate::config::ServerAddr;
use crate::error::BackendError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Callback invoked when a server enters [`ConnectionState::TimedOutAway`].
pub type TimedOutHook = Arc<dyn Fn(&ServerAddr, Duration) + Send + Sync>;

/// Observed state of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected with no disconnect observed.
    Connected,
    /// Disconnected since the given instant.
    Disconnected {
        /// Start of the disconnect episode
        since: Instant,
    },
    /// Came back within the allowed away time.
    Reconnected {
        /// Length of the episode
        away: Duration,
    },
    /// Stayed away longer than the allowed away time.
    TimedOutAway {
        /// Away time when the limit was detected
        away: Duration,
    },
}

#[derive(Debug)]
struct Tracked {
    state: ConnectionState,
    disconnected_at: Option<Instant>,
}

/// Tracks disconnect episodes against a maximum away time.
///
/// Clones share the same episode state.
#[derive(Clone)]
pub struct ReconnectListener {
    max_away_time: Duration,
    servers: Arc<Mutex<HashMap<ServerAddr, Tracked>>>,
    timed_out: Arc<AtomicUsize>,
    on_timed_out: Option<TimedOutHook>,
}

impl ReconnectListener {
    /// Create a listener allowing servers to be away for `max_away_time`.
    pub fn new(max_away_time: Duration) -> Self {
        Self {
            max_away_time,
            servers: Arc::new(Mutex::new(HashMap::new())),
            timed_out: Arc::new(AtomicUsize::new(0)),
            on_timed_out: None,
        }
    }

    /// Run `hook` whenever a server times out.
    pub fn with_timeout_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ServerAddr, Duration) + Send + Sync + 'static,
    {
        self.on_timed_out = Some(Arc::new(hook));
        self
    }

    /// Configured maximum away time.
    pub fn max_away_time(&self) -> Duration {
        self.max_away_time
    }

    /// Last observed state of `server`, `None` if no event was seen for it.
    pub fn state(&self, server: &ServerAddr) -> Option<ConnectionState> {
        self.servers.lock().get(server).map(|tracked| tracked.state)
    }

    /// Number of episodes that exceeded the maximum away time.
    pub fn timed_out_count(&self) -> usize {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Re-evaluate every ongoing episode.
    ///
    /// Returns the servers that timed out during this call.
    pub fn check_away(&self) -> Vec<ServerAddr> {
        let timed_out: Vec<(ServerAddr, Duration)> = {
            let mut servers = self.servers.lock();
            servers
                .iter_mut()
                .filter_map(|(server, tracked)| {
                    self.expire(tracked).map(|away| (server.clone(), away))
                })
                .collect()
        };

        timed_out
            .into_iter()
            .map(|(server, away)| {
                self.report_timed_out(&server, away);
                server
            })
            .collect()
    }

    /// Move an ongoing episode past the limit into `TimedOutAway`.
    fn expire(&self, tracked: &mut Tracked) -> Option<Duration> {
        let ConnectionState::Disconnected { since } = tracked.state else {
            return None;
        };
        let away = since.elapsed();
        if away <= self.max_away_time {
            return None;
        }
        tracked.state = ConnectionState::TimedOutAway { away };
        self.timed_out.fetch_add(1, Ordering::AcqRel);
        Some(away)
    }

    fn report_timed_out(&self, server: &ServerAddr, away: Duration) {
        armature_log::warn!(
            "Memcached server {} away for {:?}, exceeding {:?}",
            server,
            away,
            self.max_away_time
        );
        if let Some(hook) = &self.on_timed_out {
            hook(server, away);
        }
    }

    fn observe(&self, server: &ServerAddr) {
        let away = {
            let mut servers = self.servers.lock();
            servers
                .get_mut(server)
                .and_then(|tracked| self.expire(tracked))
        };
        if let Some(away) = away {
            self.report_timed_out(server, away);
        }
    }

    /// Re-check `server` just after the episode starting at `since` runs out.
    fn arm_deadline(&self, server: &ServerAddr, since: Instant) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let listener = self.clone();
        let server = server.clone();
        let deadline = since + self.max_away_time + Duration::from_millis(1);
        runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            listener.observe(&server);
        });
    }
}

impl ConnectionStateListener for ReconnectListener {
    fn on_connected(&self, client: &dyn MemcachedBackend, server: &ServerAddr) {
        let (timed_out_now, stale) = {
            let mut servers = self.servers.lock();
            let tracked = servers.entry(server.clone()).or_insert(Tracked {
                state: ConnectionState::Connected,
                disconnected_at: None,
            });
            let Some(since) = tracked.disconnected_at.take() else {
                return;
            };

            let timed_out_now = self.expire(tracked);
            match tracked.state {
                ConnectionState::TimedOutAway { .. } => (timed_out_now, true),
                _ => {
                    tracked.state = ConnectionState::Reconnected {
                        away: since.elapsed(),
                    };
                    (None, false)
                }
            }
        };

        if let Some(away) = timed_out_now {
            self.report_timed_out(server, away);
        }

        if stale {
            armature_log::warn!("Flushing memcached server {} after prolonged absence", server);
            if let Err(e) = client.flush_server(server) {
                armature_log::warn!("Failed to flush memcached server {}: {}", server, e);
            }
        } else {
            armature_log::debug!("Memcached server {} reconnected", server);
        }
    }

    fn on_disconnected(&self, _client: &dyn MemcachedBackend, server: &ServerAddr) {
        {
            let mut servers = self.servers.lock();
            let tracked = servers.entry(server.clone()).or_insert(Tracked {
                state: ConnectionState::Connected,
                disconnected_at: None,
            });
            if tracked.disconnected_at.is_none() {
                let now = Instant::now();
                tracked.disconnected_at = Some(now);
                tracked.state = ConnectionState::Disconnected { since: now };
                drop(servers);

                armature_log::debug!("Memcached server {} disconnected", server);
                self.arm_deadline(server, now);
                return;
            }
        }
        self.observe(server);
    }

    fn on_exception(&self, _client: &dyn MemcachedBackend, server: &ServerAddr, error: &BackendError) {
        armature_log::debug!("Memcached server {} reported: {}", server, error);
        self.observe(server);
    }
}

impl std::fmt::Debug for ReconnectListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectListener")
            .field("max_away_time", &self.max_away_time)
            .field("timed_out", &self.timed_out_count())
            .finish_non_exhaustive()
    }
}
