//! Session registry.
//!
//! This module provides a thread-safe registry mapping session keys to
//! [`Session`]s, the entry point used by transports when a connection
//! arrives, and the idle-session garbage collector.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::{SessionError, SessionKey};
use super::handle::ConnectionHandle;
use super::relay::run_connection_loop;
use super::room::{close_members, Session};

/// Default idle time after which a session is evicted.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Default interval between garbage collection sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on a single member send during broadcast.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing parameters for a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Idle time after which a session is evicted.
    pub ttl: Duration,
    /// Interval between garbage collection sweeps.
    pub gc_interval: Duration,
    /// Bound on a single member send during broadcast.
    pub send_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            gc_interval: DEFAULT_GC_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session key.
    pub key: SessionKey,
    /// Number of joined connections.
    pub members: usize,
    /// Time of the last join or inbound message.
    pub last_used: SystemTime,
}

/// Registry of sessions keyed by [`SessionKey`].
///
/// The map lock is only held long enough to look up, insert or remove a
/// session reference; all member work happens under the session's own lock
/// afterwards, so unrelated sessions never contend.
pub struct SessionManager {
    /// Map of session key to session.
    sessions: DashMap<SessionKey, Arc<Session>>,
    settings: SessionSettings,
    /// Connection loops spawned by [`join`](Self::join).
    connections: TaskTracker,
}

impl SessionManager {
    /// Creates a registry with an empty session for each of `initial_keys`.
    pub fn new<I, K>(initial_keys: I, settings: SessionSettings) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<SessionKey>,
    {
        let sessions = DashMap::new();
        for key in initial_keys {
            let key = key.into();
            let session = Arc::new(Session::new(key.clone(), settings.send_timeout));
            sessions.insert(key, session);
        }

        Self {
            sessions,
            settings,
            connections: TaskTracker::new(),
        }
    }

    /// Returns the timing parameters.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Registers a new, empty session.
    ///
    /// Re-registering a live key is an error rather than a reset, so members
    /// of an existing session are never silently dropped.
    pub fn register_session(&self, key: impl Into<SessionKey>) -> Result<(), SessionError> {
        use dashmap::mapref::entry::Entry;

        let key = key.into();
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyRegistered(key)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Session::new(key.clone(), self.settings.send_timeout)));
                tracing::info!(session_key = %key, "Registered session");
                Ok(())
            }
        }
    }

    /// Returns a snapshot of the session's current members.
    pub async fn get_session(&self, key: &str) -> Result<Vec<Arc<dyn ConnectionHandle>>, SessionError> {
        let session = self.lookup(key)?;
        Ok(session.members().await)
    }

    /// Returns the time of the session's last join or inbound message.
    pub async fn get_last_used_time(&self, key: &str) -> Result<SystemTime, SessionError> {
        let session = self.lookup(key)?;
        Ok(session.last_used().await)
    }

    /// Adds `handle` to the session at `key` and starts relaying its frames.
    ///
    /// On error the registry is left untouched and the caller is responsible
    /// for closing the handle.
    pub async fn join(&self, key: &str, handle: Arc<dyn ConnectionHandle>) -> Result<(), SessionError> {
        let session = self.lookup(key)?;
        session.add_member(Arc::clone(&handle)).await?;

        tracing::info!(
            session_key = %key,
            conn_id = %handle.id(),
            "Connection joined session"
        );

        self.connections.spawn(run_connection_loop(session, handle));
        Ok(())
    }

    /// Checks if a session is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Lists all registered sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for session in self.snapshot() {
            infos.push(SessionInfo {
                key: session.key().clone(),
                members: session.member_count().await,
                last_used: session.last_used().await,
            });
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Runs one garbage collection sweep.
    ///
    /// Every session idle for longer than the TTL is removed from the
    /// registry and its remaining members are closed. Returns the number of
    /// sessions evicted.
    pub async fn collect_garbage(&self) -> usize {
        let mut evicted = 0;
        let mut to_close = Vec::new();

        for session in self.snapshot() {
            let Some(members) = session.evict_if_idle(self.settings.ttl).await else {
                continue;
            };

            self.sessions
                .remove_if(session.key(), |_, current| Arc::ptr_eq(current, &session));

            tracing::info!(
                session_key = %session.key(),
                members = members.len(),
                "Evicted idle session"
            );

            to_close.extend(members);
            evicted += 1;
        }

        close_members(to_close).await;
        evicted
    }

    /// Starts a background task that sweeps idle sessions every GC interval.
    ///
    /// The task exits once `shutdown` is cancelled; a sweep already running
    /// completes first.
    pub fn start_gc_task(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.settings.gc_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Garbage collector stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let evicted = manager.collect_garbage().await;
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = manager.count(), "Garbage collection sweep");
                        }
                    }
                }
            }
        })
    }

    /// Closes every member of every session.
    ///
    /// Sessions stay registered. Connection loops observe the close and exit
    /// through their normal failure path. Returns the number of connections
    /// closed.
    pub async fn close_all(&self) -> usize {
        let mut members = Vec::new();
        for session in self.snapshot() {
            members.extend(session.drain_members().await);
        }
        let closed = members.len();
        close_members(members).await;
        closed
    }

    /// Waits for all connection loops to finish, up to `limit`.
    ///
    /// Returns false if some were still running when the limit elapsed.
    pub async fn wait_for_connections(&self, limit: Duration) -> bool {
        self.connections.close();
        let finished = tokio::time::timeout(limit, self.connections.wait()).await.is_ok();
        self.connections.reopen();
        finished
    }

    /// Returns the number of running connection loops.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    fn lookup(&self, key: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(key.to_string()))
    }

    /// Clones out every session reference so no map guard is held across awaits.
    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Vec::<SessionKey>::new(), SessionSettings::default())
    }
}
