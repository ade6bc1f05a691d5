//! A single broadcast session.
//!
//! A [`Session`] owns its member set and last-activity timestamp behind one
//! lock. Joins, leaves and broadcasts on the same session are mutually
//! exclusive, so a broadcast never interleaves with another mid-fanout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::{SessionError, SessionKey};
use super::handle::{ConnectionError, ConnectionHandle, ConnectionId, Frame};

/// State guarded by the session lock.
struct SessionState {
    members: HashMap<ConnectionId, Arc<dyn ConnectionHandle>>,
    /// Wall-clock time of the last join or inbound message.
    last_used: SystemTime,
    /// Monotonic twin of `last_used`, used for idle checks.
    last_active: Instant,
    /// Set once the garbage collector has claimed this session.
    evicted: bool,
}

impl SessionState {
    fn touch(&mut self) {
        // Never step backwards if the wall clock does.
        self.last_used = self.last_used.max(SystemTime::now());
        self.last_active = Instant::now();
    }
}

/// A named group of connections that relay frames to each other.
pub struct Session {
    key: SessionKey,
    send_timeout: Duration,
    state: Mutex<SessionState>,
}

impl Session {
    /// Creates an empty session. `last_used` starts at now.
    pub fn new(key: impl Into<SessionKey>, send_timeout: Duration) -> Self {
        Self {
            key: key.into(),
            send_timeout,
            state: Mutex::new(SessionState {
                members: HashMap::new(),
                last_used: SystemTime::now(),
                last_active: Instant::now(),
                evicted: false,
            }),
        }
    }

    /// Returns the session key.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Adds a member and refreshes the activity timestamp.
    ///
    /// Fails with [`SessionError::NotFound`] if the session was evicted while
    /// the caller held a reference to it, and with
    /// [`SessionError::DuplicateMember`] if the identity is already present.
    pub async fn add_member(&self, handle: Arc<dyn ConnectionHandle>) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;

        if state.evicted {
            return Err(SessionError::NotFound(self.key.clone()));
        }
        if state.members.contains_key(handle.id()) {
            return Err(SessionError::DuplicateMember {
                key: self.key.clone(),
                id: handle.id().clone(),
            });
        }

        state.members.insert(handle.id().clone(), handle);
        state.touch();
        Ok(())
    }

    /// Removes a member by identity.
    ///
    /// Returns true if it was present. Removing an absent member is a no-op.
    pub async fn remove_member(&self, id: &ConnectionId) -> bool {
        self.state.lock().await.members.remove(id).is_some()
    }

    /// Removes `handle` only if it is still the member registered under its id.
    ///
    /// A later connection that joined under the same id is left in place.
    pub(crate) async fn remove_handle(&self, handle: &Arc<dyn ConnectionHandle>) -> bool {
        let mut state = self.state.lock().await;
        match state.members.get(handle.id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                state.members.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    /// Returns a snapshot of the current members.
    pub async fn members(&self) -> Vec<Arc<dyn ConnectionHandle>> {
        self.state.lock().await.members.values().cloned().collect()
    }

    /// Returns the number of current members.
    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Returns the time of the last join or inbound message.
    pub async fn last_used(&self) -> SystemTime {
        self.state.lock().await.last_used
    }

    /// Marks the session as active now.
    pub async fn touch(&self) {
        self.state.lock().await.touch();
    }

    /// Sends `frame` to every member except `sender`.
    ///
    /// Sends run concurrently, each bounded by the session's send timeout.
    /// Members whose send fails or times out are removed and closed; the
    /// others still receive the frame.
    ///
    /// Returns the number of members that received the frame.
    pub async fn broadcast(&self, sender: &ConnectionId, frame: &Frame) -> usize {
        let mut state = self.state.lock().await;

        let recipients: Vec<Arc<dyn ConnectionHandle>> = state
            .members
            .values()
            .filter(|member| member.id() != sender)
            .cloned()
            .collect();

        let results = join_all(
            recipients
                .iter()
                .map(|member| deliver(member.as_ref(), frame.clone(), self.send_timeout)),
        )
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (member, result) in recipients.into_iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        session_key = %self.key,
                        conn_id = %member.id(),
                        error = %e,
                        "Dropping member after failed send"
                    );
                    state.members.remove(member.id());
                    failed.push(member);
                }
            }
        }
        drop(state);

        // Closing a stalled transport can take longer than the send itself;
        // the sender's loop must not wait on it.
        if !failed.is_empty() {
            tokio::spawn(close_members(failed));
        }

        tracing::trace!(
            session_key = %self.key,
            sender = %sender,
            bytes = frame.len(),
            delivered,
            "Broadcast frame"
        );

        delivered
    }

    /// Claims the session for eviction if it has been idle longer than `ttl`.
    ///
    /// On success the session refuses further joins and the members present
    /// at this moment are handed back for the caller to close.
    pub(crate) async fn evict_if_idle(&self, ttl: Duration) -> Option<Vec<Arc<dyn ConnectionHandle>>> {
        let mut state = self.state.lock().await;
        if state.evicted || state.last_active.elapsed() <= ttl {
            return None;
        }
        state.evicted = true;
        Some(state.members.drain().map(|(_, member)| member).collect())
    }

    /// Removes and returns every member, leaving the session registered.
    pub(crate) async fn drain_members(&self) -> Vec<Arc<dyn ConnectionHandle>> {
        let mut state = self.state.lock().await;
        state.members.drain().map(|(_, member)| member).collect()
    }
}

/// Closes `members` concurrently.
pub(crate) async fn close_members(members: Vec<Arc<dyn ConnectionHandle>>) {
    join_all(members.iter().map(|member| member.close())).await;
}

/// Sends one frame to one member within `limit`.
async fn deliver(
    member: &dyn ConnectionHandle,
    frame: Frame,
    limit: Duration,
) -> Result<(), ConnectionError> {
    match tokio::time::timeout(limit, member.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout(limit)),
    }
}
