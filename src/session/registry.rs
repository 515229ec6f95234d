//! Session registry
//!
//! The set of active sessions. Admission may happen at any time; removal is
//! deferred to the tick boundary so a tick never iterates a session that is
//! being torn down. Structures that hold per-candidate references register a
//! [`SessionListener`] and are told when a session is gone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::client_data::{ClientSession, SessionId};
use crate::error::{MixerError, Result};

/// Default full-rate distance for new sessions, in metres
pub const DEFAULT_MAX_FULL_RATE_DISTANCE: f32 = 20.0;

/// Notified after a session has left the active set
pub trait SessionListener: Send + Sync {
    /// Called once per removed session, outside any registry lock
    fn session_removed(&self, session: &ClientSession);
}

#[derive(Debug, Default)]
struct Membership {
    tick_in_progress: bool,
    pending_removals: Vec<SessionId>,
}

/// Thread-safe registry of connected sessions
pub struct SessionRegistry {
    /// Map of session ID to session
    sessions: DashMap<SessionId, Arc<ClientSession>>,
    /// Map of peer address to session ID
    by_address: DashMap<SocketAddr, SessionId>,
    /// Next session ID to assign
    next_id: AtomicU64,
    /// Tick boundary and the removals waiting for it
    membership: Mutex<Membership>,
    /// Removal subscribers
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    /// Maximum concurrent sessions
    max_sessions: usize,
    /// Maximum idle time before disconnect
    max_idle_time: Duration,
    /// Full-rate distance given to new sessions
    default_max_full_rate_distance: f32,
}

impl SessionRegistry {
    /// Create a registry with default limits
    pub fn new() -> Self {
        Self::with_limits(1024, 10, DEFAULT_MAX_FULL_RATE_DISTANCE)
    }

    /// Create a registry with custom limits
    pub fn with_limits(
        max_sessions: usize,
        max_idle_secs: u64,
        default_max_full_rate_distance: f32,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            by_address: DashMap::new(),
            next_id: AtomicU64::new(1),
            membership: Mutex::new(Membership::default()),
            listeners: RwLock::new(Vec::new()),
            max_sessions,
            max_idle_time: Duration::from_secs(max_idle_secs),
            default_max_full_rate_distance,
        }
    }

    /// Register a removal listener
    pub fn subscribe(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    /// Admit a peer. A peer that is already connected gets its existing
    /// session back. The address lookup and insert are one step, so
    /// concurrent first datagrams from a peer share a session.
    pub fn connect(&self, address: SocketAddr) -> Result<Arc<ClientSession>> {
        match self.by_address.entry(address) {
            Entry::Occupied(mut entry) => {
                if let Some(session) = self.get(*entry.get()) {
                    return Ok(session);
                }
                // Still mapped to a session waiting for the tick boundary
                let session = self.admit(address)?;
                entry.insert(session.id);
                Ok(session)
            }
            Entry::Vacant(entry) => {
                let session = self.admit(address)?;
                entry.insert(session.id);
                Ok(session)
            }
        }
    }

    fn admit(&self, address: SocketAddr) -> Result<Arc<ClientSession>> {
        if self.sessions.len() >= self.max_sessions {
            warn!(
                address = %address,
                max = self.max_sessions,
                "Session limit reached, refusing peer"
            );
            return Err(MixerError::SessionLimit(self.max_sessions));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(ClientSession::new(
            id,
            address,
            self.default_max_full_rate_distance,
        ));
        self.sessions.insert(id, session.clone());

        info!(
            session_id = id,
            uuid = %session.uuid,
            address = %address,
            "Session created"
        );

        Ok(session)
    }

    /// Get a live session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions
            .get(&id)
            .map(|r| r.clone())
            .filter(|session| !session.is_removed())
    }

    /// Get a live session by peer address
    pub fn find_by_address(&self, address: SocketAddr) -> Option<Arc<ClientSession>> {
        let id = *self.by_address.get(&address)?;
        self.get(id)
    }

    /// Disconnect a session. Unknown or already-removed IDs are ignored.
    ///
    /// During a tick the session is only tombstoned; it leaves the active
    /// set when the tick ends.
    pub fn disconnect(&self, id: SessionId) {
        let removed = {
            let mut membership = self.membership.lock();
            let session = match self.sessions.get(&id).map(|r| r.clone()) {
                Some(session) => session,
                None => return,
            };
            if !session.mark_removed() {
                return;
            }
            if membership.tick_in_progress {
                debug!(session_id = id, "Session tombstoned until tick end");
                membership.pending_removals.push(id);
                Vec::new()
            } else {
                self.remove_now(id).into_iter().collect()
            }
        };
        self.notify(removed);
    }

    /// Disconnect all sessions
    pub fn disconnect_all(&self) {
        for id in self.session_ids() {
            self.disconnect(id);
        }
    }

    /// Open the tick boundary: flush deferred removals and capture the
    /// active set the tick will iterate.
    pub fn begin_tick(&self) -> Vec<Arc<ClientSession>> {
        let (removed, mut active) = {
            let mut membership = self.membership.lock();
            let removed = self.flush_pending(&mut membership);
            membership.tick_in_progress = true;
            let active: Vec<_> = self
                .sessions
                .iter()
                .filter(|r| !r.is_removed())
                .map(|r| r.value().clone())
                .collect();
            (removed, active)
        };
        self.notify(removed);
        active.sort_by_key(|session| session.id);
        active
    }

    /// Close the tick boundary and apply removals that arrived mid-tick
    pub fn end_tick(&self) {
        let removed = {
            let mut membership = self.membership.lock();
            membership.tick_in_progress = false;
            self.flush_pending(&mut membership)
        };
        self.notify(removed);
    }

    fn flush_pending(&self, membership: &mut Membership) -> Vec<Arc<ClientSession>> {
        membership
            .pending_removals
            .drain(..)
            .filter_map(|id| self.remove_now(id))
            .collect()
    }

    fn remove_now(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        let (_, session) = self.sessions.remove(&id)?;
        self.by_address
            .remove_if(&session.address, |_, mapped| *mapped == id);
        info!(
            session_id = id,
            uuid = %session.uuid,
            "Session removed"
        );
        Some(session)
    }

    fn notify(&self, removed: Vec<Arc<ClientSession>>) {
        if removed.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for session in &removed {
            for listener in &listeners {
                listener.session_removed(session);
            }
        }
    }

    /// Get the count of sessions in the active set
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions tombstoned and waiting for the tick to end
    pub fn pending_removal_count(&self) -> usize {
        self.membership.lock().pending_removals.len()
    }

    /// Get list of all live session IDs
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|r| !r.is_removed())
            .map(|r| *r.key())
            .collect()
    }

    /// Iterate over all live sessions
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ClientSession),
    {
        for session in self.sessions.iter() {
            if !session.is_removed() {
                f(&session);
            }
        }
    }

    /// Disconnect sessions that have been silent longer than the idle limit.
    /// Returns the IDs that were disconnected.
    pub fn cleanup_idle(&self) -> Vec<SessionId> {
        let mut to_remove = Vec::new();

        for session in self.sessions.iter() {
            if !session.is_removed() && session.is_idle(self.max_idle_time) {
                debug!(
                    session_id = session.id,
                    idle = ?session.last_activity().elapsed(),
                    "Session idle timeout"
                );
                to_remove.push(session.id);
            }
        }

        for &id in &to_remove {
            self.disconnect(id);
        }
        to_remove
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("max_sessions", &self.max_sessions)
            .field("max_idle_time", &self.max_idle_time)
            .finish()
    }
}
