//! Arena of live sessions.
//!
//! Each accepted connection gets a slot holding its peer address and its
//! close token. Shutdown walks the arena and signals every live session;
//! a session frees its own slot when it ends.

use chrono::{DateTime, Local};
use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Cancelled when the server wants the session to end
pub type CloseSignal = CancellationToken;

/// Server-side handle to one live session.
#[derive(Debug)]
pub struct SessionHandle {
    pub peer: SocketAddr,
    pub connected_at: DateTime<Local>,
    close: CloseSignal,
}

impl SessionHandle {
    /// Ask the session to close. Returns false if it was already asked.
    fn signal_close(&self) -> bool {
        if self.close.is_cancelled() {
            return false;
        }
        self.close.cancel();
        true
    }
}

/// Live sessions indexed by session id.
///
/// Provides O(1) insert, lookup, and remove operations.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<Slab<SessionHandle>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slab<SessionHandle>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new session, returning its id and close signal.
    pub fn insert(&self, peer: SocketAddr) -> (usize, CloseSignal) {
        let close = CancellationToken::new();
        let id = self.lock().insert(SessionHandle {
            peer,
            connected_at: Local::now(),
            close: close.clone(),
        });
        (id, close)
    }

    /// Remove a session's slot.
    pub fn remove(&self, id: usize) -> Option<SessionHandle> {
        let mut sessions = self.lock();
        if sessions.contains(id) {
            Some(sessions.remove(id))
        } else {
            None
        }
    }

    /// Signal every live session to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, handle)| handle.signal_close())
            .count()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
