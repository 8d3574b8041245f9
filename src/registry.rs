//! In-memory user registry shared by every session.
//!
//! Provides a thread-safe key-value store with:
//! - Generated, never-reused user keys
//! - Atomic get, post and delete operations
//! - Removal of a session's own record when the session ends

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::SeedUser;

/// A single registered user
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub name: String,
    pub age: i64,
    /// When the record was inserted
    pub registered_at: DateTime<Local>,
}

impl UserRecord {
    pub fn new(name: impl Into<String>, age: i64) -> Self {
        Self {
            name: name.into(),
            age,
            registered_at: Local::now(),
        }
    }
}

/// Thread-safe user registry.
///
/// Every operation holds the lock for its whole duration, so each command
/// against the registry is one atomic read or write.
pub struct Registry {
    users: Mutex<HashMap<String, UserRecord>>,
    /// Key sequence counter
    next_key: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        }
    }

    /// Create a registry pre-populated with the configured users
    pub fn with_seed(seed: &[SeedUser]) -> Self {
        let registry = Self::new();
        for user in seed {
            registry.post(&user.name, user.age);
        }
        if !registry.is_empty() {
            info!(count = registry.len(), "Seeded user registry");
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UserRecord>> {
        // A panicking holder cannot leave the map half-updated: every
        // mutation is a single insert or remove.
        self.users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn generate_key(&self) -> String {
        format!("user{}", self.next_key.fetch_add(1, Ordering::SeqCst))
    }

    /// Insert a new record under a freshly generated key and return the key
    pub fn post(&self, name: &str, age: i64) -> String {
        let key = self.generate_key();
        let record = UserRecord::new(name, age);
        self.lock().insert(key.clone(), record);
        debug!(key = %key, name, age, "User registered");
        key
    }

    /// Look up a record by key
    pub fn get(&self, key: &str) -> Option<UserRecord> {
        self.lock().get(key).cloned()
    }

    /// Remove a record, returning it if it was present
    pub fn delete(&self, key: &str) -> Option<UserRecord> {
        let removed = self.lock().remove(key);
        if removed.is_some() {
            debug!(key, "User removed");
        }
        removed
    }

    /// Number of records currently stored
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
