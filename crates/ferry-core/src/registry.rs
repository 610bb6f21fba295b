//! Bounded registry of live recipient sessions.
//!
//! Owned by the engine and shared with the orchestrators it creates.
//! Terminal sessions are evicted oldest-first when the registry is full;
//! if every entry is still live, inserts are refused.

use crate::error::{FerryError, Result};
use crate::ids::GroupId;
use crate::recipient::RecipientId;
use crate::session::RecipientSession;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::debug;

/// Registry key: one recipient within one transfer
pub type SessionKey = (GroupId, RecipientId);

#[derive(Debug)]
struct Entry {
    session: Arc<RecipientSession>,
    inserted: Instant,
}

/// Bounded session registry
#[derive(Debug)]
pub struct SessionRegistry {
    capacity: usize,
    entries: DashMap<SessionKey, Entry>,
    insert_lock: Mutex<()>,
}

impl SessionRegistry {
    /// Registry holding at most `capacity` sessions.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
            insert_lock: Mutex::new(()),
        }
    }

    /// Register a session.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`] if the key is taken or the
    /// registry is full of live sessions.
    pub fn insert(&self, key: SessionKey, session: Arc<RecipientSession>) -> Result<()> {
        let _guard = self
            .insert_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.entries.contains_key(&key) {
            return Err(FerryError::validation(format!(
                "session for {} in {} already registered",
                key.1, key.0
            )));
        }
        while self.entries.len() >= self.capacity {
            if !self.evict_oldest_terminal() {
                return Err(FerryError::validation(format!(
                    "session registry full ({} live sessions)",
                    self.capacity
                )));
            }
        }
        self.entries.insert(
            key,
            Entry {
                session,
                inserted: Instant::now(),
            },
        );
        Ok(())
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<RecipientSession>> {
        self.entries.get(key).map(|e| Arc::clone(&e.session))
    }

    /// Remove a session.
    pub fn evict(&self, key: &SessionKey) -> Option<Arc<RecipientSession>> {
        self.entries.remove(key).map(|(_, e)| e.session)
    }

    /// Remove every terminal session; returns how many were removed.
    pub fn evict_terminal(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !e.session.status().is_terminal());
        before - self.entries.len()
    }

    /// Registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_oldest_terminal(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .filter(|e| e.session.status().is_terminal())
            .min_by_key(|e| e.inserted)
            .map(|e| e.key().clone());
        match oldest {
            Some(key) => {
                debug!(group = %key.0, recipient = %key.1, "evicting finished session");
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}
