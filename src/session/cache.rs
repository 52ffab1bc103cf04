//! Bounded in-memory session cache with least-recently-used ordering.
//!
//! The cache never evicts on its own. [`SessionCache::eviction_order`] tells
//! the owner which entries to flush and remove, so an entry only leaves memory
//! after its state is durable.

use std::collections::HashMap;

use super::types::Session;

#[derive(Debug)]
struct Entry {
    session: Session,
    dirty: bool,
    last_used: u64,
}

/// Capacity-bounded map from session key to session.
#[derive(Debug)]
pub struct SessionCache {
    capacity: usize,
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl SessionCache {
    /// A cache that prefers to hold at most `capacity` sessions (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    /// A cache that never asks for eviction.
    pub fn unbounded() -> Self {
        Self {
            capacity: usize::MAX,
            entries: HashMap::new(),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Borrow a session mutably and mark it most recently used.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Session> {
        let now = self.tick();
        self.entries.get_mut(key).map(|e| {
            e.last_used = now;
            e.session.touch();
            &mut e.session
        })
    }

    /// Borrow without changing recency.
    pub fn peek(&self, key: &str) -> Option<&Session> {
        self.entries.get(key).map(|e| &e.session)
    }

    /// Insert or replace a clean entry as most recently used.
    pub fn insert(&mut self, session: Session) {
        let now = self.tick();
        self.entries.insert(
            session.key.clone(),
            Entry {
                session,
                dirty: false,
                last_used: now,
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> Option<Session> {
        self.entries.remove(key).map(|e| e.session)
    }

    pub fn set_dirty(&mut self, key: &str, dirty: bool) {
        if let Some(e) = self.entries.get_mut(key) {
            e.dirty = dirty;
        }
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.dirty)
    }

    pub fn dirty_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of entries above capacity.
    pub fn overflow(&self) -> usize {
        self.entries.len().saturating_sub(self.capacity)
    }

    /// Keys ordered least recently used first, skipping `protect`.
    pub fn eviction_order(&self, protect: &str) -> Vec<String> {
        let mut order: Vec<(&String, u64)> = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != protect)
            .map(|(k, e)| (k, e.last_used))
            .collect();
        order.sort_by_key(|(_, t)| *t);
        order.into_iter().map(|(k, _)| k.clone()).collect()
    }
}
