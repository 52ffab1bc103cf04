//! Session module - conversation state with bounded memory residency
//!
//! [`SessionManager`] owns a [`SessionCache`] (LRU, capacity-bounded) and an
//! optional [`SessionStore`] (append-only JSONL logs). Locking is per key.
//! Every mutation goes to memory first and is then appended to the session's
//! log. If the write fails the entry is marked dirty and stays usable; the
//! next successful write, [`SessionManager::save`] or
//! [`SessionManager::flush_all`] rewrites a full snapshot. Dirty entries are flushed before eviction and remain
//! resident if that flush fails.
//!
//! # Example
//!
//! ```
//! use picoclaw::session::{SessionManager, Message};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = SessionManager::new_memory();
//!
//!     manager.append("telegram:chat123", Message::user("Hello!")).await.unwrap();
//!     manager.append("telegram:chat123", Message::assistant("Hi there!")).await.unwrap();
//!
//!     let session = manager.get_or_create("telegram:chat123").await.unwrap();
//!     assert_eq!(session.message_count(), 2);
//! }
//! ```

pub mod cache;
pub mod store;
pub mod types;

pub use cache::SessionCache;
pub use store::{LogRecord, SessionStore};
pub use types::{estimate_tokens, Message, Role, Session, ToolCall, SUMMARY_PREFIX};

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PicoError, Result};

/// Default number of sessions kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Session manager: bounded cache in front of durable per-key logs.
///
/// Cloning is cheap; clones share the same cache and store. Every operation on
/// a key holds that key's lock, so a key's file never sees interleaved
/// writers. The cache lock only guards map bookkeeping and is never held
/// across disk I/O, so one session's flush does not stall the others.
#[derive(Clone)]
pub struct SessionManager {
    cache: Arc<Mutex<SessionCache>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    store: Option<SessionStore>,
}

impl SessionManager {
    /// Persist under `~/.picoclaw/sessions/`.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_path(Config::dir().join("sessions"), capacity)
    }

    /// Persist under `path`, keeping at most `capacity` sessions in memory.
    pub fn with_path(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        Ok(Self {
            cache: Arc::new(Mutex::new(SessionCache::new(capacity))),
            locks: Arc::new(DashMap::new()),
            store: Some(SessionStore::open(path)?),
        })
    }

    /// Memory-only manager. With nowhere to flush, it never evicts.
    pub fn new_memory() -> Self {
        Self {
            cache: Arc::new(Mutex::new(SessionCache::unbounded())),
            locks: Arc::new(DashMap::new()),
            store: None,
        }
    }

    pub fn store(&self) -> Option<&SessionStore> {
        self.store.as_ref()
    }

    /// Get an existing session (memory, then disk) or create an empty one.
    pub async fn get_or_create(&self, key: &str) -> Result<Session> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.ensure_loaded(key).await?;
        self.cache
            .lock()
            .await
            .get_mut(key)
            .map(|s| s.clone())
            .ok_or_else(|| PicoError::NotFound(format!("session {}", key)))
    }

    /// Get a session without creating it.
    pub async fn get(&self, key: &str) -> Result<Option<Session>> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        if let Some(session) = self.cache.lock().await.get_mut(key) {
            return Ok(Some(session.clone()));
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.load(key).await? {
            Some(session) => {
                self.cache.lock().await.insert(session.clone());
                self.evict_overflow(key).await;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Append one message and persist it.
    pub async fn append(&self, key: &str, message: Message) -> Result<()> {
        self.append_many(key, vec![message]).await
    }

    /// Append several messages in order with a single log write.
    ///
    /// The in-memory session is updated even if the write fails; the error
    /// is returned so the caller can report degraded durability.
    pub async fn append_many(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.ensure_loaded(key).await?;
        if let Some(session) = self.cache.lock().await.get_mut(key) {
            for msg in &messages {
                session.add_message(msg.clone());
            }
        }
        let records = messages
            .into_iter()
            .map(|message| LogRecord::Message { message })
            .collect();
        self.persist(key, records).await
    }

    /// Replace `messages[start..end]` of `key` with a summary.
    pub async fn compact(&self, key: &str, start: usize, end: usize, summary: &str) -> Result<bool> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.ensure_loaded(key).await?;
        let applied = self
            .cache
            .lock()
            .await
            .get_mut(key)
            .is_some_and(|s| s.compact_span(start, end, summary));
        if !applied {
            return Ok(false);
        }
        self.persist(
            key,
            vec![LogRecord::Compacted {
                start,
                end,
                summary: summary.to_string(),
            }],
        )
        .await?;
        Ok(true)
    }

    /// Rewrite the whole history of `key`.
    ///
    /// The consolidation mark is kept but capped at the new logical count.
    /// The log is rewritten as a snapshot rather than appended to.
    pub async fn replace(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.ensure_loaded(key).await?;
        {
            let mut cache = self.cache.lock().await;
            if let Some(session) = cache.get_mut(key) {
                session.messages = messages;
                session.consolidated_count = session.consolidated_count.min(session.logical_count());
                session.updated_at = chrono::Utc::now();
            }
            cache.set_dirty(key, true);
        }
        self.flush_key(key).await
    }

    /// Advance the consolidation mark. Returns true if it moved.
    pub async fn mark_consolidated(&self, key: &str, count: usize) -> Result<bool> {
        self.advance_mark(key, None, count).await
    }

    /// Advance the consolidation mark only if `key` is still in clear
    /// generation `epoch`. Returns true if it moved.
    pub async fn mark_consolidated_in(&self, key: &str, epoch: u64, count: usize) -> Result<bool> {
        self.advance_mark(key, Some(epoch), count).await
    }

    /// Drop every message of `key`.
    pub async fn clear(&self, key: &str) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.ensure_loaded(key).await?;
        if let Some(session) = self.cache.lock().await.get_mut(key) {
            session.clear();
        }
        self.persist(key, vec![LogRecord::Cleared]).await
    }

    /// Copy the current state of `key` to the archive directory.
    ///
    /// Returns `None` for memory-only managers or empty sessions.
    pub async fn archive(&self, key: &str) -> Result<Option<PathBuf>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.ensure_loaded(key).await?;
        let session = self.cache.lock().await.peek(key).cloned();
        match session {
            Some(session) if !session.is_empty() => Ok(Some(store.archive(&session).await?)),
            _ => Ok(None),
        }
    }

    /// Durably flush `key` as a compacted snapshot.
    pub async fn save(&self, key: &str) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.flush_key(key).await
    }

    /// Drop `key` from memory, flushing first if it has unsaved changes.
    ///
    /// If that flush fails the entry stays cached and the error is returned.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        if self.cache.lock().await.is_dirty(key) {
            self.flush_key(key).await?;
        }
        self.cache.lock().await.remove(key);
        Ok(())
    }

    /// Flush every dirty session. Attempts all of them and returns the first
    /// error, if any.
    pub async fn flush_all(&self) -> Result<()> {
        let dirty = self.cache.lock().await.dirty_keys();
        let mut first_err = None;
        for key in dirty {
            let lock = self.key_lock(&key);
            let _guard = lock.lock().await;
            if !self.cache.lock().await.is_dirty(&key) {
                continue;
            }
            if let Err(e) = self.flush_key(&key).await {
                warn!(session = %key, error = %e, "Failed to flush session");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove a session from memory and disk.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.cache.lock().await.remove(key);
        if let Some(store) = &self.store {
            store.remove(key).await?;
        }
        Ok(())
    }

    /// Keys of all known sessions, in memory or on disk.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut keys = self.cache.lock().await.keys();
        if let Some(store) = &self.store {
            for key in store.keys().await? {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn is_cached(&self, key: &str) -> bool {
        self.cache.lock().await.contains(key)
    }

    pub async fn is_dirty(&self, key: &str) -> bool {
        self.cache.lock().await.is_dirty(key)
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }

    // ------------------------------------------------------------------------

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Caller holds the lock of `key`.
    async fn ensure_loaded(&self, key: &str) -> Result<()> {
        if self.cache.lock().await.contains(key) {
            return Ok(());
        }
        let session = match &self.store {
            Some(store) => store.load(key).await?,
            None => None,
        }
        .unwrap_or_else(|| Session::new(key));
        self.cache.lock().await.insert(session);
        self.evict_overflow(key).await;
        Ok(())
    }

    /// Flush and drop least recently used sessions until the cache fits.
    ///
    /// Sessions whose lock is held elsewhere are in use and skipped, as are
    /// sessions whose flush fails.
    async fn evict_overflow(&self, protect: &str) {
        let order = {
            let cache = self.cache.lock().await;
            if cache.overflow() == 0 {
                return;
            }
            cache.eviction_order(protect)
        };
        for candidate in order {
            if self.cache.lock().await.overflow() == 0 {
                break;
            }
            let lock = self.key_lock(&candidate);
            let Ok(_guard) = lock.try_lock() else {
                debug!(session = %candidate, "Session busy, not evicting");
                continue;
            };
            if self.cache.lock().await.is_dirty(&candidate) {
                if let Err(e) = self.flush_key(&candidate).await {
                    warn!(session = %candidate, error = %e, "Flush before eviction failed, keeping session in memory");
                    continue;
                }
            }
            self.cache.lock().await.remove(&candidate);
            debug!(session = %candidate, "Evicted session from memory");
        }
    }

    async fn advance_mark(&self, key: &str, epoch: Option<u64>, count: usize) -> Result<bool> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.ensure_loaded(key).await?;
        let moved = {
            let mut cache = self.cache.lock().await;
            match cache.get_mut(key) {
                Some(session) if epoch.is_some_and(|e| e != session.epoch) => {
                    debug!(session = %key, "Session cleared since the mark was computed");
                    None
                }
                Some(session) => session
                    .mark_consolidated(count)
                    .then_some(session.consolidated_count),
                None => None,
            }
        };
        let Some(count) = moved else {
            return Ok(false);
        };
        self.persist(key, vec![LogRecord::Consolidated { count }])
            .await?;
        Ok(true)
    }

    /// Write a full snapshot of `key`. Caller holds the lock of `key`.
    async fn flush_key(&self, key: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(session) = self.cache.lock().await.peek(key).cloned() else {
            return Ok(());
        };
        store.write_snapshot(&session).await?;
        self.cache.lock().await.set_dirty(key, false);
        Ok(())
    }

    /// Log `records` for `key`. Caller holds the lock of `key`.
    async fn persist(&self, key: &str, records: Vec<LogRecord>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        // A dirty entry's log is missing earlier mutations, so appending would
        // not replay correctly. Rewrite it in full instead.
        let (session, dirty) = {
            let cache = self.cache.lock().await;
            let Some(session) = cache.peek(key) else {
                return Ok(());
            };
            if cache.is_dirty(key) {
                (session.clone(), true)
            } else {
                (session.header(), false)
            }
        };
        let result = if dirty {
            store.write_snapshot(&session).await
        } else {
            store.append(&session, &records).await
        };
        let mut cache = self.cache.lock().await;
        match result {
            Ok(()) => {
                cache.set_dirty(key, false);
                Ok(())
            }
            Err(e) => {
                warn!(session = %key, error = %e, "Session write failed, continuing in memory");
                cache.set_dirty(key, true);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn break_storage(dir: &Path) {
        std::fs::remove_dir_all(dir).unwrap();
        std::fs::write(dir, b"not a directory").unwrap();
    }

    fn restore_storage(dir: &Path) {
        std::fs::remove_file(dir).unwrap();
        std::fs::create_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_get_or_create_and_append() {
        let manager = SessionManager::new_memory();
        let session = manager.get_or_create("cli:a").await.unwrap();
        assert!(session.is_empty());

        manager.append("cli:a", Message::user("hi")).await.unwrap();
        let session = manager.get("cli:a").await.unwrap().unwrap();
        assert_eq!(session.message_count(), 1);
        assert!(manager.get("cli:missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistence_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let manager = SessionManager::with_path(dir.path(), 8).unwrap();
            manager
                .append_many(
                    "telegram:1",
                    vec![Message::user("one"), Message::assistant("two")],
                )
                .await
                .unwrap();
            manager.mark_consolidated("telegram:1", 1).await.unwrap();
        }
        let manager = SessionManager::with_path(dir.path(), 8).unwrap();
        let session = manager.get_or_create("telegram:1").await.unwrap();
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.consolidated_count, 1);
        assert_eq!(manager.list().await.unwrap(), vec!["telegram:1"]);
    }

    #[tokio::test]
    async fn test_lru_eviction_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::with_path(dir.path(), 2).unwrap();
        for key in ["a", "b"] {
            manager.append(key, Message::user(key)).await.unwrap();
        }
        // Touch "a" so "b" becomes least recently used.
        manager.get_or_create("a").await.unwrap();
        manager.append("c", Message::user("c")).await.unwrap();

        assert_eq!(manager.cached_len().await, 2);
        assert!(manager.is_cached("a").await);
        assert!(!manager.is_cached("b").await);

        let b = manager.get_or_create("b").await.unwrap();
        assert_eq!(b.messages[0].content, "b");
    }

    #[tokio::test]
    async fn test_eviction_never_drops_unflushed_mutations() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sessions");
        let manager = SessionManager::with_path(&dir, 1).unwrap();
        manager.append("a", Message::user("saved")).await.unwrap();

        break_storage(&dir);
        let err = manager
            .append("a", Message::user("unsaved"))
            .await
            .unwrap_err();
        assert!(matches!(err, PicoError::SessionIo(_)));
        assert!(manager.is_dirty("a").await);

        // Loading "b" overflows the cache, but "a" cannot be flushed.
        manager.get_or_create("b").await.unwrap();
        assert!(manager.is_cached("a").await);
        assert_eq!(manager.cached_len().await, 2);
        assert!(manager.invalidate("a").await.is_err());
        assert!(manager.is_cached("a").await);

        restore_storage(&dir);
        manager.get_or_create("c").await.unwrap();
        assert!(!manager.is_cached("a").await);
        assert_eq!(manager.cached_len().await, 1);

        let a = manager.get_or_create("a").await.unwrap();
        let contents: Vec<_> = a.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["saved", "unsaved"]);
    }

    #[tokio::test]
    async fn test_flush_all_recovers_dirty_sessions() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sessions");
        let manager = SessionManager::with_path(&dir, 8).unwrap();

        break_storage(&dir);
        assert!(manager.append("x", Message::user("1")).await.is_err());
        assert!(manager.flush_all().await.is_err());

        restore_storage(&dir);
        manager.flush_all().await.unwrap();
        assert!(!manager.is_dirty("x").await);

        manager.invalidate("x").await.unwrap();
        assert!(!manager.is_cached("x").await);
        let x = manager.get_or_create("x").await.unwrap();
        assert_eq!(x.message_count(), 1);
    }

    #[tokio::test]
    async fn test_compact_persists() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::with_path(dir.path(), 8).unwrap();
        let msgs = (0..6).map(|i| Message::user(&i.to_string())).collect();
        manager.append_many("k", msgs).await.unwrap();
        assert!(manager.compact("k", 0, 4, "early chat").await.unwrap());
        assert!(!manager.compact("k", 5, 99, "bad").await.unwrap());

        manager.invalidate("k").await.unwrap();
        let k = manager.get_or_create("k").await.unwrap();
        assert_eq!(k.message_count(), 3);
        assert_eq!(k.consolidated_count, 4);
        assert!(k.messages[0].is_summary());
    }

    #[tokio::test]
    async fn test_clear_and_archive() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::with_path(dir.path(), 8).unwrap();
        manager.append("cli:x", Message::user("keep me")).await.unwrap();

        let archived = manager.archive("cli:x").await.unwrap().unwrap();
        assert!(archived.exists());
        manager.clear("cli:x").await.unwrap();

        manager.invalidate("cli:x").await.unwrap();
        assert!(manager.get_or_create("cli:x").await.unwrap().is_empty());
        assert!(manager.archive("cli:x").await.unwrap().is_none());

        let text = std::fs::read_to_string(archived).unwrap();
        assert!(text.contains("keep me"));
    }

    #[tokio::test]
    async fn test_memory_manager_never_evicts() {
        let manager = SessionManager::new_memory();
        for i in 0..(DEFAULT_CACHE_CAPACITY * 2) {
            manager
                .append(&i.to_string(), Message::user("x"))
                .await
                .unwrap();
        }
        assert_eq!(manager.cached_len().await, DEFAULT_CACHE_CAPACITY * 2);
        assert!(manager.archive("0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_keys() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::with_path(dir.path(), 4).unwrap();
        let mut handles = Vec::new();
        for t in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("chat:{}", t);
                for i in 0..10 {
                    manager
                        .append(&key, Message::user(&i.to_string()))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for t in 0..8 {
            let s = manager.get_or_create(&format!("chat:{}", t)).await.unwrap();
            assert_eq!(s.message_count(), 10);
        }
        assert!(manager.cached_len().await <= 4);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::with_path(dir.path(), 4).unwrap();
        manager.append("gone", Message::user("x")).await.unwrap();
        manager.delete("gone").await.unwrap();
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_rewrites_history() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::with_path(dir.path(), 4).unwrap();
        for i in 0..4 {
            manager
                .append("r", Message::user(&i.to_string()))
                .await
                .unwrap();
        }
        manager.mark_consolidated("r", 3).await.unwrap();
        manager
            .replace("r", vec![Message::user("only")])
            .await
            .unwrap();

        let reopened = SessionManager::with_path(dir.path(), 4).unwrap();
        let s = reopened.get_or_create("r").await.unwrap();
        assert_eq!(s.message_count(), 1);
        assert_eq!(s.messages[0].content, "only");
        assert_eq!(s.consolidated_count, 1);
    }

    #[tokio::test]
    async fn test_busy_key_does_not_block_other_keys() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::with_path(dir.path(), 8).unwrap();
        manager.append("a", Message::user("a")).await.unwrap();

        let lock = manager.key_lock("a");
        let held = lock.lock().await;
        let other = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            manager.append("b", Message::user("b")),
        )
        .await;
        assert!(other.is_ok(), "writes to b waited on a");
        let same = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            manager.append("a", Message::user("again")),
        )
        .await;
        assert!(same.is_err());
        drop(held);

        manager.append("a", Message::user("again")).await.unwrap();
        assert_eq!(manager.get_or_create("a").await.unwrap().message_count(), 2);
    }

    #[tokio::test]
    async fn test_busy_session_is_not_evicted() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::with_path(dir.path(), 1).unwrap();
        manager.append("a", Message::user("a")).await.unwrap();

        let lock = manager.key_lock("a");
        let held = lock.lock().await;
        manager.append("b", Message::user("b")).await.unwrap();
        assert!(manager.is_cached("a").await);
        assert_eq!(manager.cached_len().await, 2);
        drop(held);

        manager.append("c", Message::user("c")).await.unwrap();
        assert_eq!(manager.cached_len().await, 1);
        assert!(manager.is_cached("c").await);
    }

    #[tokio::test]
    async fn test_mark_in_stale_generation_is_ignored() {
        let manager = SessionManager::new_memory();
        for i in 0..3 {
            manager.append("k", Message::user(&i.to_string())).await.unwrap();
        }
        let before = manager.get_or_create("k").await.unwrap();
        manager.clear("k").await.unwrap();
        manager.append("k", Message::user("fresh")).await.unwrap();

        assert!(!manager.mark_consolidated_in("k", before.epoch, 3).await.unwrap());
        let after = manager.get_or_create("k").await.unwrap();
        assert_eq!(after.epoch, before.epoch + 1);
        assert_eq!(after.consolidated_count, 0);

        assert!(manager.mark_consolidated_in("k", after.epoch, 1).await.unwrap());
        assert_eq!(manager.get_or_create("k").await.unwrap().consolidated_count, 1);
    }
}
