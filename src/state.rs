//! Durable forwarding state: per-source cursors and the set of batch
//! fingerprints that were already handled.
//!
//! Mutations only touch memory and mark the store dirty. [`StateStore::flush`]
//! rewrites both tables inside a single SQLite transaction, so the file on
//! disk always holds the last fully committed snapshot.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::StateConfig;
use crate::error::StateStoreError;
use crate::platform::{ChatId, Cursor, Source, SourceKind};

/// Stable dedup key of a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn for_message(source_id: ChatId, message_id: i64) -> Self {
        Self::digest(&format!("{}:m:{}", source_id, message_id))
    }

    pub fn for_group(source_id: ChatId, group_key: &str) -> Self {
        Self::digest(&format!("{}:g:{}", source_id, group_key))
    }

    fn digest(input: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full hashes are noise in logs
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// Plain copy of everything the store persists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub cursors: BTreeMap<ChatId, Cursor>,
    /// Oldest first
    pub seen: Vec<Fingerprint>,
}

#[derive(Debug, Clone, Copy)]
pub struct StateOptions {
    pub max_flush_failures: u32,
    /// 0 keeps every fingerprint
    pub seen_capacity: usize,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            max_flush_failures: 5,
            seen_capacity: 10_000,
        }
    }
}

impl From<&StateConfig> for StateOptions {
    fn from(config: &StateConfig) -> Self {
        Self {
            max_flush_failures: config.max_flush_failures,
            seen_capacity: config.seen_capacity,
        }
    }
}

struct Inner {
    conn: Connection,
    cursors: HashMap<ChatId, Cursor>,
    seen: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
    dirty: bool,
    consecutive_failures: u32,
    options: StateOptions,
}

impl Inner {
    fn insert_seen(&mut self, fingerprint: Fingerprint) -> bool {
        if !self.seen.insert(fingerprint.clone()) {
            return false;
        }
        self.order.push_back(fingerprint);
        self.evict_overflow();
        self.dirty = true;
        true
    }

    fn evict_overflow(&mut self) {
        let capacity = self.options.seen_capacity;
        if capacity == 0 {
            return;
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
                self.dirty = true;
            }
        }
    }

    fn write_snapshot(&mut self) -> Result<(), StateStoreError> {
        let Inner {
            conn,
            cursors,
            order,
            ..
        } = self;

        // Dropping the transaction without commit rolls it back
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cursors", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO cursors (source_id, kind, value) VALUES (?1, ?2, ?3)")?;
            for (source_id, cursor) in cursors.iter() {
                stmt.execute(params![source_id, cursor.kind().to_string(), cursor.value()])?;
            }
        }
        tx.execute("DELETE FROM seen", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO seen (seq, fingerprint) VALUES (?1, ?2)")?;
            for (seq, fingerprint) in order.iter().enumerate() {
                stmt.execute(params![seq as i64, fingerprint.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Thread-safe handle to the forwarding state
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<Inner>>,
}

impl StateStore {
    /// Open or create the state database at the given path
    pub fn open(path: &Path, options: StateOptions) -> Result<Self, StateStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        let store = Self::from_connection(conn, options)?;
        info!("State store opened at: {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(options: StateOptions) -> Result<Self, StateStoreError> {
        Self::from_connection(Connection::open_in_memory()?, options)
    }

    fn from_connection(conn: Connection, options: StateOptions) -> Result<Self, StateStoreError> {
        Self::run_migrations(&conn)?;
        let cursors = Self::load_cursors(&conn)?;
        let loaded = Self::load_seen(&conn)?;

        let mut inner = Inner {
            conn,
            cursors,
            seen: loaded.iter().cloned().collect(),
            order: loaded.into_iter().collect(),
            dirty: false,
            consecutive_failures: 0,
            options,
        };
        inner.evict_overflow();

        info!(
            cursors = inner.cursors.len(),
            seen = inner.order.len(),
            "Loaded forwarding state"
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StateStoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cursors (
                source_id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS seen (
                seq INTEGER PRIMARY KEY,
                fingerprint TEXT NOT NULL UNIQUE
            );
            ",
        )?;
        Ok(())
    }

    fn load_cursors(conn: &Connection) -> Result<HashMap<ChatId, Cursor>, StateStoreError> {
        let mut stmt = conn.prepare("SELECT source_id, kind, value FROM cursors")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut cursors = HashMap::with_capacity(rows.len());
        for (source_id, kind, value) in rows {
            let kind = match kind.as_str() {
                "broadcast" => SourceKind::Broadcast,
                "group" => SourceKind::Group,
                other => {
                    return Err(StateStoreError::Corrupt(format!(
                        "unknown cursor kind '{}' for source {}",
                        other, source_id
                    )))
                }
            };
            cursors.insert(source_id, Cursor::new(kind, value));
        }
        Ok(cursors)
    }

    fn load_seen(conn: &Connection) -> Result<Vec<Fingerprint>, StateStoreError> {
        let mut stmt = conn.prepare("SELECT fingerprint FROM seen ORDER BY seq ASC")?;
        let seen = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(Fingerprint))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(seen)
    }

    /// The stored cursor for `source`, or its initial value. A cursor stored
    /// under a different kind is ignored.
    pub async fn get_cursor(&self, source: &Source) -> Cursor {
        match self.stored_cursor(source.id).await {
            Some(cursor) if cursor.kind() == source.kind => cursor,
            Some(cursor) => {
                warn!(
                    source = source.id,
                    "Stored cursor ({}) does not match configured kind {}, starting over",
                    cursor,
                    source.kind
                );
                Cursor::start(source.kind)
            }
            None => Cursor::start(source.kind),
        }
    }

    pub async fn stored_cursor(&self, source_id: ChatId) -> Option<Cursor> {
        self.inner.lock().await.cursors.get(&source_id).copied()
    }

    /// Move the cursor forward. Never moves backwards; returns whether it moved.
    pub async fn set_cursor(&self, source_id: ChatId, cursor: Cursor) -> bool {
        let mut inner = self.inner.lock().await;
        let current = inner.cursors.get(&source_id).copied();
        let next = match current {
            Some(existing) => existing.max(cursor),
            None => cursor,
        };
        if current == Some(next) {
            return false;
        }
        inner.cursors.insert(source_id, next);
        inner.dirty = true;
        true
    }

    pub async fn has_seen(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.lock().await.seen.contains(fingerprint)
    }

    /// Record a fingerprint; returns false if it was already present.
    pub async fn mark_seen(&self, fingerprint: Fingerprint) -> bool {
        self.inner.lock().await.insert_seen(fingerprint)
    }

    /// Persist pending changes atomically.
    ///
    /// Individual failures are returned as-is and leave the changes pending
    /// for the next call. Once `max_flush_failures` calls in a row have
    /// failed the error becomes [`StateStoreError::Exhausted`].
    pub async fn flush(&self) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.dirty {
            return Ok(());
        }

        match inner.write_snapshot() {
            Ok(()) => {
                inner.dirty = false;
                inner.consecutive_failures = 0;
                debug!(
                    cursors = inner.cursors.len(),
                    seen = inner.order.len(),
                    "State flushed"
                );
                Ok(())
            }
            Err(e) => {
                inner.consecutive_failures += 1;
                let failures = inner.consecutive_failures;
                if failures >= inner.options.max_flush_failures {
                    error!(failures, "State flush keeps failing: {}", e);
                    Err(StateStoreError::Exhausted {
                        failures,
                        last: e.to_string(),
                    })
                } else {
                    warn!(failures, "State flush failed: {}", e);
                    Err(e)
                }
            }
        }
    }

    pub async fn snapshot(&self) -> PersistedState {
        let inner = self.inner.lock().await;
        PersistedState {
            cursors: inner.cursors.iter().map(|(k, v)| (*k, *v)).collect(),
            seen: inner.order.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: ChatId) -> Source {
        Source {
            id,
            kind: SourceKind::Group,
        }
    }

    #[tokio::test]
    async fn test_unknown_source_starts_at_initial_cursor() {
        let store = StateStore::open_in_memory(StateOptions::default()).unwrap();
        assert_eq!(store.get_cursor(&group(1)).await, Cursor::Group(0));
        assert_eq!(store.stored_cursor(1).await, None);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let store = StateStore::open_in_memory(StateOptions::default()).unwrap();
        assert!(store.set_cursor(1, Cursor::Group(10)).await);
        assert!(!store.set_cursor(1, Cursor::Group(7)).await);
        assert!(!store.set_cursor(1, Cursor::Group(10)).await);
        assert_eq!(store.get_cursor(&group(1)).await, Cursor::Group(10));
        assert!(store.set_cursor(1, Cursor::Group(11)).await);
        assert_eq!(store.get_cursor(&group(1)).await, Cursor::Group(11));
    }

    #[tokio::test]
    async fn test_mismatched_kind_is_ignored() {
        let store = StateStore::open_in_memory(StateOptions::default()).unwrap();
        store.set_cursor(1, Cursor::Broadcast(500)).await;
        assert_eq!(store.get_cursor(&group(1)).await, Cursor::Group(0));
    }

    #[tokio::test]
    async fn test_mark_seen_is_idempotent() {
        let store = StateStore::open_in_memory(StateOptions::default()).unwrap();
        let fp = Fingerprint::for_message(1, 42);
        assert!(!store.has_seen(&fp).await);
        assert!(store.mark_seen(fp.clone()).await);
        assert!(!store.mark_seen(fp.clone()).await);
        assert!(store.has_seen(&fp).await);
        assert_eq!(store.snapshot().await.seen, vec![fp]);
    }

    #[tokio::test]
    async fn test_seen_capacity_evicts_oldest() {
        let store = StateStore::open_in_memory(StateOptions {
            max_flush_failures: 3,
            seen_capacity: 2,
        })
        .unwrap();
        let fps: Vec<_> = (1..=3).map(|id| Fingerprint::for_message(1, id)).collect();
        for fp in &fps {
            store.mark_seen(fp.clone()).await;
        }
        assert!(!store.has_seen(&fps[0]).await);
        assert!(store.has_seen(&fps[1]).await);
        assert!(store.has_seen(&fps[2]).await);
    }

    #[tokio::test]
    async fn test_flush_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("forwarder.db");

        let expected = {
            let store = StateStore::open(&path, StateOptions::default()).unwrap();
            store.set_cursor(-1001, Cursor::Broadcast(102)).await;
            store.set_cursor(-1002, Cursor::Group(77)).await;
            store.mark_seen(Fingerprint::for_message(-1001, 5001)).await;
            store.mark_seen(Fingerprint::for_group(-1002, "g1")).await;
            store.mark_seen(Fingerprint::for_message(-1001, 5002)).await;
            store.flush().await.unwrap();
            store.snapshot().await
        };

        let reopened = StateStore::open(&path, StateOptions::default()).unwrap();
        assert_eq!(reopened.snapshot().await, expected);
        assert_eq!(expected.seen.len(), 3);
    }

    #[tokio::test]
    async fn test_unflushed_changes_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forwarder.db");
        {
            let store = StateStore::open(&path, StateOptions::default()).unwrap();
            store.set_cursor(1, Cursor::Group(5)).await;
            store.flush().await.unwrap();
            store.set_cursor(1, Cursor::Group(9)).await;
        }
        let reopened = StateStore::open(&path, StateOptions::default()).unwrap();
        assert_eq!(reopened.stored_cursor(1).await, Some(Cursor::Group(5)));
    }

    #[tokio::test]
    async fn test_repeated_flush_failure_escalates() {
        let store = StateStore::open_in_memory(StateOptions {
            max_flush_failures: 3,
            seen_capacity: 0,
        })
        .unwrap();
        store.set_cursor(1, Cursor::Group(5)).await;
        store.flush().await.unwrap();

        store
            .inner
            .lock()
            .await
            .conn
            .execute_batch("DROP TABLE seen;")
            .unwrap();
        store.set_cursor(1, Cursor::Group(6)).await;
        store.mark_seen(Fingerprint::for_message(1, 1)).await;

        for _ in 0..2 {
            let err = store.flush().await.unwrap_err();
            assert!(!err.is_fatal());
        }
        let err = store.flush().await.unwrap_err();
        assert!(matches!(err, StateStoreError::Exhausted { failures: 3, .. }));

        // Failed transactions rolled back; the last committed cursor remains
        let value: i64 = store
            .inner
            .lock()
            .await
            .conn
            .query_row("SELECT value FROM cursors WHERE source_id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_successful_flush_resets_failure_count() {
        let store = StateStore::open_in_memory(StateOptions {
            max_flush_failures: 2,
            seen_capacity: 0,
        })
        .unwrap();
        store
            .inner
            .lock()
            .await
            .conn
            .execute_batch("ALTER TABLE seen RENAME TO seen_moved;")
            .unwrap();
        store.mark_seen(Fingerprint::for_message(1, 1)).await;
        assert!(!store.flush().await.unwrap_err().is_fatal());

        store
            .inner
            .lock()
            .await
            .conn
            .execute_batch("ALTER TABLE seen_moved RENAME TO seen;")
            .unwrap();
        store.flush().await.unwrap();

        store
            .inner
            .lock()
            .await
            .conn
            .execute_batch("ALTER TABLE seen RENAME TO seen_moved;")
            .unwrap();
        store.mark_seen(Fingerprint::for_message(1, 2)).await;
        assert!(!store.flush().await.unwrap_err().is_fatal());
    }

    #[test]
    fn test_fingerprints_are_stable_hex() {
        let a = Fingerprint::for_message(-1001, 5);
        assert_eq!(a, Fingerprint::for_message(-1001, 5));
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, Fingerprint::for_message(-1002, 5));
        assert_ne!(a, Fingerprint::for_group(-1001, "5"));
        assert_eq!(a.to_string().len(), 12);
    }
}
