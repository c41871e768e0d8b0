//! Key-value store for facts that must survive between actions and cycles.
//!
//! Keys are ordered string segments (`["shards", "rs0", "mongod:27020",
//! "version"]`) so related entries can be listed by prefix. Values are plain
//! strings.
//!
//! # redb table design
//!
//! `RedbStore` uses a single `ENTRIES` table. Each segment is written
//! followed by a `0x00` terminator:
//!
//! ```text
//! shards\0rs0\0mongod:27020\0version\0
//! ```
//!
//! A segment prefix therefore encodes to a byte prefix, and listing a prefix
//! is one range scan from the prefix to the prefix with its last terminator
//! bumped to `0x01`. Segments may not contain `0x00`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RolloutError};

// ---------------------------------------------------------------------------
// StoreKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreKey(Vec<String>);

impl StoreKey {
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if let Some(bad) = segments.iter().find(|s| s.contains('\0')) {
            return Err(RolloutError::Store(format!(
                "key segment contains NUL: {bad:?}"
            )));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &StoreKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for seg in &self.0 {
            out.extend_from_slice(seg.as_bytes());
            out.push(0);
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self(Vec::new()));
        }
        let body = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        let segments = body
            .split(|b| *b == 0)
            .map(|s| {
                String::from_utf8(s.to_vec()).map_err(|e| RolloutError::Store(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(segments))
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// Injected key-value capability. Opened once at process start and shared by
/// reference with every check and command factory.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &StoreKey) -> Result<Option<String>>;

    fn set(&self, key: &StoreKey, value: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn list(&self, prefix: &StoreKey) -> Result<Vec<(StoreKey, String)>>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Process-local store. Nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<StoreKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<StoreKey, String>>> {
        self.entries
            .lock()
            .map_err(|_| RolloutError::Store("memory store lock poisoned".into()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &StoreKey) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &StoreKey, value: &str) -> Result<()> {
        self.lock()?.insert(key.clone(), value.to_string());
        Ok(())
    }

    fn list(&self, prefix: &StoreKey) -> Result<Vec<(StoreKey, String)>> {
        Ok(self
            .lock()?
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

const ENTRIES: TableDefinition<&[u8], &str> = TableDefinition::new("entries");

fn store_err(e: impl fmt::Display) -> RolloutError {
    RolloutError::Store(e.to_string())
}

/// Exclusive upper bound of a prefix scan: the encoded prefix with its final
/// terminator raised from `0x00` to `0x01`.
fn prefix_upper_bound(encoded: &[u8]) -> Option<Vec<u8>> {
    let mut upper = encoded.to_vec();
    let last = upper.last_mut()?;
    *last = 1;
    Some(upper)
}

/// Persistent store backed by a redb file.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating the table and parent
    /// directories if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(ENTRIES).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &StoreKey) -> Result<Option<String>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(ENTRIES).map_err(store_err)?;
        let value = table
            .get(key.encode().as_slice())
            .map_err(store_err)?
            .map(|v| v.value().to_string());
        Ok(value)
    }

    fn set(&self, key: &StoreKey, value: &str) -> Result<()> {
        let encoded = key.encode();
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(ENTRIES).map_err(store_err)?;
            table
                .insert(encoded.as_slice(), value)
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn list(&self, prefix: &StoreKey) -> Result<Vec<(StoreKey, String)>> {
        let lower = prefix.encode();
        let upper = prefix_upper_bound(&lower);
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(ENTRIES).map_err(store_err)?;

        let range = match &upper {
            Some(upper) => table.range(lower.as_slice()..upper.as_slice()),
            None => table.iter(),
        }
        .map_err(store_err)?;

        let mut result = Vec::new();
        for entry in range {
            let (k, v) = entry.map_err(store_err)?;
            result.push((StoreKey::decode(k.value())?, v.value().to_string()));
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(segments: &[&str]) -> StoreKey {
        StoreKey::new(segments.iter().copied()).unwrap()
    }

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("state/test.redb")).unwrap();
        (dir, store)
    }

    fn exercise(store: &dyn KvStore) {
        assert_eq!(store.get(&key(&["shards", "rs0", "a", "version"])).unwrap(), None);

        store
            .set(&key(&["shards", "rs0", "a", "version"]), "4.2.25")
            .unwrap();
        store
            .set(&key(&["shards", "rs0", "b", "version"]), "4.4.29")
            .unwrap();
        store
            .set(&key(&["shards", "rs01", "c", "version"]), "4.4.29")
            .unwrap();
        store.set(&key(&["other"]), "x").unwrap();

        assert_eq!(
            store
                .get(&key(&["shards", "rs0", "a", "version"]))
                .unwrap()
                .as_deref(),
            Some("4.2.25")
        );

        let listed = store.list(&key(&["shards", "rs0"])).unwrap();
        let members: Vec<&str> = listed.iter().map(|(k, _)| k.segments()[2].as_str()).collect();
        assert_eq!(members, vec!["a", "b"], "rs01 must not match prefix rs0");

        // Overwrite keeps one entry.
        store
            .set(&key(&["shards", "rs0", "a", "version"]), "4.4.29")
            .unwrap();
        let listed = store.list(&key(&["shards", "rs0"])).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|(_, v)| v == "4.4.29"));

        assert_eq!(store.list(&key(&[])).unwrap().len(), 4);
    }

    #[test]
    fn memory_store_semantics() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn redb_store_semantics() {
        let (_dir, store) = open_tmp();
        exercise(&store);
    }

    #[test]
    fn redb_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.set(&key(&["shards", "rs0", "a", "version"]), "6.0.15").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(
            store
                .get(&key(&["shards", "rs0", "a", "version"]))
                .unwrap()
                .as_deref(),
            Some("6.0.15")
        );
    }

    #[test]
    fn key_rejects_nul_segments() {
        assert!(StoreKey::new(["ok", "bad\0seg"]).is_err());
    }

    #[test]
    fn key_encoding_roundtrips() {
        let k = key(&["shards", "mongos", "mongos:27017", "version"]);
        assert_eq!(StoreKey::decode(&k.encode()).unwrap(), k);
        assert_eq!(StoreKey::decode(&key(&[]).encode()).unwrap(), key(&[]));
        assert_eq!(k.to_string(), "shards/mongos/mongos:27017/version");
    }
}
