// The bounded index of cache entries.
//
// Entries live in `shard-NN` sub-directories of the cache root, picked by the crc32 of
// the key. Every entry gets its own file name (`<crc32>-<generation>.bin`), so an entry
// created after an eviction never touches the file an older reader is still draining.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use lru::LruCache;
use tracing::{debug, info, trace, warn};

use super::entry::{CacheEntry, EntryReader, EntryStatus, EntryWriter, DEFAULT_READ_CHUNK};
use super::{CacheError, CacheKey};

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Maximum number of resident entries
    pub capacity: usize,
    pub shard_count: usize,
    pub read_chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("spool"),
            capacity: 1024,
            shard_count: 16,
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }
}

impl StoreConfig {
    fn shard_dir(&self, shard: usize) -> PathBuf {
        self.root.join(format!("shard-{:02}", shard))
    }
}

type EntryMap = LruCache<CacheKey, CacheEntry, ahash::RandomState>;

struct StoreInner {
    config: StoreConfig,
    generation: AtomicU64,
    entries: Mutex<EntryMap>,
}

/// Capacity-bounded map from [CacheKey] to [CacheEntry] with LRU eviction
///
/// Entries that are still being written are pinned: they are never chosen as an
/// eviction victim.
#[derive(Clone)]
pub struct EntryStore {
    inner: Arc<StoreInner>,
}

impl EntryStore {
    /// Create the shard directories and remove body files left behind by a previous
    /// run. Nothing is persisted across restarts, so those files are unreachable.
    pub fn open(mut config: StoreConfig) -> io::Result<Self> {
        config.capacity = config.capacity.max(1);
        config.shard_count = config.shard_count.max(1);
        config.read_chunk_size = config.read_chunk_size.max(1);

        let mut purged = 0usize;
        for shard in 0..config.shard_count {
            let dir = config.shard_dir(shard);
            fs::create_dir_all(&dir)?;
            purged += purge_stale_files(&dir)?;
        }
        info!(
            root = %config.root.display(),
            capacity = config.capacity,
            shards = config.shard_count,
            purged,
            "Opened cache store"
        );

        let entries = LruCache::unbounded_with_hasher(ahash::RandomState::new());
        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                generation: AtomicU64::new(0),
                entries: Mutex::new(entries),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is resident. Does not count as a use.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.lock().contains(key)
    }

    /// Create and index a new entry for `key` and return its writer.
    ///
    /// If the writer fails, the entry is removed from the index again.
    pub fn open_for_write(&self, key: &CacheKey) -> Result<EntryWriter, CacheError> {
        // An evicted entry may hold the last handle on its file; it is released
        // after the lock
        let (entry, _evicted) = {
            let mut entries = self.lock();
            if entries.contains(key) {
                return Err(CacheError::EntryExists(key.clone()));
            }
            let evicted = if entries.len() >= self.inner.config.capacity {
                Some(self.evict_one(&mut entries)?)
            } else {
                None
            };
            let entry = CacheEntry::new(self.location(key));
            entries.put(key.clone(), entry.clone());
            (entry, evicted)
        };

        let writer = match entry.open_for_write() {
            Ok(writer) => writer,
            Err(e) => {
                self.remove_entry(key, &entry);
                return Err(e);
            }
        };
        trace!(key = %key, path = %entry.location().display(), "Opened cache entry for writing");

        let store = Arc::downgrade(&self.inner);
        let failed_key = key.clone();
        let failed_entry = entry.clone();
        Ok(writer.on_failure(move || {
            if let Some(inner) = Weak::upgrade(&store) {
                EntryStore { inner }.remove_entry(&failed_key, &failed_entry);
            }
        }))
    }

    /// Open a read stream over the entry for `key`, refreshing its recency.
    pub fn open_for_read(&self, key: &CacheKey) -> Result<EntryReader, CacheError> {
        let entry = self
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(key.clone()))?;
        Ok(entry.open_for_read(self.inner.config.read_chunk_size))
    }

    /// Unindex `key`, but only if it still maps to `entry`.
    pub fn remove_entry(&self, key: &CacheKey, entry: &CacheEntry) -> bool {
        let removed = {
            let mut entries = self.lock();
            let matches = entries
                .peek(key)
                .map(|resident| resident.ptr_eq(entry))
                .unwrap_or(false);
            if matches {
                entries.pop(key)
            } else {
                None
            }
        };
        match removed {
            Some(_) => {
                debug!(key = %key, "Removed cache entry");
                true
            }
            None => false,
        }
    }

    /// Unindex the least recently used settled entry and hand it back, so the
    /// caller drops it outside the lock.
    fn evict_one(&self, entries: &mut EntryMap) -> Result<CacheEntry, CacheError> {
        let victim = entries
            .iter()
            .rev()
            .find(|(_, entry)| entry.status() != EntryStatus::Pending)
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => match entries.pop(&key) {
                Some(evicted) => {
                    debug!(key = %key, "Evicted least recently used cache entry");
                    Ok(evicted)
                }
                None => Err(CacheError::NotFound(key)),
            },
            None => {
                warn!(
                    capacity = self.inner.config.capacity,
                    "Every cache entry is being written, nothing can be evicted"
                );
                Err(CacheError::StoreFull {
                    capacity: self.inner.config.capacity,
                })
            }
        }
    }

    fn location(&self, key: &CacheKey) -> PathBuf {
        let digest = key.digest();
        let shard = digest as usize % self.inner.config.shard_count;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        self.inner
            .config
            .shard_dir(shard)
            .join(format!("{:08x}-{}.bin", digest, generation))
    }

    fn lock(&self) -> MutexGuard<'_, EntryMap> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn purge_stale_files(dir: &Path) -> io::Result<usize> {
    let mut purged = 0;
    for dirent in fs::read_dir(dir)? {
        let path = dirent?.path();
        if path.extension().map(|ext| ext == "bin").unwrap_or(false) {
            match fs::remove_file(&path) {
                Ok(()) => purged += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to purge stale cache file"),
            }
        }
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir, capacity: usize) -> EntryStore {
        EntryStore::open(StoreConfig {
            root: dir.path().to_path_buf(),
            capacity,
            shard_count: 4,
            read_chunk_size: 16,
        })
        .unwrap()
    }

    async fn put(store: &EntryStore, key: &CacheKey, body: &[u8]) {
        let mut writer = store.open_for_write(key).unwrap();
        writer.write_chunk(body).await.unwrap();
        writer.finish().await.unwrap();
    }

    async fn read_all(store: &EntryStore, key: &CacheKey) -> Vec<u8> {
        let mut reader = store.open_for_read(key).unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_lru_eviction_of_settled_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 2);
        let (a, b, c) = (CacheKey::from("A"), CacheKey::from("B"), CacheKey::from("C"));

        for key in [&a, &b, &c] {
            put(&store, key, key.as_str().as_bytes()).await;
            assert_eq!(read_all(&store, key).await, key.as_str().as_bytes());
        }

        assert!(!store.has(&a));
        assert!(store.has(&b));
        assert!(store.has(&c));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_read_refreshes_recency_but_has_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 2);
        let (a, b, c) = (CacheKey::from("A"), CacheKey::from("B"), CacheKey::from("C"));

        put(&store, &a, b"a").await;
        put(&store, &b, b"b").await;
        read_all(&store, &a).await;
        assert!(store.has(&b));
        put(&store, &c, b"c").await;

        assert!(store.has(&a));
        assert!(!store.has(&b));
    }

    #[tokio::test]
    async fn test_pending_entries_are_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 2);
        let (a, b, c) = (CacheKey::from("A"), CacheKey::from("B"), CacheKey::from("C"));

        let _wa = store.open_for_write(&a).unwrap();
        let mut wb = store.open_for_write(&b).unwrap();
        match store.open_for_write(&c) {
            Err(CacheError::StoreFull { capacity }) => assert_eq!(capacity, 2),
            other => panic!("expected StoreFull, got {:?}", other.map(|_| ())),
        }
        assert!(!store.has(&c));

        wb.write_chunk(b"b").await.unwrap();
        wb.finish().await.unwrap();
        put(&store, &c, b"c").await;
        assert!(store.has(&a), "the pending entry survives");
        assert!(!store.has(&b));
        assert!(store.has(&c));
    }

    #[tokio::test]
    async fn test_evicted_entry_keeps_serving_its_reader() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1);
        let (a, b) = (CacheKey::from("A"), CacheKey::from("B"));

        put(&store, &a, b"first body").await;
        let mut reader = store.open_for_read(&a).unwrap();
        let path = reader.entry().location().to_path_buf();
        put(&store, &b, b"second").await;
        assert!(!store.has(&a));

        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"first body");
        assert!(path.exists());
        drop(reader);
        assert!(!path.exists(), "the file goes away with its last reader");
    }

    #[tokio::test]
    async fn test_evicted_file_is_removed_once_unindexed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1);
        let (a, b) = (CacheKey::from("A"), CacheKey::from("B"));

        put(&store, &a, b"evict me").await;
        let path = store.open_for_read(&a).unwrap().entry().location().to_path_buf();
        assert!(path.exists());

        let mut writer = store.open_for_write(&b).unwrap();
        assert!(!path.exists());
        assert!(!store.has(&a));

        // The index is free again as soon as the writer is handed out
        assert!(matches!(
            store.open_for_write(&b),
            Err(CacheError::EntryExists(_))
        ));
        writer.write_chunk(b"b").await.unwrap();
        writer.finish().await.unwrap();
        assert_eq!(read_all(&store, &b).await, b"b");
    }

    #[tokio::test]
    async fn test_rewriting_a_key_uses_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1);
        let (a, b) = (CacheKey::from("A"), CacheKey::from("B"));

        put(&store, &a, b"old").await;
        let old = store.open_for_read(&a).unwrap();
        put(&store, &b, b"b").await;
        put(&store, &a, b"new").await;

        let fresh = store.open_for_read(&a).unwrap();
        assert_ne!(old.entry().location(), fresh.entry().location());
        assert_eq!(read_all(&store, &a).await, b"new");
    }

    #[tokio::test]
    async fn test_duplicate_write_and_missing_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 4);
        let key = CacheKey::from("K");

        assert!(matches!(
            store.open_for_read(&key),
            Err(CacheError::NotFound(k)) if k == key
        ));
        let _writer = store.open_for_write(&key).unwrap();
        assert!(matches!(
            store.open_for_write(&key),
            Err(CacheError::EntryExists(k)) if k == key
        ));
    }

    #[tokio::test]
    async fn test_failed_write_unindexes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 4);
        let key = CacheKey::from("K");

        let mut writer = store.open_for_write(&key).unwrap();
        writer.write_chunk(b"abc").await.unwrap();
        let mut reader = store.open_for_read(&key).unwrap();
        writer.abort("upstream reset");

        assert!(!store.has(&key));
        assert!(matches!(
            reader.next_chunk().await,
            Err(CacheError::UpstreamWriteFailed(_))
        ));
        // The key can be fetched again
        put(&store, &key, b"retry").await;
        assert_eq!(read_all(&store, &key).await, b"retry");
    }

    #[tokio::test]
    async fn test_open_purges_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("shard-01").join("deadbeef-7.bin");
        let keep = dir.path().join("shard-01").join("notes.txt");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"stale").unwrap();
        fs::write(&keep, b"keep").unwrap();

        let store = store(&dir, 4);
        assert!(store.is_empty());
        assert!(!stale.exists());
        assert!(keep.exists());
        for shard in 0..4 {
            assert!(dir.path().join(format!("shard-{:02}", shard)).is_dir());
        }
    }
}
