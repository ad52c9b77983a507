use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::CacheKey;

/// Status line and headers of an upstream response, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Server errors and partial content are handed to coalesced waiters but never
    /// replayed to later requests.
    pub fn is_storable(&self) -> bool {
        self.status < 500 && self.status != 206
    }
}

/// What a cache hit replays: the response head plus the key of its body entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub head: ResponseHead,
    pub body_key: CacheKey,
}

/// Bounded LRU map of response metadata
pub struct MetadataCache {
    entries: LruCache<CacheKey, Arc<ResponseMeta>, ahash::RandomState>,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::with_hasher(capacity, ahash::RandomState::new()),
        }
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<Arc<ResponseMeta>> {
        self.entries.get(key).cloned()
    }

    pub fn insert(&mut self, key: CacheKey, meta: Arc<ResponseMeta>) {
        self.entries.put(key, meta);
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<Arc<ResponseMeta>> {
        self.entries.pop(key)
    }
}
