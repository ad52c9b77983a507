// Implements the disk-backed response cache that sits behind the Spool proxy service.
// Response bodies are streamed to files while they are still arriving from the
// upstream, and any number of downstream requests may read those files at the same
// time as they grow. Concurrent requests for the same resource are coalesced so that
// only one upstream fetch is ever in flight per cache key.
//
// Key Components:
// - `CacheEntry`: One body file plus its `Pending -> Complete | Failed` lifecycle and a
//   change channel. `EntryWriter` appends to it, `EntryReader` tails it.
// - `EntryStore`: The bounded, LRU-evicted index of entries. Entries that are still
//   being written are never evicted.
// - `MetadataCache`: The bounded index of response heads, keyed like the store.
// - `CoalescingCache`: Decides hit / join / fetch for every request and fans a single
//   upstream response out to every waiting request.
// - `BodyFill`: Copies an upstream body into an entry on its own task, so the fill
//   never depends on the request that started it.

use std::io;
use std::sync::Arc;

use thiserror::Error;

pub use self::coalesce::{
    serve, CacheStatus, CachedResponse, CoalescingCache, FetchPermit, FetchStarted, Lookup,
    ResponseSink, Upstream, UpstreamResponse, Waiter,
};
pub use self::entry::{CacheEntry, EntryReader, EntryStatus, EntryWriter, DEFAULT_READ_CHUNK};
pub use self::fill::BodyFill;
pub use self::key::{CacheKey, CacheRequest};
pub use self::metadata::{MetadataCache, ResponseHead, ResponseMeta};
pub use self::store::{EntryStore, StoreConfig};

pub mod coalesce;
pub mod entry;
pub mod fill;
pub mod key;
pub mod metadata;
pub mod store;

/// Errors raised by the cache core.
///
/// The type is `Clone` because one failure (for example an aborted upstream body)
/// has to be reported to every reader of the affected entry.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A write handle was requested for a key that is already in the store
    #[error("an entry for {0} already exists")]
    EntryExists(CacheKey),

    /// A read handle was requested for a key that is not in the store
    #[error("no entry for {0}")]
    NotFound(CacheKey),

    /// A second writer was requested for a single entry
    #[error("entry is already being written")]
    AlreadyWriting,

    /// The upstream body or the disk write failed part-way through
    #[error("upstream write failed: {0}")]
    UpstreamWriteFailed(Arc<str>),

    /// The upstream fetch could not be established at all
    #[error("upstream transport error: {0}")]
    TransportError(Arc<str>),

    /// Every resident entry is still being written, so nothing can be evicted
    #[error("cache is full: all {capacity} entries are being written")]
    StoreFull { capacity: usize },

    /// Creating, opening or reading a cache file failed
    #[error("cache file i/o failed: {0}")]
    Io(Arc<io::Error>),

    /// The response could not be written to the client
    #[error("downstream write failed: {0}")]
    Downstream(Arc<str>),
}

impl CacheError {
    pub fn upstream_write(reason: impl Into<Arc<str>>) -> Self {
        Self::UpstreamWriteFailed(reason.into())
    }

    pub fn transport(reason: impl Into<Arc<str>>) -> Self {
        Self::TransportError(reason.into())
    }

    pub fn downstream(reason: impl Into<Arc<str>>) -> Self {
        Self::Downstream(reason.into())
    }

    /// Whether a request hitting this error should fall back to fetching the
    /// resource itself, without the cache, instead of failing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EntryExists(_) | Self::NotFound(_) | Self::StoreFull { .. } | Self::Io(_)
        )
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
