use std::io;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::coalesce::CoalescingCache;
use super::entry::{CacheEntry, EntryWriter};
use super::{CacheError, CacheKey};

/// Copies an upstream body into a cache entry
pub struct BodyFill {
    writer: EntryWriter,
    cache: CoalescingCache,
    key: CacheKey,
    transient: bool,
}

impl BodyFill {
    pub(crate) fn new(
        writer: EntryWriter,
        cache: CoalescingCache,
        key: CacheKey,
        transient: bool,
    ) -> Self {
        Self {
            writer,
            cache,
            key,
            transient,
        }
    }

    pub fn entry(&self) -> &CacheEntry {
        self.writer.entry()
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Write `body` into the entry until it ends, returning the number of bytes written.
    ///
    /// An error item fails the entry, and with it every reader.
    pub async fn run<S>(self, mut body: S) -> Result<u64, CacheError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let BodyFill {
            mut writer,
            cache,
            key,
            transient,
        } = self;

        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    writer.write_chunk(&chunk).await?;
                    written += chunk.len() as u64;
                }
                Err(e) => return Err(writer.abort(format!("upstream body failed: {e}"))),
            }
        }

        if transient {
            // Unindexed before it completes, so no later fetch can find the body
            cache.forget(&key, writer.entry());
        }
        writer.finish().await?;
        Ok(written)
    }

    /// Run the fill on its own task so it outlives the request that started it.
    pub fn spawn<S>(self, body: S) -> JoinHandle<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let key = self.key.clone();
            match self.run(body).await {
                Ok(written) => debug!(key = %key, written, "Cache fill complete"),
                Err(e) => warn!(key = %key, error = %e, "Cache fill failed"),
            }
        })
    }
}
