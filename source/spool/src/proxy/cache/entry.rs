// A single cached body on disk, readable while it is being written.
//
// The entry state (status, committed size, failure reason) lives in a `watch` channel.
// The writer publishes a new size only after the bytes it covers were handed to the
// OS, so a reader woken by the channel can always read up to the size it observes.
// Readers subscribe first and then look at the state, so a change that happens
// between the check and the wait is never missed.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::CacheError;

/// Chunk size used by readers unless configured otherwise
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
struct EntryState {
    status: EntryStatus,
    size: u64,
    failure: Option<Arc<str>>,
}

struct EntryInner {
    location: PathBuf,
    writer_claimed: AtomicBool,
    state: watch::Sender<EntryState>,
}

impl Drop for EntryInner {
    // The last handle is gone: the entry is unindexed and nobody reads it anymore.
    fn drop(&mut self) {
        match std::fs::remove_file(&self.location) {
            Ok(()) => debug!(path = %self.location.display(), "Removed released cache file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.location.display(),
                error = %e,
                "Failed to remove released cache file"
            ),
        }
    }
}

/// Shared handle on one cached body
#[derive(Clone)]
pub struct CacheEntry {
    inner: Arc<EntryInner>,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("CacheEntry")
            .field("location", &self.inner.location)
            .field("status", &state.status)
            .field("size", &state.size)
            .finish()
    }
}

impl CacheEntry {
    pub fn new(location: PathBuf) -> Self {
        let (state, _) = watch::channel(EntryState {
            status: EntryStatus::Pending,
            size: 0,
            failure: None,
        });
        Self {
            inner: Arc::new(EntryInner {
                location,
                writer_claimed: AtomicBool::new(false),
                state,
            }),
        }
    }

    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    pub fn status(&self) -> EntryStatus {
        self.inner.state.borrow().status
    }

    /// Number of bytes committed to the file so far
    pub fn size(&self) -> u64 {
        self.inner.state.borrow().size
    }

    pub fn failure(&self) -> Option<Arc<str>> {
        self.inner.state.borrow().failure.clone()
    }

    /// Number of tailing readers currently subscribed to changes
    pub fn subscribers(&self) -> usize {
        self.inner.state.receiver_count()
    }

    pub fn ptr_eq(&self, other: &CacheEntry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Claim the single writer of this entry and create its backing file.
    pub fn open_for_write(&self) -> Result<EntryWriter, CacheError> {
        if self.inner.writer_claimed.swap(true, Ordering::AcqRel) {
            return Err(CacheError::AlreadyWriting);
        }

        let file = match std::fs::File::create(&self.inner.location) {
            Ok(file) => file,
            Err(e) => {
                self.fail(&format!("failed to create cache file: {e}"));
                return Err(e.into());
            }
        };
        trace!(path = %self.inner.location.display(), "Opened cache file for writing");

        Ok(EntryWriter {
            entry: self.clone(),
            file: File::from_std(file),
            on_failure: None,
            done: false,
        })
    }

    /// Open a byte stream over the entry, reading `chunk_size` bytes at a time.
    ///
    /// A complete entry is read sequentially to the end of its file. Otherwise the
    /// reader tails the writer, waiting whenever it has caught up with it.
    pub fn open_for_read(&self, chunk_size: usize) -> EntryReader {
        let changes = self.inner.state.subscribe();
        let status = changes.borrow().status;
        let changes = match status {
            EntryStatus::Complete => None,
            _ => Some(changes),
        };
        EntryReader {
            entry: self.clone(),
            changes,
            file: None,
            bytes_read: 0,
            chunk_size: chunk_size.max(1),
            finished: false,
        }
    }

    fn grow(&self, len: u64) {
        self.inner.state.send_modify(|state| state.size += len);
    }

    fn complete(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if state.status != EntryStatus::Pending {
                return false;
            }
            state.status = EntryStatus::Complete;
            true
        })
    }

    fn fail(&self, reason: &str) -> bool {
        self.inner.state.send_if_modified(|state| {
            if state.status != EntryStatus::Pending {
                return false;
            }
            state.status = EntryStatus::Failed;
            state.failure = Some(reason.into());
            true
        })
    }
}

/// The single writer of a [CacheEntry]
///
/// Dropping the writer without calling [EntryWriter::finish] fails the entry.
pub struct EntryWriter {
    entry: CacheEntry,
    file: File,
    on_failure: Option<Box<dyn FnOnce() + Send + Sync>>,
    done: bool,
}

impl EntryWriter {
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// Run `hook` once if this writer ever fails the entry.
    pub fn on_failure(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    /// Append a chunk and publish the new size once the bytes reached the file.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        if self.done {
            return Err(CacheError::upstream_write("write after the entry was closed"));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        if let Err(e) = append(&mut self.file, chunk).await {
            return Err(self.fail_with(format!("write to cache file failed: {e}")));
        }
        self.entry.grow(chunk.len() as u64);
        Ok(())
    }

    /// Close the entry; it becomes `Complete` unless it already failed.
    pub async fn finish(mut self) -> Result<(), CacheError> {
        if let Err(e) = self.file.flush().await {
            return Err(self.fail_with(format!("flushing cache file failed: {e}")));
        }
        self.done = true;
        if self.entry.complete() {
            debug!(
                path = %self.entry.location().display(),
                size = self.entry.size(),
                "Cache entry complete"
            );
        }
        Ok(())
    }

    /// Fail the entry, e.g. because the upstream body broke off.
    pub fn abort(mut self, reason: impl Into<String>) -> CacheError {
        self.fail_with(reason.into())
    }

    fn fail_with(&mut self, reason: String) -> CacheError {
        self.done = true;
        if self.entry.fail(&reason) {
            warn!(path = %self.entry.location().display(), reason = %reason, "Cache entry failed");
        }
        if let Some(hook) = self.on_failure.take() {
            hook();
        }
        CacheError::upstream_write(reason)
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        if !self.done {
            self.fail_with("writer dropped before the body was complete".to_string());
        }
    }
}

async fn append(file: &mut File, chunk: &[u8]) -> io::Result<()> {
    file.write_all(chunk).await?;
    file.flush().await
}

/// A byte stream over a [CacheEntry]
///
/// The file handle is opened on the first read and closed on EOF, on error, or when
/// the reader is dropped, whichever comes first.
pub struct EntryReader {
    entry: CacheEntry,
    changes: Option<watch::Receiver<EntryState>>,
    file: Option<File>,
    bytes_read: u64,
    chunk_size: usize,
    finished: bool,
}

impl EntryReader {
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// Whether this reader follows a writer that was still running when it opened
    pub fn is_tailing(&self) -> bool {
        self.changes.is_some()
    }

    /// Read the next chunk, `Ok(None)` at the end of the body.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CacheError> {
        if self.finished {
            return Ok(None);
        }
        if self.changes.is_none() {
            return self.read_sequential().await;
        }

        loop {
            let state = match self.changes.as_mut() {
                Some(changes) => changes.borrow_and_update().clone(),
                None => return self.read_sequential().await,
            };

            match state.status {
                EntryStatus::Failed => {
                    self.close();
                    let reason = state
                        .failure
                        .unwrap_or_else(|| Arc::from("entry failed"));
                    return Err(CacheError::UpstreamWriteFailed(reason));
                }
                EntryStatus::Complete if self.bytes_read >= state.size => {
                    self.close();
                    return Ok(None);
                }
                EntryStatus::Pending
                    if self.bytes_read + self.chunk_size as u64 >= state.size =>
                {
                    trace!(
                        bytes_read = self.bytes_read,
                        size = state.size,
                        "Reader caught up with writer, waiting"
                    );
                    let closed = match self.changes.as_mut() {
                        Some(changes) => changes.changed().await.is_err(),
                        None => true,
                    };
                    if closed {
                        self.close();
                        return Err(CacheError::upstream_write("entry writer vanished"));
                    }
                    continue;
                }
                _ => {}
            }

            let len = (state.size - self.bytes_read).min(self.chunk_size as u64) as usize;
            return self.read_exact(len).await;
        }
    }

    async fn read_exact(&mut self, len: usize) -> Result<Option<Bytes>, CacheError> {
        let mut buf = BytesMut::zeroed(len);
        let result = match self.file().await {
            Ok(file) => file.read_exact(&mut buf).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.close();
            return Err(e.into());
        }
        self.bytes_read += len as u64;
        Ok(Some(buf.freeze()))
    }

    async fn read_sequential(&mut self) -> Result<Option<Bytes>, CacheError> {
        let mut buf = BytesMut::zeroed(self.chunk_size);
        let result = match self.file().await {
            Ok(file) => file.read(&mut buf).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(0) => {
                self.close();
                Ok(None)
            }
            Ok(n) => {
                buf.truncate(n);
                self.bytes_read += n as u64;
                Ok(Some(buf.freeze()))
            }
            Err(e) => {
                self.close();
                Err(e.into())
            }
        }
    }

    async fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = File::open(self.entry.location()).await?;
            trace!(path = %self.entry.location().display(), "Opened cache file for reading");
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "cache file closed")),
        }
    }

    fn close(&mut self) {
        self.finished = true;
        self.file = None;
        self.changes = None;
    }
}
