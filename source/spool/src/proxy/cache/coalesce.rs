// Request coalescing in front of the entry store.
//
// Every cacheable request resolves to one of three outcomes under a single lock:
// - `Hit`: metadata and body are resident, the response is replayed from disk
// - `Joined`: a fetch for the key is already in flight, the request queues behind it
// - `Miss`: nothing is known, the caller receives the `FetchPermit` and must fetch
//
// When the permitted fetch begins, the body is copied into a new entry on its own task
// and every request, the original one included, receives its own tailing reader over
// that entry, queued ones in arrival order. Whatever the outcome of the fetch, the
// queue is drained exactly once.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::entry::{CacheEntry, EntryReader};
use super::fill::BodyFill;
use super::key::{CacheKey, CacheRequest};
use super::metadata::{MetadataCache, ResponseHead, ResponseMeta};
use super::store::EntryStore;
use super::CacheError;

/// How a request was answered, as reported in the access log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Joined,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Joined => "JOINED",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response ready to be replayed: its head and a reader over its body
pub struct CachedResponse {
    pub meta: Arc<ResponseMeta>,
    pub body: EntryReader,
}

impl fmt::Debug for CachedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResponse")
            .field("meta", &self.meta)
            .field("body", self.body.entry())
            .finish()
    }
}

/// Where a response is delivered to
#[async_trait]
pub trait ResponseSink: Send {
    async fn write_head(&mut self, head: &ResponseHead) -> Result<(), CacheError>;

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), CacheError>;

    async fn finish(&mut self) -> Result<(), CacheError>;

    /// Report a failure. Before the head was written this is an error response,
    /// afterwards the response is cut short.
    async fn fail(&mut self, error: &CacheError);

    /// Told how the request is being answered, before anything is written.
    fn on_status(&mut self, _status: CacheStatus) {}
}

/// The start of an upstream response
pub struct UpstreamResponse {
    pub head: ResponseHead,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

/// The origin behind the cache
///
/// A fetch yields exactly one outcome: a response that has begun, or an error.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: &CacheRequest) -> Result<UpstreamResponse, CacheError>;
}

type WaiterSender = oneshot::Sender<Result<CachedResponse, CacheError>>;

#[derive(Default)]
struct PendingFetch {
    waiters: Vec<WaiterSender>,
}

struct CoalesceState {
    metadata: MetadataCache,
    pending: HashMap<CacheKey, PendingFetch, ahash::RandomState>,
}

/// Single-flight cache over an [EntryStore]
#[derive(Clone)]
pub struct CoalescingCache {
    store: EntryStore,
    state: Arc<Mutex<CoalesceState>>,
}

pub enum Lookup {
    Hit(CachedResponse),
    Joined(Waiter),
    Miss(FetchPermit),
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Hit(_) => f.write_str("Hit"),
            Lookup::Joined(w) => write!(f, "Joined({})", w.key),
            Lookup::Miss(p) => write!(f, "Miss({})", p.key),
        }
    }
}

/// A request queued behind an in-flight fetch
pub struct Waiter {
    key: CacheKey,
    rx: oneshot::Receiver<Result<CachedResponse, CacheError>>,
}

impl Waiter {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub async fn wait(self) -> Result<CachedResponse, CacheError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CacheError::transport("upstream fetch was abandoned")),
        }
    }
}

/// The right, and the duty, to fetch a key from upstream
///
/// Exactly one of [FetchPermit::begin] or [FetchPermit::fail] settles the permit.
/// Dropping an unsettled permit fails every queued request.
pub struct FetchPermit {
    key: CacheKey,
    cache: CoalescingCache,
    settled: bool,
}

/// A fetch that has begun: the response for the original requester, and the fill
/// that copies the upstream body into the cache (absent if the body was resident).
pub struct FetchStarted {
    pub response: CachedResponse,
    pub fill: Option<BodyFill>,
}

impl FetchPermit {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The upstream response has begun with `head`.
    ///
    /// Opens the body entry, records the metadata and hands a fresh reader to every
    /// queued request. If the entry cannot be opened the error is returned, queued
    /// requests receive it as well, and the response must be served uncached.
    pub fn begin(mut self, head: ResponseHead) -> Result<FetchStarted, CacheError> {
        self.settled = true;
        let cache = self.cache.clone();
        let store = &cache.store;
        let key = self.key.clone();
        let transient = !head.is_storable();

        // While the fetch is pending nobody else writes `key`, so the store can be
        // consulted, and the file created, without holding the coalescing lock.
        let resident = store.has(&key);
        if resident && transient {
            // The resident body belongs to another head
            let e = CacheError::EntryExists(key.clone());
            cache.abandon(&key, e.clone());
            return Err(e);
        }

        let writer = if resident {
            debug!(key = %key, "Body already resident, not writing it again");
            None
        } else {
            match store.open_for_write(&key) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    cache.abandon(&key, e.clone());
                    return Err(e);
                }
            }
        };

        let original = match &writer {
            Some(writer) => Ok(writer.entry().open_for_read(store.config().read_chunk_size)),
            None => store.open_for_read(&key),
        };
        let body = match original {
            Ok(body) => body,
            Err(e) => {
                cache.abandon(&key, e.clone());
                return Err(e);
            }
        };

        let meta = Arc::new(ResponseMeta {
            head,
            body_key: key.clone(),
        });
        let entry = body.entry().clone();
        let chunk_size = store.config().read_chunk_size;
        {
            let mut state = cache.lock();
            let waiters = state
                .pending
                .remove(&key)
                .map(|pending| pending.waiters)
                .unwrap_or_default();
            // Transient responses only reach the requests queued right now
            if !transient {
                state.metadata.insert(key.clone(), meta.clone());
            }
            drain(&key, waiters, |_| {
                Ok(CachedResponse {
                    meta: meta.clone(),
                    body: entry.open_for_read(chunk_size),
                })
            });
        }

        let fill = writer.map(|writer| BodyFill::new(writer, cache.clone(), key, transient));
        Ok(FetchStarted {
            response: CachedResponse { meta, body },
            fill,
        })
    }

    /// The upstream fetch failed before a response began.
    pub fn fail(mut self, error: CacheError) {
        self.settled = true;
        self.cache.abandon(&self.key, error);
    }
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.abandon(
                &self.key,
                CacheError::transport("upstream fetch was abandoned"),
            );
        }
    }
}

fn drain(
    key: &CacheKey,
    waiters: Vec<WaiterSender>,
    mut outcome: impl FnMut(usize) -> Result<CachedResponse, CacheError>,
) {
    if !waiters.is_empty() {
        trace!(key = %key, waiters = waiters.len(), "Resuming coalesced requests");
    }
    for (idx, tx) in waiters.into_iter().enumerate() {
        // A waiter that went away just drops its reader
        let _ = tx.send(outcome(idx));
    }
}

impl CoalescingCache {
    pub fn new(store: EntryStore, metadata_capacity: usize) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(CoalesceState {
                metadata: MetadataCache::new(metadata_capacity),
                pending: HashMap::default(),
            })),
        }
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Decide how to answer a request for `key`.
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let mut state = self.lock();

        if let Some(meta) = state.metadata.get(key) {
            match self.store.open_for_read(&meta.body_key) {
                Ok(body) => {
                    trace!(key = %key, "Cache hit");
                    return Lookup::Hit(CachedResponse { meta, body });
                }
                Err(_) => {
                    trace!(key = %key, "Dropping metadata whose body is gone");
                    state.metadata.remove(key);
                }
            }
        }

        if let Some(pending) = state.pending.get_mut(key) {
            let (tx, rx) = oneshot::channel();
            pending.waiters.push(tx);
            trace!(key = %key, queued = pending.waiters.len(), "Joined in-flight fetch");
            return Lookup::Joined(Waiter {
                key: key.clone(),
                rx,
            });
        }

        state.pending.insert(key.clone(), PendingFetch::default());
        trace!(key = %key, "Cache miss, fetching");
        Lookup::Miss(FetchPermit {
            key: key.clone(),
            cache: self.clone(),
            settled: false,
        })
    }

    /// Number of requests queued behind the in-flight fetch of `key`
    pub fn pending_waiters(&self, key: &CacheKey) -> Option<usize> {
        self.lock().pending.get(key).map(|p| p.waiters.len())
    }

    /// Unindex a completed transient entry, if `key` still refers to `entry`.
    ///
    /// Transient responses never had metadata recorded, so only the body goes.
    pub fn forget(&self, key: &CacheKey, entry: &CacheEntry) {
        if self.store.remove_entry(key, entry) {
            debug!(key = %key, "Dropped transient response");
        }
    }

    /// Answer `request` through the cache, writing the response to `sink`.
    pub async fn handle<U, S>(
        &self,
        request: &CacheRequest,
        upstream: &U,
        sink: &mut S,
    ) -> Result<CacheStatus, CacheError>
    where
        U: Upstream + ?Sized,
        S: ResponseSink + ?Sized,
    {
        if !request.is_cacheable() {
            sink.on_status(CacheStatus::Bypass);
            bypass(request, upstream, sink).await?;
            return Ok(CacheStatus::Bypass);
        }

        let key = request.key();
        match self.lookup(&key) {
            Lookup::Hit(cached) => {
                sink.on_status(CacheStatus::Hit);
                serve(cached, sink).await?;
                Ok(CacheStatus::Hit)
            }
            Lookup::Joined(waiter) => match waiter.wait().await {
                Ok(cached) => {
                    sink.on_status(CacheStatus::Joined);
                    serve(cached, sink).await?;
                    Ok(CacheStatus::Joined)
                }
                Err(e) if e.is_retryable() => {
                    debug!(key = %key, error = %e, "Coalesced fetch was not cached, fetching directly");
                    sink.on_status(CacheStatus::Bypass);
                    bypass(request, upstream, sink).await?;
                    Ok(CacheStatus::Bypass)
                }
                Err(e) => {
                    sink.on_status(CacheStatus::Joined);
                    sink.fail(&e).await;
                    Err(e)
                }
            },
            Lookup::Miss(permit) => {
                let response = match upstream.fetch(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Upstream fetch failed");
                        permit.fail(e.clone());
                        sink.on_status(CacheStatus::Miss);
                        sink.fail(&e).await;
                        return Err(e);
                    }
                };

                match permit.begin(response.head.clone()) {
                    Ok(started) => {
                        // The fill runs on its own task: the original requester
                        // going away never cuts the body short for anyone else
                        if let Some(fill) = started.fill {
                            fill.spawn(response.body);
                        }
                        sink.on_status(CacheStatus::Miss);
                        serve(started.response, sink).await?;
                        Ok(CacheStatus::Miss)
                    }
                    Err(e) => {
                        debug!(key = %key, error = %e, "Serving response uncached");
                        sink.on_status(CacheStatus::Bypass);
                        forward(response, sink).await?;
                        Ok(CacheStatus::Bypass)
                    }
                }
            }
        }
    }

    fn abandon(&self, key: &CacheKey, error: CacheError) {
        let waiters = self
            .lock()
            .pending
            .remove(key)
            .map(|pending| pending.waiters)
            .unwrap_or_default();
        debug!(key = %key, error = %error, waiters = waiters.len(), "Fetch settled without a cache entry");
        drain(key, waiters, |_| Err(error.clone()));
    }

    fn lock(&self) -> MutexGuard<'_, CoalesceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replay a cached response into `sink`, returning the number of body bytes sent.
pub async fn serve<S>(cached: CachedResponse, sink: &mut S) -> Result<u64, CacheError>
where
    S: ResponseSink + ?Sized,
{
    let CachedResponse { meta, mut body } = cached;
    sink.write_head(&meta.head).await?;

    let mut sent = 0u64;
    loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => {
                sent += chunk.len() as u64;
                sink.write_body(chunk).await?;
            }
            Ok(None) => break,
            Err(e) => {
                sink.fail(&e).await;
                return Err(e);
            }
        }
    }
    sink.finish().await?;
    Ok(sent)
}

async fn bypass<U, S>(request: &CacheRequest, upstream: &U, sink: &mut S) -> Result<(), CacheError>
where
    U: Upstream + ?Sized,
    S: ResponseSink + ?Sized,
{
    match upstream.fetch(request).await {
        Ok(response) => forward(response, sink).await,
        Err(e) => {
            sink.fail(&e).await;
            Err(e)
        }
    }
}

async fn forward<S>(response: UpstreamResponse, sink: &mut S) -> Result<(), CacheError>
where
    S: ResponseSink + ?Sized,
{
    let UpstreamResponse { head, mut body } = response;
    sink.write_head(&head).await?;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => sink.write_body(chunk).await?,
            Err(e) => {
                let e = CacheError::upstream_write(format!("upstream body failed: {e}"));
                sink.fail(&e).await;
                return Err(e);
            }
        }
    }
    sink.finish().await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::stream;
    use http::Method;
    use tokio::sync::Notify;

    use super::*;
    use crate::proxy::cache::store::StoreConfig;

    enum Outcome {
        Respond { status: u16, body: Vec<u8> },
        Refuse,
        BreakAfter { prefix: Vec<u8> },
    }

    struct FakeUpstream {
        calls: AtomicUsize,
        gate: Mutex<Option<Arc<Notify>>>,
        script: Mutex<VecDeque<Outcome>>,
        body: Vec<u8>,
    }

    impl FakeUpstream {
        fn new(body: &[u8]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Mutex::new(None),
                script: Mutex::new(VecDeque::new()),
                body: body.to_vec(),
            }
        }

        fn gated(self, gate: Arc<Notify>) -> Self {
            *self.gate.lock().unwrap() = Some(gate);
            self
        }

        fn then(self, outcome: Outcome) -> Self {
            self.script.lock().unwrap().push_back(outcome);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn chunked(body: Vec<u8>) -> BoxStream<'static, io::Result<Bytes>> {
        let chunks: Vec<io::Result<Bytes>> = body
            .chunks(10)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks).boxed()
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn fetch(&self, _request: &CacheRequest) -> Result<UpstreamResponse, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }

            let outcome = self.script.lock().unwrap().pop_front();
            match outcome {
                Some(Outcome::Refuse) => Err(CacheError::transport("connection refused")),
                Some(Outcome::Respond { status, body }) => Ok(UpstreamResponse {
                    head: ResponseHead::new(status).with_header("content-type", "text/plain"),
                    body: chunked(body),
                }),
                Some(Outcome::BreakAfter { prefix }) => Ok(UpstreamResponse {
                    head: ResponseHead::new(200),
                    body: stream::iter(vec![
                        Ok(Bytes::from(prefix)),
                        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
                    ])
                    .boxed(),
                }),
                None => Ok(UpstreamResponse {
                    head: ResponseHead::new(200)
                        .with_header("content-type", "application/octet-stream")
                        .with_header("content-length", self.body.len().to_string()),
                    body: chunked(self.body.clone()),
                }),
            }
        }
    }

    #[derive(Default, Debug)]
    struct MemorySink {
        head: Option<ResponseHead>,
        body: Vec<u8>,
        finished: bool,
        failure: Option<String>,
    }

    #[async_trait]
    impl ResponseSink for MemorySink {
        async fn write_head(&mut self, head: &ResponseHead) -> Result<(), CacheError> {
            self.head = Some(head.clone());
            Ok(())
        }

        async fn write_body(&mut self, chunk: Bytes) -> Result<(), CacheError> {
            self.body.extend_from_slice(&chunk);
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), CacheError> {
            self.finished = true;
            Ok(())
        }

        async fn fail(&mut self, error: &CacheError) {
            self.failure = Some(error.to_string());
        }
    }

    fn cache(dir: &tempfile::TempDir, capacity: usize) -> CoalescingCache {
        let store = EntryStore::open(StoreConfig {
            root: dir.path().to_path_buf(),
            capacity,
            shard_count: 2,
            read_chunk_size: 16,
        })
        .unwrap();
        CoalescingCache::new(store, 16)
    }

    fn get(path: &str) -> CacheRequest {
        CacheRequest::new(Method::GET, path.parse().unwrap(), Some("origin.test".into()))
    }

    fn spawn_request(
        cache: &CoalescingCache,
        upstream: &Arc<FakeUpstream>,
        request: CacheRequest,
    ) -> tokio::task::JoinHandle<(Result<CacheStatus, CacheError>, MemorySink)> {
        let cache = cache.clone();
        let upstream = upstream.clone();
        tokio::spawn(async move {
            let mut sink = MemorySink::default();
            let status = cache.handle(&request, &*upstream, &mut sink).await;
            (status, sink)
        })
    }

    async fn wait_for_waiters(cache: &CoalescingCache, key: &CacheKey, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.pending_waiters(key) != Some(count) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("requests never queued");
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let body: Vec<u8> = (0..100u8).collect();
        let gate = Arc::new(Notify::new());
        let upstream = Arc::new(FakeUpstream::new(&body).gated(gate.clone()));
        let request = get("/k");

        let tasks: Vec<_> = (0..3)
            .map(|_| spawn_request(&cache, &upstream, request.clone()))
            .collect();
        wait_for_waiters(&cache, &request.key(), 2).await;
        gate.notify_one();

        let mut statuses = Vec::new();
        let mut heads = Vec::new();
        for task in tasks {
            let (status, sink) = task.await.unwrap();
            statuses.push(status.unwrap());
            assert!(sink.finished);
            assert_eq!(sink.body, body);
            heads.push(sink.head.unwrap());
        }

        assert_eq!(upstream.calls(), 1);
        assert!(heads.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(heads[0].header("content-length"), Some("100"));
        assert_eq!(statuses.iter().filter(|s| **s == CacheStatus::Miss).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == CacheStatus::Joined).count(), 2);
        assert_eq!(cache.pending_waiters(&request.key()), None);
    }

    #[tokio::test]
    async fn test_later_request_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let upstream = Arc::new(FakeUpstream::new(b"cached body"));
        let request = get("/hit");

        let mut first = MemorySink::default();
        let status = cache.handle(&request, &*upstream, &mut first).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);

        let mut second = MemorySink::default();
        let status = cache.handle(&request, &*upstream, &mut second).await.unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(second.body, b"cached body");
        assert_eq!(second.head, first.head);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_fails_waiters_then_retries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let gate = Arc::new(Notify::new());
        let upstream = Arc::new(
            FakeUpstream::new(b"recovered")
                .gated(gate.clone())
                .then(Outcome::Refuse),
        );
        let request = get("/flaky");

        let first = spawn_request(&cache, &upstream, request.clone());
        wait_for_waiters(&cache, &request.key(), 0).await;
        let second = spawn_request(&cache, &upstream, request.clone());
        wait_for_waiters(&cache, &request.key(), 1).await;
        gate.notify_one();

        for task in [first, second] {
            let (status, sink) = task.await.unwrap();
            assert!(matches!(status, Err(CacheError::TransportError(_))));
            assert!(sink.head.is_none());
            assert!(sink.failure.is_some());
        }
        assert!(!cache.store().has(&request.key()));

        let mut retry = MemorySink::default();
        let status = cache.handle(&request, &*upstream, &mut retry).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(retry.body, b"recovered");
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_mid_transfer_failure_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let upstream = Arc::new(FakeUpstream::new(b"second try").then(Outcome::BreakAfter {
            prefix: vec![7; 30],
        }));
        let request = get("/broken");

        let mut sink = MemorySink::default();
        let status = cache.handle(&request, &*upstream, &mut sink).await;
        assert!(matches!(status, Err(CacheError::UpstreamWriteFailed(_))));
        assert!(sink.failure.is_some());
        assert!(!sink.finished);
        assert!(!cache.store().has(&request.key()));

        let mut again = MemorySink::default();
        let status = cache.handle(&request, &*upstream, &mut again).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(again.body, b"second try");
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_server_errors_are_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let upstream = Arc::new(FakeUpstream::new(b"healthy").then(Outcome::Respond {
            status: 503,
            body: b"down".to_vec(),
        }));
        let request = get("/status");

        let mut first = MemorySink::default();
        cache.handle(&request, &*upstream, &mut first).await.unwrap();
        assert_eq!(first.head.as_ref().map(|h| h.status), Some(503));
        assert_eq!(first.body, b"down");
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let mut second = MemorySink::default();
        let status = cache.handle(&request, &*upstream, &mut second).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(second.head.as_ref().map(|h| h.status), Some(200));
        assert_eq!(second.body, b"healthy");
    }

    #[tokio::test]
    async fn test_full_store_serves_uncached_and_waiters_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 1);
        let _occupant = cache.store().open_for_write(&CacheKey::from("other")).unwrap();
        let gate = Arc::new(Notify::new());
        let upstream = Arc::new(FakeUpstream::new(b"uncached").gated(gate.clone()));
        let request = get("/full");

        let first = spawn_request(&cache, &upstream, request.clone());
        wait_for_waiters(&cache, &request.key(), 0).await;
        let second = spawn_request(&cache, &upstream, request.clone());
        wait_for_waiters(&cache, &request.key(), 1).await;
        gate.notify_one();

        for task in [first, second] {
            let (status, sink) = task.await.unwrap();
            assert_eq!(status.unwrap(), CacheStatus::Bypass);
            assert_eq!(sink.body, b"uncached");
        }
        assert_eq!(upstream.calls(), 2);
        assert!(!cache.store().has(&request.key()));
    }

    #[tokio::test]
    async fn test_dropped_permit_releases_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 4);
        let key = CacheKey::from("GET http://origin.test/dropped");

        let permit = match cache.lookup(&key) {
            Lookup::Miss(permit) => permit,
            other => panic!("expected a miss, got {other:?}"),
        };
        let waiter = match cache.lookup(&key) {
            Lookup::Joined(waiter) => waiter,
            other => panic!("expected to join, got {other:?}"),
        };
        assert_eq!(cache.pending_waiters(&key), Some(1));

        drop(permit);
        assert!(matches!(waiter.wait().await, Err(CacheError::TransportError(_))));
        assert!(matches!(cache.lookup(&key), Lookup::Miss(_)));
    }

    #[tokio::test]
    async fn test_resident_body_is_not_written_twice() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 4);
        let key = CacheKey::from("GET http://origin.test/resident");
        {
            let mut writer = cache.store().open_for_write(&key).unwrap();
            writer.write_chunk(b"already here").await.unwrap();
            writer.finish().await.unwrap();
        }

        let permit = match cache.lookup(&key) {
            Lookup::Miss(permit) => permit,
            other => panic!("expected a miss, got {other:?}"),
        };
        let started = permit.begin(ResponseHead::new(200)).unwrap();
        assert!(started.fill.is_none());

        let mut sink = MemorySink::default();
        serve(started.response, &mut sink).await.unwrap();
        assert_eq!(sink.body, b"already here");
        assert!(matches!(cache.lookup(&key), Lookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_other_methods_bypass() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 4);
        let upstream = Arc::new(FakeUpstream::new(b"posted"));
        let request = CacheRequest::new(Method::POST, "/form".parse().unwrap(), None);

        for _ in 0..2 {
            let mut sink = MemorySink::default();
            let status = cache.handle(&request, &*upstream, &mut sink).await.unwrap();
            assert_eq!(status, CacheStatus::Bypass);
            assert_eq!(sink.body, b"posted");
        }
        assert_eq!(upstream.calls(), 2);
        assert!(cache.store().is_empty());
    }

    #[tokio::test]
    async fn test_transient_response_reaches_waiters_but_never_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 4);
        let key = CacheKey::from("GET http://origin.test/unavailable");

        let permit = match cache.lookup(&key) {
            Lookup::Miss(permit) => permit,
            other => panic!("expected a miss, got {other:?}"),
        };
        let waiter = match cache.lookup(&key) {
            Lookup::Joined(waiter) => waiter,
            other => panic!("expected to join, got {other:?}"),
        };

        // The fill is kept alive but never run, so the entry stays pending
        let started = permit.begin(ResponseHead::new(503)).unwrap();
        assert!(started.fill.is_some());

        let queued = waiter.wait().await.unwrap();
        assert_eq!(queued.meta.head.status, 503);
        match cache.lookup(&key) {
            Lookup::Miss(_) => {}
            other => panic!("a 503 must not be replayed, got {other:?}"),
        }
        drop(started);
    }

    /// Fails every body write after the first one, like a client that hung up
    #[derive(Default)]
    struct HangUpSink {
        chunks: usize,
    }

    #[async_trait]
    impl ResponseSink for HangUpSink {
        async fn write_head(&mut self, _head: &ResponseHead) -> Result<(), CacheError> {
            Ok(())
        }

        async fn write_body(&mut self, _chunk: Bytes) -> Result<(), CacheError> {
            self.chunks += 1;
            if self.chunks > 1 {
                return Err(CacheError::downstream("client closed the connection"));
            }
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), CacheError> {
            Ok(())
        }

        async fn fail(&mut self, _error: &CacheError) {}
    }

    #[tokio::test]
    async fn test_original_client_leaving_does_not_cut_waiters_short() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let body: Vec<u8> = (0..100u8).collect();
        let gate = Arc::new(Notify::new());
        let upstream = Arc::new(FakeUpstream::new(&body).gated(gate.clone()));
        let request = get("/shared");

        let original = {
            let cache = cache.clone();
            let upstream = upstream.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let mut sink = HangUpSink::default();
                cache.handle(&request, &*upstream, &mut sink).await
            })
        };
        wait_for_waiters(&cache, &request.key(), 0).await;
        let waiters: Vec<_> = (0..2)
            .map(|_| spawn_request(&cache, &upstream, request.clone()))
            .collect();
        wait_for_waiters(&cache, &request.key(), 2).await;
        gate.notify_one();

        assert!(matches!(
            original.await.unwrap(),
            Err(CacheError::Downstream(_))
        ));
        for waiter in waiters {
            let (status, sink) = waiter.await.unwrap();
            assert_eq!(status.unwrap(), CacheStatus::Joined);
            assert!(sink.finished);
            assert_eq!(sink.body, body);
        }

        let mut later = MemorySink::default();
        let status = cache.handle(&request, &*upstream, &mut later).await.unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(later.body, body);
        assert_eq!(upstream.calls(), 1);
    }
}
