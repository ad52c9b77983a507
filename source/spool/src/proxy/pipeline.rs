//! Request processing pipeline
//!
//! The stages the [SpoolProxyService](super::SpoolProxyService) callbacks run:
//! answering cacheable requests through the cache when a request arrives, and
//! access logging when the request is done.

use async_trait::async_trait;
use bytes::Bytes;
use pingora::{Error, ErrorType, Result};
use pingora_proxy::Session;

use crate::logging::{self, AccessRecord};
use crate::proxy::cache::{
    CacheError, CacheRequest, CacheStatus, CoalescingCache, ResponseHead, ResponseSink, Upstream,
};
use crate::proxy::header_utils::HeaderUtils;
use crate::proxy::origin::Origin;
use crate::proxy::SpoolContext;

/// [ResponseSink] writing to a pingora downstream session
pub struct SessionSink<'a> {
    session: &'a mut Session,
}

impl<'a> SessionSink<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ResponseSink for SessionSink<'_> {
    async fn write_head(&mut self, head: &ResponseHead) -> Result<(), CacheError> {
        let header =
            HeaderUtils::replay_header(head).map_err(|e| CacheError::downstream(e.to_string()))?;
        self.session
            .downstream_session
            .write_response_header(Box::new(header))
            .await
            .map_err(|e| CacheError::downstream(e.to_string()))
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), CacheError> {
        self.session
            .downstream_session
            .write_response_body(chunk, false)
            .await
            .map_err(|e| CacheError::downstream(e.to_string()))
    }

    async fn finish(&mut self) -> Result<(), CacheError> {
        self.session
            .downstream_session
            .write_response_body(Bytes::new(), true)
            .await
            .map_err(|e| CacheError::downstream(e.to_string()))
    }

    async fn fail(&mut self, error: &CacheError) {
        tracing::debug!(error = %error, "Answering with 502 before any response was sent");
        self.session.downstream_session.respond_error(502).await;
    }
}

/// Records what was sent through a [ResponseSink], for the access log.
///
/// A failure is only passed on while no head was written; afterwards the
/// response can only be cut short, which the caller does.
pub struct ResponseTracker<'a, S: ?Sized> {
    inner: &'a mut S,
    status: Option<u16>,
    cache_status: CacheStatus,
    sent: u64,
    failed_before_head: bool,
}

impl<'a, S: ResponseSink + ?Sized> ResponseTracker<'a, S> {
    pub fn new(inner: &'a mut S) -> Self {
        Self {
            inner,
            status: None,
            cache_status: CacheStatus::Bypass,
            sent: 0,
            failed_before_head: false,
        }
    }
}

#[async_trait]
impl<S: ResponseSink + ?Sized> ResponseSink for ResponseTracker<'_, S> {
    async fn write_head(&mut self, head: &ResponseHead) -> Result<(), CacheError> {
        self.inner.write_head(head).await?;
        self.status = Some(head.status);
        Ok(())
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), CacheError> {
        let len = chunk.len() as u64;
        self.inner.write_body(chunk).await?;
        self.sent += len;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), CacheError> {
        self.inner.finish().await
    }

    async fn fail(&mut self, error: &CacheError) {
        if self.status.is_none() {
            self.inner.fail(error).await;
            self.failed_before_head = true;
            self.status = Some(502);
        }
    }

    fn on_status(&mut self, status: CacheStatus) {
        self.cache_status = status;
        self.inner.on_status(status);
    }
}

/// Pipeline for processing HTTP requests
pub struct RequestPipeline;

impl RequestPipeline {
    /// Process cache lookup stage
    ///
    /// Returns `true` when the request was answered here. Requests the cache does
    /// not handle return `false` and are proxied by pingora.
    pub async fn process_cache_lookup(
        session: &mut Session,
        ctx: &mut SpoolContext,
        cache: &CoalescingCache,
        origin: &Origin,
    ) -> Result<bool> {
        let req_header = session.req_header();
        let request = HeaderUtils::cache_request(req_header);
        if !request.is_cacheable() || HeaderUtils::is_range_request(req_header) {
            ctx.cache_status = CacheStatus::Bypass;
            return Ok(false);
        }

        tracing::debug!(cache_key = %request.key(), "Checking cache");
        let fetch = origin.fetch_for(req_header)?;
        let mut sink = SessionSink::new(session);
        Self::answer(ctx, cache, &request, &fetch, &mut sink).await
    }

    /// Answer `request` through the cache into `sink` and settle the context.
    ///
    /// A failure before the head was sent has already been answered with a 502.
    /// A failure after it becomes a pingora `WriteError`, which drops the
    /// connection so the client never takes a short body for a whole one.
    pub async fn answer<U, S>(
        ctx: &mut SpoolContext,
        cache: &CoalescingCache,
        request: &CacheRequest,
        upstream: &U,
        sink: &mut S,
    ) -> Result<bool>
    where
        U: Upstream + ?Sized,
        S: ResponseSink + ?Sized,
    {
        let mut tracker = ResponseTracker::new(sink);
        let result = cache.handle(request, upstream, &mut tracker).await;

        ctx.cache_status = tracker.cache_status;
        ctx.response_status = tracker.status;
        if tracker.cache_status != CacheStatus::Bypass {
            ctx.bytes_from_cache = tracker.sent;
        }

        match result {
            Ok(_) => Ok(true),
            Err(e) if tracker.failed_before_head => {
                tracing::warn!(error = %e, "Request failed before a response was sent");
                ctx.error = Some(e.to_string());
                Ok(true)
            }
            Err(e) => Err(Error::explain(
                ErrorType::WriteError,
                format!("response cut short: {e}"),
            )),
        }
    }
}

/// Pipeline for processing HTTP responses
pub struct ResponsePipeline;

impl ResponsePipeline {
    /// Write the access log line, and the error log line if the request failed
    pub fn process_logging(session: &Session, error: Option<&Error>, ctx: &SpoolContext) {
        let req_header = session.req_header();
        let uri = req_header.uri.to_string();
        logging::log_access(&AccessRecord {
            method: req_header.method.as_str(),
            uri: &uri,
            status: Self::logged_status(ctx, error),
            cache_status: ctx.cache_status.as_str(),
            bytes_from_cache: ctx.bytes_from_cache,
            upstream: &ctx.upstream_addr,
            elapsed: ctx.started.elapsed(),
        });

        let failure = error.map(|e| e.to_string()).or_else(|| ctx.error.clone());
        if let Some(failure) = failure {
            logging::log_error(req_header.method.as_str(), &uri, &failure);
        }
    }

    /// The status the client saw: what was sent, else 502 for a failed request
    pub fn logged_status(ctx: &SpoolContext, error: Option<&Error>) -> u16 {
        ctx.response_status
            .or_else(|| error.map(|_| 502))
            .unwrap_or(0)
    }
}
