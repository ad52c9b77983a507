// Implements the Spool proxy service: pingora's HTTP proxy extended with the coalescing
// disk cache. Cacheable requests are answered in the request filter stage: hits and
// requests that joined an in-flight fetch straight from the cache files, misses by
// fetching from the origin on a task of their own and following the new entry like
// every other reader. Everything else is proxied by pingora as usual.
//
// Key Components:
// - `SpoolProxyService`: The `ProxyHttp` implementation holding the cache and the origin.
// - `SpoolContext`: Per-request state for the access log.
// - `Origin`: The connection pool cache fills fetch through.
// - `RequestPipeline` and `ResponsePipeline`: The cache and logging stages the
//   callbacks delegate to.

use std::time::Instant;

use async_trait::async_trait;

use pingora::{server::Server, services::Service, Error};
use pingora_core::{upstreams::peer::HttpPeer, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::config::internal::{ListenerConfig, ListenerKind, ProxyConfig};

use self::{
    cache::{CacheStatus, CoalescingCache, EntryStore},
    origin::Origin,
    pipeline::{RequestPipeline, ResponsePipeline},
};

pub mod cache;
pub mod header_utils;
pub mod origin;
pub mod pipeline;

/// The [SpoolProxyService] is intended to capture the behaviors used to extend
/// the [HttpProxy] functionality by providing a [ProxyHttp] trait implementation.
///
/// The [ProxyHttp] trait allows us to provide callback-like control of various stages
/// of the [request/response lifecycle].
///
/// [HttpProxy]: pingora_proxy::HttpProxy
/// [request/response lifecycle]: https://github.com/cloudflare/pingora/blob/7ce6f4ac1c440756a63b0766f72dbeca25c6fc94/docs/user_guide/phase_chart.md
pub struct SpoolProxyService {
    /// Cache, if enabled for this proxy
    pub cache: Option<CoalescingCache>,
    /// The origin every request is forwarded to
    pub origin: Origin,
}

/// Create a proxy service from its configuration
pub fn spool_proxy_service(
    conf: ProxyConfig,
    server: &Server,
) -> std::io::Result<Box<dyn Service>> {
    let cache = if conf.cache.enabled {
        let store = EntryStore::open(conf.cache.store_config(&conf.name))?;
        tracing::info!(
            "Cache enabled for {} with room for {} entries",
            conf.name,
            store.capacity()
        );
        Some(CoalescingCache::new(
            store,
            conf.cache.max_metadata_entries,
        ))
    } else {
        None
    };

    let mut my_proxy = pingora_proxy::http_proxy_service_with_name(
        &server.configuration,
        SpoolProxyService {
            cache,
            origin: Origin::new(&conf.upstream),
        },
        &conf.name,
    );

    populate_listeners(conf.listeners, &mut my_proxy);

    Ok(Box::new(my_proxy))
}

pub fn populate_listeners<T>(
    listeners: Vec<ListenerConfig>,
    service: &mut pingora_core::services::listening::Service<T>,
) {
    for list_cfg in listeners {
        match list_cfg.source {
            ListenerKind::Tcp { addr } => {
                service.add_tcp(&addr);
            }
            ListenerKind::Uds(path) => {
                // NOTE: See https://github.com/cloudflare/pingora/issues/182 for tracking
                // "paths aren't always UTF-8 strings".
                let path = path.to_string_lossy();
                service.add_uds(&path, None);
            }
        }
    }
}

/// Per-request context
pub struct SpoolContext {
    pub started: Instant,
    /// How the request was answered, for the access log
    pub cache_status: CacheStatus,
    pub response_status: Option<u16>,
    pub bytes_from_cache: u64,
    pub upstream_addr: String,
    /// A failure already answered with an error response
    pub error: Option<String>,
}

impl SpoolContext {
    pub fn new(upstream_addr: String) -> Self {
        Self {
            started: Instant::now(),
            cache_status: CacheStatus::Bypass,
            response_status: None,
            bytes_from_cache: 0,
            upstream_addr,
            error: None,
        }
    }
}

#[async_trait]
impl ProxyHttp for SpoolProxyService {
    type CTX = SpoolContext;

    fn new_ctx(&self) -> Self::CTX {
        SpoolContext::new(self.origin.addr().to_string())
    }

    /// Handle the "Request filter" stage using the Pipeline pattern
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        match &self.cache {
            Some(cache) => {
                RequestPipeline::process_cache_lookup(session, ctx, cache, &self.origin).await
            }
            None => Ok(false),
        }
    }

    /// Handle the "upstream peer" phase, where we pick which upstream to proxy to.
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Ok(Box::new(self.origin.peer()))
    }

    /// Handle the "upstream request filter" phase, where we can choose to make
    /// modifications to the request, prior to it being passed along to the
    /// upstream.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        header: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(host) = self.origin.set_host() {
            header.insert_header("host", host)?;
        }
        Ok(())
    }

    /// Record the status of a response pingora proxies on its own
    fn upstream_response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) {
        ctx.response_status = Some(upstream_response.status.as_u16());
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        ResponsePipeline::process_logging(session, e, ctx);
    }
}
