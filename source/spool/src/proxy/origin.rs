//! The origin behind a proxy
//!
//! Cache misses are fetched here rather than through pingora's proxy phases, so the
//! cache fill does not depend on the downstream connection that caused it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use pingora::{Error, Result};
use pingora_core::{
    connectors::http::Connector, protocols::http::client::HttpSession,
    upstreams::peer::HttpPeer,
};
use pingora_http::RequestHeader;

use crate::config::internal::UpstreamConfig;
use crate::proxy::cache::{CacheError, CacheRequest, Upstream, UpstreamResponse};
use crate::proxy::header_utils::HeaderUtils;

/// Connection pool and peer of one configured origin
#[derive(Clone)]
pub struct Origin {
    connector: Arc<Connector>,
    addr: SocketAddr,
    peer: HttpPeer,
    set_host: Option<String>,
}

impl Origin {
    pub fn new(upstream: &UpstreamConfig) -> Self {
        Self {
            connector: Arc::new(Connector::new(None)),
            addr: upstream.addr,
            peer: HttpPeer::new(upstream.addr, upstream.tls, upstream.sni.clone()),
            set_host: upstream.set_host.clone(),
        }
    }

    pub fn peer(&self) -> HttpPeer {
        self.peer.clone()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replacement for the `Host` header of forwarded requests
    pub fn set_host(&self) -> Option<&str> {
        self.set_host.as_deref()
    }

    /// Prepare the upstream request for a cache fill of `req_header`
    pub fn fetch_for(&self, req_header: &RequestHeader) -> Result<OriginFetch> {
        Ok(OriginFetch {
            connector: self.connector.clone(),
            peer: self.peer.clone(),
            request: HeaderUtils::origin_request(req_header, self.set_host())?,
        })
    }
}

/// One prepared upstream request
pub struct OriginFetch {
    connector: Arc<Connector>,
    peer: HttpPeer,
    request: RequestHeader,
}

impl OriginFetch {
    pub fn request(&self) -> &RequestHeader {
        &self.request
    }

    /// Send the request and read up to the final response head.
    async fn exchange(&self, mut session: HttpSession) -> Result<UpstreamResponse, CacheError> {
        session
            .write_request_header(Box::new(self.request.clone()))
            .await
            .map_err(transport)?;
        session.finish_request_body().await.map_err(transport)?;

        let head = loop {
            session.read_response_header().await.map_err(transport)?;
            let Some(header) = session.response_header() else {
                return Err(CacheError::transport("upstream sent no response header"));
            };
            // Informational heads other than a protocol switch precede the real one
            if header.status.is_informational() && header.status.as_u16() != 101 {
                continue;
            }
            break header.clone();
        };

        let response_head = HeaderUtils::response_head(&head);
        if !HeaderUtils::response_has_body(&self.request.method, &head) {
            self.connector
                .release_http_session(session, &self.peer, None)
                .await;
            return Ok(UpstreamResponse {
                head: response_head,
                body: stream::empty().boxed(),
            });
        }

        let connector = self.connector.clone();
        let peer = self.peer.clone();
        let body = stream::unfold(Some(session), move |state| {
            let connector = connector.clone();
            let peer = peer.clone();
            async move {
                let mut session = state?;
                match session.read_response_body().await {
                    Ok(Some(chunk)) => Some((Ok(chunk), Some(session))),
                    Ok(None) => {
                        connector.release_http_session(session, &peer, None).await;
                        None
                    }
                    Err(e) => {
                        let e = io::Error::new(io::ErrorKind::Other, e.to_string());
                        Some((Err(e), None))
                    }
                }
            }
        })
        .boxed();

        Ok(UpstreamResponse {
            head: response_head,
            body,
        })
    }
}

#[async_trait]
impl Upstream for OriginFetch {
    async fn fetch(&self, _request: &CacheRequest) -> Result<UpstreamResponse, CacheError> {
        let (session, reused) = self
            .connector
            .get_http_session(&self.peer)
            .await
            .map_err(transport)?;
        match self.exchange(session).await {
            Err(e) if reused => {
                // A pooled connection may have been closed by the origin meanwhile
                tracing::debug!(error = %e, "Reused upstream connection failed, reconnecting");
                let (session, _) = self
                    .connector
                    .get_http_session(&self.peer)
                    .await
                    .map_err(transport)?;
                self.exchange(session).await
            }
            result => result,
        }
    }
}

fn transport(e: Box<Error>) -> CacheError {
    CacheError::transport(e.to_string())
}
