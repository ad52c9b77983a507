//! Header utilities for HTTP request and response handling
//!
//! Conversions between pingora's header types and the cache's [ResponseHead].

use http::Method;
use pingora::Result;
use pingora_http::{RequestHeader, ResponseHeader};

use crate::proxy::cache::{CacheRequest, ResponseHead};

/// Headers that only describe one connection and are never stored or replayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers that would make the origin answer with something other than the
/// full representation, which is what the cache stores
const PARTIAL_OR_CONDITIONAL: &[&str] = &[
    "range",
    "if-range",
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
];

/// Utility functions for HTTP header manipulation
pub struct HeaderUtils;

impl HeaderUtils {
    pub fn is_hop_by_hop(name: &str) -> bool {
        HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
    }

    /// The parts of a downstream request that make up its cache key
    pub fn cache_request(req_header: &RequestHeader) -> CacheRequest {
        let host = req_header
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        CacheRequest::new(req_header.method.clone(), req_header.uri.clone(), host)
    }

    /// Range requests are proxied as they are, never answered from the cache
    pub fn is_range_request(req_header: &RequestHeader) -> bool {
        req_header.headers.contains_key(http::header::RANGE)
    }

    /// Build the request a cache fill sends upstream for `req_header`
    pub fn origin_request(req_header: &RequestHeader, set_host: Option<&str>) -> Result<RequestHeader> {
        let mut request = req_header.clone();
        for name in HOP_BY_HOP.iter().chain(PARTIAL_OR_CONDITIONAL) {
            request.remove_header(*name);
        }
        if let Some(host) = set_host {
            request.insert_header("host", host)?;
        }
        Ok(request)
    }

    /// Whether a response to a `method` request carries a body at all
    pub fn response_has_body(method: &Method, resp_header: &ResponseHeader) -> bool {
        if *method == Method::HEAD || !Self::status_allows_body(resp_header.status.as_u16()) {
            return false;
        }
        resp_header
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            != Some(0)
    }

    fn status_allows_body(status: u16) -> bool {
        !matches!(status, 100..=199 | 204 | 304)
    }

    /// Capture an upstream response head for storage
    pub fn response_head(resp_header: &ResponseHeader) -> ResponseHead {
        let headers = resp_header
            .headers
            .iter()
            .filter(|(name, _)| !Self::is_hop_by_hop(name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        ResponseHead {
            status: resp_header.status.as_u16(),
            headers,
        }
    }

    /// Build the downstream header for a replayed response
    ///
    /// Without a `content-length` the body is sent with chunked transfer encoding,
    /// unless the status never has one.
    pub fn replay_header(head: &ResponseHead) -> Result<ResponseHeader> {
        let mut resp_header = ResponseHeader::build(head.status, Some(head.headers.len() + 1))?;
        for (name, value) in &head.headers {
            if Self::is_hop_by_hop(name) {
                continue;
            }
            resp_header.append_header(name.clone(), value.as_str())?;
        }
        if head.header("content-length").is_none() && Self::status_allows_body(head.status) {
            resp_header.insert_header("transfer-encoding", "chunked")?;
        }
        Ok(resp_header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_head_drops_hop_by_hop() {
        let mut upstream = ResponseHeader::build(200, None).unwrap();
        upstream.append_header("Content-Type", "text/html").unwrap();
        upstream.append_header("Connection", "keep-alive").unwrap();
        upstream.append_header("Transfer-Encoding", "chunked").unwrap();
        upstream.append_header("Set-Cookie", "a=1").unwrap();
        upstream.append_header("Set-Cookie", "b=2").unwrap();

        let head = HeaderUtils::response_head(&upstream);
        assert_eq!(head.status, 200);
        assert_eq!(
            head.headers,
            vec![
                ("content-type".to_string(), "text/html".to_string()),
                ("set-cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ]
        );
    }

    #[test]
    fn test_replay_header_with_length() {
        let head = ResponseHead::new(404)
            .with_header("content-type", "text/plain")
            .with_header("content-length", "9");
        let header = HeaderUtils::replay_header(&head).unwrap();
        assert_eq!(header.status.as_u16(), 404);
        assert_eq!(header.headers.get("content-length").unwrap(), "9");
        assert!(header.headers.get("transfer-encoding").is_none());
    }

    #[test]
    fn test_replay_header_without_length_is_chunked() {
        let head = ResponseHead::new(200)
            .with_header("content-type", "text/plain")
            .with_header("keep-alive", "timeout=5");
        let header = HeaderUtils::replay_header(&head).unwrap();
        assert_eq!(header.headers.get("transfer-encoding").unwrap(), "chunked");
        assert!(header.headers.get("keep-alive").is_none());
    }

    #[test]
    fn test_bodyless_statuses_are_not_chunked() {
        for status in [204, 304] {
            let header = HeaderUtils::replay_header(&ResponseHead::new(status)).unwrap();
            assert!(header.headers.get("transfer-encoding").is_none());
        }
    }

    #[test]
    fn test_response_has_body() {
        let get = Method::GET;
        let ok = ResponseHeader::build(200, None).unwrap();
        assert!(HeaderUtils::response_has_body(&get, &ok));
        assert!(!HeaderUtils::response_has_body(&Method::HEAD, &ok));

        for status in [103, 204, 304] {
            let header = ResponseHeader::build(status, None).unwrap();
            assert!(!HeaderUtils::response_has_body(&get, &header), "{status}");
        }

        let mut empty = ResponseHeader::build(200, None).unwrap();
        empty.insert_header("Content-Length", "0").unwrap();
        assert!(!HeaderUtils::response_has_body(&get, &empty));

        let mut sized = ResponseHeader::build(200, None).unwrap();
        sized.insert_header("Content-Length", "12").unwrap();
        assert!(HeaderUtils::response_has_body(&get, &sized));
    }

    #[test]
    fn test_origin_request_asks_for_the_full_body() {
        let mut req = RequestHeader::build("GET", b"/video.mp4", None).unwrap();
        req.insert_header("Host", "media.example").unwrap();
        req.insert_header("If-Modified-Since", "Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        req.insert_header("Keep-Alive", "timeout=5").unwrap();
        req.insert_header("User-Agent", "curl/8.0").unwrap();

        let kept = HeaderUtils::origin_request(&req, None).unwrap();
        assert_eq!(kept.headers.get("host").unwrap(), "media.example");
        assert_eq!(kept.headers.get("user-agent").unwrap(), "curl/8.0");
        assert!(kept.headers.get("if-modified-since").is_none());
        assert!(kept.headers.get("keep-alive").is_none());

        let replaced = HeaderUtils::origin_request(&req, Some("origin.internal")).unwrap();
        assert_eq!(replaced.headers.get("host").unwrap(), "origin.internal");
        assert_eq!(replaced.uri, "/video.mp4");
    }

    #[test]
    fn test_cache_request_and_range() {
        let mut req = RequestHeader::build("GET", b"/video.mp4", None).unwrap();
        req.insert_header("Host", "Media.Example").unwrap();
        let request = HeaderUtils::cache_request(&req);
        assert_eq!(request.key().as_str(), "GET http://media.example/video.mp4");
        assert!(!HeaderUtils::is_range_request(&req));

        req.insert_header("Range", "bytes=0-99").unwrap();
        assert!(HeaderUtils::is_range_request(&req));
    }
}
