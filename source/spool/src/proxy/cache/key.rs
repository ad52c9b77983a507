//! Cache keys
//!
//! A key is the upper-cased method followed by the normalized absolute URL of the
//! request. Request headers other than `Host` never take part, so there is no
//! `Vary` support: two requests for the same URL share one cached response.

use std::fmt;
use std::sync::Arc;

use http::{Method, Uri};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Opaque, path-safe digest of the key, used to name body files.
    pub fn digest(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.0.as_bytes());
        hasher.finalize()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

/// The parts of an inbound request the cache cares about
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    pub uri: Uri,
    pub host: Option<String>,
}

impl CacheRequest {
    pub fn new(method: Method, uri: Uri, host: Option<String>) -> Self {
        Self { method, uri, host }
    }

    /// Only safe, body-less requests are shared between clients.
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    pub fn key(&self) -> CacheKey {
        let scheme = self
            .uri
            .scheme_str()
            .unwrap_or("http")
            .to_ascii_lowercase();
        let authority = self
            .uri
            .authority()
            .map(|a| a.as_str())
            .or(self.host.as_deref())
            .map(|a| strip_default_port(&a.to_ascii_lowercase(), &scheme));

        let path = match self.uri.path() {
            "" => "/",
            p => p,
        };

        let mut key = String::with_capacity(64);
        key.push_str(self.method.as_str());
        key.push(' ');
        if let Some(authority) = authority {
            key.push_str(&scheme);
            key.push_str("://");
            key.push_str(&authority);
        }
        key.push_str(path);
        if let Some(query) = self.uri.query() {
            key.push('?');
            key.push_str(query);
        }
        CacheKey(key.into())
    }
}

fn strip_default_port(authority: &str, scheme: &str) -> String {
    let default = match scheme {
        "https" => ":443",
        _ => ":80",
    };
    authority
        .strip_suffix(default)
        .unwrap_or(authority)
        .to_string()
}
