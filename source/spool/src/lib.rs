//! Spool: a coalescing, disk-backed caching reverse proxy built on pingora
//!
//! The [proxy::cache] module holds the cache itself and can be used without the
//! pingora edge in [proxy].

pub mod config;
pub mod logging;
pub mod proxy;
