//! Spool's internal configuration
//!
//! This is the configuration all other sources (the nginx-like file, the CLI) are
//! rendered into.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use http::Uri;
use pingora::server::configuration::{Opt as PingoraOpt, ServerConf as PingoraServerConf};

use crate::logging::LoggingConfig;
use crate::proxy::cache::{StoreConfig, DEFAULT_READ_CHUNK};

/// Spool's internal configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub validate_configs: bool,
    pub threads_per_service: usize,
    pub daemonize: bool,
    pub pid_file: Option<PathBuf>,
    pub upgrade_socket: Option<PathBuf>,
    pub upgrade: bool,
    pub logging: LoggingConfig,
    pub basic_proxies: Vec<ProxyConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            validate_configs: false,
            threads_per_service: 8,
            daemonize: false,
            pid_file: None,
            upgrade_socket: None,
            upgrade: false,
            logging: LoggingConfig::default(),
            basic_proxies: vec![],
        }
    }
}

impl Config {
    /// Get the [`Opt`][PingoraOpt] field for Pingora
    pub fn pingora_opt(&self) -> PingoraOpt {
        let mut opt = PingoraOpt::default();
        opt.upgrade = self.upgrade;
        opt.daemon = self.daemonize;
        opt.test = self.validate_configs;
        opt
    }

    /// Get the [`ServerConf`][PingoraServerConf] field for Pingora
    pub fn pingora_server_conf(&self) -> PingoraServerConf {
        let defaults = PingoraServerConf::default();
        PingoraServerConf {
            daemon: self.daemonize,
            error_log: None,
            pid_file: self
                .pid_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(defaults.pid_file.clone()),
            upgrade_sock: self
                .upgrade_socket
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(defaults.upgrade_sock.clone()),
            threads: self.threads_per_service,
            work_stealing: true,
            ..defaults
        }
    }
}

/// Where a proxy accepts connections
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub source: ListenerKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerKind {
    Tcp { addr: String },
    Uds(PathBuf),
}

impl ListenerConfig {
    /// Parse `host:port` or `unix:/path/to.sock`
    pub fn parse(value: &str) -> Self {
        let source = match value.strip_prefix("unix:") {
            Some(path) => ListenerKind::Uds(PathBuf::from(path)),
            None => ListenerKind::Tcp {
                addr: value.to_string(),
            },
        };
        Self { source }
    }
}

/// The single origin a proxy forwards cache misses to
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub addr: SocketAddr,
    pub tls: bool,
    pub sni: String,
    /// Replaces the `Host` header of forwarded requests when set
    pub set_host: Option<String>,
}

impl UpstreamConfig {
    /// Build from a `proxy_pass` URL such as `http://127.0.0.1:9000` or
    /// `https://origin.example.com`. Host names are resolved once, here.
    pub fn from_url(url: &str) -> Result<Self, String> {
        let uri: Uri = url.parse().map_err(|e| format!("invalid URL: {e}"))?;
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => return Err(format!("unsupported scheme '{other}'")),
            None => return Err("URL must start with http:// or https://".to_string()),
        };
        let host = uri
            .host()
            .ok_or_else(|| "URL has no host".to_string())?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| format!("cannot resolve '{host}': {e}"))?
            .next()
            .ok_or_else(|| format!("'{host}' resolved to no address"))?;

        Ok(Self {
            addr,
            tls,
            sni: if tls { host } else { String::new() },
            set_host: None,
        })
    }
}

/// Cache settings of one proxy
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Base directory; the proxy's name is appended to it
    pub dir: Option<PathBuf>,
    pub max_entries: usize,
    pub max_metadata_entries: usize,
    pub shard_count: usize,
    pub read_chunk_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_entries: 1024,
            max_metadata_entries: 1000,
            shard_count: 16,
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }
}

impl CacheConfig {
    pub fn store_config(&self, proxy_name: &str) -> StoreConfig {
        let base = self
            .dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("spool"));
        StoreConfig {
            root: base.join(proxy_name),
            capacity: self.max_entries,
            shard_count: self.shard_count,
            read_chunk_size: self.read_chunk_size,
        }
    }
}

/// One reverse proxy: its listeners, its origin and its cache
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub name: String,
    pub listeners: Vec<ListenerConfig>,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
}
