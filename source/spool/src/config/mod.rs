//! Configuration sources
//!
//! Spool is configured from an nginx-like file, from the command line, or both.
//! Everything is rendered into [internal::Config].

use std::path::PathBuf;

use clap::Parser;
use miette::Diagnostic;
use thiserror::Error;

use self::internal::{CacheConfig, Config, ListenerConfig, ProxyConfig, UpstreamConfig};
use self::nginx::{Nginx, NginxParseError};

pub mod internal;
pub mod nginx;

/// A coalescing, disk-backed caching reverse proxy
#[derive(Parser, Debug, Default)]
#[command(version, about)]
pub struct Cli {
    /// Path to the nginx-like configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub validate_configs: bool,

    /// Address to listen on, `host:port` or `unix:/path`. May be repeated.
    #[arg(long)]
    pub listen: Vec<String>,

    /// Origin URL cache misses are forwarded to, e.g. `http://127.0.0.1:9000`
    #[arg(long)]
    pub upstream: Option<String>,

    /// Base directory for cache files
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum number of cached bodies per proxy
    #[arg(long)]
    pub max_entries: Option<usize>,

    #[arg(long)]
    pub threads_per_service: Option<usize>,

    #[arg(long)]
    pub daemonize: bool,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] NginxParseError),

    #[error("invalid upstream '{url}': {reason}")]
    #[diagnostic(help("use a URL such as http://127.0.0.1:9000"))]
    Upstream { url: String, reason: String },

    #[error("--listen and --upstream need exactly one server block, found {0}")]
    #[diagnostic(help("set listeners and origins in the configuration file instead"))]
    AmbiguousOverride(usize),

    #[error("no proxy configured")]
    #[diagnostic(help("pass --config, or both --listen and --upstream"))]
    NoProxies,

    #[error("--max-entries must be greater than zero")]
    ZeroEntries,
}

/// Render the configuration from the command line arguments of this process
pub fn render_config() -> Result<Config, ConfigError> {
    render_config_from(Cli::parse())
}

/// Render the configuration from parsed command line arguments
pub fn render_config_from(cli: Cli) -> Result<Config, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            Nginx::from_path(path)?.into()
        }
        None => Config::default(),
    };

    apply_cli(&mut config, cli)?;

    if config.basic_proxies.is_empty() {
        return Err(ConfigError::NoProxies);
    }
    Ok(config)
}

fn apply_cli(config: &mut Config, cli: Cli) -> Result<(), ConfigError> {
    if cli.validate_configs {
        config.validate_configs = true;
    }
    if cli.daemonize {
        config.daemonize = true;
    }
    if let Some(threads) = cli.threads_per_service {
        config.threads_per_service = threads.max(1);
    }

    let upstream = cli
        .upstream
        .as_deref()
        .map(|url| {
            UpstreamConfig::from_url(url).map_err(|reason| ConfigError::Upstream {
                url: url.to_string(),
                reason,
            })
        })
        .transpose()?;
    let listeners: Vec<ListenerConfig> =
        cli.listen.iter().map(|l| ListenerConfig::parse(l)).collect();

    if config.basic_proxies.is_empty() {
        // Without a file, a single proxy comes from the command line alone
        if let (Some(upstream), false) = (upstream, listeners.is_empty()) {
            config.basic_proxies.push(ProxyConfig {
                name: "spool".to_string(),
                listeners,
                upstream,
                cache: CacheConfig::default(),
            });
        }
    } else if upstream.is_some() || !listeners.is_empty() {
        let [proxy] = config.basic_proxies.as_mut_slice() else {
            return Err(ConfigError::AmbiguousOverride(config.basic_proxies.len()));
        };
        if let Some(upstream) = upstream {
            proxy.upstream = upstream;
        }
        if !listeners.is_empty() {
            proxy.listeners = listeners;
        }
    }

    for proxy in config.basic_proxies.iter_mut() {
        if let Some(dir) = &cli.cache_dir {
            proxy.cache.dir = Some(dir.clone());
        }
        if let Some(max) = cli.max_entries {
            if max == 0 {
                return Err(ConfigError::ZeroEntries);
            }
            proxy.cache.max_entries = max;
        }
    }

    Ok(())
}
