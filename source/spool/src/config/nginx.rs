//! Configuration sourced from an Nginx-like file format
//!
//! This module implements a parser for a simplified Nginx-like configuration format
//! that is more familiar to users of Nginx while mapping directly onto spool's
//! internal configuration model.

use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;
use tracing::Level;

use super::internal::{CacheConfig, Config, ListenerConfig, ProxyConfig, UpstreamConfig};

#[derive(Debug, Error, Diagnostic)]
#[error("Nginx configuration error at line {line}: {message}")]
pub struct NginxParseError {
    message: String,
    line: usize,
    #[source_code]
    source_code: String,
    #[label("here")]
    span: SourceSpan,
}

impl NginxParseError {
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Represents an Nginx-like configuration
pub struct Nginx {
    config: Config,
}

impl Nginx {
    /// Load configuration from a file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, NginxParseError> {
        let content = read_to_string(&path).map_err(|e| NginxParseError {
            message: format!("cannot read {}: {}", path.as_ref().display(), e),
            line: 0,
            source_code: String::new(),
            span: (0, 0).into(),
        })?;
        Self::from_string(&content)
    }

    /// Parse configuration from a string
    pub fn from_string(content: &str) -> Result<Self, NginxParseError> {
        let mut parser = NginxParser::new(content);
        let config = parser.parse()?;
        Ok(Self { config })
    }
}

impl From<Nginx> for Config {
    fn from(nginx: Nginx) -> Self {
        nginx.config
    }
}

/// Parser for Nginx-like configuration syntax
struct NginxParser<'a> {
    content: &'a str,
    lines: Vec<(usize, &'a str)>, // (line_number, line_content)
    current_line: usize,
}

impl<'a> NginxParser<'a> {
    fn new(content: &'a str) -> Self {
        let lines: Vec<(usize, &'a str)> = content
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line))
            .filter(|(_, line)| !line.trim().is_empty() && !line.trim().starts_with('#'))
            .collect();

        Self {
            content,
            lines,
            current_line: 0,
        }
    }

    /// Returns the next non-empty line after stripping inline comments.
    fn next_clean_line(&mut self) -> Option<(usize, &'a str)> {
        while let Some((line_num, raw_line)) = self.next_line() {
            let cleaned = raw_line.split('#').next().unwrap_or("").trim();
            if !cleaned.is_empty() {
                return Some((line_num, cleaned));
            }
        }
        None
    }

    fn next_line(&mut self) -> Option<(usize, &'a str)> {
        let line = self.lines.get(self.current_line).copied()?;
        self.current_line += 1;
        Some(line)
    }

    fn last_line_num(&self) -> usize {
        self.current_line
            .checked_sub(1)
            .and_then(|idx| self.lines.get(idx))
            .map(|(num, _)| *num)
            .unwrap_or(0)
    }

    fn parse(&mut self) -> Result<Config, NginxParseError> {
        let mut config = Config::default();
        let mut basic_proxies = Vec::new();

        while let Some((line_num, line)) = self.next_clean_line() {
            let line = line.trim_end_matches(';');
            if line.starts_with("system") {
                self.expect_open_brace(line, line_num)?;
                self.parse_system_block(&mut config)?;
            } else if line.starts_with("http") {
                self.expect_open_brace(line, line_num)?;
                self.parse_http_block(&mut basic_proxies)?;
            } else {
                return Err(self.error("Unknown top-level block", line_num, 0, line.len()));
            }
        }

        config.logging.enabled =
            config.logging.access_log.is_some() || config.logging.error_log.is_some();
        config.basic_proxies = basic_proxies;
        Ok(config)
    }

    fn expect_open_brace(&self, line: &str, line_num: usize) -> Result<(), NginxParseError> {
        if !line.ends_with('{') {
            Err(self.error("Expected '{'", line_num, line.len().saturating_sub(1), 1))
        } else {
            Ok(())
        }
    }

    fn error(&self, message: &str, line_num: usize, offset: usize, len: usize) -> NginxParseError {
        NginxParseError {
            message: message.to_string(),
            line: line_num,
            source_code: self.content.to_string(),
            span: (self.line_offset(line_num) + offset, len).into(),
        }
    }

    fn line_offset(&self, line_num: usize) -> usize {
        self.content
            .lines()
            .take(line_num.saturating_sub(1))
            .map(|l| l.len() + 1)
            .sum()
    }

    fn parse_system_block(&mut self, config: &mut Config) -> Result<(), NginxParseError> {
        while let Some((line_num, line)) = self.next_clean_line() {
            let line = line.trim_end_matches(';');
            if line == "}" {
                break;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.first().copied().unwrap_or("") {
                "threads_per_service" => {
                    config.threads_per_service =
                        self.parse_value(&parts, 1, line_num, "threads_per_service")?;
                }
                "daemonize" => {
                    config.daemonize = self.parse_value(&parts, 1, line_num, "daemonize")?;
                }
                "pid_file" => {
                    let path = self.parse_quoted_value(&parts, 1, line_num, "pid_file")?;
                    config.pid_file = Some(PathBuf::from(path));
                }
                "upgrade_socket" => {
                    let path = self.parse_quoted_value(&parts, 1, line_num, "upgrade_socket")?;
                    config.upgrade_socket = Some(PathBuf::from(path));
                }
                "log_level" => {
                    config.logging.level =
                        self.parse_value::<Level>(&parts, 1, line_num, "log_level")?;
                }
                "access_log" => {
                    let path = self.parse_quoted_value(&parts, 1, line_num, "access_log")?;
                    config.logging.access_log = Some(PathBuf::from(path));
                }
                "error_log" => {
                    let path = self.parse_quoted_value(&parts, 1, line_num, "error_log")?;
                    config.logging.error_log = Some(PathBuf::from(path));
                }
                _ => return Err(self.error("Unknown system directive", line_num, 0, line.len())),
            }
        }
        Ok(())
    }

    fn parse_http_block(
        &mut self,
        basic_proxies: &mut Vec<ProxyConfig>,
    ) -> Result<(), NginxParseError> {
        while let Some((line_num, line)) = self.next_clean_line() {
            let line = line.trim_end_matches(';');
            if line == "}" {
                break;
            }
            if line.starts_with("server") {
                self.expect_open_brace(line, line_num)?;
                self.parse_server_block(basic_proxies)?;
            } else {
                return Err(self.error("Unknown http directive", line_num, 0, line.len()));
            }
        }
        Ok(())
    }

    fn parse_server_block(
        &mut self,
        basic_proxies: &mut Vec<ProxyConfig>,
    ) -> Result<(), NginxParseError> {
        let start_line = self.last_line_num();
        let mut name = format!("Server{}", basic_proxies.len());
        let mut listeners = Vec::new();
        let mut upstream: Option<UpstreamConfig> = None;
        let mut set_host: Option<String> = None;
        let mut cache = CacheConfig::default();

        while let Some((line_num, line)) = self.next_clean_line() {
            let line = line.trim_end_matches(';');
            if line == "}" {
                break;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.first().copied().unwrap_or("") {
                "server_name" => {
                    name = self.parse_value(&parts, 1, line_num, "server_name")?;
                }
                "listen" => {
                    let addr = self.parse_quoted_value(&parts, 1, line_num, "listen")?;
                    listeners.push(ListenerConfig::parse(&addr));
                }
                "proxy_pass" => {
                    let url = self.parse_quoted_value(&parts, 1, line_num, "proxy_pass")?;
                    let parsed = UpstreamConfig::from_url(&url)
                        .map_err(|e| self.error(&format!("Invalid proxy_pass: {e}"), line_num, 0, line.len()))?;
                    upstream = Some(parsed);
                }
                "proxy_set_host" => {
                    set_host = Some(self.parse_quoted_value(&parts, 1, line_num, "proxy_set_host")?);
                }
                "cache" => {
                    self.expect_open_brace(line, line_num)?;
                    self.parse_cache_block(&mut cache)?;
                }
                _ => return Err(self.error("Unknown server directive", line_num, 0, line.len())),
            }
        }

        if listeners.is_empty() {
            return Err(self.error("Server must have at least one listener", start_line, 0, 0));
        }
        let Some(mut upstream) = upstream else {
            return Err(self.error("Proxy server must have a proxy_pass", start_line, 0, 0));
        };
        upstream.set_host = set_host;

        basic_proxies.push(ProxyConfig {
            name,
            listeners,
            upstream,
            cache,
        });
        Ok(())
    }

    fn parse_cache_block(&mut self, cache: &mut CacheConfig) -> Result<(), NginxParseError> {
        while let Some((sub_line_num, line)) = self.next_clean_line() {
            let line = line.trim_end_matches(';');
            if line == "}" {
                break;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.first().copied().unwrap_or("") {
                "cache_enabled" => {
                    cache.enabled = self.parse_value(&parts, 1, sub_line_num, "cache_enabled")?;
                }
                "cache_dir" => {
                    let path = self.parse_quoted_value(&parts, 1, sub_line_num, "cache_dir")?;
                    cache.dir = Some(PathBuf::from(path));
                }
                "max_entries" => {
                    cache.max_entries =
                        self.parse_positive(&parts, sub_line_num, "max_entries")?;
                }
                "max_metadata_entries" => {
                    cache.max_metadata_entries =
                        self.parse_positive(&parts, sub_line_num, "max_metadata_entries")?;
                }
                "shard_count" => {
                    cache.shard_count = self.parse_positive(&parts, sub_line_num, "shard_count")?;
                }
                "read_chunk_size" => {
                    cache.read_chunk_size =
                        self.parse_positive(&parts, sub_line_num, "read_chunk_size")?;
                }
                _ => {
                    return Err(self.error(
                        "Unknown cache directive",
                        sub_line_num,
                        0,
                        line.len(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn parse_positive(
        &self,
        parts: &[&str],
        line_num: usize,
        directive: &str,
    ) -> Result<usize, NginxParseError> {
        let val: i64 = self.parse_value(parts, 1, line_num, directive)?;
        if val > 0 {
            Ok(val as usize)
        } else {
            Err(self.error(
                &format!("{} must be positive", directive),
                line_num,
                0,
                parts.join(" ").len(),
            ))
        }
    }

    fn parse_value<T: FromStr>(
        &self,
        parts: &[&str],
        index: usize,
        line_num: usize,
        directive: &str,
    ) -> Result<T, NginxParseError> {
        if parts.len() <= index {
            return Err(self.error(
                &format!("Missing value for {}", directive),
                line_num,
                0,
                parts.join(" ").len(),
            ));
        }
        parts[index].parse().map_err(|_| {
            self.error(
                &format!("Invalid value for {}", directive),
                line_num,
                0,
                parts[index].len(),
            )
        })
    }

    fn parse_quoted_value(
        &self,
        parts: &[&str],
        index: usize,
        line_num: usize,
        directive: &str,
    ) -> Result<String, NginxParseError> {
        if parts.len() <= index {
            return Err(self.error(
                &format!("Missing value for {}", directive),
                line_num,
                0,
                parts.join(" ").len(),
            ));
        }
        Ok(parts[index].trim_matches('"').to_string())
    }
}
