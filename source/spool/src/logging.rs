// Logging for the spool proxy: a console layer plus optional access-log and error-log
// files. File output goes through a background writer thread that batches lines and
// flushes them, so request handling never blocks on log I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::oneshot;
use tracing::Level;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;

/// Target of access log events; the console layer hides them.
pub const ACCESS_TARGET: &str = "spool::access";

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub access_log: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
    pub level: Level,
    pub enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            access_log: None,
            error_log: None,
            level: Level::INFO,
            enabled: false,
        }
    }
}

/// Message sent to the writer thread
#[derive(Debug)]
enum LogMessage {
    Content(Vec<u8>),
    Shutdown(oneshot::Sender<()>),
}

const FLUSH_BYTES: usize = 32 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// File writer fed through a channel by the tracing layers
pub struct AsyncFileWriter {
    sender: Sender<LogMessage>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncFileWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file_path = path.as_ref().to_path_buf();
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;
        let (sender, receiver) = mpsc::channel(4096);
        let thread = std::thread::Builder::new()
            .name("spool-log-writer".into())
            .spawn(move || writer_thread(receiver, file, file_path))?;

        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }
}

fn writer_thread(mut receiver: Receiver<LogMessage>, mut file: File, path: PathBuf) {
    let mut buffer = Vec::with_capacity(64 * 1024);
    let mut last_flush = Instant::now();

    let mut write_out = |buffer: &mut Vec<u8>| {
        if buffer.is_empty() {
            return;
        }
        if let Err(e) = file.write_all(buffer).and_then(|_| file.flush()) {
            eprintln!("Error writing to {}: {}", path.display(), e);
        }
        buffer.clear();
    };

    while let Some(msg) = receiver.blocking_recv() {
        match msg {
            LogMessage::Content(content) => {
                buffer.extend_from_slice(&content);
                let now = Instant::now();
                if buffer.len() > FLUSH_BYTES || now.duration_since(last_flush) > FLUSH_INTERVAL {
                    write_out(&mut buffer);
                    last_flush = now;
                }
            }
            LogMessage::Shutdown(response) => {
                write_out(&mut buffer);
                let _ = response.send(());
                return;
            }
        }
    }
    write_out(&mut buffer);
}

impl Drop for AsyncFileWriter {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let (tx, mut rx) = oneshot::channel();
        if self.sender.try_send(LogMessage::Shutdown(tx)).is_err() {
            return;
        }

        // Bounded wait for the final flush; the thread is never joined blindly
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            if rx.try_recv().is_ok() {
                let _ = thread.join();
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl MakeWriter<'_> for AsyncFileWriter {
    type Writer = AsyncLogWriter;

    fn make_writer(&self) -> Self::Writer {
        AsyncLogWriter {
            sender: self.sender.clone(),
        }
    }
}

/// Writer implementation for tracing integration
pub struct AsyncLogWriter {
    sender: Sender<LogMessage>,
}

impl Write for AsyncLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self
            .sender
            .try_send(LogMessage::Content(buf.to_vec()))
            .is_err()
        {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "Log buffer full"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Initialize the logging system
pub fn init_logging(config: &LoggingConfig) -> io::Result<()> {
    // Access lines only go to the access log
    let console_layer = fmt::layer().with_writer(std::io::stdout).with_filter(
        Targets::new()
            .with_target(ACCESS_TARGET, LevelFilter::OFF)
            .with_default(config.level),
    );

    if !config.enabled {
        tracing_subscriber::registry().with(console_layer).init();
        return Ok(());
    }

    let access_writer = config
        .access_log
        .as_ref()
        .map(AsyncFileWriter::new)
        .transpose()?;
    let error_writer = config
        .error_log
        .as_ref()
        .map(AsyncFileWriter::new)
        .transpose()?;

    let access_layer = access_writer.map(|w| {
        fmt::layer()
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_level(false)
            .with_writer(w)
            .with_filter(Targets::new().with_target(ACCESS_TARGET, Level::INFO))
    });

    let error_layer = error_writer.map(|w| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(w)
            .with_filter(LevelFilter::ERROR)
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(access_layer)
        .with(error_layer)
        .init();

    Ok(())
}

/// One line of the access log
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub status: u16,
    pub cache_status: &'a str,
    pub bytes_from_cache: u64,
    pub upstream: &'a str,
    pub elapsed: Duration,
}

impl AccessRecord<'_> {
    fn format(&self, timestamp: &str) -> String {
        format!(
            "timestamp={} method={} uri={} status={} cache={} cache_bytes={} upstream={} elapsed_ms={}",
            timestamp,
            self.method,
            self.uri,
            self.status,
            self.cache_status,
            self.bytes_from_cache,
            self.upstream,
            self.elapsed.as_millis(),
        )
    }
}

/// Log access information
pub fn log_access(record: &AccessRecord<'_>) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f %z").to_string();
    tracing::info!(target: ACCESS_TARGET, "{}", record.format(&timestamp));
}

/// Log error information
pub fn log_error(method: &str, uri: &str, error: &str) {
    tracing::error!(
        method = %method,
        uri = %uri,
        error = %error,
        "Request failed"
    );
}
