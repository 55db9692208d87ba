//! Runtime-adjustable logging.
//!
//! The subscriber is a registry with a reloadable [`LevelFilter`] and a
//! `fmt` layer writing into a [`SwitchableWriter`]. `set loglevel` swaps the
//! filter, `set logtarget` swaps the sink underneath the writer; neither
//! needs the subscriber to be rebuilt.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use syslog::{Facility, Formatter3164};
use tracing::{info, Level, Metadata};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, Registry};

use crate::error::{WardenError, WardenResult};

pub const DEFAULT_LOG_LEVEL: u8 = 3;
pub const DEFAULT_LOG_TARGET: &str = "STDERR";

/// Map the numeric level (0 = fatal .. 4 = debug) onto a filter.
pub fn level_filter(level: u8) -> WardenResult<LevelFilter> {
    match level {
        0 | 1 => Ok(LevelFilter::ERROR),
        2 => Ok(LevelFilter::WARN),
        3 => Ok(LevelFilter::INFO),
        4 => Ok(LevelFilter::DEBUG),
        n => Err(WardenError::Config(format!(
            "log level {} out of range (0..4)",
            n
        ))),
    }
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
    Syslog,
    File(PathBuf),
}

impl FromStr for LogTarget {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(WardenError::Config("empty log target".to_string())),
            "STDOUT" => Ok(LogTarget::Stdout),
            "STDERR" => Ok(LogTarget::Stderr),
            "SYSLOG" => Ok(LogTarget::Syslog),
            path => Ok(LogTarget::File(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTarget::Stdout => f.write_str("STDOUT"),
            LogTarget::Stderr => f.write_str("STDERR"),
            LogTarget::Syslog => f.write_str("SYSLOG"),
            LogTarget::File(p) => write!(f, "{}", p.display()),
        }
    }
}

enum Sink {
    Stdout,
    Stderr,
    Syslog(Box<SyslogLogger>),
    File(File),
}

type SyslogLogger = syslog::Logger<syslog::LoggerBackend, Formatter3164>;

/// Send one message to syslog at the severity matching `level`.
fn syslog_send(logger: &mut SyslogLogger, level: Level, msg: &str) {
    let _ = match level {
        Level::ERROR => logger.err(msg),
        Level::WARN => logger.warning(msg),
        Level::INFO => logger.info(msg),
        _ => logger.debug(msg),
    };
}

impl Sink {
    fn open(target: &LogTarget) -> WardenResult<Self> {
        match target {
            LogTarget::Stdout => Ok(Sink::Stdout),
            LogTarget::Stderr => Ok(Sink::Stderr),
            LogTarget::Syslog => {
                let formatter = Formatter3164 {
                    facility: Facility::LOG_DAEMON,
                    hostname: None,
                    process: "failwarden".into(),
                    pid: std::process::id(),
                };
                syslog::unix(formatter).map(|l| Sink::Syslog(Box::new(l))).map_err(|e| {
                    WardenError::Config(format!("unable to connect to syslog: {}", e))
                })
            }
            LogTarget::File(path) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(Sink::File)
                .map_err(|e| {
                    WardenError::FileSystem(format!(
                        "unable to open log file {}: {}",
                        path.display(),
                        e
                    ))
                }),
        }
    }

    // Errors are dropped: there is nowhere left to report them.
    fn emit(&mut self, level: Level, bytes: &[u8]) {
        match self {
            Sink::Stdout => {
                let _ = io::stdout().write_all(bytes);
            }
            Sink::Stderr => {
                let _ = io::stderr().write_all(bytes);
            }
            Sink::File(f) => {
                let _ = f.write_all(bytes);
            }
            Sink::Syslog(logger) => {
                let text = String::from_utf8_lossy(bytes);
                syslog_send(logger, level, text.trim_end());
            }
        }
    }

    fn flush(&mut self) {
        match self {
            Sink::Stdout => {
                let _ = io::stdout().flush();
            }
            Sink::Stderr => {
                let _ = io::stderr().flush();
            }
            Sink::File(f) => {
                let _ = f.flush();
                let _ = f.sync_data();
            }
            Sink::Syslog(_) => {}
        }
    }
}

/// `MakeWriter` whose destination can be replaced at runtime.
#[derive(Clone)]
pub struct SwitchableWriter {
    sink: Arc<Mutex<Sink>>,
}

/// Buffers one formatted event and hands it to the current sink on drop.
pub struct EventWriter {
    sink: Arc<Mutex<Sink>>,
    level: Level,
    buf: Vec<u8>,
}

impl Write for EventWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.sink.lock().emit(self.level, &self.buf);
        }
    }
}

impl<'a> MakeWriter<'a> for SwitchableWriter {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter {
            sink: self.sink.clone(),
            level: Level::INFO,
            buf: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        EventWriter {
            sink: self.sink.clone(),
            level: *meta.level(),
            buf: Vec::new(),
        }
    }
}

/// Handle to the process logger owned by the server.
pub struct LogControl {
    level: AtomicU8,
    target: Mutex<LogTarget>,
    sink: Arc<Mutex<Sink>>,
    handle: Option<reload::Handle<LevelFilter, Registry>>,
}

impl fmt::Debug for LogControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogControl")
            .field("level", &self.level())
            .field("target", &self.target())
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl LogControl {
    /// A controller that is not connected to any global subscriber.
    pub fn detached() -> Self {
        Self {
            level: AtomicU8::new(DEFAULT_LOG_LEVEL),
            target: Mutex::new(LogTarget::Stderr),
            sink: Arc::new(Mutex::new(Sink::Stderr)),
            handle: None,
        }
    }

    /// Build the subscriber and install it as the global default.
    pub fn install(level: u8, target: &str) -> Result<Self> {
        let filter = level_filter(level)?;
        let target: LogTarget = target.parse()?;
        let sink = Arc::new(Mutex::new(Sink::open(&target)?));

        let (filter_layer, handle) = reload::Layer::new(filter);
        let writer = SwitchableWriter { sink: sink.clone() };
        let subscriber = tracing_subscriber::registry().with(filter_layer).with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        );
        tracing::subscriber::set_global_default(subscriber)
            .context("Failed to install the log subscriber")?;

        Ok(Self {
            level: AtomicU8::new(level),
            target: Mutex::new(target),
            sink,
            handle: Some(handle),
        })
    }

    pub fn writer(&self) -> SwitchableWriter {
        SwitchableWriter {
            sink: self.sink.clone(),
        }
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: u8) -> WardenResult<()> {
        let filter = level_filter(level)?;
        if let Some(handle) = &self.handle {
            handle
                .reload(filter)
                .map_err(|e| WardenError::Config(format!("unable to change log level: {}", e)))?;
        }
        self.level.store(level, Ordering::Relaxed);
        info!("Changed logging level to {}", level);
        Ok(())
    }

    pub fn target(&self) -> String {
        self.target.lock().to_string()
    }

    /// Switch the destination. On failure the previous target stays.
    pub fn set_target(&self, target: &str) -> WardenResult<()> {
        let target: LogTarget = target.parse()?;
        let mut current = self.target.lock();
        if *current == target {
            return Ok(());
        }
        let sink = Sink::open(&target)?;
        let mut old = std::mem::replace(&mut *self.sink.lock(), sink);
        old.flush();
        info!("Changed logging target to {} (was {})", target, *current);
        *current = target;
        Ok(())
    }

    pub fn flush(&self) {
        self.sink.lock().flush();
    }
}
