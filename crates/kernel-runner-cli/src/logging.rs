//! Subscriber setup for the binary.

use std::io::{self, Write};

use clap::ValueEnum;
use kernel_runner_common::LogLevel;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

/// The `tracing` level equivalent to `level`; `None` for `off`.
pub fn tracing_level(level: LogLevel) -> Option<Level> {
    match level {
        LogLevel::Trace => Some(Level::TRACE),
        LogLevel::Debug => Some(Level::DEBUG),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Warning => Some(Level::WARN),
        LogLevel::Error | LogLevel::Critical => Some(Level::ERROR),
        LogLevel::Off => None,
    }
}

/// Stderr writer that flushes after events at or above a severity.
#[derive(Debug, Clone, Copy)]
pub struct FlushingStderr {
    threshold: Option<Level>,
}

impl FlushingStderr {
    pub fn new(threshold: LogLevel) -> Self {
        Self { threshold: tracing_level(threshold) }
    }

    pub fn flushes(&self, level: &Level) -> bool {
        // More severe levels compare lower.
        self.threshold.is_some_and(|t| *level <= t)
    }
}

pub struct EventWriter {
    inner: io::Stderr,
    flush: bool,
}

impl Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if self.flush {
            let _ = self.inner.flush();
        }
    }
}

impl<'a> MakeWriter<'a> for FlushingStderr {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter { inner: io::stderr(), flush: false }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        EventWriter { inner: io::stderr(), flush: self.flushes(meta.level()) }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
pub fn init(level: LogLevel, flush_threshold: LogLevel, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.filter_directive()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingStderr::new(flush_threshold))
        .with_target(false);

    let installed = match format {
        LogFormat::Json => {
            subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).try_init()
        }
        LogFormat::Compact => subscriber.compact().try_init(),
        LogFormat::Pretty => subscriber.pretty().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install the log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_threshold_is_inclusive() {
        let writer = FlushingStderr::new(LogLevel::Info);
        assert!(writer.flushes(&Level::ERROR));
        assert!(writer.flushes(&Level::INFO));
        assert!(!writer.flushes(&Level::DEBUG));
    }

    #[test]
    fn off_never_flushes() {
        let writer = FlushingStderr::new(LogLevel::Off);
        assert!(!writer.flushes(&Level::ERROR));
    }

    #[test]
    fn critical_maps_to_error() {
        assert_eq!(tracing_level(LogLevel::Critical), Some(Level::ERROR));
        assert_eq!(tracing_level(LogLevel::Warning), Some(Level::WARN));
    }
}
