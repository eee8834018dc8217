//! Tracing subscriber setup
//!
//! Human-readable logs go to stderr, filtered by `RUST_LOG` (default `info`,
//! `debug` with the debug flag). Every run also gets a JSON debug log file
//! unless disabled, and `DHCTL_TRACE` adds a span-event trace file.

use crate::error::{DestroyError, Result};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const TRACE_ENV: &str = "DHCTL_TRACE";

const DEFAULT_TRACE_FILE: &str = "trace.out";
const DEFAULT_CPU_FILE: &str = "pprof.cpu";

/// Parsed `DHCTL_TRACE`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TraceConfig {
    #[default]
    Disabled,
    Enabled {
        trace_path: PathBuf,
        /// Reported only, no CPU profile is written
        cpu_path: PathBuf,
    },
}

impl TraceConfig {
    /// Empty, `0` and `no` disable tracing; `1` and `yes` use the default
    /// file names in the working directory; anything else is the trace path.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "0" | "no" => TraceConfig::Disabled,
            "1" | "yes" => TraceConfig::Enabled {
                trace_path: PathBuf::from(DEFAULT_TRACE_FILE),
                cpu_path: PathBuf::from(DEFAULT_CPU_FILE),
            },
            path => TraceConfig::Enabled {
                trace_path: PathBuf::from(path),
                cpu_path: PathBuf::from(format!("{path}.prof.cpu")),
            },
        }
    }

    pub fn from_env() -> Self {
        Self::parse(&std::env::var(TRACE_ENV).unwrap_or_default())
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, TraceConfig::Enabled { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub debug: bool,
    /// JSON debug log destination, `None` to skip the file
    pub debug_log_file: Option<PathBuf>,
    pub trace: TraceConfig,
}

/// `<tmp>/dhctl-destroy-<timestamp>.log`
pub fn default_debug_log_path(tmp_dir: &Path, now: DateTime<Utc>) -> PathBuf {
    tmp_dir.join(format!("dhctl-destroy-{}.log", now.format("%Y%m%d-%H%M%S")))
}

fn create_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(File::create(path)?)
}

/// JSON layer for `DHCTL_TRACE`: every event plus span enter and exit
pub fn trace_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
        .with_writer(writer)
        .with_filter(LevelFilter::TRACE)
}

/// Install the global subscriber
///
/// # Errors
/// * `Io` - debug log or trace file cannot be created
/// * `Internal` - a global subscriber is already installed
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let file_layer = match &config.debug_log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(create_log_file(path)?))
                .with_filter(LevelFilter::DEBUG),
        ),
        None => None,
    };

    let trace_layer = match &config.trace {
        TraceConfig::Enabled { trace_path, .. } => {
            Some(trace_layer(Mutex::new(create_log_file(trace_path)?)))
        }
        TraceConfig::Disabled => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(trace_layer)
        .try_init()
        .map_err(|e| DestroyError::Internal(format!("cannot install log subscriber: {e}")))?;

    if let Some(path) = &config.debug_log_file {
        info!(path = %path.display(), "Writing debug log");
    }
    if let TraceConfig::Enabled { trace_path, cpu_path } = &config.trace {
        info!(
            trace = %trace_path.display(),
            cpu = %cpu_path.display(),
            "Tracing enabled, CPU profile is not collected"
        );
    }
    Ok(())
}

#[cfg(test)]
#[path = "logging_test.rs"]
mod tests;
