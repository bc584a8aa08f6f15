//! Logging setup for the `procpool` binary and for hosts embedding the pool.
//!
//! The library only emits `tracing` events; nothing is printed unless a
//! subscriber is installed, e.g. with [`init`].
//!
//! # Environment Variables
//!
//! - `PROCPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `PROCPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PROCPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PROCPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use procpool::logging::{LogConfig, LogFormat, init};
//!
//! init(LogConfig::default().with_format(LogFormat::Compact).with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// Single line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration, consumed by [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Also write to this file (rotated per `rotation`).
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Emit an event when a span closes, with its timing.
    pub span_events: bool,
    /// Filter directive; takes precedence over `level`.
    pub filter: Option<String>,
    pub show_target: bool,
    /// Thread names help tell the collector and reader threads apart.
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_names: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level from the usual `-v`/`-q` flags: warn by default, info with
    /// `-v`, debug with `-vv`, trace beyond; errors only when quiet.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Self {
        let level = match (quiet, verbose) {
            (true, _) => Level::ERROR,
            (false, 0) => Level::WARN,
            (false, 1) => Level::INFO,
            (false, 2) => Level::DEBUG,
            (false, _) => Level::TRACE,
        };
        let mut config = Self::default().with_level(level);
        // An explicit flag beats the environment.
        if verbose > 0 || quiet {
            config.filter = Some(format!("procpool={}", level).to_lowercase());
        }
        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_thread_names(mut self, enabled: bool) -> Self {
        self.show_thread_names = enabled;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set (e.g. from `-v`) is kept; `PROCPOOL_LOG_LEVEL`
    /// applies only when no filter is set at all.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("PROCPOOL_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("PROCPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PROCPOOL_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if let Ok(path) = std::env::var("PROCPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// A formatting layer for `writer` in the configured format.
    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_thread_names(self.show_thread_names)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Pretty => base.boxed(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("procpool.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

/// Install the global subscriber: stderr, plus the log file if configured.
///
/// Calling it again after a subscriber is installed does nothing.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, true)];
    if let Some(path) = &config.file_path {
        layers.push(config.layer(file_appender(path, config.rotation), false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
