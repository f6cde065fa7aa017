//! Logging setup for the `parx` binary and its worker processes.
//!
//! Logs always go to stderr so that job output on stdout stays clean.
//!
//! # Environment Variables
//!
//! - `PARX_LOG` - Log filter (overrides RUST_LOG)
//! - `PARX_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PARX_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PARX_LOG_FILE` - Path to a log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use parx::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line format
    Pretty,
    /// Single-line format (default)
    #[default]
    Compact,
    /// JSON lines for log aggregation systems
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Pretty, Self::Compact, Self::Json]
            .into_iter()
            .find(|format| s.eq_ignore_ascii_case(format.as_str()))
            .ok_or_else(|| format!("unknown log format '{}' (pretty, compact, json)", s))
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    pub format: LogFormat,
    /// Log file, appended to as well as stderr
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show thread names, which carry the pool slot (default: true)
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            file_path: None,
            filter: None,
            show_thread_names: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level for a `-v` count, or ERROR when quiet.
    pub fn for_verbosity(verbose: u8, quiet: bool) -> Self {
        let level = match (quiet, verbose) {
            (true, _) => Level::ERROR,
            (false, 0) => Level::WARN,
            (false, 1) => Level::INFO,
            (false, 2) => Level::DEBUG,
            (false, _) => Level::TRACE,
        };
        Self::default().with_level(level)
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

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// `PARX_LOG` (or `RUST_LOG`) sets the filter, `PARX_LOG_LEVEL` the
    /// level when no filter is set. Format and file come from their own
    /// variables.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PARX_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("PARX_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PARX_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("PARX_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    /// The filter directive in effect. Handed to worker processes as
    /// `PARX_LOG` so they log like their parent.
    pub fn directive(&self) -> String {
        match self.filter {
            Some(ref filter) => filter.clone(),
            None => self.level.to_string().to_lowercase(),
        }
    }

    fn build_filter(&self) -> EnvFilter {
        EnvFilter::try_new(self.directive()).unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log filter '{}', using default",
                self.directive()
            );
            EnvFilter::new(self.level.to_string().to_lowercase())
        })
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_thread_names(self.show_thread_names)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Json => base.json().boxed(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    if s.eq_ignore_ascii_case("warning") {
        return Some(Level::WARN);
    }
    s.parse().ok()
}

fn file_appender(path: &Path) -> RollingFileAppender {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("parx.log");
    rolling::never(parent, file_name)
}

/// Initialize the global tracing subscriber: stderr, plus the log file
/// when one is configured.
///
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, true)];
    if let Some(ref path) = config.file_path {
        layers.push(config.layer(file_appender(path), false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
