//! Logging setup shared by the BFH binaries.
//!
//! Logs go to stderr (human or JSON) and optionally to a JSON file. Both
//! writers are non-blocking; keep the returned [`LoggingGuards`] alive until
//! the process exits or buffered lines are lost.

use crate::config::EnvParser;
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("failed to prepare log file {}: {source}", .path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
    /// Additional JSON log file.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Build from `BFH_LOG_LEVEL`, `BFH_LOG_JSON` and `BFH_LOG_FILE`.
    ///
    /// Invalid values fall back to the defaults; they are reported again
    /// when the full configuration is loaded.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level).value;
        let json = parser.get_bool("LOG_JSON", false).value;
        let file = parser.get_optional_path("LOG_FILE").value;
        Self {
            level,
            format: if json { LogFormat::Json } else { LogFormat::Pretty },
            stderr: false,
            file,
        }
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Filter directive used when `RUST_LOG` is not set. Dependencies stay
    /// at `warn` so the BFH crates are readable at `debug`.
    pub fn filter_directive(&self) -> String {
        format!(
            "warn,bfh={level},bfh_common={level}",
            level = self.level
        )
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            stderr: true,
            file: None,
        }
    }
}

/// Flush guards for the non-blocking writers.
#[must_use = "dropping the guards stops log output"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn make_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(false)
            .compact()
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    }
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter_directive())?,
    };

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = Vec::new();

    if config.stderr {
        use std::io::IsTerminal;
        let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
        guards.push(guard);
        layers.push(make_layer(config.format, writer, ansi));
    }

    if let Some(path) = &config.file {
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(|source| LoggingError::File {
            path: path.clone(),
            source,
        })?;
        let file_name = path.file_name().ok_or_else(|| LoggingError::File {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
        })?;
        let appender = tracing_appender::rolling::never(&dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        layers.push(make_layer(LogFormat::Json, writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    Ok(LoggingGuards { _guards: guards })
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    #[test]
    fn test_builders() {
        let config = LogConfig::default()
            .with_level("debug")
            .with_json()
            .with_file("/tmp/bfh.log");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/bfh.log")));
        assert_eq!(
            config.filter_directive(),
            "warn,bfh=debug,bfh_common=debug"
        );
    }

    #[test]
    fn test_from_env() {
        let _guard = env_test_lock();
        // SAFETY: Tests run single-threaded, no concurrent access to env vars
        unsafe {
            std::env::set_var("BFH_LOG_LEVEL", "TRACE");
            std::env::set_var("BFH_LOG_JSON", "1");
        }
        let config = LogConfig::from_env("info").with_stderr();
        // SAFETY: Tests run single-threaded, no concurrent access to env vars
        unsafe {
            std::env::remove_var("BFH_LOG_LEVEL");
            std::env::remove_var("BFH_LOG_JSON");
        }
        assert_eq!(config.level, "trace");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.stderr);
    }

    #[test]
    fn test_second_init_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = LogConfig::default().with_file(dir.path().join("logs/bfh.jsonl"));
        let _first = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
