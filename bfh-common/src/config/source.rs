//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// `bfh.toml` (or another file given with `--config`).
    File(PathBuf),
    /// A `BFH_*` environment variable.
    Environment,
    /// Command-line flag.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Environment => write!(f, "environment"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// A value paired with the place it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Environment variable name when `source` is `Environment`.
    pub var_name: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            var_name: None,
        }
    }

    pub fn from_env(value: T, var_name: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            var_name: Some(var_name.into()),
        }
    }

    pub fn is_default(&self) -> bool {
        self.source == ConfigSource::Default
    }

    /// Value if it was set explicitly, `None` when it is only the default.
    pub fn overridden(self) -> Option<T> {
        if self.is_default() {
            None
        } else {
            Some(self.value)
        }
    }
}
