//! `BFH_*` environment overrides.
//!
//! Every lookup returns a [`Sourced`] value. Malformed values fall back to
//! the default and are queued, so one load reports every bad variable.

use super::source::Sourced;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "BFH_";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Malformed {
        var: String,
        value: String,
        expected: &'static str,
    },

    #[error("{var}={value} is outside {min}..={max}")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Reads `BFH_<NAME>` variables and collects every parse failure.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name and its value, if set.
    fn lookup(name: &str) -> Option<(String, String)> {
        let var = format!("{PREFIX}{name}");
        let value = std::env::var(&var).ok()?;
        Some((var, value))
    }

    fn malformed(&mut self, var: &str, value: String, expected: &'static str) {
        self.errors.push(EnvError::Malformed {
            var: var.to_string(),
            value,
            expected,
        });
    }

    /// `1/true/yes/on` or `0/false/no/off`; empty counts as false.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let Some((var, value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Sourced::from_env(true, var),
            "0" | "false" | "no" | "off" | "" => Sourced::from_env(false, var),
            _ => {
                self.malformed(&var, value, "boolean");
                Sourced::default_value(default)
            }
        }
    }

    /// Any `FromStr` number bounded by `min..=max`.
    pub fn get_in_range<T>(&mut self, name: &str, default: T, min: T, max: T) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let Some((var, value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<T>() {
            Ok(n) if n >= min && n <= max => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.malformed(&var, value, "number");
                Sourced::default_value(default)
            }
        }
    }

    /// Bare seconds (`90`) or a humantime string (`1m 30s`).
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let Some((var, value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match parse_duration(&value) {
            Some(d) => Sourced::from_env(d, var),
            None => {
                self.malformed(&var, value, "duration");
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let Some((var, value)) = Self::lookup(name) else {
            return Sourced::default_value(default.to_string());
        };
        let level = value.to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            Sourced::from_env(level, var)
        } else {
            self.malformed(&var, value, "log level");
            Sourced::default_value(default.to_string())
        }
    }

    /// `None` when unset or set to the empty string.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match Self::lookup(name) {
            Some((var, value)) if value.is_empty() => Sourced::from_env(None, var),
            Some((var, value)) => Sourced::from_env(Some(value), var),
            None => Sourced::default_value(None),
        }
    }

    /// Like [`get_optional_string`](Self::get_optional_string) with `~/`
    /// expanded.
    pub fn get_optional_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        let raw = self.get_optional_string(name);
        Sourced {
            value: raw.value.as_deref().map(expand_tilde),
            source: raw.source,
            var_name: raw.var_name,
        }
    }
}

pub fn parse_duration(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    trimmed
        .parse::<u64>()
        .map(Duration::from_secs)
        .ok()
        .or_else(|| humantime::parse_duration(trimmed).ok())
}

pub fn expand_tilde(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}
