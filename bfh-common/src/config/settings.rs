//! `bfh.toml` settings and the `buildkit.json` infrastructure descriptor.

use super::env::{EnvError, EnvParser};
use crate::errors::{BfhError, ErrorCode};
use crate::ports::ReadinessPolicy;
use crate::process::TerminationPolicy;
use crate::types::PortRange;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// File name of the infrastructure descriptor inside the buildkit directory.
pub const BUILDKIT_CONFIG_FILE: &str = "buildkit.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid environment configuration: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ConfigError> for BfhError {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::NotFound(_) => ErrorCode::ConfigNotFound,
            ConfigError::Read { .. } => ErrorCode::ConfigReadError,
            ConfigError::Parse { .. } => ErrorCode::ConfigParseError,
            ConfigError::Env(_) => ErrorCode::ConfigEnvError,
            ConfigError::Invalid(_) => ErrorCode::ConfigValidationError,
        };
        BfhError::configuration_with(code, err.to_string())
    }
}

// ── bfh.toml ────────────────────────────────────────────────────────────

/// BFH configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BfhConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub ports: PortRange,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub termination: TerminationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding `buildkit.json`.
    #[serde(default = "default_buildkit_dir")]
    pub buildkit_dir: PathBuf,
    /// Directory holding `connection_info`, `known_hosts` and key material.
    #[serde(default = "default_ssh_dir")]
    pub ssh_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            buildkit_dir: default_buildkit_dir(),
            ssh_dir: default_ssh_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Login user on the bastion.
    #[serde(default = "default_bastion_user")]
    pub bastion_user: String,
    /// Seconds between keepalive probes.
    #[serde(default = "default_server_alive_interval")]
    pub server_alive_interval: u32,
    /// Unanswered keepalives before the transport reconnects.
    #[serde(default = "default_server_alive_count_max")]
    pub server_alive_count_max: u32,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bastion_user: default_bastion_user(),
            server_alive_interval: default_server_alive_interval(),
            server_alive_count_max: default_server_alive_count_max(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_readiness_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_readiness_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_readiness_interval_ms(),
            timeout_ms: default_readiness_timeout_ms(),
            connect_timeout_ms: default_readiness_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Workload name is `<workload_prefix><arch>`.
    #[serde(default = "default_workload_prefix")]
    pub workload_prefix: String,
    /// Annotation holding the last build time in Unix seconds.
    #[serde(default = "default_annotation_key")]
    pub annotation_key: String,
    #[serde(default = "default_buildkit_port")]
    pub buildkit_port: u16,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_scale_timeout_secs")]
    pub scale_timeout_secs: u64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            workload_prefix: default_workload_prefix(),
            annotation_key: default_annotation_key(),
            buildkit_port: default_buildkit_port(),
            poll_interval_secs: default_poll_interval_secs(),
            scale_timeout_secs: default_scale_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationConfig {
    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,
    #[serde(default = "default_termination_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_safety_margin_ms")]
    pub safety_margin_ms: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_ms: default_graceful_timeout_ms(),
            poll_interval_ms: default_termination_poll_ms(),
            safety_margin_ms: default_safety_margin_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_buildkit_dir() -> PathBuf {
    PathBuf::from(".buildkit")
}

fn default_ssh_dir() -> PathBuf {
    PathBuf::from(".ssh")
}

fn default_bastion_user() -> String {
    "panfactum".to_string()
}

fn default_server_alive_interval() -> u32 {
    2
}

fn default_server_alive_count_max() -> u32 {
    3
}

fn default_connect_timeout() -> u32 {
    1
}

fn default_readiness_interval_ms() -> u64 {
    1000
}

fn default_readiness_timeout_ms() -> u64 {
    30_000
}

fn default_readiness_connect_timeout_ms() -> u64 {
    3000
}

fn default_namespace() -> String {
    "buildkit".to_string()
}

fn default_workload_prefix() -> String {
    "buildkit-".to_string()
}

fn default_annotation_key() -> String {
    "bfh.dev/last-build".to_string()
}

fn default_buildkit_port() -> u16 {
    1234
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_scale_timeout_secs() -> u64 {
    600
}

fn default_graceful_timeout_ms() -> u64 {
    5000
}

fn default_termination_poll_ms() -> u64 {
    100
}

fn default_safety_margin_ms() -> u64 {
    1000
}

impl BfhConfig {
    /// Default location: `<config_dir>/bfh/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bfh").join("config.toml"))
    }

    /// Load settings from `path` (or the default location), then apply
    /// `BFH_*` environment overrides.
    ///
    /// An explicitly given path must exist; a missing default file just
    /// means built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if !p.exists() => return Err(ConfigError::NotFound(p.to_path_buf())),
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Overlay `BFH_*` environment variables on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut parser = EnvParser::new();

        if let Some(level) = parser.get_log_level("LOG_LEVEL", &self.general.log_level).overridden() {
            self.general.log_level = level;
        }
        if let Some(dir) = parser.get_optional_path("BUILDKIT_DIR").value {
            self.general.buildkit_dir = dir;
        }
        if let Some(dir) = parser.get_optional_path("SSH_DIR").value {
            self.general.ssh_dir = dir;
        }

        let start = parser.get_in_range("PORT_RANGE_START", self.ports.start(), 1, u16::MAX);
        let end = parser.get_in_range("PORT_RANGE_END", self.ports.end(), 1, u16::MAX);
        if !start.is_default() || !end.is_default() {
            self.ports = PortRange::new(start.value, end.value)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        if let Some(user) = parser.get_optional_string("BASTION_USER").value {
            self.tunnel.bastion_user = user;
        }
        if let Some(ns) = parser.get_optional_string("NAMESPACE").value {
            self.capacity.namespace = ns;
        }

        if let Some(d) = parser
            .get_duration("READINESS_TIMEOUT", Duration::from_millis(self.readiness.timeout_ms))
            .overridden()
        {
            self.readiness.timeout_ms = d.as_millis() as u64;
        }
        if let Some(d) = parser
            .get_duration(
                "SCALE_POLL_INTERVAL",
                Duration::from_secs(self.capacity.poll_interval_secs),
            )
            .overridden()
        {
            self.capacity.poll_interval_secs = d.as_secs();
        }
        if let Some(d) = parser
            .get_duration(
                "SCALE_TIMEOUT",
                Duration::from_secs(self.capacity.scale_timeout_secs),
            )
            .overridden()
        {
            self.capacity.scale_timeout_secs = d.as_secs();
        }
        if let Some(d) = parser
            .get_duration(
                "GRACEFUL_TIMEOUT",
                Duration::from_millis(self.termination.graceful_timeout_ms),
            )
            .overridden()
        {
            self.termination.graceful_timeout_ms = d.as_millis() as u64;
        }

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readiness.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "readiness.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.capacity.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "capacity.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.termination.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "termination.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.capacity.workload_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "capacity.workload_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_millis(self.readiness.interval_ms),
            timeout: Duration::from_millis(self.readiness.timeout_ms),
            connect_timeout: Duration::from_millis(self.readiness.connect_timeout_ms),
        }
    }

    pub fn termination_policy(&self) -> TerminationPolicy {
        TerminationPolicy {
            graceful_timeout: Duration::from_millis(self.termination.graceful_timeout_ms),
            kill_children: true,
            poll_interval: Duration::from_millis(self.termination.poll_interval_ms),
            safety_margin: Duration::from_millis(self.termination.safety_margin_ms),
        }
    }
}

// ── buildkit.json ───────────────────────────────────────────────────────

/// Infrastructure outputs describing the remote build fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildKitConfig {
    /// Image registry host, e.g. `123.dkr.ecr.us-east-2.amazonaws.com`.
    pub registry: String,
    pub cache_bucket: String,
    pub cache_bucket_region: String,
    /// Kubernetes context name.
    pub cluster: String,
    /// Bastion name as listed in `connection_info`.
    pub bastion: String,
    /// Certificate authority address; falls back to `VAULT_ADDR`.
    #[serde(default)]
    pub authority_address: Option<String>,
    /// Connect straight to build pods instead of going through the bastion.
    #[serde(default)]
    pub in_cluster: bool,
}

impl BuildKitConfig {
    pub fn load(buildkit_dir: &Path) -> Result<Self, ConfigError> {
        let path = buildkit_dir.join(BUILDKIT_CONFIG_FILE);
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), registry = %config.registry, "Loaded buildkit config");
        Ok(config)
    }

    /// Resolve the certificate authority address.
    pub fn authority_address(&self) -> Result<String, BfhError> {
        if let Some(addr) = self.authority_address.as_ref().filter(|a| !a.is_empty()) {
            return Ok(addr.clone());
        }
        match std::env::var("VAULT_ADDR") {
            Ok(addr) if !addr.is_empty() => Ok(addr),
            _ => Err(BfhError::configuration_with(
                ErrorCode::AuthorityAddressMissing,
                "no certificate authority address: set authority_address in buildkit.json or VAULT_ADDR",
            )),
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use tempfile::TempDir;

    fn set_env(key: &str, value: &str) {
        // SAFETY: Tests run single-threaded, no concurrent access to env vars
        unsafe { std::env::set_var(key, value) };
    }

    fn remove_env(key: &str) {
        // SAFETY: Tests run single-threaded, no concurrent access to env vars
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    fn test_defaults() {
        let config = BfhConfig::default();
        assert_eq!(config.ports, PortRange::default());
        assert_eq!(config.capacity.workload_prefix, "buildkit-");
        assert_eq!(config.capacity.buildkit_port, 1234);
        assert_eq!(config.tunnel.server_alive_interval, 2);

        let term = config.termination_policy();
        assert_eq!(term.graceful_timeout, Duration::from_secs(5));
        assert_eq!(term.poll_interval, Duration::from_millis(100));
        assert_eq!(term.safety_margin, Duration::from_secs(1));

        let ready = config.readiness_policy();
        assert_eq!(ready.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: BfhConfig = toml::from_str(
            r#"
            [ports]
            start = 40000
            end = 40100

            [capacity]
            namespace = "builders"
            "#,
        )
        .unwrap();
        assert_eq!(config.ports.start(), 40000);
        assert_eq!(config.capacity.namespace, "builders");
        assert_eq!(config.capacity.scale_timeout_secs, 600);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_load_explicit_missing_path_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = BfhConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
        let bfh: BfhError = err.into();
        assert_eq!(bfh.code(), ErrorCode::ConfigNotFound);
    }

    #[test]
    fn test_load_applies_env_overrides() {
        let _guard = env_test_lock();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[capacity]\nscale_timeout_secs = 60\n").unwrap();

        set_env("BFH_SCALE_TIMEOUT", "2m");
        set_env("BFH_NAMESPACE", "ci-builders");
        let config = BfhConfig::load(Some(&path));
        remove_env("BFH_SCALE_TIMEOUT");
        remove_env("BFH_NAMESPACE");

        let config = config.unwrap();
        assert_eq!(config.capacity.scale_timeout_secs, 120);
        assert_eq!(config.capacity.namespace, "ci-builders");
    }

    #[test]
    fn test_env_errors_are_collected() {
        let _guard = env_test_lock();
        set_env("BFH_LOG_LEVEL", "chatty");
        set_env("BFH_GRACEFUL_TIMEOUT", "whenever");
        let mut config = BfhConfig::default();
        let result = config.apply_env();
        remove_env("BFH_LOG_LEVEL");
        remove_env("BFH_GRACEFUL_TIMEOUT");

        match result {
            Err(ConfigError::Env(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected env errors, got {:?}", other),
        }
    }

    #[test]
    fn test_inverted_env_port_range_rejected() {
        let _guard = env_test_lock();
        set_env("BFH_PORT_RANGE_START", "40000");
        set_env("BFH_PORT_RANGE_END", "39000");
        let mut config = BfhConfig::default();
        let result = config.apply_env();
        remove_env("BFH_PORT_RANGE_START");
        remove_env("BFH_PORT_RANGE_END");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = BfhConfig::default();
        config.readiness.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buildkit_config_load() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(BUILDKIT_CONFIG_FILE),
            r#"{
                "registry": "registry.example.com",
                "cache_bucket": "build-cache",
                "cache_bucket_region": "us-east-2",
                "cluster": "production",
                "bastion": "prod-bastion"
            }"#,
        )
        .unwrap();

        let config = BuildKitConfig::load(dir.path()).unwrap();
        assert_eq!(config.bastion, "prod-bastion");
        assert!(!config.in_cluster);
        assert!(config.authority_address.is_none());
    }

    #[test]
    fn test_buildkit_config_missing_and_malformed() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            BuildKitConfig::load(dir.path()),
            Err(ConfigError::NotFound(_))
        ));

        std::fs::write(dir.path().join(BUILDKIT_CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(
            BuildKitConfig::load(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_authority_address_prefers_file_value() {
        let config = BuildKitConfig {
            registry: "r".to_string(),
            cache_bucket: "b".to_string(),
            cache_bucket_region: "us-east-2".to_string(),
            cluster: "c".to_string(),
            bastion: "bastion".to_string(),
            authority_address: Some("https://vault.example.com".to_string()),
            in_cluster: false,
        };
        assert_eq!(
            config.authority_address().unwrap(),
            "https://vault.example.com"
        );
    }
}
