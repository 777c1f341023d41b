//! Typed error returned by every fallible BFH operation.

use super::catalog::ErrorCode;
use crate::types::Architecture;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = BfhError> = std::result::Result<T, E>;

/// A single architecture whose build exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchFailure {
    pub architecture: Architecture,
    pub exit_code: i32,
}

impl fmt::Display for ArchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (exit {})", self.architecture, self.exit_code)
    }
}

#[derive(Debug, Error)]
pub enum BfhError {
    /// Local configuration or cached metadata is missing or invalid.
    #[error("{message}")]
    Configuration { code: ErrorCode, message: String },

    /// Bearer token or certificate signing failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Fewer free ports than requested in the scanned range.
    #[error("only {found} of {requested} free ports available in {start}..={end}")]
    ResourceExhausted {
        requested: usize,
        found: usize,
        start: u16,
        end: u16,
    },

    #[error("timed out after {} waiting for {what}", human(.after))]
    Timeout { what: String, after: Duration },

    /// The tunnel transport process could not be started.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{host}:{port} did not accept connections within {}", human(.after))]
    EndpointUnready {
        host: String,
        port: u16,
        after: Duration,
    },

    #[error("no running build engine instance for {architecture}")]
    CapacityUnavailable { architecture: Architecture },

    #[error("manifest publication failed: {0}")]
    PublishFailed(String),

    /// The control plane returned something that is not the expected shape.
    #[error("invalid {what} from control plane: '{value}'")]
    InvalidResponse { what: String, value: String },

    #[error("{what} not found: {}", .path.display())]
    NotFound { what: String, path: PathBuf },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// At least one architecture build returned a non-zero status.
    #[error("build failed for {}", format_failures(.failures))]
    BuildFailed { failures: Vec<ArchFailure> },

    /// An external command exited unsuccessfully.
    #[error("`{command}` failed{}: {stderr}", format_exit(.exit_code))]
    Subprocess {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("interrupted")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BfhError {
    /// Generic configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            code: ErrorCode::ConfigValidationError,
            message: message.into(),
        }
    }

    /// Configuration error carrying a specific catalog code.
    pub fn configuration_with(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Configuration {
            code,
            message: message.into(),
        }
    }

    /// Catalog code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { code, .. } => *code,
            Self::Authentication(_) => ErrorCode::CertificateSigningFailed,
            Self::ResourceExhausted { .. } => ErrorCode::PortsExhausted,
            Self::Timeout { .. } => ErrorCode::CapacityScaleTimeout,
            Self::Transport(_) => ErrorCode::TunnelSpawnFailed,
            Self::EndpointUnready { .. } => ErrorCode::TunnelEndpointUnready,
            Self::CapacityUnavailable { .. } => ErrorCode::CapacityUnavailable,
            Self::PublishFailed(_) => ErrorCode::ManifestPublishFailed,
            Self::InvalidResponse { .. } => ErrorCode::ControlPlaneInvalidResponse,
            Self::NotFound { .. } => ErrorCode::BuildInputNotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::BuildFailed { .. } => ErrorCode::BuildFailed,
            Self::Subprocess { .. } => ErrorCode::InternalSubprocessError,
            Self::Cancelled => ErrorCode::BuildCancelled,
            Self::Io(_) => ErrorCode::InternalIoError,
        }
    }
}

fn human(d: &Duration) -> String {
    humantime::format_duration(*d).to_string()
}

fn format_failures(failures: &[ArchFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" with exit code {c}"),
        None => " (terminated by signal)".to_string(),
    }
}
