//! Error Catalog for Build Fleet Helper
//!
//! Every failure the CLI can surface maps to a unique, stable code with a
//! message template and remediation steps, so operators can tell "no bastion
//! configured" apart from "the arm64 Dockerfile step failed" at a glance.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                               |
//! |------------|-------------|-------------------------------------------|
//! | E001-E099  | Config      | Configuration, inputs and local caches    |
//! | E100-E199  | Tunnel      | Ports, credentials and tunnel transport   |
//! | E200-E299  | Capacity    | Control plane and build capacity          |
//! | E300-E399  | Build       | Build engine execution                    |
//! | E400-E499  | Publish     | Multi-architecture manifest publication   |
//! | E500-E599  | Internal    | Internal/unexpected errors                |
//!
//! # Example
//!
//! ```rust
//! use bfh_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::BastionNotConfigured.entry();
//! println!("Error {}: {}", entry.code, entry.message);
//! for step in entry.remediation {
//!     println!("  - {}", step);
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all BFH error scenarios.
///
/// Each variant maps to a unique error code in the BFH-Exxx format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file could not be parsed
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Bastion connection metadata is missing
    BastionNotConfigured,
    /// Certificate authority address is not configured
    AuthorityAddressMissing,
    /// Build input (Dockerfile or context) not found
    BuildInputNotFound,
    /// Argument failed validation
    InvalidArgument,

    // =========================================================================
    // Tunnel Errors (E100-E199)
    // =========================================================================
    /// No free local ports in the requested range
    PortsExhausted,
    /// Certificate authority refused to sign the public key
    CertificateSigningFailed,
    /// Tunnel transport process could not be spawned
    TunnelSpawnFailed,
    /// Tunnel local port never accepted connections
    TunnelEndpointUnready,

    // =========================================================================
    // Capacity Errors (E200-E299)
    // =========================================================================
    /// No running build engine instance could be resolved
    CapacityUnavailable,
    /// Build capacity did not become available in time
    CapacityScaleTimeout,
    /// Control plane returned a malformed value
    ControlPlaneInvalidResponse,

    // =========================================================================
    // Build Errors (E300-E399)
    // =========================================================================
    /// One or more architecture builds failed
    BuildFailed,
    /// Build was interrupted by the operator
    BuildCancelled,

    // =========================================================================
    // Publish Errors (E400-E499)
    // =========================================================================
    /// Manifest aggregation failed
    ManifestPublishFailed,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Local filesystem operation failed
    InternalIoError,
    /// External command exited unsuccessfully
    InternalSubprocessError,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            // Config (001-099)
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,
            Self::BastionNotConfigured => 6,
            Self::AuthorityAddressMissing => 7,
            Self::BuildInputNotFound => 8,
            Self::InvalidArgument => 9,

            // Tunnel (100-199)
            Self::PortsExhausted => 100,
            Self::CertificateSigningFailed => 101,
            Self::TunnelSpawnFailed => 102,
            Self::TunnelEndpointUnready => 103,

            // Capacity (200-299)
            Self::CapacityUnavailable => 200,
            Self::CapacityScaleTimeout => 201,
            Self::ControlPlaneInvalidResponse => 202,

            // Build (300-399)
            Self::BuildFailed => 300,
            Self::BuildCancelled => 301,

            // Publish (400-499)
            Self::ManifestPublishFailed => 400,

            // Internal (500-599)
            Self::InternalIoError => 500,
            Self::InternalSubprocessError => 501,
        }
    }

    /// Returns the formatted error code string (e.g., "BFH-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("BFH-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Tunnel,
            200..=299 => ErrorCategory::Capacity,
            300..=399 => ErrorCategory::Build,
            400..=499 => ErrorCategory::Publish,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file could not be parsed",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has invalid value",
            Self::BastionNotConfigured => "Bastion connection metadata not found",
            Self::AuthorityAddressMissing => "Certificate authority address is not configured",
            Self::BuildInputNotFound => "Dockerfile or build context not found",
            Self::InvalidArgument => "Invalid argument",

            Self::PortsExhausted => "No free local ports available in the requested range",
            Self::CertificateSigningFailed => "Certificate authority could not sign the public key",
            Self::TunnelSpawnFailed => "Tunnel process could not be started",
            Self::TunnelEndpointUnready => "Tunnel endpoint did not accept connections in time",

            Self::CapacityUnavailable => "No running build engine instance is available",
            Self::CapacityScaleTimeout => "Timed out waiting for build capacity",
            Self::ControlPlaneInvalidResponse => "Control plane returned a malformed value",

            Self::BuildFailed => "One or more architecture builds failed",
            Self::BuildCancelled => "Build was interrupted",

            Self::ManifestPublishFailed => "Multi-architecture manifest publication failed",

            Self::InternalIoError => "Local filesystem operation failed",
            Self::InternalSubprocessError => "External command failed",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Check the path passed with --config",
                "Regenerate buildkit.json from your infrastructure outputs",
            ],
            Self::ConfigReadError => &["Check file permissions on the configuration file"],
            Self::ConfigParseError => &[
                "Validate the file syntax (TOML for bfh.toml, JSON for buildkit.json)",
            ],
            Self::ConfigValidationError => &["Review the reported field and correct its value"],
            Self::ConfigEnvError => &["Unset or correct the reported BFH_* environment variable"],
            Self::BastionNotConfigured => &[
                "Resynchronize the local SSH connection cache (connection_info)",
                "Confirm the bastion name in buildkit.json is spelled correctly",
            ],
            Self::AuthorityAddressMissing => &[
                "Set authority_address in buildkit.json or export VAULT_ADDR",
            ],
            Self::BuildInputNotFound => &["Check the --file and --context paths"],
            Self::InvalidArgument => &["Review the command arguments"],

            Self::PortsExhausted => &[
                "Free some local ports or widen the [ports] range in bfh.toml",
            ],
            Self::CertificateSigningFailed => &[
                "Re-authenticate with the certificate authority (e.g. vault login)",
                "Unset a stale VAULT_TOKEN",
            ],
            Self::TunnelSpawnFailed => &[
                "Ensure autossh (or kubectl for in-cluster mode) is installed and on PATH",
            ],
            Self::TunnelEndpointUnready => &[
                "Check that the bastion is reachable",
                "Increase [readiness] timeout in bfh.toml",
            ],

            Self::CapacityUnavailable => &[
                "Run `bfh scale up --wait` and retry",
                "Check the build engine pods in the cluster",
            ],
            Self::CapacityScaleTimeout => &[
                "Check cluster capacity and pod events for the build workload",
                "Increase the scale-up timeout",
            ],
            Self::ControlPlaneInvalidResponse => &[
                "Inspect the workload with kubectl; a replica count or annotation is malformed",
            ],

            Self::BuildFailed => &["Review the prefixed build output for the failing architecture"],
            Self::BuildCancelled => &["Re-run the build"],

            Self::ManifestPublishFailed => &[
                "Verify registry credentials",
                "Confirm every per-architecture image was pushed",
            ],

            Self::InternalIoError => &["Check disk space and permissions"],
            Self::InternalSubprocessError => &["Re-run with --verbose to see the command output"],
        }
    }

    /// Returns all error codes.
    #[must_use]
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::BastionNotConfigured,
            Self::AuthorityAddressMissing,
            Self::BuildInputNotFound,
            Self::InvalidArgument,
            Self::PortsExhausted,
            Self::CertificateSigningFailed,
            Self::TunnelSpawnFailed,
            Self::TunnelEndpointUnready,
            Self::CapacityUnavailable,
            Self::CapacityScaleTimeout,
            Self::ControlPlaneInvalidResponse,
            Self::BuildFailed,
            Self::BuildCancelled,
            Self::ManifestPublishFailed,
            Self::InternalIoError,
            Self::InternalSubprocessError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration, inputs and local caches (E001-E099)
    Config,
    /// Ports, credentials and tunnel transport (E100-E199)
    Tunnel,
    /// Control plane and build capacity (E200-E299)
    Capacity,
    /// Build engine execution (E300-E399)
    Build,
    /// Manifest publication (E400-E499)
    Publish,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Tunnel => "Tunnel",
            Self::Capacity => "Capacity",
            Self::Build => "Build",
            Self::Publish => "Publish",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "BFH-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
