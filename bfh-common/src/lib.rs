//! Shared building blocks for Build Fleet Helper.
//!
//! Everything here is independent of the remote systems BFH talks to:
//! the error catalog, configuration, logging, local port allocation,
//! background process tracking and subprocess helpers.

pub mod config;
pub mod errors;
pub mod logging;
pub mod ports;
pub mod process;
pub mod subprocess;
pub mod testing;
pub mod types;
pub mod util;

pub use config::{BfhConfig, BuildKitConfig, ConfigError};
pub use errors::{ArchFailure, BfhError, ErrorCategory, ErrorCode, ErrorEntry, Result};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use ports::{PortAllocator, ReadinessPolicy, check_connection, wait_for_port};
pub use process::{BackgroundProcess, ProcessRegistry, TerminationOutcome, TerminationPolicy};
pub use subprocess::{CommandOutput, ExternalCommand};
pub use types::{Architecture, BastionEndpoint, BuildEndpoint, PortRange};
pub use util::mask_sensitive_command;
