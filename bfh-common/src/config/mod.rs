//! Configuration system for BFH.
//!
//! - `bfh.toml` settings with per-section defaults
//! - `BFH_*` environment overrides with type checking and source tracking
//! - the `buildkit.json` infrastructure descriptor

pub mod env;
pub mod settings;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use settings::{
    BUILDKIT_CONFIG_FILE, BfhConfig, BuildKitConfig, CapacityConfig, ConfigError, GeneralConfig,
    ReadinessConfig, TerminationConfig, TunnelConfig,
};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
