//! Test support shared by the workspace crates.

pub mod log;

pub use log::{TestGuard, TestOutcome, TestTrail, TrailEntry, init_test_subscriber};
