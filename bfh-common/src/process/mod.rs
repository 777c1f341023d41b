//! Background process tracking and teardown.

pub mod registry;
pub mod signal;

pub use registry::{BackgroundProcess, ProcessRegistry, TerminationOutcome, TerminationPolicy};
pub use signal::{Signal, is_process_alive, is_protected, process_tree, send_signal, signal_tree};
