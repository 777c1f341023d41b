//! Error catalog and typed errors for Build Fleet Helper
//!
//! The catalog gives every failure a stable `BFH-Exxx` code with
//! remediation steps; [`BfhError`] is the typed error that library code
//! returns and that maps onto the catalog.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                          |
//! |------------|-------------|--------------------------------------|
//! | E001-E099  | Config      | Configuration and build inputs       |
//! | E100-E199  | Tunnel      | Ports, credentials and transport     |
//! | E200-E299  | Capacity    | Control plane and scaling            |
//! | E300-E399  | Build       | Build engine execution               |
//! | E400-E499  | Publish     | Manifest publication                 |
//! | E500-E599  | Internal    | Internal/unexpected errors           |

pub mod catalog;
mod error;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
pub use error::{ArchFailure, BfhError, Result};
