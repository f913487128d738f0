//! Error handling for dump operations.
//!
//! This module provides:
//! - The crate-wide [`DumpError`] taxonomy (configuration, topology, oplog,
//!   query, write and metadata failures)
//! - Structured extraction of MongoDB driver errors for diagnostics
//!
//! Every error except the metadata lookup failure is fatal. Errors carry the
//! namespace or phase they happened in before they reach `main`, which turns
//! them into a non-zero exit code.

pub mod kinds;
pub mod mongo;

// Re-export commonly used types
pub use kinds::{ConfigError, DumpError, Result};
pub use mongo::{ErrorInfo, extract_error_info};
