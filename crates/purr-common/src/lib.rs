//! Purr Common Library
//!
//! Shared types, utilities, and error handling for the purr worker.
//!
//! # Overview
//!
//! - **Error Handling**: Common error and result types
//! - **Hashing**: Deterministic identifiers for batches and documents
//! - **Logging**: `tracing` subscriber bootstrap
//! - **Types**: Task status, task directive and workflow enums shared by
//!   everything that talks to the task bus
//!
//! # Example
//!
//! ```no_run
//! use purr_common::hash::hashify;
//!
//! let batch_id = hashify(r#"{"asset":"well","chunk":100}"#);
//! assert_eq!(batch_id.len(), 32);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod hash;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{PurrError, Result};
pub use hash::hashify;
pub use types::{Directive, TaskStatus, Workflow};
