//! Purr Worker Library
//!
//! Chunked batch loader for petroleum-project databases.
//!
//! # Overview
//!
//! A worker host listens on a shared task bus for work addressed to it. A
//! **batch** task names one asset type in one project; the worker fetches the
//! asset definition, lists the identifiers to load, and fans the batch out as
//! **chunk** tasks tracked in a per-batch ledger. Each chunk task queries its
//! slice of the source store, decodes the raw columns, composes one JSON
//! document per row, and upserts the documents into the analytical store.
//! The last chunk to finish announces the batch as done.
//!
//! # Modules
//!
//! - [`bus`]: task rows, acceptance, decoding, the batch ledger
//! - [`planner`]: where-clause assembly, identifier grouping, chunk selectors
//! - [`codec`]: typed scalar coercion and the binary record layouts
//! - [`composer`]: rows to documents, plus post-process aggregation
//! - [`sink`]: idempotent per-asset upserts
//! - [`coordinator`]: the per-task status lifecycle and fan-in
//! - [`dispatcher`]: bounded worker pools fed from the bus
//!
//! # Example
//!
//! ```rust,ignore
//! let coordinator = Arc::new(Coordinator::new(ctx.clone(), Arc::new(UnsupportedCollaborator)));
//! let dispatcher = Dispatcher::new(ctx, coordinator, 4, 2, Duration::from_secs(30));
//! dispatcher.run().await?;
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod bus;
pub mod codec;
pub mod composer;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod definition;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod planner;
pub mod sink;
pub mod source;

pub use bus::{BatchRequest, ChunkTask, RawTask, TaskBody, TaskBus, TaskRecord};
pub use config::Config;
pub use context::WorkerContext;
pub use coordinator::{CollaboratorHandler, Coordinator, TaskOutcome, UnsupportedCollaborator};
pub use dispatcher::{Dispatcher, Routed, TaskHandler, WorkerPool};
pub use error::{WorkerError, WorkerResult};
