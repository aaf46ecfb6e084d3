//! Shared handles for task execution
//!
//! Built once in `main` (or by a test) and passed to the coordinator. There
//! is no process-wide session or logger state beyond the tracing subscriber.

use std::sync::Arc;

use crate::bus::{ProjectCatalog, TaskBus};
use crate::definition::DefinitionService;
use crate::notify::Notifier;
use crate::sink::DocumentSink;
use crate::source::SourceStore;

#[derive(Clone)]
pub struct WorkerContext {
    /// Identity tasks must be addressed to
    pub host: String,
    /// Suite this worker serves
    pub suite: String,
    pub bus: Arc<dyn TaskBus>,
    pub projects: Arc<dyn ProjectCatalog>,
    pub definitions: Arc<dyn DefinitionService>,
    pub source: Arc<dyn SourceStore>,
    pub sink: Arc<dyn DocumentSink>,
    pub notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("host", &self.host)
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}
