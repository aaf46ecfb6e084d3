//! Common types used across purr crates

use serde::{Deserialize, Serialize};

/// Status of a task record on the task bus.
///
/// A task is PENDING when published, PROCESSING once a worker picks it up,
/// and FAILED if its handler errored. Successful tasks are deleted rather than
/// given a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::PurrError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(crate::PurrError::Parse(format!("Invalid task status: {}", s))),
        }
    }
}

/// What a task asks the worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    Batch,
    Chunk,
    Recon,
    Search,
    Export,
    Halt,
}

impl Directive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Directive::Batch => "batch",
            Directive::Chunk => "chunk",
            Directive::Recon => "recon",
            Directive::Search => "search",
            Directive::Export => "export",
            Directive::Halt => "halt",
        }
    }

    /// Search and export are interactive and run on the latency-sensitive pool.
    pub fn is_latency_sensitive(&self) -> bool {
        matches!(self, Directive::Search | Directive::Export)
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Directive {
    type Err = crate::PurrError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "batch" => Ok(Directive::Batch),
            "chunk" => Ok(Directive::Chunk),
            "recon" => Ok(Directive::Recon),
            "search" => Ok(Directive::Search),
            "export" => Ok(Directive::Export),
            "halt" => Ok(Directive::Halt),
            _ => Err(crate::PurrError::Parse(format!("Invalid directive: {}", s))),
        }
    }
}

/// Workflow label attached to status notes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workflow {
    Load,
    Recon,
    Any,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Load => "load",
            Workflow::Recon => "recon",
            Workflow::Any => "any",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_from_str() {
        assert_eq!("pending".parse::<TaskStatus>().unwrap(), TaskStatus::Pending);
        assert_eq!("PROCESSING".parse::<TaskStatus>().unwrap(), TaskStatus::Processing);
        assert_eq!("Failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_status_serde_is_uppercase() {
        let json = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
    }

    #[test]
    fn test_directive_routing() {
        assert!(Directive::Search.is_latency_sensitive());
        assert!(Directive::Export.is_latency_sensitive());
        assert!(!Directive::Batch.is_latency_sensitive());
        assert!(!Directive::Chunk.is_latency_sensitive());
    }

    #[test]
    fn test_directive_round_trips_through_str() {
        for d in [
            Directive::Batch,
            Directive::Chunk,
            Directive::Recon,
            Directive::Search,
            Directive::Export,
            Directive::Halt,
        ] {
            assert_eq!(d.as_str().parse::<Directive>().unwrap(), d);
        }
    }
}
