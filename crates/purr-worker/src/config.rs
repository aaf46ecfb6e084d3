//! Worker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Worker Configuration Constants
// ============================================================================

/// Default control database (task bus, ledger, projects, messages).
pub const DEFAULT_CONTROL_DATABASE_URL: &str = "postgresql://localhost/purr";

/// Default analytical store receiving document upserts.
pub const DEFAULT_ANALYTICS_DATABASE_URL: &str = "postgresql://localhost/purr";

/// Default maximum database connections per pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default suite served by this worker.
pub const DEFAULT_SUITE: &str = "petra";

/// Default size of the pool running batch, chunk and recon tasks.
pub const DEFAULT_WORK_MAX_WORKERS: usize = 4;

/// Default size of the pool running search and export tasks.
pub const DEFAULT_SEARCH_MAX_WORKERS: usize = 2;

/// Default LISTEN/NOTIFY channel announcing new tasks.
pub const DEFAULT_TASK_CHANNEL: &str = "purr_task";

/// Default asset definition service.
pub const DEFAULT_DEFINITION_SERVICE_URL: &str = "http://localhost:54321";

/// Default seconds to wait for in-flight tasks after a halt.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub worker: WorkerConfig,
    pub control_db: DatabaseConfig,
    pub analytics_db: DatabaseConfig,
    pub definitions: DefinitionServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity tasks are addressed to
    pub hostname: String,
    pub suite: String,
    pub work_max_workers: usize,
    pub search_max_workers: usize,
    pub task_channel: String,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionServiceConfig {
    pub url: String,
    /// Bearer key; empty sends no credentials
    #[serde(skip_serializing)]
    pub api_key: String,
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl WorkerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Lowercased machine host name, or "localhost" if it is unreadable
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.to_lowercase())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let max_connections = env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS);
        let connect_timeout_secs = env_or("DATABASE_CONNECT_TIMEOUT", DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS);

        let config = Config {
            worker: WorkerConfig {
                hostname: std::env::var("PURR_HOSTNAME")
                    .map(|h| h.to_lowercase())
                    .unwrap_or_else(|_| local_hostname()),
                suite: env_string("PURR_SUITE", DEFAULT_SUITE),
                work_max_workers: env_or("WORK_MAX_WORKERS", DEFAULT_WORK_MAX_WORKERS),
                search_max_workers: env_or("SEARCH_MAX_WORKERS", DEFAULT_SEARCH_MAX_WORKERS),
                task_channel: env_string("PURR_TASK_CHANNEL", DEFAULT_TASK_CHANNEL),
                shutdown_timeout_secs: env_or("PURR_SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            },
            control_db: DatabaseConfig {
                url: env_string("CONTROL_DATABASE_URL", DEFAULT_CONTROL_DATABASE_URL),
                max_connections,
                connect_timeout_secs,
            },
            analytics_db: DatabaseConfig {
                url: env_string("ANALYTICS_DATABASE_URL", DEFAULT_ANALYTICS_DATABASE_URL),
                max_connections,
                connect_timeout_secs,
            },
            definitions: DefinitionServiceConfig {
                url: env_string("DEFINITION_SERVICE_URL", DEFAULT_DEFINITION_SERVICE_URL),
                api_key: env_string("DEFINITION_SERVICE_KEY", ""),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker.hostname.trim().is_empty() {
            anyhow::bail!("Worker hostname cannot be empty");
        }

        if self.worker.suite.trim().is_empty() {
            anyhow::bail!("PURR_SUITE cannot be empty");
        }

        if self.worker.work_max_workers == 0 || self.worker.search_max_workers == 0 {
            anyhow::bail!(
                "Pool sizes must be greater than 0 (work: {}, search: {})",
                self.worker.work_max_workers,
                self.worker.search_max_workers
            );
        }

        if self.worker.task_channel.is_empty()
            || !self
                .worker
                .task_channel
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("Invalid task channel name: {:?}", self.worker.task_channel);
        }

        for (name, db) in [("control", &self.control_db), ("analytics", &self.analytics_db)] {
            if db.url.is_empty() {
                anyhow::bail!("The {} database URL cannot be empty", name);
            }
            if db.max_connections == 0 {
                anyhow::bail!("The {} database max_connections must be greater than 0", name);
            }
        }

        if self.definitions.url.is_empty() {
            anyhow::bail!("DEFINITION_SERVICE_URL cannot be empty");
        }

        if self.definitions.api_key.is_empty() {
            tracing::warn!("No DEFINITION_SERVICE_KEY configured - definition requests are unauthenticated");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig {
                hostname: local_hostname(),
                suite: DEFAULT_SUITE.to_string(),
                work_max_workers: DEFAULT_WORK_MAX_WORKERS,
                search_max_workers: DEFAULT_SEARCH_MAX_WORKERS,
                task_channel: DEFAULT_TASK_CHANNEL.to_string(),
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            control_db: DatabaseConfig {
                url: DEFAULT_CONTROL_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            analytics_db: DatabaseConfig {
                url: DEFAULT_ANALYTICS_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            definitions: DefinitionServiceConfig {
                url: DEFAULT_DEFINITION_SERVICE_URL.to_string(),
                api_key: String::new(),
            },
        }
    }
}
