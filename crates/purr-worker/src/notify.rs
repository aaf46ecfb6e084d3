//! Job status events
//!
//! Users follow a batch through the message log: `busy` when a job starts,
//! `note` for milestones, `done` when a batch (never a single chunk) is
//! complete. Sending an event must never fail the job that emits it.

use async_trait::async_trait;
use purr_common::Workflow;
use serde_json::json;
use tracing::{info, warn};

use crate::bus::postgres::SharedPool;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Busy {
        job_id: String,
    },
    Note {
        note: String,
        project_id: Option<String>,
        workflow: Workflow,
    },
    Done {
        job_id: String,
    },
}

impl Event {
    pub fn busy(job_id: impl ToString) -> Self {
        Event::Busy {
            job_id: job_id.to_string(),
        }
    }

    pub fn done(job_id: impl ToString) -> Self {
        Event::Done {
            job_id: job_id.to_string(),
        }
    }

    pub fn note(note: impl Into<String>, project_id: Option<&str>, workflow: Workflow) -> Self {
        Event::Note {
            note: note.into(),
            project_id: project_id.map(str::to_string),
            workflow,
        }
    }

    pub fn directive(&self) -> &'static str {
        match self {
            Event::Busy { .. } => "busy",
            Event::Note { .. } => "note",
            Event::Done { .. } => "done",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: Event);
}

/// Writes events to the control database's `message` table.
///
/// Holds the bus's [`SharedPool`] rather than a pool of its own, so events
/// keep flowing after the bus refreshes an expired session.
pub struct PgNotifier {
    pool: SharedPool,
    worker: String,
}

impl PgNotifier {
    pub fn new(pool: impl Into<SharedPool>, worker: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            worker: worker.into(),
        }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn send(&self, event: Event) {
        let (data, project_id, workflow) = match &event {
            Event::Busy { job_id } | Event::Done { job_id } => {
                info!(event = event.directive(), job_id = %job_id, "status event");
                (json!({ "job_id": job_id }), None, Workflow::Any)
            },
            Event::Note {
                note,
                project_id,
                workflow,
            } => {
                info!(project_id = ?project_id, workflow = workflow.as_str(), "{}", note);
                (json!({ "note": note }), project_id.clone(), *workflow)
            },
        };

        let pool = self.pool.get().await;
        let result = sqlx::query(
            r#"
            INSERT INTO message (worker, directive, project_id, data, workflow)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&self.worker)
        .bind(event.directive())
        .bind(project_id)
        .bind(data)
        .bind(workflow.as_str())
        .execute(&pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, event = event.directive(), "failed to record status event");
        }
    }
}
