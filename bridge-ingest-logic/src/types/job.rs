use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CanonicalEvent;

/// Unit of work in the job queue. `job_id` is the event id, which is what
/// deduplicates delivery at the queue boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub event: CanonicalEvent,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub acked: bool,
    pub error: Option<String>,
}

impl JobEnvelope {
    pub fn new(event: CanonicalEvent, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_id: event.id.clone(),
            event,
            attempts: 0,
            max_attempts,
            next_run_at: now,
            acked: false,
            error: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: JobEnvelope,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}
