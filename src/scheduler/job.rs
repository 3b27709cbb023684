use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Starting,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Whether the job lifecycle allows moving from `self` to `next`.
    ///
    /// Transitions only move forward: nothing returns to `Pending`, and
    /// `Starting` is reachable from `Pending` alone.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Error)
                | (Pending, Cancelled)
                | (Starting, InProgress)
                | (Starting, Completed)
                | (Starting, Error)
                | (Starting, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Error)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Starting => write!(f, "starting"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: String,
    pub host_group: String,
    pub status: JobStatus,
    /// Higher values are dispatched first.
    pub priority: i32,
    pub parameters: HashMap<String, String>,
    pub assigned_host: Option<String>,
    pub cancel_requested: bool,
    /// Human-readable reason for the current status, mostly set on errors.
    pub reason: Option<String>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(task_id: impl Into<String>, host_group: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), task_id, host_group, Utc::now())
    }

    pub fn with_id(
        id: Uuid,
        task_id: impl Into<String>,
        host_group: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id: task_id.into(),
            host_group: host_group.into(),
            status: JobStatus::Pending,
            priority: 0,
            parameters: HashMap::new(),
            assigned_host: None,
            cancel_requested: false,
            reason: None,
            result: None,
            created_at,
            started_at: None,
            finished_at: None,
            last_heartbeat: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Most recent sign of life: the last heartbeat, or the dispatch time if
    /// the host has not reported yet.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.or(self.started_at)
    }

    /// Wall time spent between dispatch and completion, if both are known.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
