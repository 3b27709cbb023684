//! Collaborator interfaces for job and task-definition persistence.
//!
//! The orchestration core never owns job records: it reads them, performs
//! status transitions and stamps timestamps. Creation and retention belong to
//! whatever sits behind [`JobStore`]. The in-memory adapters here back the
//! binary and the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::task::TaskDefinition;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Filter for [`JobStore::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub host_group: Option<String>,
    /// Only jobs created at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl JobQuery {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.host_group = Some(group.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self
                .host_group
                .as_deref()
                .map_or(true, |g| job.host_group == g)
            && self.since.map_or(true, |since| job.created_at >= since)
    }
}

/// A compare-and-set status change. Applied only if the job is still in
/// `from`.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    pub assigned_host: Option<String>,
    pub reason: Option<String>,
    pub result: Option<String>,
}

impl Transition {
    pub fn new(from: JobStatus, to: JobStatus, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            at,
            assigned_host: None,
            reason: None,
            result: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.assigned_host = Some(host.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_result(mut self, result: Option<String>) -> Self {
        self.result = result;
        self
    }

    /// Write the transition into `job`. Callers have already checked `from`.
    pub fn apply(&self, job: &mut Job) {
        job.status = self.to;
        match self.to {
            JobStatus::Starting => {
                job.started_at = Some(self.at);
                job.assigned_host = self.assigned_host.clone();
            }
            JobStatus::InProgress => {
                job.last_heartbeat = Some(self.at);
            }
            status if status.is_terminal() => {
                job.finished_at = Some(self.at);
                job.assigned_host = None;
            }
            _ => {}
        }
        if self.reason.is_some() {
            job.reason = self.reason.clone();
        }
        if self.result.is_some() {
            job.result = self.result.clone();
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: &Uuid) -> Result<Option<Job>>;

    async fn add(&self, job: Job) -> Result<()>;

    /// Replace a stored job wholesale.
    async fn update(&self, job: Job) -> Result<()>;

    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>>;

    /// Atomically apply `transition`.
    ///
    /// Returns `Ok(None)` when the job is no longer in `transition.from`,
    /// which callers treat as a lost race rather than a failure.
    async fn transition(&self, id: &Uuid, transition: Transition) -> Result<Option<Job>>;

    /// Refresh the job's heartbeat timestamp. Terminal jobs are left alone.
    async fn record_heartbeat(&self, id: &Uuid, at: DateTime<Utc>) -> Result<Option<Job>>;

    /// Flag a non-terminal job for cancellation.
    async fn request_cancel(&self, id: &Uuid) -> Result<Job>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, task_id: &str) -> Result<Option<TaskDefinition>>;
}

/// Bounded in-memory job store.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    max_jobs: usize,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: &Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn add(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.max_jobs {
            return Err(DispatchError::Store(format!(
                "job store at capacity ({} jobs)",
                self.max_jobs
            )));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn update(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job;
                Ok(())
            }
            None => Err(DispatchError::JobNotFound(job.id)),
        }
    }

    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<Job> = jobs.values().filter(|j| query.matches(j)).cloned().collect();
        matched.sort_by_key(|j| j.created_at);
        Ok(matched)
    }

    async fn transition(&self, id: &Uuid, transition: Transition) -> Result<Option<Job>> {
        if !transition.from.can_transition_to(transition.to) {
            return Err(DispatchError::InvalidTransition {
                job: *id,
                from: transition.from,
                to: transition.to,
            });
        }

        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(DispatchError::JobNotFound(*id))?;
        if job.status != transition.from {
            return Ok(None);
        }
        transition.apply(job);
        Ok(Some(job.clone()))
    }

    async fn record_heartbeat(&self, id: &Uuid, at: DateTime<Utc>) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(DispatchError::JobNotFound(*id))?;
        if job.status.is_terminal() {
            return Ok(None);
        }
        job.last_heartbeat = Some(at);
        Ok(Some(job.clone()))
    }

    async fn request_cancel(&self, id: &Uuid) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(DispatchError::JobNotFound(*id))?;
        if job.status.is_terminal() {
            return Err(DispatchError::InvalidTransition {
                job: *id,
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }
        job.cancel_requested = true;
        Ok(job.clone())
    }
}

/// Read-only task definitions held in memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: std::sync::RwLock<HashMap<String, TaskDefinition>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: impl IntoIterator<Item = TaskDefinition>) -> Self {
        let store = Self::new();
        for task in tasks {
            store.insert(task);
        }
        store
    }

    pub fn insert(&self, task: TaskDefinition) {
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), task);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskDefinition>> {
        Ok(self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned())
    }
}
