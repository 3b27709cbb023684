use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{DispatchError, Result};
use crate::gateway::HostEvent;
use crate::metrics::WorkerMetrics;
use crate::scheduler::{
    DispatchOutcome, Job, JobQuery, JobStatus, JobStore, LoadBalancer, TaskStore, Transition,
};

/// Inbound host events buffered per worker between ticks.
pub const EVENT_QUEUE_SIZE: usize = 1024;

/// A lost compare-and-set is retried against a fresh read this many times.
const SETTLE_ATTEMPTS: usize = 3;

const METRICS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeouts {
    pub start: Duration,
    pub heartbeat: Duration,
    pub default_job: Duration,
    pub max_age: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl WorkerTimeouts {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            start: config.start_timeout(),
            heartbeat: config.heartbeat_timeout(),
            default_job: config.default_job_timeout(),
            max_age: config.job_max_age(),
        }
    }
}

/// Dispatch and health monitoring for the jobs of one host group.
///
/// Every operation takes `now` from the caller and compares it with the
/// timestamps stored on the job; nothing here sleeps or waits on a host.
pub struct JobWorker {
    host_group: String,
    jobs: Arc<dyn JobStore>,
    tasks: Arc<dyn TaskStore>,
    balancer: Arc<LoadBalancer>,
    events: Mutex<mpsc::Receiver<HostEvent>>,
    // Reports that raced ahead of their dispatch being recorded.
    deferred: Mutex<Vec<HostEvent>>,
    timeouts: WorkerTimeouts,
}

impl JobWorker {
    pub fn new(
        host_group: impl Into<String>,
        jobs: Arc<dyn JobStore>,
        tasks: Arc<dyn TaskStore>,
        balancer: Arc<LoadBalancer>,
        events: mpsc::Receiver<HostEvent>,
        timeouts: WorkerTimeouts,
    ) -> Self {
        Self {
            host_group: host_group.into(),
            jobs,
            tasks,
            balancer,
            events: Mutex::new(events),
            deferred: Mutex::new(Vec::new()),
            timeouts,
        }
    }

    pub fn host_group(&self) -> &str {
        &self.host_group
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Apply every host event queued since the last drain, oldest first.
    pub async fn drain_events(&self) -> usize {
        let queued: Vec<HostEvent> = {
            let mut queued = std::mem::take(&mut *self.deferred.lock().await);
            let mut rx = self.events.lock().await;
            while let Ok(event) = rx.try_recv() {
                queued.push(event);
            }
            queued
        };

        let count = queued.len();
        for event in queued {
            let job_id = event.job_id();
            if let Err(e) = self.apply_event(event).await {
                tracing::warn!(job_id = %job_id, group = %self.host_group, error = %e, "Failed to apply host event");
            }
        }
        count
    }

    /// Update job state from one host report.
    ///
    /// Reports for terminal or never-dispatched jobs, or from a host other
    /// than the one the job is assigned to, are ignored. A report for a job
    /// still `Pending` but already placed on the reporting host is held back
    /// until the next drain, by which time the dispatch has been recorded.
    pub async fn apply_event(&self, event: HostEvent) -> Result<()> {
        let job_id = event.job_id();
        let job = self
            .jobs
            .get(&job_id)
            .await?
            .ok_or(DispatchError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Event for finished job ignored");
            return Ok(());
        }
        if job.status == JobStatus::Pending {
            if self.balancer.assignment(&job_id).as_deref() == Some(event.host()) {
                tracing::debug!(job_id = %job_id, host = event.host(), "Event ahead of dispatch, deferring");
                self.deferred.lock().await.push(event);
                return Ok(());
            }
            tracing::warn!(job_id = %job_id, host = event.host(), "Event for undispatched job ignored");
            return Ok(());
        }
        if let Some(assigned) = job.assigned_host.as_deref() {
            if assigned != event.host() {
                tracing::warn!(
                    job_id = %job_id,
                    host = event.host(),
                    assigned,
                    "Event from unassigned host ignored"
                );
                return Ok(());
            }
        }

        match event {
            HostEvent::Heartbeat { host, at, .. } => {
                if job.status == JobStatus::Starting {
                    let transition = Transition::new(JobStatus::Starting, JobStatus::InProgress, at);
                    if self.jobs.transition(&job_id, transition).await?.is_some() {
                        tracing::info!(job_id = %job_id, host = %host, "Job in progress");
                        return Ok(());
                    }
                }
                self.jobs.record_heartbeat(&job_id, at).await?;
                tracing::trace!(job_id = %job_id, host = %host, "Heartbeat");
            }
            HostEvent::Completed { result, at, .. } => {
                if self
                    .settle(&job_id, JobStatus::Completed, at, None, result)
                    .await?
                    .is_some()
                {
                    tracing::info!(job_id = %job_id, "Job completed");
                }
            }
            HostEvent::Failed { error, at, .. } => {
                if self
                    .settle(&job_id, JobStatus::Error, at, Some(error.clone()), None)
                    .await?
                    .is_some()
                {
                    tracing::warn!(job_id = %job_id, error = %error, "Job failed on host");
                }
            }
            HostEvent::Cancelled { at, .. } => {
                if self
                    .settle(&job_id, JobStatus::Cancelled, at, Some("cancelled".into()), None)
                    .await?
                    .is_some()
                {
                    tracing::info!(job_id = %job_id, "Job cancelled");
                }
            }
        }
        Ok(())
    }

    /// Fail jobs that stayed `Pending` past the start timeout.
    pub async fn clean_not_started_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut cleaned = 0;
        for job in self.query(JobStatus::Pending, now).await? {
            if !expired(job.created_at, now, self.timeouts.start) {
                continue;
            }
            let reason = format!(
                "never started within {}s",
                self.timeouts.start.as_secs()
            );
            if self.finish(&job, JobStatus::Error, now, Some(reason), None).await? {
                tracing::warn!(job_id = %job.id, group = %self.host_group, "Job never started");
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    /// Dispatch pending jobs, highest priority first, then oldest.
    ///
    /// Stops at the first job that finds no free host: every later job
    /// would be deferred too.
    pub async fn execute_pending(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut pending = self.query(JobStatus::Pending, now).await?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut dispatched = 0;
        for job in pending {
            if job.cancel_requested {
                continue;
            }
            let Some(task) = self.tasks.get(&job.task_id).await? else {
                let reason = format!("task definition not found: {}", job.task_id);
                if self.finish(&job, JobStatus::Error, now, Some(reason), None).await? {
                    tracing::warn!(job_id = %job.id, task = %job.task_id, "Task definition not found");
                }
                continue;
            };
            if let Some(target) = task.host_group.as_deref() {
                if target != self.host_group {
                    let reason = format!("task targets host group {}", target);
                    if self.finish(&job, JobStatus::Error, now, Some(reason), None).await? {
                        tracing::warn!(
                            job_id = %job.id,
                            task = %task.id,
                            target,
                            group = %self.host_group,
                            "Task targets another host group"
                        );
                    }
                    continue;
                }
            }

            match self.balancer.dispatch(self.jobs.as_ref(), &job, &task, now).await {
                Ok(DispatchOutcome::Dispatched { .. }) => dispatched += 1,
                Ok(DispatchOutcome::Stale) => {}
                Ok(DispatchOutcome::Deferred) => {
                    tracing::debug!(group = %self.host_group, "No free host, deferring remaining jobs");
                    break;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Dispatch failed");
                }
            }
        }
        Ok(dispatched)
    }

    /// Act on jobs flagged for cancellation.
    ///
    /// Pending jobs are cancelled outright. Running jobs get a cancel sent to
    /// their host and stay in their state until the host acknowledges; a host
    /// that cannot be reached is tried again next cycle.
    pub async fn cancel_requested(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut handled = 0;
        for status in [JobStatus::Pending, JobStatus::Starting, JobStatus::InProgress] {
            for job in self.query(status, now).await? {
                if !job.cancel_requested {
                    continue;
                }
                if status == JobStatus::Pending {
                    let reason = Some("cancelled before dispatch".to_string());
                    if self.finish(&job, JobStatus::Cancelled, now, reason, None).await? {
                        tracing::info!(job_id = %job.id, "Pending job cancelled");
                        handled += 1;
                    }
                    continue;
                }
                match self.balancer.cancel(&job).await {
                    Ok(()) => handled += 1,
                    Err(DispatchError::HostNotAvailable(_)) => {
                        tracing::warn!(
                            job_id = %job.id,
                            host = ?job.assigned_host,
                            "Host not available for cancel, retrying next cycle"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(handled)
    }

    /// Fail dispatched jobs whose host has gone quiet.
    ///
    /// A `Starting` job counts from its dispatch time, an `InProgress` job
    /// from its last heartbeat.
    pub async fn monitor_in_progress_heartbeat(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut lost = 0;
        for status in [JobStatus::Starting, JobStatus::InProgress] {
            for job in self.query(status, now).await? {
                let last_seen = job.last_seen().unwrap_or(job.created_at);
                if !expired(last_seen, now, self.timeouts.heartbeat) {
                    continue;
                }
                let reason = match status {
                    JobStatus::Starting => "host never acknowledged the job",
                    _ => "heartbeat lost",
                };
                if self
                    .finish(&job, JobStatus::Error, now, Some(reason.to_string()), None)
                    .await?
                {
                    tracing::warn!(
                        job_id = %job.id,
                        host = ?job.assigned_host,
                        last_seen = %last_seen,
                        "{}",
                        reason
                    );
                    lost += 1;
                }
            }
        }
        Ok(lost)
    }

    /// Stop jobs that ran past their task's timeout.
    ///
    /// The host is asked to cancel, but the job moves to `Error` right away
    /// whether or not the cancel reaches it.
    pub async fn monitor_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut timed_out = 0;
        for job in self.query(JobStatus::InProgress, now).await? {
            let Some(started_at) = job.started_at else {
                continue;
            };
            let limit = match self.tasks.get(&job.task_id).await? {
                Some(task) => task.effective_timeout(self.timeouts.default_job),
                None => self.timeouts.default_job,
            };
            if !expired(started_at, now, limit) {
                continue;
            }

            if let Err(e) = self.balancer.cancel(&job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Could not cancel timed out job");
            }
            let reason = format!("exceeded timeout of {}s", limit.as_secs());
            if self.finish(&job, JobStatus::Error, now, Some(reason), None).await? {
                tracing::warn!(job_id = %job.id, timeout_secs = limit.as_secs(), "Job timed out");
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    pub async fn collect_metrics(&self, now: DateTime<Utc>) -> Result<WorkerMetrics> {
        let query = JobQuery::default().in_group(&self.host_group);
        let query = match cutoff(now, self.timeouts.max_age) {
            Some(since) => query.since(since),
            None => query,
        };
        let jobs = self.jobs.query(&query).await?;

        let mut metrics = WorkerMetrics {
            host_group: self.host_group.clone(),
            ..Default::default()
        };
        let mut total_secs = 0.0;
        let mut timed = 0usize;
        for job in &jobs {
            let recent = job
                .finished_at
                .is_some_and(|at| !expired(at, now, METRICS_WINDOW));
            match job.status {
                JobStatus::Pending => metrics.pending += 1,
                JobStatus::Starting | JobStatus::InProgress => metrics.in_progress += 1,
                JobStatus::Completed if recent => {
                    metrics.completed_last_24h += 1;
                    if let Some(duration) = job.run_duration() {
                        total_secs += duration.num_milliseconds() as f64 / 1000.0;
                        timed += 1;
                    }
                }
                JobStatus::Error if recent => metrics.errors_last_24h += 1,
                _ => {}
            }
        }
        if timed > 0 {
            metrics.avg_duration_secs = total_secs / timed as f64;
        }
        Ok(metrics)
    }

    /// Rebuild host assignments for dispatched jobs after a restart.
    ///
    /// Restored jobs are not trusted beyond their routing: a host that no
    /// longer runs them stops heartbeating and the heartbeat monitor fails
    /// them.
    pub async fn recover(&self) -> Result<usize> {
        let mut restored = 0;
        for status in [JobStatus::Starting, JobStatus::InProgress] {
            let query = JobQuery::status(status).in_group(&self.host_group);
            for job in self.jobs.query(&query).await? {
                if let Some(host) = job.assigned_host {
                    self.balancer.restore(job.id, job.host_group.clone(), host);
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            tracing::info!(group = %self.host_group, restored, "Recovered job assignments");
        }
        Ok(restored)
    }

    /// Jobs of this group in `status`.
    ///
    /// Only `Pending` lookups are bounded by the maximum job age. Dispatched
    /// jobs hold a host slot until they finish, so liveness checks must see
    /// them however long they run.
    async fn query(&self, status: JobStatus, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let query = JobQuery::status(status).in_group(&self.host_group);
        let query = match cutoff(now, self.timeouts.max_age) {
            Some(since) if status == JobStatus::Pending => query.since(since),
            _ => query,
        };
        self.jobs.query(&query).await
    }

    /// Move `job` to a terminal state if it is still in the status it was
    /// read with, releasing its host slot. Returns whether this call made
    /// the change.
    async fn finish(
        &self,
        job: &Job,
        to: JobStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
        result: Option<String>,
    ) -> Result<bool> {
        let mut transition = Transition::new(job.status, to, at).with_result(result);
        if let Some(reason) = reason {
            transition = transition.with_reason(reason);
        }
        match self.jobs.transition(&job.id, transition).await? {
            Some(_) => {
                self.balancer.release(&job.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Like [`finish`](Self::finish), but re-reads the job when a concurrent
    /// transition wins the race.
    async fn settle(
        &self,
        job_id: &Uuid,
        to: JobStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
        result: Option<String>,
    ) -> Result<Option<Job>> {
        for _ in 0..SETTLE_ATTEMPTS {
            let job = self
                .jobs
                .get(job_id)
                .await?
                .ok_or(DispatchError::JobNotFound(*job_id))?;
            if !job.status.can_transition_to(to) {
                return Ok(None);
            }
            if self
                .finish(&job, to, at, reason.clone(), result.clone())
                .await?
            {
                return self.jobs.get(job_id).await;
            }
        }
        Ok(None)
    }
}

/// The instant `age` before `now`, if representable.
fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}

/// Whether more than `timeout` has passed between `since` and `now`.
fn expired(since: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    cutoff(now, timeout).is_some_and(|limit| since < limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{EventRouter, HostGateway, ServerMessage};
    use crate::hosts::{HostClaims, HostRegistry};
    use crate::scheduler::{InMemoryJobStore, InMemoryTaskStore, TaskDefinition};

    struct Fixture {
        worker: JobWorker,
        jobs: Arc<InMemoryJobStore>,
        gateway: Arc<HostGateway>,
        balancer: Arc<LoadBalancer>,
        events: mpsc::Sender<HostEvent>,
    }

    fn fixture() -> Fixture {
        fixture_with(WorkerTimeouts::default())
    }

    fn fixture_with(timeouts: WorkerTimeouts) -> Fixture {
        let registry = Arc::new(HostRegistry::new(["A"]));
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let mut router = EventRouter::new();
        router.add_route("A", tx.clone());
        let gateway = Arc::new(HostGateway::new(registry.clone(), router));
        let balancer = Arc::new(LoadBalancer::new(registry, gateway.clone()));
        let jobs = Arc::new(InMemoryJobStore::new());
        let tasks = Arc::new(InMemoryTaskStore::from_tasks([
            TaskDefinition::new("t", "task"),
            TaskDefinition::new("quick", "quick task").with_timeout(Duration::from_secs(30)),
            TaskDefinition::new("gpu", "gpu task").with_host_group("B"),
        ]));
        let worker = JobWorker::new(
            "A",
            jobs.clone(),
            tasks,
            balancer.clone(),
            rx,
            timeouts,
        );
        Fixture {
            worker,
            jobs,
            gateway,
            balancer,
            events: tx,
        }
    }

    async fn status(f: &Fixture, id: &Uuid) -> JobStatus {
        f.jobs.get(id).await.unwrap().unwrap().status
    }

    #[test]
    fn expired_is_strict() {
        let now = Utc::now();
        let timeout = Duration::from_secs(60);
        assert!(!expired(now - chrono::Duration::seconds(60), now, timeout));
        assert!(expired(now - chrono::Duration::seconds(61), now, timeout));
        assert!(!expired(now, now, Duration::MAX));
    }

    #[tokio::test]
    async fn start_timeout_fails_job_for_good() {
        let f = fixture();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();

        let later = Utc::now() + chrono::Duration::minutes(6);
        assert_eq!(f.worker.clean_not_started_jobs(later).await.unwrap(), 1);
        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.reason.unwrap().contains("never started"));

        // A host turning up afterwards does not revive it.
        let _conn = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        assert_eq!(f.worker.execute_pending(later).await.unwrap(), 0);
        assert_eq!(status(&f, &job.id).await, JobStatus::Error);
    }

    #[tokio::test]
    async fn fresh_pending_job_is_not_cleaned() {
        let f = fixture();
        f.jobs.add(Job::new("t", "A")).await.unwrap();
        assert_eq!(f.worker.clean_not_started_jobs(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn first_heartbeat_marks_job_in_progress() {
        let f = fixture();
        let (_id, _host, mut rx) = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();

        assert_eq!(f.worker.execute_pending(Utc::now()).await.unwrap(), 1);
        assert_eq!(status(&f, &job.id).await, JobStatus::Starting);
        assert!(matches!(rx.recv().await, Some(ServerMessage::Execute { .. })));

        let at = Utc::now();
        f.events
            .send(HostEvent::Heartbeat {
                job_id: job.id,
                host: "h1".into(),
                at,
            })
            .await
            .unwrap();
        assert_eq!(f.worker.drain_events().await, 1);

        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
        assert_eq!(stored.last_heartbeat, Some(at));
    }

    #[tokio::test]
    async fn heartbeat_loss_errors_exactly_once() {
        let f = fixture();
        let _conn = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();
        f.worker.execute_pending(Utc::now()).await.unwrap();
        f.worker
            .apply_event(HostEvent::Heartbeat {
                job_id: job.id,
                host: "h1".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(f.worker.monitor_in_progress_heartbeat(later).await.unwrap(), 1);
        assert_eq!(f.worker.monitor_in_progress_heartbeat(later).await.unwrap(), 0);

        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.reason.as_deref(), Some("heartbeat lost"));
        assert!(f.balancer.assignment(&job.id).is_none());
    }

    #[tokio::test]
    async fn unacknowledged_start_is_failed() {
        let f = fixture();
        let _conn = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();
        f.worker.execute_pending(Utc::now()).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(f.worker.monitor_in_progress_heartbeat(later).await.unwrap(), 1);
        assert_eq!(status(&f, &job.id).await, JobStatus::Error);
    }

    #[tokio::test]
    async fn completion_frees_host_slot() {
        let f = fixture();
        let _conn = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let first = Job::new("t", "A");
        let second = Job::with_id(
            Uuid::new_v4(),
            "t",
            "A",
            first.created_at + chrono::Duration::milliseconds(1),
        );
        f.jobs.add(first.clone()).await.unwrap();
        f.jobs.add(second.clone()).await.unwrap();

        assert_eq!(f.worker.execute_pending(Utc::now()).await.unwrap(), 1);
        assert_eq!(status(&f, &second.id).await, JobStatus::Pending);

        f.worker
            .apply_event(HostEvent::Completed {
                job_id: first.id,
                host: "h1".into(),
                result: Some("ok".into()),
                at: Utc::now(),
            })
            .await
            .unwrap();
        let done = f.jobs.get(&first.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("ok"));
        assert_eq!(f.balancer.load("A", "h1"), 0);

        assert_eq!(f.worker.execute_pending(Utc::now()).await.unwrap(), 1);
        assert_eq!(status(&f, &second.id).await, JobStatus::Starting);
    }

    #[tokio::test]
    async fn higher_priority_job_goes_first() {
        let f = fixture();
        let _conn = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let low = Job::new("t", "A");
        let high = Job::new("t", "A").with_priority(5);
        f.jobs.add(low.clone()).await.unwrap();
        f.jobs.add(high.clone()).await.unwrap();

        assert_eq!(f.worker.execute_pending(Utc::now()).await.unwrap(), 1);
        assert_eq!(status(&f, &high.id).await, JobStatus::Starting);
        assert_eq!(status(&f, &low.id).await, JobStatus::Pending);
    }

    #[tokio::test]
    async fn missing_task_definition_fails_job() {
        let f = fixture();
        let _conn = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("ghost", "A");
        f.jobs.add(job.clone()).await.unwrap();

        assert_eq!(f.worker.execute_pending(Utc::now()).await.unwrap(), 0);
        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.reason.unwrap().contains("task definition not found"));
    }

    #[tokio::test]
    async fn task_for_another_group_is_not_dispatched() {
        let f = fixture();
        let (_id, _host, mut rx) = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("gpu", "A");
        f.jobs.add(job.clone()).await.unwrap();

        assert_eq!(f.worker.execute_pending(Utc::now()).await.unwrap(), 0);
        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.reason.as_deref(), Some("task targets host group B"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn long_running_jobs_stay_monitored_past_max_age() {
        let f = fixture_with(WorkerTimeouts {
            max_age: Duration::from_secs(60 * 60),
            ..WorkerTimeouts::default()
        });
        let now = Utc::now();
        let mut job = Job::with_id(Uuid::new_v4(), "t", "A", now - chrono::Duration::hours(2));
        job.status = JobStatus::InProgress;
        job.assigned_host = Some("h1".into());
        job.started_at = Some(job.created_at);
        job.last_heartbeat = Some(now - chrono::Duration::minutes(30));
        f.jobs.add(job.clone()).await.unwrap();
        f.worker.recover().await.unwrap();
        assert_eq!(f.balancer.load("A", "h1"), 1);

        assert_eq!(f.worker.monitor_in_progress_heartbeat(now).await.unwrap(), 1);
        assert_eq!(status(&f, &job.id).await, JobStatus::Error);
        assert_eq!(f.balancer.load("A", "h1"), 0);
    }

    #[tokio::test]
    async fn report_ahead_of_recorded_dispatch_is_applied_later() {
        let f = fixture();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();
        // Placed on h1 but the Pending -> Starting write has not landed yet.
        f.balancer.restore(job.id, "A", "h1");

        f.events
            .send(HostEvent::Completed {
                job_id: job.id,
                host: "h1".into(),
                result: Some("fast".into()),
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(f.worker.drain_events().await, 1);
        assert_eq!(status(&f, &job.id).await, JobStatus::Pending);

        f.jobs
            .transition(
                &job.id,
                Transition::new(JobStatus::Pending, JobStatus::Starting, Utc::now()).with_host("h1"),
            )
            .await
            .unwrap();
        assert_eq!(f.worker.drain_events().await, 1);

        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result.as_deref(), Some("fast"));
        assert_eq!(f.balancer.load("A", "h1"), 0);
    }

    #[tokio::test]
    async fn cancel_on_disconnected_host_keeps_status() {
        let f = fixture();
        let (conn, _host, _rx) = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();
        f.worker.execute_pending(Utc::now()).await.unwrap();

        f.gateway.disconnect(conn);
        let flagged = f.jobs.request_cancel(&job.id).await.unwrap();
        assert!(matches!(
            f.balancer.cancel(&flagged).await,
            Err(DispatchError::HostNotAvailable(id)) if id == job.id
        ));

        assert_eq!(f.worker.cancel_requested(Utc::now()).await.unwrap(), 0);
        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Starting);
        assert!(stored.cancel_requested);
    }

    #[tokio::test]
    async fn cancel_reaches_host_and_ack_finishes_job() {
        let f = fixture();
        let (_conn, _host, mut rx) = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();
        f.worker.execute_pending(Utc::now()).await.unwrap();
        let _execute = rx.recv().await;

        f.jobs.request_cancel(&job.id).await.unwrap();
        assert_eq!(f.worker.cancel_requested(Utc::now()).await.unwrap(), 1);
        assert_eq!(rx.recv().await, Some(ServerMessage::Cancel { job_id: job.id }));
        assert_eq!(status(&f, &job.id).await, JobStatus::Starting);

        f.worker
            .apply_event(HostEvent::Cancelled {
                job_id: job.id,
                host: "h1".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(status(&f, &job.id).await, JobStatus::Cancelled);
        assert_eq!(f.balancer.load("A", "h1"), 0);
    }

    #[tokio::test]
    async fn pending_cancel_skips_dispatch() {
        let f = fixture();
        let _conn = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();
        f.jobs.request_cancel(&job.id).await.unwrap();

        assert_eq!(f.worker.execute_pending(Utc::now()).await.unwrap(), 0);
        assert_eq!(f.worker.cancel_requested(Utc::now()).await.unwrap(), 1);
        assert_eq!(status(&f, &job.id).await, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn run_timeout_uses_task_override() {
        let f = fixture();
        let (_conn, _host, mut rx) = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("quick", "A");
        f.jobs.add(job.clone()).await.unwrap();
        f.worker.execute_pending(Utc::now()).await.unwrap();
        let _execute = rx.recv().await;
        f.worker
            .apply_event(HostEvent::Heartbeat {
                job_id: job.id,
                host: "h1".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(f.worker.monitor_timeouts(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(f.worker.monitor_timeouts(later).await.unwrap(), 1);
        assert_eq!(rx.recv().await, Some(ServerMessage::Cancel { job_id: job.id }));
        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.reason.unwrap().contains("timeout"));
        assert!(f.balancer.assignment(&job.id).is_none());
    }

    #[tokio::test]
    async fn events_for_finished_or_foreign_jobs_are_ignored() {
        let f = fixture();
        let _conn = f.gateway.connect("h1", &HostClaims::new("A")).unwrap();
        let job = Job::new("t", "A");
        f.jobs.add(job.clone()).await.unwrap();
        f.worker.execute_pending(Utc::now()).await.unwrap();

        // Wrong host.
        f.worker
            .apply_event(HostEvent::Completed {
                job_id: job.id,
                host: "h2".into(),
                result: None,
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(status(&f, &job.id).await, JobStatus::Starting);

        f.worker
            .apply_event(HostEvent::Failed {
                job_id: job.id,
                host: "h1".into(),
                error: "disk full".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();
        let failed = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.reason.as_deref(), Some("disk full"));

        // A late completion does not overwrite the failure.
        f.worker
            .apply_event(HostEvent::Completed {
                job_id: job.id,
                host: "h1".into(),
                result: None,
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(status(&f, &job.id).await, JobStatus::Error);

        let unknown = f
            .worker
            .apply_event(HostEvent::Heartbeat {
                job_id: Uuid::new_v4(),
                host: "h1".into(),
                at: Utc::now(),
            })
            .await;
        assert!(matches!(unknown, Err(DispatchError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn recover_restores_assignments() {
        let f = fixture();
        let mut job = Job::new("t", "A");
        job.status = JobStatus::InProgress;
        job.assigned_host = Some("h1".into());
        job.started_at = Some(Utc::now());
        f.jobs.add(job.clone()).await.unwrap();
        f.jobs.add(Job::new("t", "A")).await.unwrap();

        assert_eq!(f.worker.recover().await.unwrap(), 1);
        assert_eq!(f.balancer.assignment(&job.id).as_deref(), Some("h1"));
        assert_eq!(f.balancer.load("A", "h1"), 1);
    }

    #[tokio::test]
    async fn metrics_count_recent_jobs() {
        let f = fixture();
        let now = Utc::now();
        f.jobs.add(Job::new("t", "A")).await.unwrap();

        let mut running = Job::new("t", "A");
        running.status = JobStatus::InProgress;
        f.jobs.add(running).await.unwrap();

        let mut done = Job::new("t", "A");
        done.status = JobStatus::Completed;
        done.started_at = Some(now - chrono::Duration::seconds(10));
        done.finished_at = Some(now);
        f.jobs.add(done).await.unwrap();

        let mut old_error = Job::new("t", "A");
        old_error.status = JobStatus::Error;
        old_error.finished_at = Some(now - chrono::Duration::days(2));
        f.jobs.add(old_error).await.unwrap();

        let metrics = f.worker.collect_metrics(now).await.unwrap();
        assert_eq!(metrics.host_group, "A");
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.in_progress, 1);
        assert_eq!(metrics.completed_last_24h, 1);
        assert_eq!(metrics.errors_last_24h, 0);
        assert!((metrics.avg_duration_secs - 10.0).abs() < f64::EPSILON);
    }
}
