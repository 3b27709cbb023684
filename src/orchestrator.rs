use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{DispatchError, Result};
use crate::gateway::{EventRouter, HostGateway};
use crate::hosts::HostRegistry;
use crate::metrics::MetricsSink;
use crate::scheduler::{InMemoryJobStore, InMemoryTaskStore, Job, JobStore, LoadBalancer, TaskStore};
use crate::worker::{JobWorker, WorkerTimeouts, EVENT_QUEUE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Execution,
    Heartbeat,
    Timeout,
}

impl std::fmt::Display for TickKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickKind::Execution => write!(f, "execution"),
            TickKind::Heartbeat => write!(f, "heartbeat"),
            TickKind::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every worker ran; `failed` of them returned an error or panicked.
    Completed { failed: usize },
    /// A tick of the same kind was still running.
    Skipped,
}

/// Single-flight flag for one tick kind.
#[derive(Debug, Default)]
pub struct TickGuard {
    running: AtomicBool,
}

impl TickGuard {
    pub fn try_enter(&self) -> Option<TickPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Held for the duration of a tick; clears the guard on drop.
pub struct TickPermit<'a> {
    guard: &'a TickGuard,
}

impl Drop for TickPermit<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Top-level coordinator: owns the host registry, the gateway, the load
/// balancer and one [`JobWorker`] per configured host group, and drives the
/// workers from three independent periodic ticks.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<HostRegistry>,
    gateway: Arc<HostGateway>,
    balancer: Arc<LoadBalancer>,
    workers: Vec<Arc<JobWorker>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    execution_guard: TickGuard,
    heartbeat_guard: TickGuard,
    timeout_guard: TickGuard,
}

impl Orchestrator {
    /// Build an orchestrator over externally owned stores.
    ///
    /// `job_stores` must hold a store for every configured worker's host
    /// group. Fails on an invalid configuration.
    pub fn new(
        config: OrchestratorConfig,
        mut job_stores: HashMap<String, Arc<dyn JobStore>>,
        tasks: Arc<dyn TaskStore>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(HostRegistry::new(config.host_groups.iter().cloned()));
        let mut router = EventRouter::new();
        let mut queues = Vec::with_capacity(config.workers.len());
        for worker in &config.workers {
            let jobs = job_stores.remove(&worker.host_group).ok_or_else(|| {
                DispatchError::Config(format!(
                    "no job store for host group '{}'",
                    worker.host_group
                ))
            })?;
            let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
            router.add_route(worker.host_group.clone(), tx);
            queues.push((worker.host_group.clone(), jobs, rx));
        }

        let gateway = Arc::new(HostGateway::new(registry.clone(), router));
        let balancer = Arc::new(LoadBalancer::new(registry.clone(), gateway.clone()));
        let timeouts = WorkerTimeouts::from_config(&config);
        let workers = queues
            .into_iter()
            .map(|(group, jobs, rx)| {
                Arc::new(JobWorker::new(
                    group,
                    jobs,
                    tasks.clone(),
                    balancer.clone(),
                    rx,
                    timeouts,
                ))
            })
            .collect();

        let metrics = if config.metrics_enabled { metrics } else { None };

        Ok(Self {
            config,
            registry,
            gateway,
            balancer,
            workers,
            metrics,
            execution_guard: TickGuard::default(),
            heartbeat_guard: TickGuard::default(),
            timeout_guard: TickGuard::default(),
        })
    }

    /// Build an orchestrator with bounded in-memory job stores, one per
    /// worker, and the config's task definitions.
    pub fn in_memory(
        config: OrchestratorConfig,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Result<Self> {
        let job_stores = config
            .workers
            .iter()
            .map(|w| {
                let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::with_capacity(w.max_jobs));
                (w.host_group.clone(), store)
            })
            .collect();
        let tasks = Arc::new(InMemoryTaskStore::from_tasks(config.tasks.clone()));
        Self::new(config, job_stores, tasks, metrics)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<HostGateway> {
        &self.gateway
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn workers(&self) -> &[Arc<JobWorker>] {
        &self.workers
    }

    pub fn worker(&self, group: &str) -> Option<&Arc<JobWorker>> {
        self.workers.iter().find(|w| w.host_group() == group)
    }

    pub fn job_store(&self, group: &str) -> Option<&Arc<dyn JobStore>> {
        self.worker(group).map(|w| w.job_store())
    }

    /// Rebuild host assignments from the job stores. Call once before the
    /// ticks start.
    pub async fn recover(&self) -> Result<usize> {
        let mut restored = 0;
        for worker in &self.workers {
            restored += worker.recover().await?;
        }
        Ok(restored)
    }

    /// Flag a job for cancellation in whichever worker's store holds it.
    pub async fn request_cancel(&self, job_id: &Uuid) -> Result<Job> {
        for worker in &self.workers {
            if worker.job_store().get(job_id).await?.is_some() {
                let job = worker.job_store().request_cancel(job_id).await?;
                tracing::info!(job_id = %job_id, group = %job.host_group, "Cancellation requested");
                return Ok(job);
            }
        }
        Err(DispatchError::JobNotFound(*job_id))
    }

    /// Clean not-started jobs, dispatch pending ones and send cancels, on
    /// every worker in parallel. Publishes metrics afterwards if a sink is
    /// configured.
    pub async fn run_execution_tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let Some(_permit) = self.execution_guard.try_enter() else {
            tracing::warn!(tick = %TickKind::Execution, "Previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let failed = self
            .fan_out(TickKind::Execution, move |worker| async move {
                worker.drain_events().await;
                let cleaned = worker.clean_not_started_jobs(now).await?;
                let dispatched = worker.execute_pending(now).await?;
                let cancels = worker.cancel_requested(now).await?;
                if cleaned + dispatched + cancels > 0 {
                    tracing::debug!(
                        group = %worker.host_group(),
                        cleaned,
                        dispatched,
                        cancels,
                        "Execution tick"
                    );
                }
                Ok(())
            })
            .await;

        if let Some(sink) = &self.metrics {
            self.publish_metrics(sink.as_ref(), now).await;
        }
        TickOutcome::Completed { failed }
    }

    /// Fail dispatched jobs whose host stopped heartbeating.
    pub async fn run_heartbeat_tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let Some(_permit) = self.heartbeat_guard.try_enter() else {
            tracing::warn!(tick = %TickKind::Heartbeat, "Previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let failed = self
            .fan_out(TickKind::Heartbeat, move |worker| async move {
                worker.drain_events().await;
                worker.monitor_in_progress_heartbeat(now).await?;
                Ok(())
            })
            .await;
        TickOutcome::Completed { failed }
    }

    /// Stop jobs that ran past their timeout.
    pub async fn run_timeout_tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let Some(_permit) = self.timeout_guard.try_enter() else {
            tracing::warn!(tick = %TickKind::Timeout, "Previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let failed = self
            .fan_out(TickKind::Timeout, move |worker| async move {
                worker.drain_events().await;
                worker.monitor_timeouts(now).await?;
                Ok(())
            })
            .await;
        TickOutcome::Completed { failed }
    }

    pub async fn run_tick(&self, kind: TickKind, now: DateTime<Utc>) -> TickOutcome {
        match kind {
            TickKind::Execution => self.run_execution_tick(now).await,
            TickKind::Heartbeat => self.run_heartbeat_tick(now).await,
            TickKind::Timeout => self.run_timeout_tick(now).await,
        }
    }

    pub fn is_tick_running(&self, kind: TickKind) -> bool {
        match kind {
            TickKind::Execution => self.execution_guard.is_running(),
            TickKind::Heartbeat => self.heartbeat_guard.is_running(),
            TickKind::Timeout => self.timeout_guard.is_running(),
        }
    }

    fn interval_for(&self, kind: TickKind) -> Duration {
        match kind {
            TickKind::Execution => self.config.execution_interval(),
            TickKind::Heartbeat => self.config.heartbeat_interval(),
            TickKind::Timeout => self.config.timeout_interval(),
        }
    }

    /// Start the three tick loops. They stop when `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        [TickKind::Execution, TickKind::Heartbeat, TickKind::Timeout]
            .into_iter()
            .map(|kind| tokio::spawn(self.clone().tick_loop(kind, shutdown.clone())))
            .collect()
    }

    /// Run the tick loops until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            workers = self.workers.len(),
            execution_interval_ms = self.config.execution_interval_ms,
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            timeout_interval_ms = self.config.timeout_interval_ms,
            "Orchestrator started"
        );
        for handle in self.spawn(shutdown) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Tick loop terminated abnormally");
            }
        }
        tracing::info!("Orchestrator stopped");
    }

    /// Each tick runs in its own task so a slow tick does not hold back the
    /// timer; the next tick of the same kind is then skipped by its guard.
    async fn tick_loop(self: Arc<Self>, kind: TickKind, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval_for(kind));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(tick = %kind, "Tick loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let orchestrator = self.clone();
                    tokio::spawn(async move {
                        orchestrator.run_tick(kind, Utc::now()).await;
                    });
                }
            }
        }
    }

    /// Run `step` for every worker concurrently. Returns how many failed.
    async fn fan_out<F, Fut>(&self, kind: TickKind, step: F) -> usize
    where
        F: Fn(Arc<JobWorker>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for worker in &self.workers {
            let group = worker.host_group().to_string();
            let fut = step(worker.clone());
            set.spawn(async move { (group, fut.await) });
        }

        let mut failed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((group, Err(e))) => {
                    failed += 1;
                    tracing::error!(tick = %kind, group = %group, error = %e, "Worker tick failed");
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(tick = %kind, error = %e, "Worker tick panicked");
                }
            }
        }
        failed
    }

    async fn publish_metrics(&self, sink: &dyn MetricsSink, now: DateTime<Utc>) {
        for worker in &self.workers {
            match worker.collect_metrics(now).await {
                Ok(metrics) => metrics.publish(sink, now),
                Err(e) => {
                    tracing::warn!(group = %worker.host_group(), error = %e, "Failed to collect metrics");
                }
            }
        }
    }
}
