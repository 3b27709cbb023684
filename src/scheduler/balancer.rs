use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::gateway::HostCommandSender;
use crate::hosts::HostRegistry;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::store::{JobStore, Transition};
use crate::scheduler::task::TaskDefinition;

/// Result of a dispatch attempt that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Job sent to `host` and moved to `Starting`.
    Dispatched { host: String },
    /// No connected host in the group has spare capacity; retry next tick.
    Deferred,
    /// The job already left `Pending` or already holds an assignment.
    Stale,
}

enum Reservation {
    Host(String),
    AlreadyAssigned,
    NoCandidate,
}

/// A job's placement: the host name within the job's group.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Assignment {
    group: String,
    host: String,
}

/// Places jobs on hosts and tracks which host runs which job.
///
/// Hosts are ranked by priority (highest first), then current load (lowest
/// first), then name. Slot reservation happens under a single lock so
/// concurrent dispatches never push a host past its capacity and a job never
/// holds two assignments.
///
/// A host is identified by its group and name together: the same name
/// registered in two groups is two hosts with separate capacity.
pub struct LoadBalancer {
    registry: Arc<HostRegistry>,
    sender: Arc<dyn HostCommandSender>,
    assignments: Mutex<HashMap<Uuid, Assignment>>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<HostRegistry>, sender: Arc<dyn HostCommandSender>) -> Self {
        Self {
            registry,
            sender,
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Place a pending job on the best eligible host in its group.
    pub async fn dispatch(
        &self,
        store: &dyn JobStore,
        job: &Job,
        task: &TaskDefinition,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        if job.status != JobStatus::Pending {
            return Ok(DispatchOutcome::Stale);
        }

        let group = job.host_group.as_str();
        let mut unreachable = HashSet::new();
        loop {
            let host = match self.reserve(job.id, group, &unreachable) {
                Reservation::Host(host) => host,
                Reservation::AlreadyAssigned => return Ok(DispatchOutcome::Stale),
                Reservation::NoCandidate => {
                    tracing::debug!(job_id = %job.id, group, "No eligible host");
                    return Ok(DispatchOutcome::Deferred);
                }
            };

            match self
                .sender
                .execute(job.id, task, &job.parameters, group, &host)
                .await
            {
                Ok(()) => {}
                Err(DispatchError::HostNotAvailable(_)) => {
                    tracing::warn!(job_id = %job.id, group, host = %host, "Host unreachable, trying next");
                    self.release(&job.id);
                    unreachable.insert(host);
                    continue;
                }
                Err(e) => {
                    self.release(&job.id);
                    return Err(e);
                }
            }

            let transition =
                Transition::new(JobStatus::Pending, JobStatus::Starting, now).with_host(&host);
            return match store.transition(&job.id, transition).await {
                Ok(Some(_)) => {
                    tracing::info!(job_id = %job.id, group, host = %host, "Job dispatched");
                    Ok(DispatchOutcome::Dispatched { host })
                }
                Ok(None) => {
                    tracing::info!(job_id = %job.id, host = %host, "Job left pending during dispatch, recalling");
                    self.recall(job.id, group, &host).await;
                    Ok(DispatchOutcome::Stale)
                }
                Err(e) => {
                    self.recall(job.id, group, &host).await;
                    Err(e)
                }
            };
        }
    }

    /// Ask the host running `job` to stop.
    ///
    /// Fails with [`DispatchError::HostNotAvailable`] if the job has no
    /// assignment or its host cannot be reached; the job is left untouched
    /// either way.
    pub async fn cancel(&self, job: &Job) -> Result<()> {
        let assignment = self
            .assignments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job.id)
            .cloned()
            .ok_or(DispatchError::HostNotAvailable(job.id))?;
        self.sender
            .cancel(job.id, &assignment.group, &assignment.host)
            .await
    }

    /// Drop the assignment for `job_id`, freeing its host slot. Returns the
    /// host it was placed on.
    pub fn release(&self, job_id: &Uuid) -> Option<String> {
        self.assignments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id)
            .map(|a| a.host)
    }

    /// Reinstate an assignment read back from the job store.
    pub fn restore(&self, job_id: Uuid, group: impl Into<String>, host: impl Into<String>) {
        self.assignments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                job_id,
                Assignment {
                    group: group.into(),
                    host: host.into(),
                },
            );
    }

    /// Host the job is placed on, if any.
    pub fn assignment(&self, job_id: &Uuid) -> Option<String> {
        self.assignments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .map(|a| a.host.clone())
    }

    /// Number of jobs currently assigned to `host` in `group`.
    pub fn load(&self, group: &str, host: &str) -> usize {
        self.assignments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|a| a.group == group && a.host == host)
            .count()
    }

    /// Current load keyed by `(group, host)`.
    pub fn host_loads(&self) -> HashMap<(String, String), usize> {
        let assignments = self.assignments.lock().unwrap_or_else(|e| e.into_inner());
        count_by_host(&assignments)
    }

    fn reserve(&self, job_id: Uuid, group: &str, excluded: &HashSet<String>) -> Reservation {
        let mut assignments = self.assignments.lock().unwrap_or_else(|e| e.into_inner());
        if assignments.contains_key(&job_id) {
            return Reservation::AlreadyAssigned;
        }

        let loads = count_by_host(&assignments);
        let best = self
            .registry
            .group_members(group)
            .into_iter()
            .filter(|h| !excluded.contains(&h.name) && self.sender.is_connected(group, &h.name))
            .map(|h| {
                let load = loads
                    .get(&(group.to_string(), h.name.clone()))
                    .copied()
                    .unwrap_or(0);
                (h, load)
            })
            .filter(|(h, load)| *load < h.capacity)
            .min_by(|(a, a_load), (b, b_load)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a_load.cmp(b_load))
                    .then(a.name.cmp(&b.name))
            });

        match best {
            Some((host, _)) => {
                assignments.insert(
                    job_id,
                    Assignment {
                        group: group.to_string(),
                        host: host.name.clone(),
                    },
                );
                Reservation::Host(host.name)
            }
            None => Reservation::NoCandidate,
        }
    }

    async fn recall(&self, job_id: Uuid, group: &str, host: &str) {
        self.release(&job_id);
        if let Err(e) = self.sender.cancel(job_id, group, host).await {
            tracing::warn!(job_id = %job_id, host, error = %e, "Failed to recall job");
        }
    }
}

fn count_by_host(assignments: &HashMap<Uuid, Assignment>) -> HashMap<(String, String), usize> {
    let mut loads = HashMap::new();
    for a in assignments.values() {
        *loads.entry((a.group.clone(), a.host.clone())).or_insert(0) += 1;
    }
    loads
}
