use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DispatchError, Result};
use crate::scheduler::TaskDefinition;

/// One job worker: the unit that owns dispatch and monitoring for a host
/// group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
    pub host_group: String,
    /// Capacity of the worker's in-memory job store.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
}

fn default_max_jobs() -> usize {
    10_000
}

impl WorkerConfig {
    pub fn new(host_group: impl Into<String>) -> Self {
        Self {
            host_group: host_group.into(),
            max_jobs: default_max_jobs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub listen_addr: SocketAddr,
    /// Period of the dispatch tick (clean not-started, execute, cancel).
    pub execution_interval_ms: u64,
    /// Period of the heartbeat-loss check.
    pub heartbeat_interval_ms: u64,
    /// Period of the run-timeout check.
    pub timeout_interval_ms: u64,
    /// Run time allowed when the task definition has no override.
    pub default_job_timeout_ms: u64,
    /// How long a job may wait in `Pending` before it is failed.
    pub start_timeout_ms: u64,
    /// Silence after which a running job counts as lost.
    pub heartbeat_timeout_ms: u64,
    /// Pending jobs created before `now - job_max_age_ms` are ignored by the
    /// workers; dispatched jobs are watched until they finish.
    pub job_max_age_ms: u64,
    /// Host groups that hosts may register under.
    pub host_groups: Vec<String>,
    pub workers: Vec<WorkerConfig>,
    pub tasks: Vec<TaskDefinition>,
    pub metrics_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            execution_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            timeout_interval_ms: 10_000,
            default_job_timeout_ms: 60 * 60 * 1_000,
            start_timeout_ms: 5 * 60 * 1_000,
            heartbeat_timeout_ms: 60 * 1_000,
            job_max_age_ms: 7 * 24 * 60 * 60 * 1_000,
            host_groups: Vec::new(),
            workers: Vec::new(),
            tasks: Vec::new(),
            metrics_enabled: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Whitelist `group` and give it a job worker.
    pub fn with_host_group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.workers.push(WorkerConfig::new(group.clone()));
        self.host_groups.push(group);
        self
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn execution_interval(&self) -> Duration {
        Duration::from_millis(self.execution_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timeout_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_interval_ms)
    }

    pub fn default_job_timeout(&self) -> Duration {
        Duration::from_millis(self.default_job_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn job_max_age(&self) -> Duration {
        Duration::from_millis(self.job_max_age_ms)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("execution_interval_ms", self.execution_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("timeout_interval_ms", self.timeout_interval_ms),
            ("default_job_timeout_ms", self.default_job_timeout_ms),
            ("start_timeout_ms", self.start_timeout_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("job_max_age_ms", self.job_max_age_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(DispatchError::Config(format!("{} must be positive", name)));
            }
        }

        if self.job_max_age_ms < self.start_timeout_ms {
            return Err(DispatchError::Config(
                "job_max_age_ms must not be shorter than start_timeout_ms".to_string(),
            ));
        }

        if self.host_groups.is_empty() {
            return Err(DispatchError::Config(
                "at least one host group must be configured".to_string(),
            ));
        }
        let known: HashSet<&str> = self.host_groups.iter().map(String::as_str).collect();
        if known.iter().any(|g| g.is_empty()) {
            return Err(DispatchError::Config(
                "host group names must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !known.contains(worker.host_group.as_str()) {
                return Err(DispatchError::Config(format!(
                    "worker references unknown host group '{}'",
                    worker.host_group
                )));
            }
            if !seen.insert(worker.host_group.as_str()) {
                return Err(DispatchError::Config(format!(
                    "host group '{}' has more than one worker",
                    worker.host_group
                )));
            }
            if worker.max_jobs == 0 {
                return Err(DispatchError::Config(format!(
                    "worker '{}' must allow at least one job",
                    worker.host_group
                )));
            }
        }

        for task in &self.tasks {
            if let Some(group) = task.host_group.as_deref() {
                if !known.contains(group) {
                    return Err(DispatchError::Config(format!(
                        "task '{}' targets unknown host group '{}'",
                        task.id, group
                    )));
                }
            }
        }
        Ok(())
    }

    /// Overlay values from a config file. Unset file fields keep their
    /// current value.
    pub fn apply_file(mut self, file: FileConfig) -> Result<Self> {
        if let Some(addr) = file.listen_addr {
            self.listen_addr = addr.parse().map_err(|e| {
                DispatchError::Config(format!("invalid listen_addr '{}': {}", addr, e))
            })?;
        }
        let overlays = [
            (file.execution_interval_ms, &mut self.execution_interval_ms),
            (file.heartbeat_interval_ms, &mut self.heartbeat_interval_ms),
            (file.timeout_interval_ms, &mut self.timeout_interval_ms),
            (file.default_job_timeout_ms, &mut self.default_job_timeout_ms),
            (file.start_timeout_ms, &mut self.start_timeout_ms),
            (file.heartbeat_timeout_ms, &mut self.heartbeat_timeout_ms),
            (file.job_max_age_ms, &mut self.job_max_age_ms),
        ];
        for (value, field) in overlays {
            if let Some(v) = value {
                *field = v;
            }
        }
        if let Some(enabled) = file.metrics_enabled {
            self.metrics_enabled = enabled;
        }

        if let Some(groups) = file.host_groups {
            self.host_groups = groups;
        }
        match file.workers {
            Some(workers) => self.workers = workers,
            // One worker per whitelisted group unless workers are listed.
            None => {
                self.workers = self.host_groups.iter().map(WorkerConfig::new).collect();
            }
        }
        self.tasks.extend(file.tasks);
        Ok(self)
    }
}

/// On-disk configuration (TOML). Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_addr: Option<String>,
    pub execution_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub timeout_interval_ms: Option<u64>,
    pub default_job_timeout_ms: Option<u64>,
    pub start_timeout_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub job_max_age_ms: Option<u64>,
    pub metrics_enabled: Option<bool>,
    pub host_groups: Option<Vec<String>>,
    pub workers: Option<Vec<WorkerConfig>>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DispatchError::Config(e.to_string()))
    }
}
