use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

pub const DEFAULT_PRIORITY: u32 = 1;
pub const DEFAULT_RUNNING_JOBS_LIMIT: usize = 1;

/// Claims a host presents when it registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostClaims {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub running_jobs_limit: Option<usize>,
}

impl HostClaims {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            priority: None,
            running_jobs_limit: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.running_jobs_limit = Some(limit);
        self
    }
}

/// A connected worker host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub name: String,
    pub group: Option<String>,
    pub priority: u32,
    /// Maximum number of jobs the host runs at once.
    pub capacity: usize,
    pub last_heartbeat: DateTime<Utc>,
    /// Live registrations sharing this name and group.
    pub connections: usize,
}

impl Host {
    fn from_claims(name: &str, claims: &HostClaims) -> Self {
        Self {
            name: name.to_string(),
            group: claims.group.clone(),
            priority: claims.priority.unwrap_or(DEFAULT_PRIORITY),
            capacity: claims
                .running_jobs_limit
                .unwrap_or(DEFAULT_RUNNING_JOBS_LIMIT)
                .max(1),
            last_heartbeat: Utc::now(),
            connections: 1,
        }
    }
}

/// Connection-scoped membership of hosts, partitioned by host group.
///
/// A host that reconnects before its old connection is torn down registers
/// twice under the same name and group; the second registration only bumps
/// `connections`, and the entry is evicted once every registration is gone.
#[derive(Debug, Default)]
pub struct HostRegistry {
    allowed_groups: HashSet<String>,
    // group -> (host name -> host)
    members: RwLock<HashMap<Option<String>, HashMap<String, Host>>>,
}

impl HostRegistry {
    pub fn new<I, S>(allowed_groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_groups: allowed_groups.into_iter().map(Into::into).collect(),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_known_group(&self, group: &str) -> bool {
        self.allowed_groups.contains(group)
    }

    /// Register or refresh a host.
    ///
    /// Hosts without a group are accepted but never receive jobs.
    pub fn add_member(&self, name: &str, claims: &HostClaims) -> Result<Host> {
        if name.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "host name must not be empty".to_string(),
            ));
        }
        if let Some(group) = claims.group.as_deref() {
            if !self.is_known_group(group) {
                return Err(DispatchError::UnknownHostGroup(group.to_string()));
            }
        }

        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        let group_members = members.entry(claims.group.clone()).or_default();
        let host = match group_members.get_mut(name) {
            Some(existing) => {
                existing.connections += 1;
                existing.priority = claims.priority.unwrap_or(DEFAULT_PRIORITY);
                existing.capacity = claims
                    .running_jobs_limit
                    .unwrap_or(DEFAULT_RUNNING_JOBS_LIMIT)
                    .max(1);
                existing.last_heartbeat = Utc::now();
                existing.clone()
            }
            None => {
                let host = Host::from_claims(name, claims);
                group_members.insert(name.to_string(), host.clone());
                host
            }
        };

        tracing::info!(
            host = %host.name,
            group = ?host.group,
            priority = host.priority,
            capacity = host.capacity,
            connections = host.connections,
            "Host registered"
        );
        Ok(host)
    }

    /// Drop one registration of `name` in `group`. Returns true if the host
    /// left the registry entirely.
    pub fn remove_member(&self, name: &str, group: Option<&str>) -> bool {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        let key = group.map(str::to_string);
        let Some(group_members) = members.get_mut(&key) else {
            return false;
        };
        let Some(host) = group_members.get_mut(name) else {
            return false;
        };

        host.connections = host.connections.saturating_sub(1);
        if host.connections > 0 {
            tracing::debug!(host = name, group = ?group, remaining = host.connections, "Host connection closed");
            return false;
        }

        group_members.remove(name);
        if group_members.is_empty() {
            members.remove(&key);
        }
        tracing::info!(host = name, group = ?group, "Host removed");
        true
    }

    /// Snapshot of a group's members, ordered by name.
    pub fn group_members(&self, group: &str) -> Vec<Host> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        let mut hosts: Vec<Host> = members
            .get(&Some(group.to_string()))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    pub fn all_members(&self) -> Vec<Host> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        let mut hosts: Vec<Host> = members
            .values()
            .flat_map(|m| m.values().cloned())
            .collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name).then(a.group.cmp(&b.group)));
        hosts
    }

    pub fn contains(&self, name: &str) -> bool {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members.values().any(|m| m.contains_key(name))
    }

    /// Number of distinct host entries across all groups.
    pub fn count(&self) -> usize {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members.values().map(HashMap::len).sum()
    }

    pub fn get(&self, name: &str) -> Option<Host> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members.values().find_map(|m| m.get(name).cloned())
    }

    /// Record a sign of life from every registration of `name`.
    pub fn touch(&self, name: &str, at: DateTime<Utc>) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        for group_members in members.values_mut() {
            if let Some(host) = group_members.get_mut(name) {
                host.last_heartbeat = at;
            }
        }
    }
}
