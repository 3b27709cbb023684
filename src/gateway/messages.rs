//! Frames exchanged with worker hosts over the real-time channel.
//!
//! Every frame is a JSON object tagged by `type`, e.g.
//! `{"type":"heartbeat","job_id":"..."}`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hosts::HostClaims;
use crate::scheduler::TaskDefinition;

/// Host → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Must be the first frame on a new connection.
    Register {
        host_name: String,
        #[serde(default)]
        claims: HostClaims,
    },
    Heartbeat {
        job_id: Uuid,
    },
    Completed {
        job_id: Uuid,
        #[serde(default)]
        result: Option<String>,
    },
    Failed {
        job_id: Uuid,
        error: String,
    },
    /// Acknowledges a cancel request; the host has stopped the job.
    Cancelled {
        job_id: Uuid,
    },
}

/// Server → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        host_name: String,
        group: Option<String>,
    },
    Rejected {
        reason: String,
    },
    Execute {
        job_id: Uuid,
        task: TaskDefinition,
        parameters: HashMap<String, String>,
    },
    Cancel {
        job_id: Uuid,
    },
}

/// Outcome reported by a host about one of its jobs, as consumed by the job
/// worker that owns the host's group.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Heartbeat {
        job_id: Uuid,
        host: String,
        at: DateTime<Utc>,
    },
    Completed {
        job_id: Uuid,
        host: String,
        result: Option<String>,
        at: DateTime<Utc>,
    },
    Failed {
        job_id: Uuid,
        host: String,
        error: String,
        at: DateTime<Utc>,
    },
    Cancelled {
        job_id: Uuid,
        host: String,
        at: DateTime<Utc>,
    },
}

impl HostEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            HostEvent::Heartbeat { job_id, .. }
            | HostEvent::Completed { job_id, .. }
            | HostEvent::Failed { job_id, .. }
            | HostEvent::Cancelled { job_id, .. } => *job_id,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            HostEvent::Heartbeat { host, .. }
            | HostEvent::Completed { host, .. }
            | HostEvent::Failed { host, .. }
            | HostEvent::Cancelled { host, .. } => host,
        }
    }

    /// Convert an inbound frame into an event. `Register` has no event form.
    pub fn from_message(host: &str, message: HostMessage, at: DateTime<Utc>) -> Option<Self> {
        let host = host.to_string();
        match message {
            HostMessage::Register { .. } => None,
            HostMessage::Heartbeat { job_id } => Some(HostEvent::Heartbeat { job_id, host, at }),
            HostMessage::Completed { job_id, result } => Some(HostEvent::Completed {
                job_id,
                host,
                result,
                at,
            }),
            HostMessage::Failed { job_id, error } => Some(HostEvent::Failed {
                job_id,
                host,
                error,
                at,
            }),
            HostMessage::Cancelled { job_id } => Some(HostEvent::Cancelled { job_id, host, at }),
        }
    }
}
