use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::gateway::messages::{HostEvent, HostMessage, ServerMessage};
use crate::hosts::{Host, HostClaims, HostRegistry};
use crate::scheduler::TaskDefinition;

/// Frames buffered per connection before the host counts as unreachable.
const OUTBOUND_QUEUE_SIZE: usize = 64;

pub type ConnectionId = u64;

/// Commands the orchestrator sends to one specific host, addressed by its
/// group and name.
///
/// Both calls return immediately: an unreachable or saturated host yields
/// [`DispatchError::HostNotAvailable`] instead of waiting.
#[async_trait]
pub trait HostCommandSender: Send + Sync {
    async fn execute(
        &self,
        job_id: Uuid,
        task: &TaskDefinition,
        parameters: &HashMap<String, String>,
        group: &str,
        host: &str,
    ) -> Result<()>;

    async fn cancel(&self, job_id: Uuid, group: &str, host: &str) -> Result<()>;

    fn is_connected(&self, group: &str, host: &str) -> bool;
}

/// Routes host events to the job worker that owns the host's group.
#[derive(Debug, Clone, Default)]
pub struct EventRouter {
    routes: HashMap<String, mpsc::Sender<HostEvent>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, group: impl Into<String>, tx: mpsc::Sender<HostEvent>) {
        self.routes.insert(group.into(), tx);
    }

    pub async fn route(&self, group: Option<&str>, event: HostEvent) {
        let Some(tx) = group.and_then(|g| self.routes.get(g)) else {
            tracing::warn!(
                job_id = %event.job_id(),
                host = event.host(),
                group = ?group,
                "No worker for host group, dropping event"
            );
            return;
        };
        if tx.send(event).await.is_err() {
            tracing::warn!(group = ?group, "Job worker event channel closed");
        }
    }
}

struct Connection {
    host_name: String,
    group: Option<String>,
    sender: mpsc::Sender<ServerMessage>,
}

/// Live duplex connections to worker hosts.
///
/// Registration and teardown keep the [`HostRegistry`] in step with the set
/// of open connections.
pub struct HostGateway {
    registry: Arc<HostRegistry>,
    router: EventRouter,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
}

impl HostGateway {
    pub fn new(registry: Arc<HostRegistry>, router: EventRouter) -> Self {
        Self {
            registry,
            router,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    /// Register a new connection for `host_name`.
    ///
    /// Returns the connection id and the receiver the transport drains to
    /// deliver frames to the host.
    pub fn connect(
        &self,
        host_name: &str,
        claims: &HostClaims,
    ) -> Result<(ConnectionId, Host, mpsc::Receiver<ServerMessage>)> {
        let host = self.registry.add_member(host_name, claims)?;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Connection {
                    host_name: host_name.to_string(),
                    group: claims.group.clone(),
                    sender: tx,
                },
            );
        tracing::debug!(connection = id, host = host_name, "Host connection opened");
        Ok((id, host, rx))
    }

    /// Tear down a connection and its registry membership.
    pub fn disconnect(&self, id: ConnectionId) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(conn) = removed {
            self.registry
                .remove_member(&conn.host_name, conn.group.as_deref());
            tracing::info!(connection = id, host = %conn.host_name, "Host disconnected");
        }
    }

    /// Handle a frame received on connection `id`.
    pub async fn handle_message(&self, id: ConnectionId, message: HostMessage) {
        let (host_name, group) = {
            let conns = self.connections.read().unwrap_or_else(|e| e.into_inner());
            match conns.get(&id) {
                Some(c) => (c.host_name.clone(), c.group.clone()),
                None => {
                    tracing::warn!(connection = id, "Message on unknown connection");
                    return;
                }
            }
        };

        let now = Utc::now();
        if matches!(message, HostMessage::Heartbeat { .. }) {
            self.registry.touch(&host_name, now);
        }
        match HostEvent::from_message(&host_name, message, now) {
            Some(event) => self.router.route(group.as_deref(), event).await,
            None => {
                tracing::warn!(connection = id, host = %host_name, "Duplicate register ignored");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Most recently opened live connection for `host` registered in `group`.
    fn sender_for(&self, group: &str, host: &str) -> Option<mpsc::Sender<ServerMessage>> {
        let conns = self.connections.read().unwrap_or_else(|e| e.into_inner());
        conns
            .iter()
            .filter(|(_, c)| {
                c.host_name == host && c.group.as_deref() == Some(group) && !c.sender.is_closed()
            })
            .max_by_key(|(id, _)| **id)
            .map(|(_, c)| c.sender.clone())
    }

    fn send(&self, job_id: Uuid, group: &str, host: &str, message: ServerMessage) -> Result<()> {
        let sender = self
            .sender_for(group, host)
            .ok_or(DispatchError::HostNotAvailable(job_id))?;
        sender.try_send(message).map_err(|e| {
            tracing::debug!(job_id = %job_id, host, error = %e, "Host outbound queue rejected frame");
            DispatchError::HostNotAvailable(job_id)
        })
    }
}

#[async_trait]
impl HostCommandSender for HostGateway {
    async fn execute(
        &self,
        job_id: Uuid,
        task: &TaskDefinition,
        parameters: &HashMap<String, String>,
        group: &str,
        host: &str,
    ) -> Result<()> {
        if task.id.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "task definition id must not be empty".to_string(),
            ));
        }
        if host.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "host name must not be empty".to_string(),
            ));
        }

        self.send(
            job_id,
            group,
            host,
            ServerMessage::Execute {
                job_id,
                task: task.clone(),
                parameters: parameters.clone(),
            },
        )?;
        tracing::info!(job_id = %job_id, group, host, task = %task.id, "Execute sent");
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid, group: &str, host: &str) -> Result<()> {
        if host.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "host name must not be empty".to_string(),
            ));
        }
        self.send(job_id, group, host, ServerMessage::Cancel { job_id })?;
        tracing::info!(job_id = %job_id, group, host, "Cancel sent");
        Ok(())
    }

    fn is_connected(&self, group: &str, host: &str) -> bool {
        self.sender_for(group, host).is_some()
    }
}
