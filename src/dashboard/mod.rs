//! HTTP status surface and the host connection endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{FromRef, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::gateway::{handler::ws_handler, HostGateway};
use crate::metrics::{PrometheusSink, WorkerMetrics};
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct DashboardState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Option<Arc<PrometheusSink>>,
}

impl FromRef<DashboardState> for Arc<HostGateway> {
    fn from_ref(state: &DashboardState) -> Self {
        state.orchestrator.gateway().clone()
    }
}

#[derive(Serialize)]
struct HostResponse {
    name: String,
    group: Option<String>,
    priority: u32,
    capacity: usize,
    load: usize,
    connections: usize,
    last_heartbeat: DateTime<Utc>,
}

#[derive(Serialize)]
struct CancelResponse {
    job_id: String,
    status: String,
    cancel_requested: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/hosts/connect", get(ws_handler))
        .route("/api/hosts", get(list_hosts_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the router on `addr` until `shutdown` is cancelled.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "HTTP server failed");
    }
}

async fn list_hosts_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let balancer = state.orchestrator.balancer();
    let loads = balancer.host_loads();
    let hosts: Vec<HostResponse> = state
        .orchestrator
        .registry()
        .all_members()
        .into_iter()
        .map(|host| HostResponse {
            load: host
                .group
                .as_ref()
                .and_then(|group| loads.get(&(group.clone(), host.name.clone())))
                .copied()
                .unwrap_or(0),
            name: host.name,
            group: host.group,
            priority: host.priority,
            capacity: host.capacity,
            connections: host.connections,
            last_heartbeat: host.last_heartbeat,
        })
        .collect();

    Json(hosts)
}

async fn list_workers_handler(State(state): State<DashboardState>) -> Response {
    let now = Utc::now();
    let mut workers: Vec<WorkerMetrics> = Vec::new();
    for worker in state.orchestrator.workers() {
        match worker.collect_metrics(now).await {
            Ok(metrics) => workers.push(metrics),
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
    Json(workers).into_response()
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Response {
    let Ok(job_id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, format!("invalid job id: {}", id));
    };

    match state.orchestrator.request_cancel(&job_id).await {
        Ok(job) => Json(CancelResponse {
            job_id: job.id.to_string(),
            status: job.status.to_string(),
            cancel_requested: job.cancel_requested,
        })
        .into_response(),
        Err(e @ DispatchError::JobNotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ DispatchError::InvalidTransition { .. }) => {
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Cancel request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn metrics_handler(State(state): State<DashboardState>) -> Response {
    let Some(sink) = state.metrics else {
        return error_response(StatusCode::NOT_FOUND, "metrics are disabled".to_string());
    };
    match sink.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}
