//! Per-host-group job orchestration.
//!
//! Each configured host group gets one [`JobWorker`], which owns the jobs of
//! that group:
//! - **Dispatch**: pending jobs go to the load balancer in priority order
//! - **Cancellation**: flagged jobs get a cancel sent to their host
//! - **Monitoring**: start, heartbeat and run timeouts end stalled jobs
//!
//! # Host events
//!
//! The gateway never touches job state. It pushes [`HostEvent`]s into the
//! worker's queue and the worker applies them at the start of each tick
//! ([`JobWorker::drain_events`]).
//!
//! [`HostEvent`]: crate::gateway::HostEvent

pub mod job_worker;

pub use job_worker::{JobWorker, WorkerTimeouts, EVENT_QUEUE_SIZE};
