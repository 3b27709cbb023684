//! Dispatches jobs to remote worker hosts partitioned into host groups.
//!
//! Jobs are not created here: they come from a [`scheduler::JobStore`]
//! supplied by the embedding application. The `hostgrid server` binary runs
//! over empty in-memory stores and is mainly useful for host connectivity and
//! the status endpoints.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod gateway;
pub mod hosts;
pub mod metrics;
pub mod orchestrator;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
