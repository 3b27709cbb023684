//! Registry of connected worker hosts.
//!
//! Host membership is tied to the real-time connection: a host appears when
//! it registers over the gateway and disappears when its last connection
//! drops. Hosts carry a priority and a running-jobs limit that the load
//! balancer uses for placement.

pub mod registry;

pub use registry::{Host, HostClaims, HostRegistry};
