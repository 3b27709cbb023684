pub mod balancer;
pub mod job;
pub mod store;
pub mod task;

pub use balancer::{DispatchOutcome, LoadBalancer};
pub use job::{Job, JobStatus};
pub use store::{InMemoryJobStore, InMemoryTaskStore, JobQuery, JobStore, TaskStore, Transition};
pub use task::TaskDefinition;
