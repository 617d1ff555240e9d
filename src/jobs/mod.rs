//! Durable job queue and the single-flight worker that drains it.

pub mod events;
pub mod model;
pub mod scheduler;
pub mod store;

pub use events::{EventBus, FailureKind, JobEvent};
pub use model::{Job, JobId, JobRequest, JobStatus, QueueStatus, VisualConfig};
pub use scheduler::{Collaborators, JobScheduler, SchedulerSettings};
pub use store::{FileJobStore, JobStore};
