pub mod commander;
pub mod job;
pub mod queue;
pub mod registry;

pub use commander::{Commander, TickOutcome};
pub use job::{AgentId, JobState, PendingJob, QueueJob, ReplayJobData};
pub use queue::{Delivery, JobQueue, QueueCounts, QueueEvent};
pub use registry::{AgentRecord, AgentRegistry, AgentStatus};
