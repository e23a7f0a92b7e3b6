pub mod queue;
pub mod status;
pub mod worker;

pub use queue::{ChannelJobQueue, Job, JobQueue};
pub use status::{JobState, JobStatus, JobStatusStore};
pub use worker::Worker;
