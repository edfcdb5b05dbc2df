mod job;
mod state;

pub use job::{Job, JobStatus};
pub use state::{StatusTransition, estimate_progress, parse_log_progress};
