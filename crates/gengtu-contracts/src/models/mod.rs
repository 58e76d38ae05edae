mod account;
mod job;
mod size;

pub use account::Account;
pub use job::{GenerationJob, JobStatus};
pub use size::SizePreset;
