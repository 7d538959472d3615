// Background Jobs Service
//
// Scheduled background jobs for the bridge: incremental sync, SLA checks,
// and queue maintenance, wired through tokio-cron-scheduler.

pub mod scheduler;

pub use scheduler::{JobError, JobExecutionLog, JobIntervals, JobResult, JobScheduler, JobStatus};
