// Job Scheduler - central scheduler for all background jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use crate::notify::NotificationQueue;
use crate::sla::SlaEngine;
use crate::sync::SyncEngine;
use snowbridge_shared::{DeliveryChannel, Notification, NotificationPriority};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
    #[error("job execution error: {0}")]
    Execution(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

#[derive(Debug, Clone, Copy)]
pub struct JobIntervals {
    pub sync_interval_minutes: u32,
    pub sla_check_interval_minutes: u32,
}

pub struct JobScheduler {
    scheduler: Mutex<Option<TokioScheduler>>,
    sync_engine: Arc<SyncEngine>,
    sla_engine: Arc<SlaEngine>,
    queue: Arc<NotificationQueue>,
    intervals: JobIntervals,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
    running: AtomicBool,
}

async fn push_log(logs: &RwLock<Vec<JobExecutionLog>>, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    // Keep only the last 100 runs.
    if logs.len() > 100 {
        logs.remove(0);
    }
}

fn finish_log(
    id: Uuid,
    job_name: &str,
    started_at: DateTime<Utc>,
    items_processed: i32,
    errors: Vec<String>,
) -> JobExecutionLog {
    let completed_at = Utc::now();
    JobExecutionLog {
        id,
        job_name: job_name.to_string(),
        started_at,
        completed_at: Some(completed_at),
        status: if errors.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::PartialFailure
        },
        items_processed,
        errors,
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    }
}

impl JobScheduler {
    pub fn new(
        sync_engine: Arc<SyncEngine>,
        sla_engine: Arc<SlaEngine>,
        queue: Arc<NotificationQueue>,
        intervals: JobIntervals,
    ) -> Self {
        Self {
            scheduler: Mutex::new(None),
            sync_engine,
            sla_engine,
            queue,
            intervals,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
            running: AtomicBool::new(false),
        }
    }

    /// Schedule all recurring jobs and start the ticker. Idempotent.
    pub async fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("starting background job scheduler");
        self.sync_engine.start().await;

        let scheduler = TokioScheduler::new().await?;
        self.schedule_incremental_sync(&scheduler).await?;
        self.schedule_sla_check(&scheduler).await?;
        self.schedule_queue_maintenance(&scheduler).await?;
        scheduler.start().await?;

        *self.scheduler.lock().await = Some(scheduler);
        info!("background job scheduler started");
        Ok(())
    }

    /// Stop the ticker and drain in-flight sync work. Idempotent.
    pub async fn stop(&self) -> JobResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        info!("shutting down background job scheduler");
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await?;
        }
        self.sync_engine.stop().await;
        Ok(())
    }

    async fn schedule_incremental_sync(&self, scheduler: &TokioScheduler) -> JobResult<()> {
        let interval = self.intervals.sync_interval_minutes.max(1);
        let cron_expr = format!("0 */{} * * * *", interval);

        let sync_engine = self.sync_engine.clone();
        let queue = self.queue.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let sync_engine = sync_engine.clone();
            let queue = queue.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log_id = Uuid::new_v4();
                let started_at = Utc::now();

                info!("running incremental sync job");
                let run = sync_engine.incremental_sync().await;

                let errors: Vec<String> = run
                    .per_table
                    .values()
                    .flat_map(|r| r.errors.iter().cloned())
                    .collect();
                push_log(
                    &logs,
                    finish_log(
                        log_id,
                        "Incremental Sync",
                        started_at,
                        run.total_synced() as i32,
                        errors,
                    ),
                )
                .await;

                info!(
                    synced = run.total_synced(),
                    errors = run.total_errors(),
                    "incremental sync completed"
                );

                let status = Notification::new(
                    if run.total_errors() == 0 {
                        "SYNC_COMPLETED"
                    } else {
                        "SYNC_FAILED"
                    },
                    NotificationPriority::Low,
                    "sync-engine",
                    format!("incremental sync: {} records", run.total_synced()),
                    serde_json::json!({
                        "synced": run.total_synced(),
                        "errors": run.total_errors(),
                        "aborted": run.aborted,
                    }),
                );
                if let Err(e) = queue
                    .enqueue(status, vec![DeliveryChannel::SocketSubscription])
                    .await
                {
                    tracing::debug!(error = %e, "sync status notification rejected");
                }
            })
        })?;

        scheduler.add(job).await?;
        info!(interval_minutes = interval, "scheduled incremental sync");
        Ok(())
    }

    async fn schedule_sla_check(&self, scheduler: &TokioScheduler) -> JobResult<()> {
        let interval = self.intervals.sla_check_interval_minutes.max(1);
        let cron_expr = format!("0 */{} * * * *", interval);

        let sla_engine = self.sla_engine.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let sla_engine = sla_engine.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log_id = Uuid::new_v4();
                let started_at = Utc::now();

                info!("running SLA check job");
                match sla_engine.run_check().await {
                    Ok(result) => {
                        info!(
                            checked = result.instances_checked,
                            breaches = result.breaches_detected,
                            "SLA check completed"
                        );
                        push_log(
                            &logs,
                            finish_log(
                                log_id,
                                "SLA Checker",
                                started_at,
                                result.instances_checked,
                                result.errors,
                            ),
                        )
                        .await;
                    }
                    Err(e) => {
                        error!(error = %e, "SLA check failed");
                        push_log(
                            &logs,
                            finish_log(log_id, "SLA Checker", started_at, 0, vec![e.to_string()]),
                        )
                        .await;
                    }
                }
            })
        })?;

        scheduler.add(job).await?;
        info!(interval_minutes = interval, "scheduled SLA checker");
        Ok(())
    }

    async fn schedule_queue_maintenance(&self, scheduler: &TokioScheduler) -> JobResult<()> {
        let queue = self.queue.clone();

        // Hourly: bound the dead-letter list and log queue health.
        let job = Job::new_async("0 7 * * * *", move |_uuid, _lock| {
            let queue = queue.clone();
            Box::pin(async move {
                let trimmed = queue.trim_dead_letters(500).await;
                let dead_letters = queue.dead_letter_count().await;
                info!(
                    depth = queue.depth(),
                    dead_letters,
                    trimmed,
                    "notification queue maintenance"
                );
            })
        })?;

        scheduler.add(job).await?;
        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    /// On-demand job trigger, also used by operational tooling.
    pub async fn run_job_now(&self, job_name: &str) -> JobResult<()> {
        match job_name {
            "full_sync" => {
                let run = self.sync_engine.full_sync().await;
                if run.aborted {
                    return Err(JobError::Execution("full sync aborted".to_string()));
                }
            }
            "incremental_sync" => {
                self.sync_engine.incremental_sync().await;
            }
            "sla_check" => {
                self.sla_engine
                    .run_check()
                    .await
                    .map_err(|e| JobError::Execution(e.to_string()))?;
            }
            other => return Err(JobError::UnknownJob(other.to_string())),
        }
        Ok(())
    }
}
