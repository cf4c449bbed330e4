//! Periodic sweep: interrupt stuck jobs, purge old finished ones.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::config::{JobTimeouts, LifecycleConfig};
use crate::jobs::manager::JobManager;

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub interrupted: Vec<String>,
    pub purged: Vec<String>,
}

pub struct JobLifecycleManager {
    jobs: JobManager,
    timeouts: JobTimeouts,
    config: LifecycleConfig,
}

impl JobLifecycleManager {
    pub fn new(jobs: JobManager, timeouts: JobTimeouts, config: LifecycleConfig) -> Self {
        Self {
            jobs,
            timeouts,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.jobs.store().list_active_jobs().await {
            Ok(active) => {
                for job in active {
                    let Some(limit) = self.timeouts.for_step(job.step) else {
                        continue;
                    };
                    let idle = now.signed_duration_since(job.updated_at);
                    if idle.to_std().is_ok_and(|idle| idle > limit) {
                        let reason = format!(
                            "interrupted: no update for {}s while {}",
                            idle.num_seconds(),
                            job.step
                        );
                        if self.jobs.interrupt(&job, &reason).await.is_some() {
                            report.interrupted.push(job.device_id);
                        }
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to list active jobs"),
        }

        match chrono::Duration::from_std(self.config.retention) {
            Ok(retention) => match self.jobs.purge_finished_before(now - retention).await {
                Ok(purged) => report.purged = purged,
                Err(e) => error!(error = %e, "Failed to purge finished jobs"),
            },
            Err(e) => error!(error = %e, "Retention window out of range"),
        }

        if report.interrupted.is_empty() && report.purged.is_empty() {
            debug!("Job sweep found nothing to do");
        } else {
            info!(
                interrupted = report.interrupted.len(),
                purged = report.purged.len(),
                "Job sweep complete"
            );
        }
        report
    }
}

/// Spawn a background task that sweeps on the configured interval.
pub fn spawn_lifecycle_task(lifecycle: Arc<JobLifecycleManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(lifecycle.config().sweep_interval);
        loop {
            interval.tick().await;
            lifecycle.sweep().await;
        }
    })
}
