//! Reconnect audit of active jobs.
//!
//! Runs once per successful reconnect. A call dispatched but never
//! acknowledged within the ack window is treated as never delivered; an
//! acknowledged call past its step timeout is treated as lost mid-work.
//! Everything else is left to finish normally.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::JobTimeouts;
use crate::jobs::manager::JobManager;
use crate::rpc::ConnectionEvent;

pub const NEVER_DELIVERED_MESSAGE: &str = "interrupted: request never delivered to worker";
pub const TIMED_OUT_MESSAGE: &str = "interrupted: worker timed out mid-work";

/// Outcome of one audit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub never_delivered: Vec<String>,
    pub timed_out: Vec<String>,
    pub untouched: Vec<String>,
}

pub struct ReconnectReconciler {
    jobs: JobManager,
    timeouts: JobTimeouts,
}

impl ReconnectReconciler {
    pub fn new(jobs: JobManager, timeouts: JobTimeouts) -> Self {
        Self { jobs, timeouts }
    }

    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconcile_at(Utc::now()).await
    }

    /// Audit every active job as of `now`.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let active = match self.jobs.store().list_active_jobs().await {
            Ok(active) => active,
            Err(e) => {
                error!(error = %e, "Failed to list active jobs for reconcile");
                return report;
            }
        };

        let exceeded = |since: DateTime<Utc>, limit: std::time::Duration| {
            now.signed_duration_since(since)
                .to_std()
                .is_ok_and(|elapsed| elapsed > limit)
        };

        for job in active {
            let verdict = match (job.dispatched_at, job.acknowledged_at) {
                (Some(dispatched), None) if exceeded(dispatched, self.timeouts.ack) => {
                    Some(NEVER_DELIVERED_MESSAGE)
                }
                (_, Some(_))
                    if self
                        .timeouts
                        .for_step(job.step)
                        .is_some_and(|limit| exceeded(job.updated_at, limit)) =>
                {
                    Some(TIMED_OUT_MESSAGE)
                }
                _ => None,
            };

            match verdict {
                Some(reason) if self.jobs.interrupt(&job, reason).await.is_some() => {
                    if reason == NEVER_DELIVERED_MESSAGE {
                        report.never_delivered.push(job.device_id);
                    } else {
                        report.timed_out.push(job.device_id);
                    }
                }
                _ => report.untouched.push(job.device_id),
            }
        }

        info!(
            never_delivered = report.never_delivered.len(),
            timed_out = report.timed_out.len(),
            untouched = report.untouched.len(),
            "Reconnect reconcile complete"
        );
        report
    }
}

/// Spawn a task that reconciles after every reconnect.
pub fn spawn_reconnect_listener(
    reconciler: Arc<ReconnectReconciler>,
    mut events: broadcast::Receiver<ConnectionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Reconnected) => {
                    reconciler.reconcile().await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection events lagged, reconciling");
                    reconciler.reconcile().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
