//! Job manager: operator actions, worker callbacks and dispatch.
//!
//! Every write goes through `JobStore::upsert` and is broadcast as a
//! `JobEvent`. Remote calls run in spawned tasks; a task only applies its
//! result while the job still carries the `dispatched_at` stamp it wrote.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, JobError, RpcError};
use crate::jobs::model::{
    AutocompleteOption, JobEvent, JobStep, JobUpdate, ScrapeJob, SlugConflict,
};
use crate::rpc::protocol::{SLUG_CONFLICT_CODE, SlugConflictDetails};
use crate::rpc::{StreamEvent, WorkerRpc};
use crate::store::JobStore;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Message stored when a search finds nothing.
pub const NO_MATCHES_MESSAGE: &str = "no matching devices";

/// A remote call to make for a job.
#[derive(Debug, Clone)]
enum Call {
    Search { query: String },
    Scrape { slug: String },
}

impl Call {
    fn name(&self) -> &'static str {
        match self {
            Self::Search { .. } => "search",
            Self::Scrape { .. } => "scrape",
        }
    }
}

enum CallResult {
    Search(Vec<AutocompleteOption>),
    Scrape,
}

/// Owns the scrape job state machine.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    worker: Option<Arc<dyn WorkerRpc>>,
    tx: broadcast::Sender<JobEvent>,
}

impl JobManager {
    /// Manager that records transitions but never calls a worker.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            store,
            worker: None,
            tx,
        }
    }

    /// Attach the worker that searches and scrapes.
    pub fn with_worker(mut self, worker: Arc<dyn WorkerRpc>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Subscribe to job updates.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn list_jobs(&self, user_id: &str) -> Result<Vec<ScrapeJob>, JobError> {
        Ok(self.store.list_jobs_for_user(user_id).await?)
    }

    pub async fn get_job(&self, device_id: &str) -> Result<Option<ScrapeJob>, JobError> {
        Ok(self.store.get_job(device_id).await?)
    }

    // ── Operator actions ────────────────────────────────────────────

    /// Start (or restart) the job for a device and dispatch a search.
    ///
    /// Only the owner may restart a finished job; another user gets
    /// `NotOwner` until it is cancelled or purged.
    pub async fn start_scrape_job(
        &self,
        user_id: &str,
        device_id: &str,
        device_name: &str,
    ) -> Result<ScrapeJob, JobError> {
        if let Some(existing) = self.store.get_job(device_id).await? {
            if existing.user_id != user_id {
                return Err(JobError::NotOwner {
                    device_id: device_id.to_string(),
                });
            }
            if existing.step.is_active() {
                return Err(JobError::InvalidState {
                    device_id: device_id.to_string(),
                    step: existing.step.to_string(),
                    action: "start".into(),
                });
            }
            self.store.delete_job(device_id).await?;
        }

        let update = JobUpdate {
            user_id: Some(user_id.to_string()),
            device_name: Some(Some(device_name.to_string())),
            slug: Some(None),
            autocomplete_options: Some(Vec::new()),
            error: Some(None),
            ..JobUpdate::step(JobStep::Searching)
        };
        let job = self.store.upsert(device_id, update).await?;
        info!(device_id = %device_id, user_id = %user_id, device_name = %device_name, "Scrape job started");
        self.emit_updated(&job);

        let call = Call::Search {
            query: device_name.to_string(),
        };
        self.dispatch(job, call).await
    }

    /// Confirm the chosen slug and dispatch the scrape.
    pub async fn confirm_slug(
        &self,
        user_id: &str,
        device_id: &str,
        slug: &str,
    ) -> Result<ScrapeJob, JobError> {
        let job = self.owned_job(device_id, user_id).await?;
        if job.step != JobStep::Selecting {
            return Err(JobError::InvalidState {
                device_id: device_id.to_string(),
                step: job.step.to_string(),
                action: "confirm slug".into(),
            });
        }

        let update = JobUpdate {
            slug: Some(Some(slug.to_string())),
            ..JobUpdate::step(JobStep::Scraping)
        };
        let job = self.store.upsert(device_id, update).await?;
        info!(device_id = %device_id, slug = %slug, "Slug confirmed");
        self.emit_updated(&job);

        let call = Call::Scrape {
            slug: slug.to_string(),
        };
        self.dispatch(job, call).await
    }

    /// Delete the job. Returns `false` without touching anything when the
    /// job is missing or owned by someone else.
    pub async fn cancel_job(&self, device_id: &str, user_id: &str) -> Result<bool, JobError> {
        let Some(job) = self.store.get_job(device_id).await? else {
            return Ok(false);
        };
        if job.user_id != user_id {
            warn!(device_id = %device_id, user_id = %user_id, "Cancel refused: not the owner");
            return Ok(false);
        }

        let deleted = self.store.delete_job(device_id).await?;
        if deleted {
            info!(device_id = %device_id, step = %job.step, "Scrape job cancelled");
            self.emit_removed(device_id, &job.user_id);
        }
        Ok(deleted)
    }

    /// Resume a failed or interrupted job from the furthest step its data
    /// allows: scraping with a slug, selecting with candidates, searching
    /// with only a name.
    pub async fn retry_job(&self, device_id: &str, user_id: &str) -> Result<ScrapeJob, JobError> {
        let job = self.owned_job(device_id, user_id).await?;
        if !job.step.is_retryable() {
            return Err(JobError::InvalidState {
                device_id: device_id.to_string(),
                step: job.step.to_string(),
                action: "retry".into(),
            });
        }

        let (target, call) = if let Some(slug) = &job.slug {
            (JobStep::Scraping, Some(Call::Scrape { slug: slug.clone() }))
        } else if !job.autocomplete_options.is_empty() {
            (JobStep::Selecting, None)
        } else if let Some(name) = &job.device_name {
            (
                JobStep::Searching,
                Some(Call::Search {
                    query: name.clone(),
                }),
            )
        } else {
            return Err(JobError::MissingPrecondition {
                device_id: device_id.to_string(),
                action: "retry".into(),
                missing: "device name, candidates or slug".into(),
            });
        };

        let update = JobUpdate {
            attempts: Some(job.attempts + 1),
            error: Some(None),
            ..JobUpdate::step(target)
        };
        let retried = self.store.upsert(device_id, update).await?;
        info!(
            device_id = %device_id,
            from = %job.step,
            to = %target,
            attempts = retried.attempts,
            "Scrape job retried"
        );
        self.emit_updated(&retried);

        match call {
            Some(call) => self.dispatch(retried, call).await,
            None => Ok(retried),
        }
    }

    async fn owned_job(&self, device_id: &str, user_id: &str) -> Result<ScrapeJob, JobError> {
        let job = self
            .store
            .get_job(device_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                device_id: device_id.to_string(),
            })?;
        if job.user_id != user_id {
            return Err(JobError::NotOwner {
                device_id: device_id.to_string(),
            });
        }
        Ok(job)
    }

    // ── Worker callbacks ────────────────────────────────────────────
    //
    // Each re-reads the job first. A missing job (cancelled) or an illegal
    // transition is logged and ignored.

    /// Search finished. No candidates is a failure.
    pub async fn handle_search_complete(
        &self,
        device_id: &str,
        options: Vec<AutocompleteOption>,
    ) -> Option<ScrapeJob> {
        if options.is_empty() {
            return self
                .transition(device_id, JobUpdate::failed(NO_MATCHES_MESSAGE), "search_complete")
                .await;
        }
        let count = options.len();
        let update = JobUpdate {
            autocomplete_options: Some(options),
            ..JobUpdate::step(JobStep::Selecting)
        };
        let job = self.transition(device_id, update, "search_complete").await?;
        info!(device_id = %device_id, candidates = count, "Search complete");
        Some(job)
    }

    pub async fn handle_scrape_complete(&self, device_id: &str) -> Option<ScrapeJob> {
        let job = self
            .transition(device_id, JobUpdate::step(JobStep::Done), "scrape_complete")
            .await?;
        info!(device_id = %device_id, "Scrape complete");
        Some(job)
    }

    pub async fn handle_scrape_error(&self, device_id: &str, message: &str) -> Option<ScrapeJob> {
        let job = self
            .transition(device_id, JobUpdate::failed(message), "scrape_error")
            .await?;
        warn!(device_id = %device_id, error = %message, attempts = job.attempts, "Scrape job failed");
        Some(job)
    }

    pub async fn handle_slug_conflict(
        &self,
        device_id: &str,
        conflict: SlugConflict,
    ) -> Option<ScrapeJob> {
        let message = format!(
            "slug {} already belongs to device {} ({})",
            conflict.slug, conflict.existing_device_id, conflict.existing_device_name
        );
        let update = JobUpdate {
            slug_conflict: Some(Some(conflict)),
            ..JobUpdate::step(JobStep::SlugConflict).with_error(message)
        };
        let job = self.transition(device_id, update, "slug_conflict").await?;
        warn!(device_id = %device_id, error = ?job.error, "Slug conflict");
        Some(job)
    }

    /// Record progress on an active job without changing its step.
    pub async fn handle_progress(
        &self,
        device_id: &str,
        stage: Option<String>,
        percent: Option<f64>,
        log: Option<String>,
    ) -> Option<ScrapeJob> {
        let job = self.load_for_callback(device_id, "progress").await?;
        if !job.step.is_active() {
            debug!(device_id = %device_id, step = %job.step, "Progress for finished job, ignoring");
            return None;
        }

        let mut update = JobUpdate::default();
        if let Some(stage) = stage {
            update.progress_stage = Some(Some(stage));
        }
        if let Some(percent) = percent.filter(|p| p.is_finite()) {
            update.progress_percent = Some(Some(percent.clamp(0.0, 100.0).round() as u8));
        }
        if let Some(log) = log {
            update.last_log = Some(Some(log));
        }
        self.apply(device_id, update).await
    }

    /// Interrupt an active job, unless it changed since `observed` was read.
    pub async fn interrupt(&self, observed: &ScrapeJob, reason: &str) -> Option<ScrapeJob> {
        let device_id = observed.device_id.as_str();
        let current = self.load_for_callback(device_id, "interrupt").await?;
        if current.updated_at != observed.updated_at || current.step != observed.step {
            debug!(device_id = %device_id, "Job moved since it was audited, not interrupting");
            return None;
        }
        let job = self
            .transition(device_id, JobUpdate::interrupted(reason), "interrupt")
            .await?;
        warn!(device_id = %device_id, from = %observed.step, reason = %reason, "Scrape job interrupted");
        Some(job)
    }

    /// Delete terminal jobs finished before `cutoff`.
    pub async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, JobError> {
        let removed = self.store.delete_finished_before(cutoff).await?;
        for job in &removed {
            self.emit_removed(&job.device_id, &job.user_id);
        }
        Ok(removed.into_iter().map(|job| job.device_id).collect())
    }

    async fn load_for_callback(&self, device_id: &str, callback: &str) -> Option<ScrapeJob> {
        match self.store.get_job(device_id).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                error!(device_id = %device_id, callback, "No job for callback, ignoring");
                None
            }
            Err(e) => {
                error!(device_id = %device_id, callback, error = %e, "Failed to load job");
                None
            }
        }
    }

    async fn transition(&self, device_id: &str, update: JobUpdate, callback: &str) -> Option<ScrapeJob> {
        let job = self.load_for_callback(device_id, callback).await?;
        let target = update.step.unwrap_or(job.step);
        if !job.step.can_transition_to(target) {
            warn!(
                device_id = %device_id,
                callback,
                from = %job.step,
                to = %target,
                "Illegal transition, ignoring"
            );
            return None;
        }
        self.apply(device_id, update).await
    }

    async fn apply(&self, device_id: &str, update: JobUpdate) -> Option<ScrapeJob> {
        match self.store.upsert(device_id, update).await {
            Ok(job) => {
                self.emit_updated(&job);
                Some(job)
            }
            Err(DatabaseError::Vanished(_)) => {
                info!(device_id = %device_id, "Job removed while updating, ignoring");
                None
            }
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Failed to update job");
                None
            }
        }
    }

    fn emit_updated(&self, job: &ScrapeJob) {
        let _ = self.tx.send(JobEvent::JobUpdated { job: job.clone() });
    }

    fn emit_removed(&self, device_id: &str, user_id: &str) {
        let _ = self.tx.send(JobEvent::JobRemoved {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
        });
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Stamp `dispatched_at` and run the call in the background.
    async fn dispatch(&self, job: ScrapeJob, call: Call) -> Result<ScrapeJob, JobError> {
        let Some(worker) = self.worker.clone() else {
            debug!(device_id = %job.device_id, call = call.name(), "No worker attached, not dispatching");
            return Ok(job);
        };

        let stamp = Utc::now();
        let update = JobUpdate {
            dispatched_at: Some(Some(stamp)),
            acknowledged_at: Some(None),
            ..Default::default()
        };
        let job = self.store.upsert(&job.device_id, update).await?;
        self.emit_updated(&job);

        let this = self.clone();
        let device_id = job.device_id.clone();
        tokio::spawn(async move {
            this.run_call(worker, device_id, stamp, call).await;
        });
        Ok(job)
    }

    /// The job if it still belongs to the dispatch stamped `stamp`.
    async fn current_dispatch(&self, device_id: &str, stamp: DateTime<Utc>) -> Option<ScrapeJob> {
        match self.store.get_job(device_id).await {
            Ok(Some(job)) if job.dispatched_at == Some(stamp) => Some(job),
            Ok(_) => None,
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Failed to load job");
                None
            }
        }
    }

    async fn run_call(
        &self,
        worker: Arc<dyn WorkerRpc>,
        device_id: String,
        stamp: DateTime<Utc>,
        call: Call,
    ) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let name = call.name();
        let remote = async {
            match &call {
                Call::Search { query } => worker
                    .search(query, Some(events_tx))
                    .await
                    .map(|r| (r.request_id, CallResult::Search(r.result))),
                Call::Scrape { slug } => worker
                    .scrape(&device_id, slug, Some(events_tx))
                    .await
                    .map(|r| (r.request_id, CallResult::Scrape)),
            }
        };
        tokio::pin!(remote);

        let mut acknowledged = false;
        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = events_rx.recv() => {
                    if self.current_dispatch(&device_id, stamp).await.is_none() {
                        continue;
                    }
                    if !acknowledged {
                        acknowledged = true;
                        self.acknowledge(&device_id).await;
                    }
                    self.apply_event(&device_id, event).await;
                }
                outcome = &mut remote => break outcome,
            }
        };

        if self.current_dispatch(&device_id, stamp).await.is_none() {
            info!(device_id = %device_id, call = name, "Dropping result of superseded dispatch");
            return;
        }

        match outcome {
            Ok((request_id, result)) => {
                if !acknowledged {
                    self.acknowledge(&device_id).await;
                }
                debug!(device_id = %device_id, request_id = %request_id, call = name, "Worker replied");
                match result {
                    CallResult::Search(options) => {
                        self.handle_search_complete(&device_id, options).await;
                    }
                    CallResult::Scrape => {
                        self.handle_scrape_complete(&device_id).await;
                    }
                }
            }
            Err(RpcError::ConnectionLost) | Err(RpcError::Shutdown) => {
                // Left active; the reconnect audit or the sweep settles it.
                warn!(device_id = %device_id, call = name, "Connection lost mid-call");
            }
            Err(RpcError::NotConnected) => {
                if let Some(job) = self.current_dispatch(&device_id, stamp).await {
                    self.interrupt(&job, "interrupted: worker not connected").await;
                }
            }
            Err(RpcError::Remote {
                code,
                message,
                details,
            }) if code == SLUG_CONFLICT_CODE => {
                let slug = match &call {
                    Call::Scrape { slug } => slug.clone(),
                    Call::Search { .. } => String::new(),
                };
                match details.and_then(|d| serde_json::from_value::<SlugConflictDetails>(d).ok()) {
                    Some(details) => {
                        let conflict = SlugConflict {
                            slug,
                            existing_device_id: details.existing_device_id,
                            existing_device_name: details.existing_device_name,
                        };
                        self.handle_slug_conflict(&device_id, conflict).await;
                    }
                    None => {
                        self.handle_scrape_error(&device_id, &format!("{code}: {message}"))
                            .await;
                    }
                }
            }
            Err(e) => {
                self.handle_scrape_error(&device_id, &e.to_string()).await;
            }
        }
    }

    async fn acknowledge(&self, device_id: &str) {
        let update = JobUpdate {
            acknowledged_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        self.apply(device_id, update).await;
    }

    async fn apply_event(&self, device_id: &str, event: StreamEvent) {
        match event {
            StreamEvent::Progress { stage, percent, .. } => {
                self.handle_progress(device_id, Some(stage), percent, None)
                    .await;
            }
            StreamEvent::Log { level, message } => {
                debug!(device_id = %device_id, level = %level, "Worker log: {}", message);
                self.handle_progress(device_id, None, None, Some(message))
                    .await;
            }
            StreamEvent::Retry {
                attempt,
                max_attempts,
                delay,
                reason,
            } => {
                let log = format!("retry {attempt}/{max_attempts} in {delay}ms: {reason}");
                self.handle_progress(device_id, None, None, Some(log)).await;
            }
            StreamEvent::Unknown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{EventSink, RpcResponse};
    use crate::pipeline::{PipelineContext, Stage};
    use crate::store::LibSqlJobStore;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn manager() -> JobManager {
        let store = LibSqlJobStore::new_memory().await.unwrap();
        JobManager::new(Arc::new(store))
    }

    fn options() -> Vec<AutocompleteOption> {
        vec![
            AutocompleteOption {
                name: "Google Pixel 9".into(),
                slug: "pixel-9".into(),
            },
            AutocompleteOption {
                name: "Google Pixel 9 Pro".into(),
                slug: "pixel-9-pro".into(),
            },
        ]
    }

    #[tokio::test]
    async fn pixel_walkthrough() {
        let jobs = manager().await;

        let job = jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        assert_eq!(job.step, JobStep::Searching);
        assert_eq!(job.attempts, 0);

        let job = jobs.handle_search_complete("D1", options()).await.unwrap();
        assert_eq!(job.step, JobStep::Selecting);
        assert_eq!(job.autocomplete_options.len(), 2);
        assert!(job.progress_stage.is_none());

        let job = jobs.confirm_slug("u1", "D1", "pixel-9").await.unwrap();
        assert_eq!(job.step, JobStep::Scraping);

        let job = jobs.handle_scrape_error("D1", "network timeout").await.unwrap();
        assert_eq!(job.step, JobStep::Error);
        assert_eq!(job.error.as_deref(), Some("network timeout"));
        assert_eq!(job.attempts, 1);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn empty_search_is_an_error() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Nonexistent 3000").await.unwrap();
        let job = jobs.handle_search_complete("D1", Vec::new()).await.unwrap();
        assert_eq!(job.step, JobStep::Error);
        assert_eq!(job.error.as_deref(), Some(NO_MATCHES_MESSAGE));
    }

    #[tokio::test]
    async fn start_rejects_active_job() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();

        let err = jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
        let err = jobs.start_scrape_job("u2", "D1", "Pixel 9").await.unwrap_err();
        assert!(matches!(err, JobError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn restart_after_failure_starts_fresh() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        jobs.handle_search_complete("D1", options()).await.unwrap();
        jobs.confirm_slug("u1", "D1", "pixel-9").await.unwrap();
        jobs.handle_scrape_error("D1", "boom").await.unwrap();

        let job = jobs.start_scrape_job("u1", "D1", "Pixel 9a").await.unwrap();
        assert_eq!(job.step, JobStep::Searching);
        assert_eq!(job.attempts, 0);
        assert!(job.slug.is_none());
        assert!(job.autocomplete_options.is_empty());
        assert!(job.error.is_none());
        assert_eq!(job.device_name.as_deref(), Some("Pixel 9a"));
    }

    #[tokio::test]
    async fn restart_of_finished_job_requires_owner() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        jobs.handle_scrape_error("D1", "boom").await.unwrap();

        let err = jobs.start_scrape_job("u2", "D1", "Pixel 9").await.unwrap_err();
        assert!(matches!(err, JobError::NotOwner { .. }));
        let job = jobs.get_job("D1").await.unwrap().unwrap();
        assert_eq!(job.user_id, "u1");
        assert_eq!(job.step, JobStep::Error);
    }

    #[tokio::test]
    async fn confirm_requires_owner_and_selecting() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();

        let err = jobs.confirm_slug("u1", "D1", "pixel-9").await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));

        jobs.handle_search_complete("D1", options()).await.unwrap();
        let err = jobs.confirm_slug("u2", "D1", "pixel-9").await.unwrap_err();
        assert!(matches!(err, JobError::NotOwner { .. }));
        let err = jobs.confirm_slug("u1", "D9", "pixel-9").await.unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_then_late_callback_is_ignored() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();

        assert!(!jobs.cancel_job("D1", "u2").await.unwrap());
        assert!(jobs.get_job("D1").await.unwrap().is_some());

        assert!(jobs.cancel_job("D1", "u1").await.unwrap());
        assert!(!jobs.cancel_job("D1", "u1").await.unwrap());

        assert!(jobs.handle_search_complete("D1", options()).await.is_none());
        assert!(jobs.get_job("D1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn illegal_callback_transition_is_ignored() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        assert!(jobs.handle_scrape_complete("D1").await.is_none());
        let conflict = SlugConflict {
            slug: "pixel-9".into(),
            existing_device_id: "D0".into(),
            existing_device_name: "Old".into(),
        };
        assert!(jobs.handle_slug_conflict("D1", conflict).await.is_none());
        assert_eq!(jobs.get_job("D1").await.unwrap().unwrap().step, JobStep::Searching);
    }

    #[tokio::test]
    async fn retry_picks_furthest_step() {
        let jobs = manager().await;

        // Slug present: back to scraping.
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        jobs.handle_search_complete("D1", options()).await.unwrap();
        jobs.confirm_slug("u1", "D1", "pixel-9").await.unwrap();
        let failed = jobs.handle_scrape_error("D1", "network timeout").await.unwrap();
        let retried = jobs.retry_job("D1", "u1").await.unwrap();
        assert_eq!(retried.step, JobStep::Scraping);
        assert_eq!(retried.attempts, failed.attempts + 1);
        assert!(retried.error.is_none());
        assert!(retried.finished_at.is_none());

        // Candidates only: back to selecting.
        jobs.start_scrape_job("u1", "D2", "Galaxy").await.unwrap();
        jobs.handle_search_complete("D2", options()).await.unwrap();
        jobs.handle_scrape_error("D2", "operator timeout").await.unwrap();
        assert_eq!(jobs.retry_job("D2", "u1").await.unwrap().step, JobStep::Selecting);

        // Only a name: back to searching.
        jobs.start_scrape_job("u1", "D3", "iPhone").await.unwrap();
        jobs.handle_scrape_error("D3", "search failed").await.unwrap();
        assert_eq!(jobs.retry_job("D3", "u1").await.unwrap().step, JobStep::Searching);
    }

    #[tokio::test]
    async fn retry_errors() {
        let jobs = manager().await;
        let err = jobs.retry_job("D1", "u1").await.unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));

        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        let err = jobs.retry_job("D1", "u1").await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));

        jobs.handle_scrape_error("D1", "boom").await.unwrap();
        let err = jobs.retry_job("D1", "u2").await.unwrap_err();
        assert!(matches!(err, JobError::NotOwner { .. }));

        // A job with nothing to resume from.
        jobs.store()
            .upsert(
                "D2",
                JobUpdate {
                    user_id: Some("u1".into()),
                    ..JobUpdate::failed("boom")
                },
            )
            .await
            .unwrap();
        let err = jobs.retry_job("D2", "u1").await.unwrap_err();
        assert!(matches!(err, JobError::MissingPrecondition { .. }));
    }

    #[tokio::test]
    async fn slug_conflict_is_terminal() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        jobs.handle_search_complete("D1", options()).await.unwrap();
        jobs.confirm_slug("u1", "D1", "pixel-9").await.unwrap();
        let job = jobs
            .handle_slug_conflict(
                "D1",
                SlugConflict {
                    slug: "pixel-9".into(),
                    existing_device_id: "D0".into(),
                    existing_device_name: "Pixel 9 (2024)".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(job.step, JobStep::SlugConflict);
        assert!(job.finished_at.is_some());
        assert!(job.slug_conflict.is_some());
        let err = jobs.retry_job("D1", "u1").await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn progress_updates_without_changing_step() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        let job = jobs
            .handle_progress("D1", Some("autocomplete".into()), Some(150.0), Some("fetching".into()))
            .await
            .unwrap();
        assert_eq!(job.step, JobStep::Searching);
        assert_eq!(job.progress_percent, Some(100));
        assert_eq!(job.last_log.as_deref(), Some("fetching"));
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn fractional_progress_is_rounded_into_range() {
        let jobs = manager().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();

        let job = jobs.handle_progress("D1", None, Some(42.5), None).await.unwrap();
        assert_eq!(job.progress_percent, Some(43));
        let job = jobs.handle_progress("D1", None, Some(-3.2), None).await.unwrap();
        assert_eq!(job.progress_percent, Some(0));
        let job = jobs.handle_progress("D1", None, Some(f64::NAN), None).await.unwrap();
        assert_eq!(job.progress_percent, Some(0));
    }

    #[tokio::test]
    async fn transitions_are_broadcast() {
        let jobs = manager().await;
        let mut rx = jobs.subscribe();
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        jobs.cancel_job("D1", "u1").await.unwrap();

        match rx.recv().await.unwrap() {
            JobEvent::JobUpdated { job } => assert_eq!(job.step, JobStep::Searching),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            JobEvent::JobRemoved { device_id, user_id } => {
                assert_eq!(device_id, "D1");
                assert_eq!(user_id, "u1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ── Dispatch through a stub worker ──────────────────────────────

    /// Worker stub with scripted replies. Holds each reply until released.
    struct ScriptedWorker {
        search: Mutex<Option<Result<Vec<AutocompleteOption>, RpcError>>>,
        scrape: Mutex<Option<Result<Value, RpcError>>>,
        gate: tokio::sync::Semaphore,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedWorker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                search: Mutex::new(None),
                scrape: Mutex::new(None),
                gate: tokio::sync::Semaphore::new(0),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait::async_trait]
    impl WorkerRpc for ScriptedWorker {
        async fn search(
            &self,
            query: &str,
            events: Option<EventSink>,
        ) -> Result<RpcResponse<Vec<AutocompleteOption>>, RpcError> {
            self.calls.lock().unwrap().push(format!("search:{query}"));
            if let Some(events) = events {
                let _ = events.send(StreamEvent::Progress {
                    stage: "autocomplete".into(),
                    percent: Some(49.6),
                    duration_ms: None,
                });
            }
            self.gate.acquire().await.unwrap().forget();
            let result = self.search.lock().unwrap().take().unwrap_or(Ok(Vec::new()));
            result.map(|result| RpcResponse {
                request_id: "req-search".into(),
                result,
            })
        }

        async fn scrape(
            &self,
            _device_id: &str,
            slug: &str,
            _events: Option<EventSink>,
        ) -> Result<RpcResponse<Value>, RpcError> {
            self.calls.lock().unwrap().push(format!("scrape:{slug}"));
            self.gate.acquire().await.unwrap().forget();
            let result = self.scrape.lock().unwrap().take().unwrap_or(Ok(json!({})));
            result.map(|result| RpcResponse {
                request_id: "req-scrape".into(),
                result,
            })
        }

        async fn run_stage(
            &self,
            _stage: Stage,
            _ctx: &PipelineContext,
        ) -> Result<RpcResponse<Value>, RpcError> {
            Err(RpcError::NotConnected)
        }

        async fn health_check(&self) -> Result<RpcResponse<Value>, RpcError> {
            Err(RpcError::NotConnected)
        }
    }

    async fn wait_for_step(jobs: &JobManager, device_id: &str, step: JobStep) -> ScrapeJob {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = jobs.get_job(device_id).await.unwrap()
                    && job.step == step
                {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job never reached step")
    }

    async fn wait_for<F: Fn(&ScrapeJob) -> bool>(jobs: &JobManager, device_id: &str, f: F) -> ScrapeJob {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = jobs.get_job(device_id).await.unwrap()
                    && f(&job)
                {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never held")
    }

    #[tokio::test]
    async fn dispatched_search_drives_job_to_selecting() {
        let worker = ScriptedWorker::new();
        *worker.search.lock().unwrap() = Some(Ok(options()));
        let jobs = manager().await.with_worker(worker.clone());

        let job = jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        assert!(job.dispatched_at.is_some());
        assert!(job.acknowledged_at.is_none());

        // The progress event acknowledges the call before it returns.
        let acked = wait_for(&jobs, "D1", |j| j.progress_percent == Some(50)).await;
        assert!(acked.acknowledged_at.is_some());

        worker.release();
        let job = wait_for_step(&jobs, "D1", JobStep::Selecting).await;
        assert_eq!(job.autocomplete_options, options());
        assert_eq!(worker.calls.lock().unwrap().as_slice(), ["search:Pixel 9"]);
    }

    #[tokio::test]
    async fn remote_slug_conflict_is_recognized() {
        let worker = ScriptedWorker::new();
        *worker.scrape.lock().unwrap() = Some(Err(RpcError::Remote {
            code: SLUG_CONFLICT_CODE.into(),
            message: "slug taken".into(),
            details: Some(json!({"existingDeviceId": "D0", "existingDeviceName": "Pixel 9 (old)"})),
        }));
        let jobs = manager().await.with_worker(worker.clone());

        jobs.store()
            .upsert(
                "D1",
                JobUpdate {
                    user_id: Some("u1".into()),
                    autocomplete_options: Some(options()),
                    ..JobUpdate::step(JobStep::Selecting)
                },
            )
            .await
            .unwrap();
        jobs.confirm_slug("u1", "D1", "pixel-9").await.unwrap();
        worker.release();

        let job = wait_for_step(&jobs, "D1", JobStep::SlugConflict).await;
        let conflict = job.slug_conflict.unwrap();
        assert_eq!(conflict.slug, "pixel-9");
        assert_eq!(conflict.existing_device_id, "D0");
    }

    #[tokio::test]
    async fn result_for_cancelled_and_restarted_job_is_dropped() {
        let worker = ScriptedWorker::new();
        *worker.search.lock().unwrap() = Some(Ok(options()));
        let jobs = manager().await.with_worker(worker.clone());

        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        jobs.cancel_job("D1", "u1").await.unwrap();
        // Restarting without a worker keeps the new row undispatched.
        let detached = JobManager::new(jobs.store().clone());
        detached.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();

        worker.release();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let job = jobs.get_job("D1").await.unwrap().unwrap();
        assert_eq!(job.step, JobStep::Searching);
        assert!(job.autocomplete_options.is_empty());
    }

    #[tokio::test]
    async fn lost_connection_leaves_job_for_audit() {
        let worker = ScriptedWorker::new();
        *worker.search.lock().unwrap() = Some(Err(RpcError::ConnectionLost));
        let jobs = manager().await.with_worker(worker.clone());

        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();
        worker.release();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(jobs.get_job("D1").await.unwrap().unwrap().step, JobStep::Searching);
    }

    #[tokio::test]
    async fn rpc_timeout_fails_the_job() {
        let worker = ScriptedWorker::new();
        *worker.scrape.lock().unwrap() = Some(Err(RpcError::Timeout {
            method: "scrape".into(),
            timeout: Duration::from_secs(300),
        }));
        let jobs = manager().await.with_worker(worker.clone());
        jobs.store()
            .upsert(
                "D1",
                JobUpdate {
                    user_id: Some("u1".into()),
                    slug: Some(Some("pixel-9".into())),
                    ..JobUpdate::step(JobStep::Interrupted).with_error("lost")
                },
            )
            .await
            .unwrap();

        let retried = jobs.retry_job("D1", "u1").await.unwrap();
        assert_eq!(retried.step, JobStep::Scraping);
        worker.release();

        let job = wait_for_step(&jobs, "D1", JobStep::Error).await;
        assert!(job.error.unwrap().contains("timed out"));
        assert_eq!(worker.calls.lock().unwrap().as_slice(), ["scrape:pixel-9"]);
    }
}
