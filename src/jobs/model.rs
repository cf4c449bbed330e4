//! Scrape job data model: steps, the persisted row, and partial updates.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Step of a device's scrape workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    /// Waiting for the worker's search results.
    Searching,
    /// Waiting for the operator to pick a candidate.
    Selecting,
    /// Worker is scraping the confirmed slug.
    Scraping,
    /// Scrape finished.
    Done,
    /// A step failed.
    Error,
    /// The confirmed slug already belongs to another device.
    SlugConflict,
    /// Abandoned by the worker or lost across a reconnect.
    Interrupted,
}

impl JobStep {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStep) -> bool {
        use JobStep::*;

        match (self, target) {
            (Searching, Selecting) | (Selecting, Scraping) => true,
            (Scraping, Done) | (Scraping, SlugConflict) => true,
            (from, Error) | (from, Interrupted) if from.is_active() => true,
            (Error | Interrupted, Searching | Selecting | Scraping) => true,
            _ => false,
        }
    }

    /// Done, error, interrupted and slug conflict are terminal.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Searching | Self::Selecting | Self::Scraping)
    }

    /// Steps that carry an error message.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Interrupted | Self::SlugConflict)
    }

    /// Steps an operator may retry from.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::Interrupted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Searching => "searching",
            Self::Selecting => "selecting",
            Self::Scraping => "scraping",
            Self::Done => "done",
            Self::Error => "error",
            Self::SlugConflict => "slug_conflict",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for JobStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "searching" => Ok(Self::Searching),
            "selecting" => Ok(Self::Selecting),
            "scraping" => Ok(Self::Scraping),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "slug_conflict" => Ok(Self::SlugConflict),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown job step: {other}")),
        }
    }
}

/// A candidate returned by a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutocompleteOption {
    pub name: String,
    pub slug: String,
}

/// Collision between a confirmed slug and an already registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlugConflict {
    pub slug: String,
    pub existing_device_id: String,
    pub existing_device_name: String,
}

/// One scrape job per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub device_id: String,
    pub user_id: String,
    pub step: JobStep,
    pub device_name: Option<String>,
    pub slug: Option<String>,
    pub autocomplete_options: Vec<AutocompleteOption>,
    pub error: Option<String>,
    pub attempts: u32,
    pub progress_stage: Option<String>,
    pub progress_percent: Option<u8>,
    pub last_log: Option<String>,
    pub slug_conflict: Option<SlugConflict>,
    /// When the current step's call was sent to the worker.
    pub dispatched_at: Option<DateTime<Utc>>,
    /// When the worker first answered that call.
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScrapeJob {
    fn empty(
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        step: JobStep,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            step,
            device_name: None,
            slug: None,
            autocomplete_options: Vec::new(),
            error: None,
            attempts: 0,
            progress_stage: None,
            progress_percent: None,
            last_log: None,
            slug_conflict: None,
            dispatched_at: None,
            acknowledged_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Merge a partial update over an existing row, or create one.
    ///
    /// This is the only place derived fields are computed:
    /// - `attempts` goes up when the update repeats the current step or lands
    ///   in `error`; an explicit value never lowers it.
    /// - progress, log and dispatch stamps reset when the step changes unless
    ///   the update supplies them.
    /// - `error` survives only in failure steps, `slug_conflict` only in
    ///   `slug_conflict`.
    /// - `finished_at` is set iff the resulting step is terminal.
    pub fn merge(
        existing: Option<&ScrapeJob>,
        device_id: &str,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<ScrapeJob, DatabaseError> {
        let (mut job, previous_step) = match existing {
            Some(job) => (job.clone(), Some(job.step)),
            None => {
                let step = update.step.ok_or_else(|| {
                    DatabaseError::Constraint(format!("new job for {device_id} needs a step"))
                })?;
                let user_id = update.user_id.clone().ok_or_else(|| {
                    DatabaseError::Constraint(format!("new job for {device_id} needs an owner"))
                })?;
                (ScrapeJob::empty(device_id, user_id, step, now), None)
            }
        };

        let new_step = update.step.unwrap_or(job.step);
        let step_changed = previous_step.is_some_and(|prev| prev != new_step);

        let repeated = previous_step.is_some_and(|prev| update.step == Some(prev));
        if repeated || update.step == Some(JobStep::Error) {
            job.attempts += 1;
        }
        if let Some(explicit) = update.attempts {
            job.attempts = job.attempts.max(explicit);
        }

        job.step = new_step;
        if let Some(user_id) = update.user_id {
            job.user_id = user_id;
        }
        if let Some(name) = update.device_name {
            job.device_name = name;
        }
        if let Some(slug) = update.slug {
            job.slug = slug;
        }
        if let Some(options) = update.autocomplete_options {
            job.autocomplete_options = options;
        }

        job.progress_stage = resolve(update.progress_stage, job.progress_stage, step_changed);
        job.progress_percent = resolve(update.progress_percent, job.progress_percent, step_changed);
        job.last_log = resolve(update.last_log, job.last_log, step_changed);
        job.dispatched_at = resolve(update.dispatched_at, job.dispatched_at, step_changed);
        job.acknowledged_at = resolve(update.acknowledged_at, job.acknowledged_at, step_changed);

        job.error = resolve(update.error, job.error, step_changed).filter(|_| new_step.is_failure());
        job.slug_conflict = resolve(update.slug_conflict, job.slug_conflict, step_changed)
            .filter(|_| new_step == JobStep::SlugConflict);

        job.finished_at = if new_step.is_terminal() {
            job.finished_at.filter(|_| !step_changed).or(Some(now))
        } else {
            None
        };
        job.updated_at = now;

        Ok(job)
    }
}

/// Supplied value wins; otherwise keep the current one unless the step moved.
fn resolve<T>(supplied: Option<Option<T>>, current: Option<T>, reset: bool) -> Option<T> {
    match supplied {
        Some(value) => value,
        None if reset => None,
        None => current,
    }
}

/// A partial update applied through `JobStore::upsert`.
///
/// Outer `None` leaves a field alone; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub user_id: Option<String>,
    pub step: Option<JobStep>,
    pub device_name: Option<Option<String>>,
    pub slug: Option<Option<String>>,
    pub autocomplete_options: Option<Vec<AutocompleteOption>>,
    pub error: Option<Option<String>>,
    pub attempts: Option<u32>,
    pub progress_stage: Option<Option<String>>,
    pub progress_percent: Option<Option<u8>>,
    pub last_log: Option<Option<String>>,
    pub slug_conflict: Option<Option<SlugConflict>>,
    pub dispatched_at: Option<Option<DateTime<Utc>>>,
    pub acknowledged_at: Option<Option<DateTime<Utc>>>,
}

impl JobUpdate {
    /// Update that moves the job to `step`.
    pub fn step(step: JobStep) -> Self {
        Self {
            step: Some(step),
            ..Default::default()
        }
    }

    /// Move to `error` with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::step(JobStep::Error).with_error(message)
    }

    /// Move to `interrupted` with a message.
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::step(JobStep::Interrupted).with_error(message)
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }
}

/// Live job notifications for subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job was created or changed.
    JobUpdated { job: ScrapeJob },
    /// A job was cancelled or purged.
    JobRemoved { device_id: String, user_id: String },
}

impl JobEvent {
    /// Owner of the job the event is about.
    pub fn user_id(&self) -> &str {
        match self {
            Self::JobUpdated { job } => &job.user_id,
            Self::JobRemoved { user_id, .. } => user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(now: DateTime<Utc>) -> ScrapeJob {
        let update = JobUpdate {
            user_id: Some("u1".into()),
            device_name: Some(Some("Pixel 9".into())),
            ..JobUpdate::step(JobStep::Searching)
        };
        ScrapeJob::merge(None, "D1", update, now).unwrap()
    }

    #[test]
    fn transitions_follow_table() {
        assert!(JobStep::Searching.can_transition_to(JobStep::Selecting));
        assert!(JobStep::Selecting.can_transition_to(JobStep::Scraping));
        assert!(JobStep::Scraping.can_transition_to(JobStep::Done));
        assert!(JobStep::Scraping.can_transition_to(JobStep::SlugConflict));
        assert!(JobStep::Selecting.can_transition_to(JobStep::Error));
        assert!(JobStep::Searching.can_transition_to(JobStep::Interrupted));
        assert!(JobStep::Interrupted.can_transition_to(JobStep::Scraping));
        assert!(JobStep::Error.can_transition_to(JobStep::Searching));

        assert!(!JobStep::Searching.can_transition_to(JobStep::Done));
        assert!(!JobStep::Done.can_transition_to(JobStep::Error));
        assert!(!JobStep::SlugConflict.can_transition_to(JobStep::Scraping));
        assert!(!JobStep::Selecting.can_transition_to(JobStep::SlugConflict));
        assert!(!JobStep::Error.can_transition_to(JobStep::Done));
    }

    #[test]
    fn step_string_roundtrip() {
        for step in [
            JobStep::Searching,
            JobStep::Selecting,
            JobStep::Scraping,
            JobStep::Done,
            JobStep::Error,
            JobStep::SlugConflict,
            JobStep::Interrupted,
        ] {
            assert_eq!(step.as_str().parse::<JobStep>().unwrap(), step);
        }
        assert!("cancelled".parse::<JobStep>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStep::SlugConflict).unwrap(),
            "\"slug_conflict\""
        );
    }

    #[test]
    fn create_requires_step_and_owner() {
        let now = Utc::now();
        assert!(ScrapeJob::merge(None, "D1", JobUpdate::default(), now).is_err());
        assert!(ScrapeJob::merge(None, "D1", JobUpdate::step(JobStep::Searching), now).is_err());

        let job = start(now);
        assert_eq!(job.step, JobStep::Searching);
        assert_eq!(job.attempts, 0);
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn repeating_a_step_counts_an_attempt() {
        let now = Utc::now();
        let job = start(now);
        let again = ScrapeJob::merge(Some(&job), "D1", JobUpdate::step(JobStep::Searching), now)
            .unwrap();
        assert_eq!(again.attempts, 1);

        let moved = ScrapeJob::merge(Some(&again), "D1", JobUpdate::step(JobStep::Selecting), now)
            .unwrap();
        assert_eq!(moved.attempts, 1);
    }

    #[test]
    fn update_without_step_keeps_attempts_and_progress() {
        let now = Utc::now();
        let job = start(now);
        let progressed = ScrapeJob::merge(
            Some(&job),
            "D1",
            JobUpdate {
                progress_stage: Some(Some("fetching".into())),
                progress_percent: Some(Some(40)),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(progressed.attempts, 0);
        assert_eq!(progressed.progress_percent, Some(40));

        let log_only = ScrapeJob::merge(
            Some(&progressed),
            "D1",
            JobUpdate {
                last_log: Some(Some("page loaded".into())),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(log_only.progress_stage.as_deref(), Some("fetching"));
    }

    #[test]
    fn step_change_clears_transient_fields_unless_supplied() {
        let now = Utc::now();
        let mut job = start(now);
        job.progress_stage = Some("search".into());
        job.progress_percent = Some(90);
        job.dispatched_at = Some(now);
        job.acknowledged_at = Some(now);

        let selecting =
            ScrapeJob::merge(Some(&job), "D1", JobUpdate::step(JobStep::Selecting), now).unwrap();
        assert!(selecting.progress_stage.is_none());
        assert!(selecting.progress_percent.is_none());
        assert!(selecting.dispatched_at.is_none());
        assert!(selecting.acknowledged_at.is_none());

        let scraping = ScrapeJob::merge(
            Some(&selecting),
            "D1",
            JobUpdate {
                progress_stage: Some(Some("queued".into())),
                ..JobUpdate::step(JobStep::Scraping)
            },
            now,
        )
        .unwrap();
        assert_eq!(scraping.progress_stage.as_deref(), Some("queued"));
    }

    #[test]
    fn error_increments_and_finishes() {
        let now = Utc::now();
        let job = start(now);
        let failed =
            ScrapeJob::merge(Some(&job), "D1", JobUpdate::failed("network timeout"), now).unwrap();
        assert_eq!(failed.step, JobStep::Error);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error.as_deref(), Some("network timeout"));
        assert_eq!(failed.finished_at, Some(now));
    }

    #[test]
    fn explicit_attempts_never_lower_the_counter() {
        let now = Utc::now();
        let mut job = start(now);
        job.attempts = 4;
        let update = JobUpdate {
            attempts: Some(2),
            ..JobUpdate::step(JobStep::Selecting)
        };
        let merged = ScrapeJob::merge(Some(&job), "D1", update, now).unwrap();
        assert_eq!(merged.attempts, 4);
    }

    #[test]
    fn leaving_failure_drops_error_and_finished_at() {
        let now = Utc::now();
        let job = start(now);
        let failed = ScrapeJob::merge(Some(&job), "D1", JobUpdate::failed("boom"), now).unwrap();
        let retried =
            ScrapeJob::merge(Some(&failed), "D1", JobUpdate::step(JobStep::Searching), now)
                .unwrap();
        assert!(retried.error.is_none());
        assert!(retried.finished_at.is_none());
    }

    #[test]
    fn slug_conflict_only_lives_in_its_step() {
        let now = Utc::now();
        let job = start(now);
        let conflict = SlugConflict {
            slug: "pixel-9".into(),
            existing_device_id: "D0".into(),
            existing_device_name: "Pixel 9".into(),
        };
        let update = JobUpdate {
            slug_conflict: Some(Some(conflict.clone())),
            ..JobUpdate::step(JobStep::Selecting)
        };
        let merged = ScrapeJob::merge(Some(&job), "D1", update, now).unwrap();
        assert!(merged.slug_conflict.is_none());

        let update = JobUpdate {
            slug_conflict: Some(Some(conflict.clone())),
            ..JobUpdate::step(JobStep::SlugConflict)
        };
        let merged = ScrapeJob::merge(Some(&merged), "D1", update, now).unwrap();
        assert_eq!(merged.slug_conflict, Some(conflict));
        assert!(merged.finished_at.is_some());
    }

    #[test]
    fn finished_at_tracks_terminal_over_any_sequence() {
        let mut now = Utc::now();
        let mut job = start(now);
        let sequence = [
            JobStep::Selecting,
            JobStep::Scraping,
            JobStep::Interrupted,
            JobStep::Interrupted,
            JobStep::Scraping,
            JobStep::Done,
            JobStep::Error,
            JobStep::Searching,
            JobStep::SlugConflict,
        ];
        let mut last_attempts = job.attempts;
        for step in sequence {
            now += chrono::Duration::seconds(1);
            job = ScrapeJob::merge(Some(&job), "D1", JobUpdate::step(step), now).unwrap();
            assert_eq!(job.finished_at.is_some(), step.is_terminal(), "step {step}");
            assert!(job.attempts >= last_attempts);
            last_attempts = job.attempts;
        }
    }

    #[test]
    fn finished_at_kept_while_staying_terminal() {
        let now = Utc::now();
        let job = start(now);
        let failed = ScrapeJob::merge(Some(&job), "D1", JobUpdate::failed("x"), now).unwrap();
        let later = now + chrono::Duration::minutes(5);
        let logged = ScrapeJob::merge(
            Some(&failed),
            "D1",
            JobUpdate {
                last_log: Some(Some("late log".into())),
                ..Default::default()
            },
            later,
        )
        .unwrap();
        assert_eq!(logged.finished_at, Some(now));
        assert_eq!(logged.updated_at, later);
    }
}
