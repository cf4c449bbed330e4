//! `JobStore` trait: the single async interface for job persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::jobs::model::{JobUpdate, ScrapeJob};

/// Backend-agnostic store holding one scrape job row per device.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Get the job for a device.
    async fn get_job(&self, device_id: &str) -> Result<Option<ScrapeJob>, DatabaseError>;

    /// All jobs owned by a user, most recently updated first.
    async fn list_jobs_for_user(&self, user_id: &str) -> Result<Vec<ScrapeJob>, DatabaseError>;

    /// All jobs in searching, selecting or scraping.
    async fn list_active_jobs(&self) -> Result<Vec<ScrapeJob>, DatabaseError>;

    /// Merge `update` over the device's row (creating it if absent) and
    /// return the stored result. See `ScrapeJob::merge` for derived fields.
    async fn upsert(&self, device_id: &str, update: JobUpdate) -> Result<ScrapeJob, DatabaseError>;

    /// Delete the device's row. Returns whether a row existed.
    async fn delete_job(&self, device_id: &str) -> Result<bool, DatabaseError>;

    /// Delete terminal jobs that finished before `cutoff`.
    /// Returns the removed rows.
    async fn delete_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, DatabaseError>;
}
