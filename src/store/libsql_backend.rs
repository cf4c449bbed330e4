//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::jobs::model::{AutocompleteOption, JobStep, JobUpdate, ScrapeJob, SlugConflict};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        info!(path = %path.display(), "Job database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ScrapeJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    /// Write a merged row. An existing row is only replaced while it still
    /// carries the `updated_at` it was read with, and a new row only when
    /// none exists. Returns `false` when the row moved underneath.
    async fn write_job(
        &self,
        previous: Option<&ScrapeJob>,
        job: &ScrapeJob,
    ) -> Result<bool, DatabaseError> {
        let options_json = serde_json::to_string(&job.autocomplete_options)
            .map_err(|e| DatabaseError::Serialization(format!("autocomplete_options: {e}")))?;
        let conflict_json = job
            .slug_conflict
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("slug_conflict: {e}")))?;

        let mut values = vec![
            libsql::Value::Text(job.device_id.clone()),
            libsql::Value::Text(job.user_id.clone()),
            libsql::Value::Text(job.step.as_str().to_string()),
            opt_text(job.device_name.clone()),
            opt_text(job.slug.clone()),
            libsql::Value::Text(options_json),
            opt_text(job.error.clone()),
            libsql::Value::Integer(job.attempts as i64),
            opt_text(job.progress_stage.clone()),
            opt_integer(job.progress_percent.map(i64::from)),
            opt_text(job.last_log.clone()),
            opt_text(conflict_json),
            opt_datetime(job.dispatched_at),
            opt_datetime(job.acknowledged_at),
            libsql::Value::Text(format_datetime(&job.created_at)),
            libsql::Value::Text(format_datetime(&job.updated_at)),
            opt_datetime(job.finished_at),
        ];

        let written = match previous {
            Some(previous) => {
                values.push(libsql::Value::Text(format_datetime(&previous.updated_at)));
                self.conn()
                    .execute(
                        "UPDATE scrape_jobs SET
                            user_id = ?2,
                            step = ?3,
                            device_name = ?4,
                            slug = ?5,
                            autocomplete_options = ?6,
                            error = ?7,
                            attempts = ?8,
                            progress_stage = ?9,
                            progress_percent = ?10,
                            last_log = ?11,
                            slug_conflict = ?12,
                            dispatched_at = ?13,
                            acknowledged_at = ?14,
                            created_at = ?15,
                            updated_at = ?16,
                            finished_at = ?17
                         WHERE device_id = ?1 AND updated_at = ?18",
                        values,
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("upsert: {e}")))?
            }
            None => self
                .conn()
                .execute(
                    &format!(
                        "INSERT INTO scrape_jobs ({JOB_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                         ON CONFLICT (device_id) DO NOTHING"
                    ),
                    values,
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert: {e}")))?,
        };
        Ok(written == 1)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.as_ref().map(format_datetime))
}

fn opt_integer(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a ScrapeJob. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<ScrapeJob, DatabaseError> {
    let text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("job row column {idx}: {e}")))
    };
    let opt = |idx: i32| -> Option<String> { row.get::<String>(idx).ok() };

    let step: JobStep = text(2)?.parse().map_err(DatabaseError::Serialization)?;

    let autocomplete_options: Vec<AutocompleteOption> = match opt(5) {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| DatabaseError::Serialization(format!("autocomplete_options: {e}")))?,
        None => Vec::new(),
    };
    let slug_conflict: Option<SlugConflict> = match opt(11) {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| DatabaseError::Serialization(format!("slug_conflict: {e}")))?,
        ),
        None => None,
    };

    let attempts: i64 = row.get(7).unwrap_or(0);
    let progress_percent = row
        .get::<i64>(9)
        .ok()
        .map(|p| p.clamp(0, 100) as u8);

    Ok(ScrapeJob {
        device_id: text(0)?,
        user_id: text(1)?,
        step,
        device_name: opt(3),
        slug: opt(4),
        autocomplete_options,
        error: opt(6),
        attempts: attempts.max(0) as u32,
        progress_stage: opt(8),
        progress_percent,
        last_log: opt(10),
        slug_conflict,
        dispatched_at: parse_optional_datetime(opt(12)),
        acknowledged_at: parse_optional_datetime(opt(13)),
        created_at: parse_datetime(&text(14)?),
        updated_at: parse_datetime(&text(15)?),
        finished_at: parse_optional_datetime(opt(16)),
    })
}

// ── Trait implementation ────────────────────────────────────────────

/// Read-merge-write rounds before `upsert` gives up on a contended row.
const UPSERT_ATTEMPTS: usize = 8;

const JOB_COLUMNS: &str = "device_id, user_id, step, device_name, slug, autocomplete_options, error, attempts, progress_stage, progress_percent, last_log, slug_conflict, dispatched_at, acknowledged_at, created_at, updated_at, finished_at";

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn get_job(&self, device_id: &str) -> Result<Option<ScrapeJob>, DatabaseError> {
        let jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE device_id = ?1"),
                params![device_id],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn list_jobs_for_user(&self, user_id: &str) -> Result<Vec<ScrapeJob>, DatabaseError> {
        self.query_jobs(
            "list_jobs_for_user",
            &format!(
                "SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE user_id = ?1 ORDER BY updated_at DESC"
            ),
            params![user_id],
        )
        .await
    }

    async fn list_active_jobs(&self) -> Result<Vec<ScrapeJob>, DatabaseError> {
        self.query_jobs(
            "list_active_jobs",
            &format!(
                "SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE step IN ('searching', 'selecting', 'scraping') ORDER BY updated_at ASC"
            ),
            (),
        )
        .await
    }

    async fn upsert(&self, device_id: &str, update: JobUpdate) -> Result<ScrapeJob, DatabaseError> {
        let mut saw_row = false;
        for _ in 0..UPSERT_ATTEMPTS {
            let existing = self.get_job(device_id).await?;
            if saw_row && existing.is_none() {
                return Err(DatabaseError::Vanished(format!(
                    "upsert: {device_id} was deleted during the write"
                )));
            }
            saw_row = existing.is_some();

            let job = ScrapeJob::merge(existing.as_ref(), device_id, update.clone(), Utc::now())?;
            if self.write_job(existing.as_ref(), &job).await? {
                debug!(
                    device_id = %job.device_id,
                    step = %job.step,
                    attempts = job.attempts,
                    "Job upserted"
                );
                return Ok(job);
            }
            debug!(device_id = %device_id, "Job changed under upsert, re-reading");
        }
        Err(DatabaseError::Conflict(format!(
            "upsert: {device_id} kept changing after {UPSERT_ATTEMPTS} attempts"
        )))
    }

    async fn delete_job(&self, device_id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM scrape_jobs WHERE device_id = ?1",
                params![device_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;

        debug!(device_id = device_id, deleted = count > 0, "Job deleted");
        Ok(count > 0)
    }

    async fn delete_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, DatabaseError> {
        let removed = self
            .query_jobs(
                "delete_finished_before",
                &format!(
                    "DELETE FROM scrape_jobs WHERE finished_at IS NOT NULL AND finished_at < ?1 RETURNING {JOB_COLUMNS}"
                ),
                params![format_datetime(&cutoff)],
            )
            .await?;

        if !removed.is_empty() {
            info!(count = removed.len(), "Purged finished jobs");
        }
        Ok(removed)
    }
}
