//! Scrape jobs: one durable state machine per device.
//!
//! ```text
//! searching ──► selecting ──► scraping ──► done
//!     │             │             ├──► slug_conflict
//!     └─────────────┴─────────────┴──► error / interrupted ──► (retry)
//! ```

pub mod lifecycle;
pub mod manager;
pub mod model;
pub mod reconcile;

pub use lifecycle::{JobLifecycleManager, SweepReport, spawn_lifecycle_task};
pub use manager::JobManager;
pub use model::{AutocompleteOption, JobEvent, JobStep, JobUpdate, ScrapeJob, SlugConflict};
pub use reconcile::{ReconcileReport, ReconnectReconciler, spawn_reconnect_listener};
