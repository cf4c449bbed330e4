//! Source pipelines.
//!
//! Each (source, data kind) pair plugs in its own handlers for up to three
//! stages, run in order:
//! 1. `scrape`: fetch raw data from the source
//! 2. `process_raw`: extract structured fields
//! 3. `process_ai`: normalize with a model
//!
//! A stage without a handler is skipped.

pub mod executor;
pub mod registry;
pub mod sources;
pub mod types;

pub use executor::PipelineExecutor;
pub use registry::PipelineRegistry;
pub use sources::{RemoteStage, build_registry};
pub use types::{
    DataKind, PipelineContext, PipelineDefinition, Source, Stage, StageHandler, StageOutcome,
    StageSet,
};
