//! Scrape orchestrator: drives device scrape jobs on a remote worker.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod rpc;
pub mod store;
