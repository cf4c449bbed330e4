//! Shared types for source pipelines.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ── Keys ────────────────────────────────────────────────────────────

/// External data source a pipeline pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Kimovil,
    PriceRu,
    Yandex,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kimovil => "kimovil",
            Self::PriceRu => "price_ru",
            Self::Yandex => "yandex",
        }
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kimovil" => Ok(Self::Kimovil),
            "price_ru" => Ok(Self::PriceRu),
            "yandex" => Ok(Self::Yandex),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

/// Kind of data a pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Specs,
    Prices,
    Links,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Specs => "specs",
            Self::Prices => "prices",
            Self::Links => "links",
        }
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "specs" => Ok(Self::Specs),
            "prices" => Ok(Self::Prices),
            "links" => Ok(Self::Links),
            other => Err(format!("unknown data kind: {other}")),
        }
    }
}

/// Pipeline phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch raw data from the source.
    Scrape,
    /// Extract structured fields from the raw payload.
    ProcessRaw,
    /// Normalize extracted fields with a model.
    ProcessAi,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::Scrape, Stage::ProcessRaw, Stage::ProcessAi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::ProcessRaw => "process_raw",
            Self::ProcessAi => "process_ai",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(Self::Scrape),
            "process_raw" => Ok(Self::ProcessRaw),
            "process_ai" => Ok(Self::ProcessAi),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// Everything a stage handler needs to know about the work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineContext {
    pub job_id: String,
    pub device_id: String,
    pub source: Source,
    pub data_kind: DataKind,
    /// Identifier of the device at the source (slug, listing id).
    pub external_id: String,
    /// Raw scrape record produced by an earlier stage, if any.
    pub scrape_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

// ── Handlers ────────────────────────────────────────────────────────

/// One stage of a source pipeline.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, ctx: &PipelineContext) -> Result<serde_json::Value, PipelineError>;
}

/// Optional handlers for each stage.
#[derive(Clone, Default)]
pub struct StageSet {
    pub scrape: Option<Arc<dyn StageHandler>>,
    pub process_raw: Option<Arc<dyn StageHandler>>,
    pub process_ai: Option<Arc<dyn StageHandler>>,
}

impl StageSet {
    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        match stage {
            Stage::Scrape => self.scrape.clone(),
            Stage::ProcessRaw => self.process_raw.clone(),
            Stage::ProcessAi => self.process_ai.clone(),
        }
    }

    pub fn with(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        match stage {
            Stage::Scrape => self.scrape = Some(handler),
            Stage::ProcessRaw => self.process_raw = Some(handler),
            Stage::ProcessAi => self.process_ai = Some(handler),
        }
        self
    }
}

/// Stage handlers registered for one (source, data kind) pair.
#[derive(Clone)]
pub struct PipelineDefinition {
    pub source: Source,
    pub data_kind: DataKind,
    pub stages: StageSet,
}

impl PipelineDefinition {
    pub fn new(source: Source, data_kind: DataKind) -> Self {
        Self {
            source,
            data_kind,
            stages: StageSet::default(),
        }
    }

    pub fn with_stage(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        self.stages = self.stages.with(stage, handler);
        self
    }
}

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(serde_json::Value),
    /// No handler registered for this stage.
    Skipped,
}
