//! Lookup table from (source, data kind) to stage handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::pipeline::types::{DataKind, PipelineDefinition, Source, Stage, StageHandler};

/// Registry of source pipelines.
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<(Source, DataKind), PipelineDefinition>>,
}

impl PipelineRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
        }
    }

    /// Register a pipeline. A later registration for the same key replaces
    /// the earlier one.
    pub async fn register_pipeline(&self, definition: PipelineDefinition) {
        let key = (definition.source, definition.data_kind);
        if self.pipelines.write().await.insert(key, definition).is_some() {
            tracing::debug!(
                source = key.0.as_str(),
                data_kind = key.1.as_str(),
                "Replaced pipeline registration"
            );
        } else {
            tracing::debug!(
                source = key.0.as_str(),
                data_kind = key.1.as_str(),
                "Registered pipeline"
            );
        }
    }

    /// Register a pipeline (sync version for startup).
    pub fn register_sync(&self, definition: PipelineDefinition) {
        let key = (definition.source, definition.data_kind);
        if let Ok(mut pipelines) = self.pipelines.try_write() {
            pipelines.insert(key, definition);
            tracing::debug!(
                source = key.0.as_str(),
                data_kind = key.1.as_str(),
                "Registered pipeline"
            );
        }
    }

    /// Handler for one stage, or `None` when that stage should be skipped.
    pub async fn get_stage_handler(
        &self,
        source: Source,
        data_kind: DataKind,
        stage: Stage,
    ) -> Option<Arc<dyn StageHandler>> {
        self.pipelines
            .read()
            .await
            .get(&(source, data_kind))
            .and_then(|definition| definition.stages.get(stage))
    }

    /// Same as `get_stage_handler`, keyed by wire names. Unknown names
    /// yield `None`.
    pub async fn get_stage_handler_by_name(
        &self,
        source: &str,
        data_kind: &str,
        stage: &str,
    ) -> Option<Arc<dyn StageHandler>> {
        let source = source.parse().ok()?;
        let data_kind = data_kind.parse().ok()?;
        let stage = stage.parse().ok()?;
        self.get_stage_handler(source, data_kind, stage).await
    }

    /// Whether anything is registered for the key.
    pub async fn has_pipeline(&self, source: Source, data_kind: DataKind) -> bool {
        self.pipelines
            .read()
            .await
            .contains_key(&(source, data_kind))
    }

    pub async fn count(&self) -> usize {
        self.pipelines.read().await.len()
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
