//! Built-in source pipelines. Every stage runs on the worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{PipelineError, RpcError};
use crate::pipeline::registry::PipelineRegistry;
use crate::pipeline::types::{
    DataKind, PipelineContext, PipelineDefinition, Source, Stage, StageHandler,
};
use crate::rpc::WorkerRpc;

/// Which stages each built-in (source, data kind) pair runs on the worker.
const BUILTIN_PIPELINES: &[(Source, DataKind, &[Stage])] = &[
    (
        Source::Kimovil,
        DataKind::Specs,
        &[Stage::Scrape, Stage::ProcessRaw, Stage::ProcessAi],
    ),
    (Source::PriceRu, DataKind::Links, &[Stage::Scrape]),
    (
        Source::PriceRu,
        DataKind::Prices,
        &[Stage::Scrape, Stage::ProcessRaw],
    ),
    (
        Source::Yandex,
        DataKind::Prices,
        &[Stage::Scrape, Stage::ProcessRaw],
    ),
];

/// Stage handler that forwards to `pipeline.run_stage` on the worker.
pub struct RemoteStage {
    rpc: Arc<dyn WorkerRpc>,
    stage: Stage,
}

impl RemoteStage {
    pub fn new(rpc: Arc<dyn WorkerRpc>, stage: Stage) -> Self {
        Self { rpc, stage }
    }
}

#[async_trait]
impl StageHandler for RemoteStage {
    async fn run(&self, ctx: &PipelineContext) -> Result<Value, PipelineError> {
        match self.rpc.run_stage(self.stage, ctx).await {
            Ok(response) => Ok(response.result),
            Err(RpcError::Remote { code, message, .. }) => Err(PipelineError::StageFailed {
                source_name: ctx.source.as_str().to_string(),
                data_kind: ctx.data_kind.as_str().to_string(),
                stage: self.stage.as_str().to_string(),
                reason: format!("{code}: {message}"),
            }),
            Err(e) => Err(PipelineError::Rpc(e)),
        }
    }
}

/// Build the registry with every built-in pipeline.
pub fn build_registry(rpc: Arc<dyn WorkerRpc>) -> PipelineRegistry {
    let registry = PipelineRegistry::new();
    for (source, data_kind, stages) in BUILTIN_PIPELINES {
        let definition = stages
            .iter()
            .fold(PipelineDefinition::new(*source, *data_kind), |def, stage| {
                def.with_stage(*stage, Arc::new(RemoteStage::new(rpc.clone(), *stage)))
            });
        registry.register_sync(definition);
    }
    tracing::info!(count = BUILTIN_PIPELINES.len(), "Registered source pipelines");
    registry
}
