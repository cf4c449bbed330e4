//! Runs the stages of a pipeline in order.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::pipeline::registry::PipelineRegistry;
use crate::pipeline::types::{PipelineContext, Stage, StageOutcome};

/// Drives registered stage handlers for a context.
pub struct PipelineExecutor {
    registry: Arc<PipelineRegistry>,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<PipelineRegistry>) -> Self {
        Self { registry }
    }

    /// Run one stage. A missing handler is a skip, not a failure.
    pub async fn run_stage(
        &self,
        ctx: &PipelineContext,
        stage: Stage,
    ) -> Result<StageOutcome, PipelineError> {
        let Some(handler) = self
            .registry
            .get_stage_handler(ctx.source, ctx.data_kind, stage)
            .await
        else {
            debug!(
                device_id = %ctx.device_id,
                source = ctx.source.as_str(),
                data_kind = ctx.data_kind.as_str(),
                stage = %stage,
                "No handler registered, skipping stage"
            );
            return Ok(StageOutcome::Skipped);
        };

        match handler.run(ctx).await {
            Ok(output) => {
                debug!(device_id = %ctx.device_id, stage = %stage, "Stage completed");
                Ok(StageOutcome::Completed(output))
            }
            Err(e) => {
                warn!(
                    device_id = %ctx.device_id,
                    source = ctx.source.as_str(),
                    data_kind = ctx.data_kind.as_str(),
                    stage = %stage,
                    error = %e,
                    "Stage failed"
                );
                Err(e)
            }
        }
    }

    /// Run scrape, process_raw and process_ai in order, stopping at the
    /// first failure. A `scrapeId` in the scrape output is carried into
    /// the context of later stages.
    pub async fn run_all(
        &self,
        mut ctx: PipelineContext,
    ) -> Result<Vec<(Stage, StageOutcome)>, PipelineError> {
        let mut outcomes = Vec::with_capacity(Stage::ORDER.len());
        for stage in Stage::ORDER {
            let outcome = self.run_stage(&ctx, stage).await?;
            if let StageOutcome::Completed(output) = &outcome
                && let Some(scrape_id) = output.get("scrapeId").and_then(|v| v.as_str())
            {
                ctx.scrape_id = Some(scrape_id.to_string());
            }
            outcomes.push((stage, outcome));
        }

        let ran = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, StageOutcome::Completed(_)))
            .count();
        info!(
            device_id = %ctx.device_id,
            source = ctx.source.as_str(),
            data_kind = ctx.data_kind.as_str(),
            ran,
            skipped = outcomes.len() - ran,
            "Pipeline finished"
        );
        Ok(outcomes)
    }
}
