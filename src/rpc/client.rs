//! Typed worker operations on top of `RpcTransport`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::RpcError;
use crate::jobs::model::AutocompleteOption;
use crate::pipeline::types::{PipelineContext, Stage};
use crate::rpc::protocol::{ScrapeParams, SearchParams, SearchResult, methods};
use crate::rpc::transport::{EventSink, RpcReply, RpcTransport};

/// A typed result with the correlation id of the call that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse<T> {
    pub request_id: String,
    pub result: T,
}

/// Remote operations the job layer and pipeline stages depend on.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Look up candidate devices for a free-text name.
    async fn search(
        &self,
        query: &str,
        events: Option<EventSink>,
    ) -> Result<RpcResponse<Vec<AutocompleteOption>>, RpcError>;

    /// Scrape a confirmed slug for a device.
    async fn scrape(
        &self,
        device_id: &str,
        slug: &str,
        events: Option<EventSink>,
    ) -> Result<RpcResponse<Value>, RpcError>;

    /// Run one pipeline stage on the worker.
    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &PipelineContext,
    ) -> Result<RpcResponse<Value>, RpcError>;

    /// Ask the worker whether it is alive.
    async fn health_check(&self) -> Result<RpcResponse<Value>, RpcError>;
}

/// `WorkerRpc` backed by the shared transport.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<RpcTransport>,
}

impl RpcClient {
    pub fn new(transport: Arc<RpcTransport>) -> Self {
        Self { transport }
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        events: Option<EventSink>,
    ) -> Result<RpcReply, RpcError> {
        self.transport
            .send_request(method, params, timeout, events)
            .await
    }
}

fn to_params<T: serde::Serialize>(params: &T) -> Result<Value, RpcError> {
    serde_json::to_value(params).map_err(|e| RpcError::Protocol(format!("encode params: {e}")))
}

fn decode<T: DeserializeOwned>(method: &str, reply: RpcReply) -> Result<RpcResponse<T>, RpcError> {
    let result = serde_json::from_value(reply.result)
        .map_err(|e| RpcError::Protocol(format!("unexpected {method} result: {e}")))?;
    Ok(RpcResponse {
        request_id: reply.request_id,
        result,
    })
}

#[async_trait]
impl WorkerRpc for RpcClient {
    async fn search(
        &self,
        query: &str,
        events: Option<EventSink>,
    ) -> Result<RpcResponse<Vec<AutocompleteOption>>, RpcError> {
        let params = to_params(&SearchParams {
            query: query.to_string(),
        })?;
        let timeout = self.transport.config().search_timeout;
        let reply = self.call(methods::SEARCH, params, timeout, events).await?;
        let response: RpcResponse<SearchResult> = decode(methods::SEARCH, reply)?;
        Ok(RpcResponse {
            request_id: response.request_id,
            result: response.result.results,
        })
    }

    async fn scrape(
        &self,
        device_id: &str,
        slug: &str,
        events: Option<EventSink>,
    ) -> Result<RpcResponse<Value>, RpcError> {
        let params = to_params(&ScrapeParams {
            device_id: device_id.to_string(),
            slug: slug.to_string(),
        })?;
        let timeout = self.transport.config().scrape_timeout;
        let reply = self.call(methods::SCRAPE, params, timeout, events).await?;
        decode(methods::SCRAPE, reply)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &PipelineContext,
    ) -> Result<RpcResponse<Value>, RpcError> {
        let params = json!({
            "stage": stage.as_str(),
            "context": to_params(ctx)?,
        });
        let timeout = self.transport.config().stage_timeout;
        let reply = self.call(methods::RUN_STAGE, params, timeout, None).await?;
        decode(methods::RUN_STAGE, reply)
    }

    async fn health_check(&self) -> Result<RpcResponse<Value>, RpcError> {
        let timeout = self.transport.config().health_timeout;
        let reply = self
            .call(methods::HEALTH, Value::Object(Default::default()), timeout, None)
            .await?;
        decode(methods::HEALTH, reply)
    }
}
