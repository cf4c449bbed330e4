//! Wire frames exchanged with the scraper worker.
//!
//! Every frame is a JSON text message. Requests carry `{id, method, params}`;
//! the worker answers with exactly one `{id, result}` or `{id, error}` and may
//! stream any number of `{id, event}` frames before it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::jobs::model::AutocompleteOption;

/// Remote method names.
pub mod methods {
    pub const SEARCH: &str = "search";
    pub const SCRAPE: &str = "scrape";
    pub const RUN_STAGE: &str = "pipeline.run_stage";
    pub const HEALTH: &str = "health";
}

/// Largest inbound text frame accepted.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Outbound request frame.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame<'a> {
    pub id: &'a str,
    pub method: &'a str,
    pub params: &'a Value,
}

/// Error body of an `{id, error}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<RemoteError> for RpcError {
    fn from(e: RemoteError) -> Self {
        RpcError::Remote {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

/// A streamed event for an in-flight request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress {
        stage: String,
        #[serde(default)]
        percent: Option<f64>,
        #[serde(default, rename = "durationMs")]
        duration_ms: Option<f64>,
    },
    Retry {
        attempt: u32,
        #[serde(rename = "maxAttempts")]
        max_attempts: u32,
        delay: u64,
        reason: String,
    },
    Log {
        level: String,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event { id: String, event: StreamEvent },
    Error { id: String, error: RemoteError },
    Result { id: String, result: Value },
}

/// Parse an inbound text frame. The key present decides the kind:
/// `event` first, then `error`, then `result`.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, RpcError> {
    let mut value: Value = serde_json::from_str(text)
        .map_err(|e| RpcError::Protocol(format!("invalid JSON frame: {e}")))?;

    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::Protocol("frame without string id".into()))?;

    let obj = value
        .as_object_mut()
        .ok_or_else(|| RpcError::Protocol("frame is not an object".into()))?;

    if let Some(event) = obj.remove("event") {
        let event = serde_json::from_value(event)
            .map_err(|e| RpcError::Protocol(format!("bad event for {id}: {e}")))?;
        return Ok(InboundFrame::Event { id, event });
    }
    if let Some(error) = obj.remove("error") {
        let error = serde_json::from_value(error)
            .map_err(|e| RpcError::Protocol(format!("bad error for {id}: {e}")))?;
        return Ok(InboundFrame::Error { id, error });
    }
    if let Some(result) = obj.remove("result") {
        return Ok(InboundFrame::Result { id, result });
    }
    Err(RpcError::Protocol(format!(
        "frame {id} has no event, error or result"
    )))
}

// ── Method payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub results: Vec<AutocompleteOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeParams {
    pub device_id: String,
    pub slug: String,
}

/// Details of a `SLUG_CONFLICT` remote error.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlugConflictDetails {
    pub existing_device_id: String,
    pub existing_device_name: String,
}

/// Remote error code for a slug that already belongs to another device.
pub const SLUG_CONFLICT_CODE: &str = "SLUG_CONFLICT";
