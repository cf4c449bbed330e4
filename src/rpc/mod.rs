//! Worker RPC: one multiplexed WebSocket to the scraper worker.

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{RpcClient, RpcResponse, WorkerRpc};
pub use protocol::StreamEvent;
pub use transport::{ConnectionEvent, ConnectionState, EventSink, RpcReply, RpcTransport};
