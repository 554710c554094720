//! The `RpcTransport` trait — the seam between the queue/cache layers and
//! whatever actually moves bytes.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// The async trait every RPC transport implements.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and is normally held as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Send a batch of JSON-RPC requests.
    ///
    /// Default implementation sends them sequentially; override for true
    /// wire-level batching.
    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        let mut responses = Vec::with_capacity(reqs.len());
        for req in reqs {
            responses.push(self.send(req).await?);
        }
        Ok(responses)
    }

    /// The transport's identifier (URL or name), for logs and metrics.
    fn url(&self) -> &str;
}
