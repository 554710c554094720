//! Memoizing wrapper for side-effect-free RPC reads.
//!
//! `eth_call`, `eth_getBalance`, `eth_getCode` and `eth_getStorageAt` against
//! a pinned block never change answer, so their responses are keyed by
//! `(chain_id, block_number, request)` and persisted through a
//! [`RpcCacheStore`]. Every other method passes straight through, and
//! transport errors surface unchanged. A broken cache backend degrades to
//! pass-through with a warning rather than failing reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use num_bigint::BigUint;
use num_traits::One;
use thiserror::Error;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::RpcTransport;

/// Failure in a cache backend. Never fatal to the read path.
#[derive(Debug, Error)]
#[error("rpc cache error: {0}")]
pub struct CacheError(pub String);

/// Persistence for memoized RPC results.
#[async_trait]
pub trait RpcCacheStore: Send + Sync + 'static {
    async fn get(
        &self,
        chain_id: u64,
        block_number: &str,
        request: &str,
    ) -> Result<Option<String>, CacheError>;

    async fn insert(
        &self,
        chain_id: u64,
        block_number: &str,
        request: &str,
        result: &str,
    ) -> Result<(), CacheError>;
}

/// In-memory cache store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryRpcCache {
    entries: Mutex<HashMap<(u64, String, String), String>>,
}

impl MemoryRpcCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl RpcCacheStore for MemoryRpcCache {
    async fn get(
        &self,
        chain_id: u64,
        block_number: &str,
        request: &str,
    ) -> Result<Option<String>, CacheError> {
        let key = (chain_id, block_number.to_string(), request.to_string());
        Ok(self.entries.lock().unwrap().get(&key).cloned())
    }

    async fn insert(
        &self,
        chain_id: u64,
        block_number: &str,
        request: &str,
        result: &str,
    ) -> Result<(), CacheError> {
        let key = (chain_id, block_number.to_string(), request.to_string());
        self.entries.lock().unwrap().insert(key, result.to_string());
        Ok(())
    }
}

/// The `(block_number, request)` tail of a cache lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Decimal block number; `"latest"` maps to `2^256 − 1` so it sorts
    /// after every historical block without colliding with one.
    pub block_number: String,
    pub request: String,
}

/// Normalize a block-tag parameter to a decimal string, or `None` for
/// tags that are not stable enough to memoize.
fn normalize_block(param: &serde_json::Value) -> Option<String> {
    let tag = param.as_str()?;
    if tag == "latest" {
        let max: BigUint = (BigUint::one() << 256u32) - 1u32;
        return Some(max.to_str_radix(10));
    }
    let digits = tag.strip_prefix("0x")?;
    let value = BigUint::parse_bytes(digits.as_bytes(), 16)?;
    Some(value.to_str_radix(10))
}

/// Build the cache key for a request, or `None` when the request must
/// bypass the cache (uncacheable method, malformed params).
pub fn cache_key(req: &JsonRpcRequest) -> Option<CacheKey> {
    let params = &req.params;
    let (block_param, request) = match req.method.as_str() {
        "eth_call" => {
            let call = params.first()?.as_object()?;
            let to = call.get("to")?.as_str()?;
            let data = call.get("data")?.as_str()?;
            (
                params.get(1)?,
                format!("call_{}_{}", to.to_lowercase(), data.to_lowercase()),
            )
        }
        "eth_getBalance" => {
            let address = params.first()?.as_str()?;
            (params.get(1)?, format!("balance_{}", address.to_lowercase()))
        }
        "eth_getCode" => {
            let address = params.first()?.as_str()?;
            (params.get(1)?, format!("code_{}", address.to_lowercase()))
        }
        "eth_getStorageAt" => {
            let address = params.first()?.as_str()?;
            let slot = params.get(1)?.as_str()?;
            (
                params.get(2)?,
                format!(
                    "storage_{}_{}",
                    address.to_lowercase(),
                    slot.to_lowercase()
                ),
            )
        }
        _ => return None,
    };

    Some(CacheKey {
        block_number: normalize_block(block_param)?,
        request,
    })
}

/// A transport that memoizes cacheable reads through an [`RpcCacheStore`].
pub struct CachedTransport {
    inner: Arc<dyn RpcTransport>,
    store: Arc<dyn RpcCacheStore>,
    chain_id: u64,
}

impl CachedTransport {
    pub fn new(inner: Arc<dyn RpcTransport>, store: Arc<dyn RpcCacheStore>, chain_id: u64) -> Self {
        Self {
            inner,
            store,
            chain_id,
        }
    }
}

#[async_trait]
impl RpcTransport for CachedTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let Some(key) = cache_key(&req) else {
            return self.inner.send(req).await;
        };

        match self
            .store
            .get(self.chain_id, &key.block_number, &key.request)
            .await
        {
            Ok(Some(cached)) => {
                let result: serde_json::Value = serde_json::from_str(&cached)?;
                tracing::trace!(method = %req.method, request = %key.request, "rpc cache hit");
                return Ok(JsonRpcResponse::of_result(req.id, result));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "rpc cache read failed; falling through");
            }
        }

        let response = self.inner.send(req).await?;
        if response.is_ok() {
            if let Some(result) = &response.result {
                if let Err(e) = self
                    .store
                    .insert(self.chain_id, &key.block_number, &key.request, &result.to_string())
                    .await
                {
                    tracing::warn!(error = %e, "rpc cache write failed");
                }
            }
        }
        Ok(response)
    }

    fn url(&self) -> &str {
        self.inner.url()
    }
}
