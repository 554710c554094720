//! chainstore-rpc — the sync-side plumbing of the indexing core.
//!
//! # Architecture
//!
//! ```text
//! RequestQueue (per network, FIFO, rate-limited)
//!      └── CachedTransport (memoizes pinned-block reads)
//!              └── RpcTransport (HttpTransport, or anything else)
//! ```
//!
//! Handlers read the chain through the cached transport; the queue paces
//! every request against the provider's rate budget.

pub mod cache;
pub mod error;
pub mod http;
pub mod queue;
pub mod request;
pub mod transport;

pub use cache::{cache_key, CacheError, CacheKey, CachedTransport, MemoryRpcCache, RpcCacheStore};
pub use error::TransportError;
pub use http::{HttpTransport, HttpTransportConfig};
pub use queue::{QueueOptions, RequestQueue};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcCall, RpcId};
pub use transport::RpcTransport;
