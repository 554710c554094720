//! chainstore-storage — checkpoint-versioned entity store backends.
//!
//! # Architecture
//!
//! ```text
//! EntityStore (trait)
//!     ├── PostgresEntityStore   schemas-as-namespaces, publish views,
//!     │                         notify trigger, revert
//!     └── SqliteEntityStore     prefix namespaces, publish views, revert
//!                               (feature "sqlite")
//! RpcCacheStore impls           rpc_cache wire table on both backends
//! ```
//!
//! Every user row is stored as versions carrying a `[from, to)` checkpoint
//! interval; the current version is the one open at `"latest"`. See the
//! `sql` module for the exact statements both backends share.

pub mod filter;
pub mod postgres;
pub mod rpc_cache;
pub mod sql;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use filter::{Condition, Direction, Filter, OrderBy};
pub use postgres::{
    published_namespace, resolve_read_namespace, NamespaceWatcher, PostgresEntityStore,
    PostgresOptions, ReadNamespace,
};
pub use rpc_cache::PostgresRpcCache;
pub use store::{EntityStore, FindMany, Patch, StoreOptions, MAX_BATCH_SIZE};

#[cfg(feature = "sqlite")]
pub use rpc_cache::SqliteRpcCache;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEntityStore;
