//! SQL-backed stores for the memoizing RPC transport.
//!
//! Wire table: `rpc_cache(chain_id, block_number, request, result)` with
//! primary key `(chain_id, block_number, request)`. The block number is
//! `numeric(78,0)` on Postgres and decimal text on SQLite; only equality is
//! ever asked of it.

use std::str::FromStr;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::PgPool;

use chainstore_rpc::cache::{CacheError, RpcCacheStore};

fn cache_err(e: impl std::fmt::Display) -> CacheError {
    CacheError(e.to_string())
}

/// Postgres-backed RPC cache.
pub struct PostgresRpcCache {
    pool: PgPool,
}

impl PostgresRpcCache {
    /// Create the cache table if needed.
    pub async fn new(pool: PgPool) -> Result<Self, CacheError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS public.rpc_cache (
                chain_id     INTEGER        NOT NULL,
                block_number NUMERIC(78, 0) NOT NULL,
                request      TEXT           NOT NULL,
                result       TEXT           NOT NULL,
                PRIMARY KEY (chain_id, block_number, request)
            )",
        )
        .execute(&pool)
        .await
        .map_err(cache_err)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RpcCacheStore for PostgresRpcCache {
    async fn get(
        &self,
        chain_id: u64,
        block_number: &str,
        request: &str,
    ) -> Result<Option<String>, CacheError> {
        let block = BigDecimal::from_str(block_number).map_err(cache_err)?;
        sqlx::query_scalar(
            "SELECT result FROM public.rpc_cache
             WHERE chain_id = $1 AND block_number = $2 AND request = $3",
        )
        .bind(chain_id as i64)
        .bind(block)
        .bind(request)
        .fetch_optional(&self.pool)
        .await
        .map_err(cache_err)
    }

    async fn insert(
        &self,
        chain_id: u64,
        block_number: &str,
        request: &str,
        result: &str,
    ) -> Result<(), CacheError> {
        let block = BigDecimal::from_str(block_number).map_err(cache_err)?;
        sqlx::query(
            "INSERT INTO public.rpc_cache (chain_id, block_number, request, result)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id, block_number, request) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(block)
        .bind(request)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(cache_err)?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub use self::sqlite_cache::SqliteRpcCache;

#[cfg(feature = "sqlite")]
mod sqlite_cache {
    use super::*;
    use sqlx::SqlitePool;

    /// SQLite-backed RPC cache.
    pub struct SqliteRpcCache {
        pool: SqlitePool,
    }

    impl SqliteRpcCache {
        pub async fn new(pool: SqlitePool) -> Result<Self, CacheError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS rpc_cache (
                    chain_id     INTEGER NOT NULL,
                    block_number TEXT    NOT NULL,
                    request      TEXT    NOT NULL,
                    result       TEXT    NOT NULL,
                    PRIMARY KEY (chain_id, block_number, request)
                )",
            )
            .execute(&pool)
            .await
            .map_err(cache_err)?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl RpcCacheStore for SqliteRpcCache {
        async fn get(
            &self,
            chain_id: u64,
            block_number: &str,
            request: &str,
        ) -> Result<Option<String>, CacheError> {
            sqlx::query_scalar(
                "SELECT result FROM rpc_cache
                 WHERE chain_id = ? AND block_number = ? AND request = ?",
            )
            .bind(chain_id as i64)
            .bind(block_number)
            .bind(request)
            .fetch_optional(&self.pool)
            .await
            .map_err(cache_err)
        }

        async fn insert(
            &self,
            chain_id: u64,
            block_number: &str,
            request: &str,
            result: &str,
        ) -> Result<(), CacheError> {
            sqlx::query(
                "INSERT INTO rpc_cache (chain_id, block_number, request, result)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (chain_id, block_number, request) DO NOTHING",
            )
            .bind(chain_id as i64)
            .bind(block_number)
            .bind(request)
            .bind(result)
            .execute(&self.pool)
            .await
            .map_err(cache_err)?;
            Ok(())
        }
    }

}
