//! Redis-backed cache store.
//!
//! Uses plain `GET` / `SET key value EX ttl` / `DEL`. The connection is opened lazily on first
//! use and dropped after an I/O failure, so an unreachable Redis only ever produces
//! [`CacheError::Unavailable`] (a miss for the read path) and the next call reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;
use tracing::debug;

use super::{CacheError, CacheStore};

#[derive(Clone)]
pub struct RedisCacheStore {
    client: Arc<redis::Client>,
    conn: Arc<RwLock<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore").finish_non_exhaustive()
    }
}

impl RedisCacheStore {
    /// Create a cache store for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// Only validates the URL; no connection is made until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            conn: Arc::new(RwLock::new(None)),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        *self.conn.write().await = Some(conn.clone());
        debug!("redis cache connection established");
        Ok(conn)
    }

    async fn map_error(&self, err: redis::RedisError) -> CacheError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            *self.conn.write().await = None;
            CacheError::Unavailable(err.to_string())
        } else {
            CacheError::Command(err.to_string())
        }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let result: Result<Option<String>, _> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.map_error(e).await),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let result: Result<(), _> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.map_error(e).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let result: Result<i64, _> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.map_error(e).await),
        }
    }
}
