//! Explicitly constructed connection context.
//!
//! Owns the cache, the entity stores, one queue per collection and the lifecycle bus.
//! Everything downstream (service facade, workers, readers) is built from it.

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use storefront_catalog::{Category, Product};

use crate::cache::{CacheError, CacheStore, InMemoryCacheStore};
use crate::config::{Backend, StorefrontConfig};
use crate::jobs::{InMemoryJobQueue, JobQueue, LifecycleBus, QueueError, QueuePolicy, Worker};
use crate::service::{CatalogService, EntityService};
use crate::store::{EntityStore, InMemoryEntityStore, PostgresEntityStore, StoreError};

pub const PRODUCT_QUEUE: &str = "productQueue";
pub const CATEGORY_QUEUE: &str = "categoryQueue";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("database connection failed: {0}")]
    Database(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
}

#[derive(Clone)]
pub struct CatalogContext {
    pub config: StorefrontConfig,
    pub cache: Arc<dyn CacheStore>,
    pub products: Arc<dyn EntityStore<Product>>,
    pub categories: Arc<dyn EntityStore<Category>>,
    pub product_queue: Arc<dyn JobQueue>,
    pub category_queue: Arc<dyn JobQueue>,
    pub lifecycle: Arc<LifecycleBus>,
    pg_pool: Option<PgPool>,
}

impl CatalogContext {
    /// Everything in process memory; used by tests and the `memory` backend without a database.
    pub fn in_memory(policy: QueuePolicy) -> Self {
        let config = StorefrontConfig {
            policy,
            ..StorefrontConfig::default()
        };
        let lifecycle = Arc::new(LifecycleBus::new());
        Self {
            cache: Arc::new(InMemoryCacheStore::new()),
            products: Arc::new(InMemoryEntityStore::<Product>::new()),
            categories: Arc::new(InMemoryEntityStore::<Category>::new()),
            product_queue: Arc::new(InMemoryJobQueue::new(
                PRODUCT_QUEUE,
                config.queue_policy(),
                lifecycle.clone(),
            )),
            category_queue: Arc::new(InMemoryJobQueue::new(
                CATEGORY_QUEUE,
                config.queue_policy(),
                lifecycle.clone(),
            )),
            lifecycle,
            config,
            pg_pool: None,
        }
    }

    /// Open the backends named by `config`.
    ///
    /// Postgres is used when `database_url` is set (the schema is created if missing).
    /// The `redis` backend needs the crate's `redis` feature.
    pub async fn connect(config: StorefrontConfig) -> Result<Self, ContextError> {
        let mut ctx = Self::in_memory(config.queue_policy());

        if let Some(url) = config.database_url.as_deref() {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .map_err(|e| ContextError::Database(e.to_string()))?;
            crate::store::postgres::migrate(&pool).await?;
            ctx.products = Arc::new(PostgresEntityStore::<Product>::new(pool.clone()));
            ctx.categories = Arc::new(PostgresEntityStore::<Category>::new(pool.clone()));
            ctx.pg_pool = Some(pool);
            info!("using postgres entity store");
        }

        match config.backend {
            Backend::Memory => info!("using in-memory queues and cache"),
            Backend::Redis => ctx.use_redis(&config).await?,
        }

        ctx.config = config;
        Ok(ctx)
    }

    #[cfg(feature = "redis")]
    async fn use_redis(&mut self, config: &StorefrontConfig) -> Result<(), ContextError> {
        use crate::cache::RedisCacheStore;
        use crate::jobs::RedisJobQueue;

        let policy = config.queue_policy();
        self.cache = Arc::new(RedisCacheStore::new(&config.redis_url)?);
        self.product_queue = Arc::new(
            RedisJobQueue::connect(&config.redis_url, PRODUCT_QUEUE, policy.clone(), self.lifecycle.clone())
                .await?,
        );
        self.category_queue = Arc::new(
            RedisJobQueue::connect(&config.redis_url, CATEGORY_QUEUE, policy, self.lifecycle.clone())
                .await?,
        );
        info!(redis_url = %config.redis_url, "using redis queues and cache");
        Ok(())
    }

    #[cfg(not(feature = "redis"))]
    async fn use_redis(&mut self, _config: &StorefrontConfig) -> Result<(), ContextError> {
        Err(ContextError::Unsupported(
            "backend `redis` requires the `redis` feature".to_string(),
        ))
    }

    pub fn service(&self) -> CatalogService {
        CatalogService::new(
            EntityService::new(self.product_queue.clone(), self.products.clone(), self.cache.clone()),
            EntityService::new(
                self.category_queue.clone(),
                self.categories.clone(),
                self.cache.clone(),
            ),
        )
    }

    pub fn product_worker(&self) -> Worker<Product> {
        Worker::new(self.product_queue.clone(), self.products.clone(), self.cache.clone())
    }

    pub fn category_worker(&self) -> Worker<Category> {
        Worker::new(self.category_queue.clone(), self.categories.clone(), self.cache.clone())
    }

    /// Close pooled connections. Workers should be shut down first.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pg_pool {
            pool.close().await;
        }
        info!("catalog context closed");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn memory_backend_connects_without_services() {
        let ctx = CatalogContext::connect(StorefrontConfig::default()).await.unwrap();

        assert_eq!(ctx.product_queue.name(), PRODUCT_QUEUE);
        assert_eq!(ctx.category_queue.name(), CATEGORY_QUEUE);
        ctx.shutdown().await;
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn redis_backend_requires_feature() {
        let config = StorefrontConfig {
            backend: Backend::Redis,
            ..StorefrontConfig::default()
        };

        let err = CatalogContext::connect(config).await.err().unwrap();
        assert!(matches!(err, ContextError::Unsupported(_)));
    }

    #[tokio::test]
    async fn queues_are_wired_to_their_collections() {
        let ctx = CatalogContext::in_memory(QueuePolicy::default());
        let service = ctx.service();

        service
            .create_category(json!({"name": "bakery"}))
            .await
            .unwrap();

        assert_eq!(ctx.category_queue.counts().await.unwrap().waiting, 1);
        assert_eq!(ctx.product_queue.counts().await.unwrap().waiting, 0);

        let job = ctx.category_worker().run_once().await.unwrap().unwrap();
        assert!(job.state.is_terminal());
        assert_eq!(service.list_categories().await.unwrap().len(), 1);
    }
}
