//! Controller-facing catalog operations.
//!
//! Writes (`create`, `update`) are enqueued and return immediately with an [`EnqueueReceipt`];
//! the worker applies them later. Reads go through the cache-aside [`CollectionReader`].
//! Deletes are applied synchronously and invalidate the collection snapshot themselves.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use storefront_catalog::{Category, CategoryPatch, Product, ProductPatch};
use storefront_core::{CatalogEntity, EntityId, JobId};

use crate::cache::CacheStore;
use crate::jobs::{JobPayload, JobQueue, QueueError};
use crate::read_path::{CollectionReader, ReadError};
use crate::store::{EntityStore, StoreError};

/// Service error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Read(#[from] ReadError),
}

/// Handle returned for an accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub entity_id: EntityId,
}

/// Operations on one collection.
pub struct EntityService<E: CatalogEntity> {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn EntityStore<E>>,
    cache: Arc<dyn CacheStore>,
    reader: CollectionReader<E>,
}

impl<E: CatalogEntity> Clone for EntityService<E> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            reader: self.reader.clone(),
        }
    }
}

impl<E: CatalogEntity> EntityService<E> {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn EntityStore<E>>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            reader: CollectionReader::new(store.clone(), cache.clone()),
            queue,
            store,
            cache,
        }
    }

    /// Enqueue creation of a record from a request body.
    ///
    /// A fresh UUID v4 id replaces any id in `body`. The body must decode as `E` and pass
    /// [`CatalogEntity::validate`]; rejected requests never reach the queue.
    pub async fn create(&self, body: JsonValue) -> Result<EnqueueReceipt, ServiceError> {
        let JsonValue::Object(mut fields) = body else {
            return Err(ServiceError::InvalidRequest(format!(
                "{} body must be a JSON object",
                E::KIND
            )));
        };
        let entity_id = EntityId::generate();
        fields.insert("id".to_string(), JsonValue::String(entity_id.to_string()));

        let entity: E = serde_json::from_value(JsonValue::Object(fields))
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        entity
            .validate()
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        let payload = JobPayload::create(&entity)
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;

        let job_id = self.queue.enqueue(payload).await?;
        info!(queue = %self.queue.name(), job_id = %job_id, id = %entity_id, "create enqueued");
        Ok(EnqueueReceipt { job_id, entity_id })
    }

    /// Enqueue a set-field patch for `id`. Existence is checked by the worker.
    pub async fn update(&self, id: EntityId, patch: E::Patch) -> Result<EnqueueReceipt, ServiceError> {
        E::validate_patch(&patch).map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        let payload = JobPayload::update(id.clone(), &patch)
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;

        let job_id = self.queue.enqueue(payload).await?;
        info!(queue = %self.queue.name(), job_id = %job_id, id = %id, "update enqueued");
        Ok(EnqueueReceipt {
            job_id,
            entity_id: id,
        })
    }

    /// The whole collection, newest first, via the cache.
    pub async fn list(&self) -> Result<Vec<E>, ServiceError> {
        Ok(self.reader.read_collection().await?)
    }

    pub async fn get(&self, id: &EntityId) -> Result<Option<E>, ServiceError> {
        Ok(self.reader.get_by_id(id).await?)
    }

    /// Delete `id` now and invalidate the snapshot. Returns whether a record was removed.
    pub async fn delete(&self, id: &EntityId) -> Result<bool, ServiceError> {
        let removed = self.store.delete(id).await?;
        if removed {
            let key = E::list_cache_key();
            if let Err(e) = self.cache.delete(&key).await {
                warn!(key = %key, id = %id, error = %e, "cache invalidation failed");
            }
        }
        Ok(removed)
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn reader(&self) -> &CollectionReader<E> {
        &self.reader
    }
}

/// Products and categories behind one facade.
#[derive(Clone)]
pub struct CatalogService {
    pub products: EntityService<Product>,
    pub categories: EntityService<Category>,
}

impl CatalogService {
    pub fn new(products: EntityService<Product>, categories: EntityService<Category>) -> Self {
        Self {
            products,
            categories,
        }
    }

    pub async fn create_product(&self, body: JsonValue) -> Result<EnqueueReceipt, ServiceError> {
        self.products.create(body).await
    }

    pub async fn update_product(
        &self,
        id: EntityId,
        patch: ProductPatch,
    ) -> Result<EnqueueReceipt, ServiceError> {
        self.products.update(id, patch).await
    }

    pub async fn list_products(&self) -> Result<Vec<Product>, ServiceError> {
        self.products.list().await
    }

    pub async fn get_product(&self, id: &EntityId) -> Result<Option<Product>, ServiceError> {
        self.products.get(id).await
    }

    pub async fn delete_product(&self, id: &EntityId) -> Result<bool, ServiceError> {
        self.products.delete(id).await
    }

    pub async fn create_category(&self, body: JsonValue) -> Result<EnqueueReceipt, ServiceError> {
        self.categories.create(body).await
    }

    pub async fn update_category(
        &self,
        id: EntityId,
        patch: CategoryPatch,
    ) -> Result<EnqueueReceipt, ServiceError> {
        self.categories.update(id, patch).await
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>, ServiceError> {
        self.categories.list().await
    }

    pub async fn get_category(&self, id: &EntityId) -> Result<Option<Category>, ServiceError> {
        self.categories.get(id).await
    }

    pub async fn delete_category(&self, id: &EntityId) -> Result<bool, ServiceError> {
        self.categories.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::{CACHE_TTL, InMemoryCacheStore};
    use crate::jobs::{InMemoryJobQueue, JobState, LifecycleBus, QueuePolicy};
    use crate::store::InMemoryEntityStore;

    fn product_service() -> (
        EntityService<Product>,
        Arc<InMemoryJobQueue>,
        Arc<InMemoryEntityStore<Product>>,
        Arc<InMemoryCacheStore>,
    ) {
        let queue = Arc::new(InMemoryJobQueue::new(
            "productQueue",
            QueuePolicy::default(),
            Arc::new(LifecycleBus::new()),
        ));
        let store = Arc::new(InMemoryEntityStore::<Product>::new());
        let cache = Arc::new(InMemoryCacheStore::new());
        let service = EntityService::new(queue.clone(), store.clone(), cache.clone());
        (service, queue, store, cache)
    }

    #[tokio::test]
    async fn create_assigns_fresh_id_and_enqueues() {
        let (service, queue, store, _cache) = product_service();

        let receipt = service
            .create(json!({"id": "client-chosen", "name": "bread", "price": 500}))
            .await
            .unwrap();

        assert_ne!(receipt.entity_id.as_str(), "client-chosen");
        let job = queue.get(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.payload.operation, "create");
        assert_eq!(job.payload.data["id"], json!(receipt.entity_id.as_str()));
        // Nothing is written until a worker runs.
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_non_object_bodies() {
        let (service, queue, _store, _cache) = product_service();

        let err = service.create(json!(["bread"])).await.unwrap_err();

        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn create_rejects_invalid_records_before_enqueue() {
        let (service, queue, _store, _cache) = product_service();

        let err = service
            .create(json!({"name": "bread", "price": -5}))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::InvalidRequest(ref msg) if msg.contains("price")));
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn category_without_name_is_rejected() {
        let queue = Arc::new(InMemoryJobQueue::new(
            "categoryQueue",
            QueuePolicy::default(),
            Arc::new(LifecycleBus::new()),
        ));
        let service = EntityService::<Category>::new(
            queue.clone(),
            Arc::new(InMemoryEntityStore::<Category>::new()),
            Arc::new(InMemoryCacheStore::new()),
        );

        let err = service.create(json!({})).await.unwrap_err();

        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn update_rejects_invalid_patch_before_enqueue() {
        let (service, queue, _store, _cache) = product_service();
        let patch = ProductPatch {
            price: Some(-5),
            ..ProductPatch::default()
        };

        let err = service
            .update(EntityId::parse("p1").unwrap(), patch)
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn update_enqueues_patch_for_worker() {
        let (service, queue, _store, _cache) = product_service();
        let patch = ProductPatch {
            price: Some(450),
            ..ProductPatch::default()
        };

        let receipt = service.update(EntityId::parse("p1").unwrap(), patch).await.unwrap();

        let job = queue.get(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(
            job.payload.data,
            json!({"id": "p1", "updatedData": {"price": 450}})
        );
    }

    #[tokio::test]
    async fn delete_invalidates_snapshot() {
        let (service, _queue, store, cache) = product_service();
        store
            .insert(Product::new(EntityId::parse("p1").unwrap(), "bread", 500))
            .await
            .unwrap();
        cache.set("products:list", "[]", CACHE_TTL).await.unwrap();

        assert!(service.delete(&EntityId::parse("p1").unwrap()).await.unwrap());
        assert!(cache.get("products:list").await.unwrap().is_none());
        assert!(!service.delete(&EntityId::parse("p1").unwrap()).await.unwrap());
    }
}
