//! Cache-aside reads of whole collections.
//!
//! ```text
//! read_collection():
//!   cache hit  -> decode snapshot, no store access
//!   cache miss -> store.list() (newest first) -> cache.set(key, json, CACHE_TTL) -> return
//! ```
//!
//! The cache never fails a read: an unreachable cache, a failed `set` and an undecodable
//! snapshot are all logged and treated as a miss. Concurrent misses each hit the store and each
//! repopulate the key with an equivalent snapshot.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use storefront_core::{CatalogEntity, EntityId};

use crate::cache::{CACHE_TTL, CacheStore};
use crate::store::{EntityStore, StoreError};

/// Read path error. Only the persistent store can fail a read.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whether a collection read was served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Cache,
    Store,
}

/// Cached reader for the collection of `E`.
pub struct CollectionReader<E: CatalogEntity> {
    store: Arc<dyn EntityStore<E>>,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    _entity: PhantomData<fn() -> E>,
}

impl<E: CatalogEntity> Clone for CollectionReader<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
            ttl: self.ttl,
            _entity: PhantomData,
        }
    }
}

impl<E: CatalogEntity> CollectionReader<E> {
    pub fn new(store: Arc<dyn EntityStore<E>>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            cache,
            ttl: CACHE_TTL,
            _entity: PhantomData,
        }
    }

    /// The whole collection, newest first.
    pub async fn read_collection(&self) -> Result<Vec<E>, ReadError> {
        self.read_collection_traced().await.map(|(items, _)| items)
    }

    /// Like [`read_collection`](Self::read_collection), also reporting where the data came from.
    pub async fn read_collection_traced(&self) -> Result<(Vec<E>, ReadSource), ReadError> {
        let key = E::list_cache_key();

        match self.cache.get(&key).await {
            Ok(Some(snapshot)) => match serde_json::from_str::<Vec<E>>(&snapshot) {
                Ok(items) => {
                    debug!(key = %key, count = items.len(), "cache hit");
                    return Ok((items, ReadSource::Cache));
                }
                Err(e) => warn!(key = %key, error = %e, "discarding undecodable cache snapshot"),
            },
            Ok(None) => debug!(key = %key, "cache miss"),
            Err(e) => warn!(key = %key, error = %e, "cache unavailable; reading from store"),
        }

        let items = self.store.list().await?;

        match serde_json::to_string(&items) {
            Ok(snapshot) => {
                if let Err(e) = self.cache.set(&key, &snapshot, self.ttl).await {
                    warn!(key = %key, error = %e, "failed to populate cache");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "failed to encode cache snapshot"),
        }

        Ok((items, ReadSource::Store))
    }

    /// Point read straight from the store; per-id reads are never cached.
    pub async fn get_by_id(&self, id: &EntityId) -> Result<Option<E>, ReadError> {
        Ok(self.store.get(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use storefront_catalog::Product;

    use super::*;
    use crate::cache::{CacheError, InMemoryCacheStore};
    use crate::store::InMemoryEntityStore;

    /// Store wrapper counting `list` calls.
    struct CountingStore {
        inner: InMemoryEntityStore<Product>,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl EntityStore<Product> for CountingStore {
        async fn insert(&self, entity: Product) -> Result<Product, StoreError> {
            self.inner.insert(entity).await
        }

        async fn get(&self, id: &EntityId) -> Result<Option<Product>, StoreError> {
            self.inner.get(id).await
        }

        async fn update(&self, entity: Product) -> Result<Product, StoreError> {
            self.inner.update(entity).await
        }

        async fn list(&self) -> Result<Vec<Product>, StoreError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            self.inner.list().await
        }

        async fn delete(&self, id: &EntityId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }
    }

    struct DownCache;

    #[async_trait]
    impl CacheStore for DownCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    async fn seeded_store() -> Arc<CountingStore> {
        let store = Arc::new(CountingStore {
            inner: InMemoryEntityStore::new(),
            lists: AtomicUsize::new(0),
        });
        store
            .insert(Product::new(EntityId::parse("p1").unwrap(), "bread", 500))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn miss_populates_cache_then_hit_skips_store() {
        let store = seeded_store().await;
        let cache = Arc::new(InMemoryCacheStore::new());
        let reader = CollectionReader::<Product>::new(store.clone(), cache.clone());

        let (first, source) = reader.read_collection_traced().await.unwrap();
        assert_eq!(source, ReadSource::Store);
        assert_eq!(first.len(), 1);
        assert!(cache.get("products:list").await.unwrap().is_some());

        let (second, source) = reader.read_collection_traced().await.unwrap();
        assert_eq!(source, ReadSource::Cache);
        assert_eq!(second, first);
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_uses_camel_case_records() {
        let store = seeded_store().await;
        let cache = Arc::new(InMemoryCacheStore::new());
        let reader = CollectionReader::<Product>::new(store, cache.clone());

        reader.read_collection().await.unwrap();

        let snapshot: serde_json::Value =
            serde_json::from_str(&cache.get("products:list").await.unwrap().unwrap()).unwrap();
        assert_eq!(snapshot[0]["id"], "p1");
        assert_eq!(snapshot[0]["inStock"], false);
    }

    #[tokio::test]
    async fn unavailable_cache_falls_back_to_store() {
        let store = seeded_store().await;
        let reader = CollectionReader::<Product>::new(store.clone(), Arc::new(DownCache));

        let items = reader.read_collection().await.unwrap();
        assert_eq!(items.len(), 1);

        reader.read_collection().await.unwrap();
        assert_eq!(store.lists.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_treated_as_miss() {
        let store = seeded_store().await;
        let cache = Arc::new(InMemoryCacheStore::new());
        cache.set("products:list", "{not json", CACHE_TTL).await.unwrap();
        let reader = CollectionReader::<Product>::new(store, cache.clone());

        let (items, source) = reader.read_collection_traced().await.unwrap();

        assert_eq!(source, ReadSource::Store);
        assert_eq!(items.len(), 1);
        let repaired = cache.get("products:list").await.unwrap().unwrap();
        assert!(repaired.starts_with('['));
    }

    #[tokio::test]
    async fn point_reads_bypass_cache() {
        let store = seeded_store().await;
        let cache = Arc::new(InMemoryCacheStore::new());
        let reader = CollectionReader::<Product>::new(store, cache.clone());

        let product = reader.get_by_id(&EntityId::parse("p1").unwrap()).await.unwrap();
        assert_eq!(product.map(|p| p.price), Some(500));
        assert!(reader.get_by_id(&EntityId::parse("nope").unwrap()).await.unwrap().is_none());
        assert!(cache.is_empty());
    }
}
