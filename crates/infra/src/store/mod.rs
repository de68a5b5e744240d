//! Persistent entity storage.
//!
//! The queue worker writes through this contract and the read path lists through it. Records are
//! keyed by their caller-assigned [`EntityId`]; `list` returns newest first.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use storefront_core::{CatalogEntity, EntityId};

pub use memory::InMemoryEntityStore;
pub use postgres::PostgresEntityStore;

/// Entity store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: EntityId },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: EntityId },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Transient failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Entity store abstraction.
#[async_trait]
pub trait EntityStore<E: CatalogEntity>: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id is taken.
    async fn insert(&self, entity: E) -> Result<E, StoreError>;

    async fn get(&self, id: &EntityId) -> Result<Option<E>, StoreError>;

    /// Replace an existing record. Fails with `NotFound` if the id is unknown.
    async fn update(&self, entity: E) -> Result<E, StoreError>;

    /// Every record, newest first.
    async fn list(&self) -> Result<Vec<E>, StoreError>;

    /// Delete by id. Returns whether a record was removed.
    async fn delete(&self, id: &EntityId) -> Result<bool, StoreError>;
}

#[async_trait]
impl<E, S> EntityStore<E> for Arc<S>
where
    E: CatalogEntity,
    S: EntityStore<E> + ?Sized,
{
    async fn insert(&self, entity: E) -> Result<E, StoreError> {
        (**self).insert(entity).await
    }

    async fn get(&self, id: &EntityId) -> Result<Option<E>, StoreError> {
        (**self).get(id).await
    }

    async fn update(&self, entity: E) -> Result<E, StoreError> {
        (**self).update(entity).await
    }

    async fn list(&self) -> Result<Vec<E>, StoreError> {
        (**self).list().await
    }

    async fn delete(&self, id: &EntityId) -> Result<bool, StoreError> {
        (**self).delete(id).await
    }
}
