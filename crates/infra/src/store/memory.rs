use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use storefront_core::{CatalogEntity, EntityId};

use super::{EntityStore, StoreError};

/// In-memory entity store for tests/dev.
#[derive(Debug)]
pub struct InMemoryEntityStore<E> {
    inner: RwLock<HashMap<EntityId, E>>,
}

impl<E> InMemoryEntityStore<E> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<E> Default for InMemoryEntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("entity store lock poisoned".to_string())
}

#[async_trait]
impl<E: CatalogEntity> EntityStore<E> for InMemoryEntityStore<E> {
    async fn insert(&self, entity: E) -> Result<E, StoreError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        if map.contains_key(entity.id()) {
            return Err(StoreError::Conflict {
                kind: E::KIND,
                id: entity.id().clone(),
            });
        }
        map.insert(entity.id().clone(), entity.clone());
        Ok(entity)
    }

    async fn get(&self, id: &EntityId) -> Result<Option<E>, StoreError> {
        let map = self.inner.read().map_err(|_| poisoned())?;
        Ok(map.get(id).cloned())
    }

    async fn update(&self, entity: E) -> Result<E, StoreError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        match map.get_mut(entity.id()) {
            Some(slot) => {
                *slot = entity.clone();
                Ok(entity)
            }
            None => Err(StoreError::NotFound {
                kind: E::KIND,
                id: entity.id().clone(),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<E>, StoreError> {
        let map = self.inner.read().map_err(|_| poisoned())?;
        let mut items: Vec<E> = map.values().cloned().collect();
        // Deterministic: newest first, then by id.
        items.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(items)
    }

    async fn delete(&self, id: &EntityId) -> Result<bool, StoreError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        Ok(map.remove(id).is_some())
    }
}
