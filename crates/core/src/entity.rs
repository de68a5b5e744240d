//! Entity traits: identity + continuity across state changes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DomainResult;
use crate::id::EntityId;

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}

/// A catalog record that can be created and patched through the write queue and listed
/// through the cached read path.
///
/// Records serialize to the same JSON shape whether they come from the persistent store or
/// from a cached collection snapshot.
pub trait CatalogEntity:
    Entity<Id = EntityId> + Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Partial update applied by `update` jobs. Every present field is a plain "set field".
    type Patch: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Singular name used in logs and error messages (e.g. `product`).
    const KIND: &'static str;

    /// Collection name used for storage and cache keys (e.g. `products`).
    const COLLECTION: &'static str;

    fn created_at(&self) -> DateTime<Utc>;

    /// Assign store-owned timestamps to a freshly constructed record.
    fn stamp_created(&mut self, now: DateTime<Utc>);

    /// Apply a set-field patch. Applying the same patch twice yields the same record.
    fn apply_patch(&mut self, patch: &Self::Patch, now: DateTime<Utc>);

    /// Check record-level invariants. Runs before a create is enqueued.
    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }

    /// Check the fields a patch sets. Runs before the patch is enqueued.
    fn validate_patch(_patch: &Self::Patch) -> DomainResult<()> {
        Ok(())
    }

    /// Cache key holding the full-collection snapshot.
    fn list_cache_key() -> String {
        format!("{}:list", Self::COLLECTION)
    }
}
