use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storefront_core::{CatalogEntity, DomainError, DomainResult, Entity, EntityId};

/// Product category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Category {
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Entity for Category {
    type Id = EntityId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl CatalogEntity for Category {
    type Patch = CategoryPatch;

    const KIND: &'static str = "category";
    const COLLECTION: &'static str = "categories";

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn stamp_created(&mut self, now: DateTime<Utc>) {
        self.created_at = now;
        self.updated_at = now;
    }

    fn apply_patch(&mut self, patch: &CategoryPatch, now: DateTime<Utc>) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        self.updated_at = now;
    }

    fn validate(&self) -> DomainResult<()> {
        check_name(&self.name)
    }

    fn validate_patch(patch: &CategoryPatch) -> DomainResult<()> {
        patch.name.as_deref().map_or(Ok(()), check_name)
    }
}

fn check_name(name: &str) -> DomainResult<()> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("category name must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_uses_collection_name() {
        assert_eq!(Category::list_cache_key(), "categories:list");
    }

    #[test]
    fn blank_name_is_rejected() {
        let category = Category::new(EntityId::parse("c1").unwrap(), "  ");
        assert!(category.validate().is_err());
    }

    #[test]
    fn blank_rename_is_rejected() {
        let blank = CategoryPatch {
            name: Some(String::new()),
        };
        assert!(Category::validate_patch(&blank).is_err());
        assert!(Category::validate_patch(&CategoryPatch::default()).is_ok());
    }

    #[test]
    fn rename_patch_applies() {
        let mut category = Category::new(EntityId::parse("c1").unwrap(), "bakery");
        let patch = CategoryPatch {
            name: Some("breads".to_string()),
        };
        category.apply_patch(&patch, Utc::now());
        assert_eq!(category.name, "breads");
    }
}
