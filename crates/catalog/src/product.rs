use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use storefront_core::{CatalogEntity, DomainError, DomainResult, Entity, EntityId};

/// Catalog product.
///
/// Field names serialize in camelCase, matching what the admin frontend sends and what the
/// collection snapshot in the cache holds. Everything except `id` has a default so a create
/// payload only needs the fields the caller knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub in_stock: bool,
    #[serde(default)]
    pub product_image: Option<String>,
    /// Price in the smallest currency unit (e.g. cents).
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category_id: Option<EntityId>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(id: EntityId, name: impl Into<String>, price: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            quantity: 0,
            in_stock: false,
            product_image: None,
            price,
            expiry_date: None,
            category_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial product update. Absent fields are left untouched.
///
/// The nullable fields are doubly wrapped: `None` leaves the field alone, `Some(None)` clears it
/// (an explicit JSON `null`), and `Some(Some(v))` sets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_stock: Option<bool>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub product_image: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiry_date: Option<Option<DateTime<Utc>>>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub category_id: Option<Option<EntityId>>,
}

/// Deserialize a present field, `null` included, as `Some`. Absence is handled by `default`.
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl Entity for Product {
    type Id = EntityId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl CatalogEntity for Product {
    type Patch = ProductPatch;

    const KIND: &'static str = "product";
    const COLLECTION: &'static str = "products";

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn stamp_created(&mut self, now: DateTime<Utc>) {
        self.created_at = now;
        self.updated_at = now;
    }

    fn apply_patch(&mut self, patch: &ProductPatch, now: DateTime<Utc>) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(quantity) = patch.quantity {
            self.quantity = quantity;
        }
        if let Some(in_stock) = patch.in_stock {
            self.in_stock = in_stock;
        }
        if let Some(image) = &patch.product_image {
            self.product_image = image.clone();
        }
        if let Some(price) = patch.price {
            self.price = price;
        }
        if let Some(expiry) = patch.expiry_date {
            self.expiry_date = expiry;
        }
        if let Some(category_id) = &patch.category_id {
            self.category_id = category_id.clone();
        }
        self.updated_at = now;
    }

    fn validate(&self) -> DomainResult<()> {
        check_amounts(Some(self.price), Some(self.quantity))
    }

    fn validate_patch(patch: &ProductPatch) -> DomainResult<()> {
        check_amounts(patch.price, patch.quantity)
    }
}

fn check_amounts(price: Option<i64>, quantity: Option<i64>) -> DomainResult<()> {
    if price.is_some_and(|p| p < 0) {
        return Err(DomainError::validation("price must not be negative"));
    }
    if quantity.is_some_and(|q| q < 0) {
        return Err(DomainError::validation("quantity must not be negative"));
    }
    Ok(())
}
