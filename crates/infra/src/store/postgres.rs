//! Postgres-backed entity store.
//!
//! Every collection shares one table of JSONB documents:
//!
//! ```sql
//! CREATE TABLE catalog_entities (
//!     collection TEXT NOT NULL,
//!     id         TEXT NOT NULL,
//!     data       JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (collection, id)
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed / Io / Tls / PoolTimedOut | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Serialization` |

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use storefront_core::{CatalogEntity, EntityId};

use super::{EntityStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS catalog_entities (
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    data       JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (collection, id)
)
"#;

const LIST_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS catalog_entities_collection_created_idx
    ON catalog_entities (collection, created_at DESC)
"#;

/// Create the entity table if it does not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", None, e))?;
    sqlx::query(LIST_INDEX)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", None, e))?;
    Ok(())
}

/// Postgres-backed store for one entity collection.
///
/// ## Thread Safety
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync).
#[derive(Debug)]
pub struct PostgresEntityStore<E> {
    pool: Arc<PgPool>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for PostgresEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: CatalogEntity> PostgresEntityStore<E> {
    /// Create a new store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            _entity: PhantomData,
        }
    }

    fn encode(entity: &E) -> Result<JsonValue, StoreError> {
        serde_json::to_value(entity).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(row: &sqlx::postgres::PgRow) -> Result<E, StoreError> {
        let data: JsonValue = row
            .try_get("data")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        serde_json::from_value(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl<E: CatalogEntity> EntityStore<E> for PostgresEntityStore<E> {
    #[instrument(skip(self, entity), fields(collection = E::COLLECTION, id = %entity.id()), err)]
    async fn insert(&self, entity: E) -> Result<E, StoreError> {
        let data = Self::encode(&entity)?;
        sqlx::query(
            r#"
            INSERT INTO catalog_entities (collection, id, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            "#,
        )
        .bind(E::COLLECTION)
        .bind(entity.id().as_str())
        .bind(data)
        .bind(entity.created_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", Some((E::KIND, entity.id())), e))?;
        Ok(entity)
    }

    #[instrument(skip(self), fields(collection = E::COLLECTION), err)]
    async fn get(&self, id: &EntityId) -> Result<Option<E>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data FROM catalog_entities
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(E::COLLECTION)
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", Some((E::KIND, id)), e))?;

        row.as_ref().map(Self::decode).transpose()
    }

    #[instrument(skip(self, entity), fields(collection = E::COLLECTION, id = %entity.id()), err)]
    async fn update(&self, entity: E) -> Result<E, StoreError> {
        let data = Self::encode(&entity)?;
        let result = sqlx::query(
            r#"
            UPDATE catalog_entities
            SET data = $3, updated_at = $4
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(E::COLLECTION)
        .bind(entity.id().as_str())
        .bind(data)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", Some((E::KIND, entity.id())), e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: E::KIND,
                id: entity.id().clone(),
            });
        }
        Ok(entity)
    }

    #[instrument(skip(self), fields(collection = E::COLLECTION), err)]
    async fn list(&self) -> Result<Vec<E>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM catalog_entities
            WHERE collection = $1
            ORDER BY created_at DESC, id ASC
            "#,
        )
        .bind(E::COLLECTION)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", None, e))?;

        rows.iter().map(Self::decode).collect()
    }

    #[instrument(skip(self), fields(collection = E::COLLECTION), err)]
    async fn delete(&self, id: &EntityId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM catalog_entities WHERE collection = $1 AND id = $2")
            .bind(E::COLLECTION)
            .bind(id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", Some((E::KIND, id)), e))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(
    operation: &str,
    record: Option<(&'static str, &EntityId)>,
    err: sqlx::Error,
) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                if let Some((kind, id)) = record {
                    return StoreError::Conflict {
                        kind,
                        id: id.clone(),
                    };
                }
            }
            StoreError::Unavailable(format!(
                "database error in {}: {}",
                operation,
                db_err.message()
            ))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        other => StoreError::Unavailable(format!("{} failed: {}", operation, other)),
    }
}
