//! `storefront-core`: catalog foundation building blocks.
//!
//! This crate contains **pure** primitives shared by the catalog, the job queue and the
//! worker (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;

pub use entity::{CatalogEntity, Entity};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, JobId};
