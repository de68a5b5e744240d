//! Infrastructure layer: cache, persistent stores, write queues, workers, config.

pub mod cache;
pub mod config;
pub mod context;
pub mod jobs;
pub mod read_path;
pub mod service;
pub mod store;
pub mod workers;

pub use config::{Backend, ConfigError, StorefrontConfig};
pub use context::{CATEGORY_QUEUE, CatalogContext, ContextError, PRODUCT_QUEUE};
pub use read_path::{CollectionReader, ReadError, ReadSource};
pub use service::{CatalogService, EnqueueReceipt, EntityService, ServiceError};
