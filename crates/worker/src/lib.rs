//! Worker process wiring: one queue worker per collection plus the lifecycle logger.

use anyhow::Context;
use tracing::info;

use storefront_infra::jobs::{WorkerHandle, WorkerStats};
use storefront_infra::workers::{ObserverHandle, spawn_lifecycle_logger};
use storefront_infra::{CATEGORY_QUEUE, CatalogContext, PRODUCT_QUEUE, StorefrontConfig};

/// Running workers for a [`CatalogContext`].
#[derive(Debug)]
pub struct Runtime {
    products: WorkerHandle,
    categories: WorkerHandle,
    logger: ObserverHandle,
}

impl Runtime {
    /// Start the lifecycle logger, then the product and category workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(ctx: &CatalogContext) -> anyhow::Result<Self> {
        let logger = spawn_lifecycle_logger(ctx.lifecycle.clone())
            .context("failed to spawn lifecycle logger")?;

        let products = ctx
            .product_worker()
            .spawn(ctx.config.worker_config(PRODUCT_QUEUE));
        let categories = ctx
            .category_worker()
            .spawn(ctx.config.worker_config(CATEGORY_QUEUE));

        info!(concurrency = ctx.config.concurrency, "workers started");
        Ok(Self {
            products,
            categories,
            logger,
        })
    }

    pub fn product_stats(&self) -> WorkerStats {
        self.products.stats()
    }

    pub fn category_stats(&self) -> WorkerStats {
        self.categories.stats()
    }

    /// Drain in-flight jobs, then stop the logger once their events are out.
    pub async fn shutdown(self) {
        self.products.shutdown().await;
        self.categories.shutdown().await;
        self.logger.shutdown();
        info!("workers stopped");
    }
}

/// Connect, run until Ctrl-C, then drain and close.
pub async fn run(config: StorefrontConfig) -> anyhow::Result<()> {
    let ctx = CatalogContext::connect(config)
        .await
        .context("failed to connect catalog backends")?;
    let runtime = Runtime::start(&ctx)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    runtime.shutdown().await;
    ctx.shutdown().await;
    Ok(())
}
