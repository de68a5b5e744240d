use std::time::Duration;

use serde_json::json;

use storefront_catalog::Product;
use storefront_core::EntityId;
use storefront_infra::jobs::{JobState, QueuePolicy};
use storefront_infra::{CatalogContext, StorefrontConfig};
use storefront_worker::Runtime;

async fn wait_for_completed(ctx: &CatalogContext, products: usize, categories: usize) {
    for _ in 0..400 {
        let p = ctx.product_queue.counts().await.unwrap().completed;
        let c = ctx.category_queue.counts().await.unwrap().completed;
        if p == products && c == categories {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("jobs did not complete in time");
}

fn fast_context() -> CatalogContext {
    let mut ctx = CatalogContext::in_memory(QueuePolicy::default());
    ctx.config = StorefrontConfig {
        poll_interval: Duration::from_millis(5),
        concurrency: 2,
        ..StorefrontConfig::default()
    };
    ctx
}

#[tokio::test]
async fn runtime_processes_both_collections() {
    let ctx = fast_context();
    let runtime = Runtime::start(&ctx).unwrap();
    let service = ctx.service();

    service
        .create_product(json!({"name": "bread", "price": 500}))
        .await
        .unwrap();
    service
        .create_product(json!({"name": "milk", "price": 120}))
        .await
        .unwrap();
    service
        .create_category(json!({"name": "bakery"}))
        .await
        .unwrap();

    wait_for_completed(&ctx, 2, 1).await;

    let products: Vec<Product> = service.list_products().await.unwrap();
    assert_eq!(products.len(), 2);
    assert_eq!(service.list_categories().await.unwrap().len(), 1);
    assert_eq!(runtime.category_stats().jobs_failed, 0);

    runtime.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn failed_jobs_stay_inspectable_after_shutdown() {
    let ctx = fast_context();
    let runtime = Runtime::start(&ctx).unwrap();

    let receipt = ctx
        .service()
        .update_category(EntityId::parse("missing").unwrap(), Default::default())
        .await
        .unwrap();

    let mut job = None;
    for _ in 0..400 {
        let current = ctx.category_queue.get(receipt.job_id).await.unwrap().unwrap();
        if current.state.is_terminal() {
            job = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    runtime.shutdown().await;

    let job = job.expect("job never settled");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(
        job.failed_reason.as_deref(),
        Some("category not found: missing")
    );
}
