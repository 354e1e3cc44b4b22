//! Read-side cache for the admin order list.
//!
//! Pages are cached per filter for a short TTL. Every component that mutates
//! an order calls [`CacheInvalidator::order_changed`], which drops all pages:
//! a single order can appear on any of them.

use async_trait::async_trait;
use moka::future::Cache;
use std::future::Future;

use crate::{
    config::CacheConfig,
    db::models::orders::{OrderFilter, OrderPage},
    types::OrderId,
};

#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn order_changed(&self, order_id: OrderId);
}

/// Invalidator for deployments and tests without a read cache
pub struct NoopInvalidator;

#[async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn order_changed(&self, _order_id: OrderId) {}
}

#[derive(Clone)]
pub struct OrderListCache {
    pages: Option<Cache<OrderFilter, OrderPage>>,
}

impl OrderListCache {
    pub fn new(config: &CacheConfig) -> Self {
        let pages = config
            .enabled
            .then(|| Cache::builder().max_capacity(config.max_capacity).time_to_live(config.ttl).build());
        Self { pages }
    }

    /// Return the cached page for `filter`, or load and cache it
    pub async fn get_or_load<F, Fut, E>(&self, filter: &OrderFilter, load: F) -> Result<OrderPage, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<OrderPage, E>>,
    {
        let Some(pages) = &self.pages else {
            return load().await;
        };

        if let Some(cached) = pages.get(filter).await {
            tracing::debug!("Cache hit for order list");
            return Ok(cached);
        }

        tracing::debug!("Cache miss for order list, executing query");
        let page = load().await?;
        pages.insert(filter.clone(), page.clone()).await;
        Ok(page)
    }
}

#[async_trait]
impl CacheInvalidator for OrderListCache {
    async fn order_changed(&self, order_id: OrderId) {
        if let Some(pages) = &self.pages {
            pages.invalidate_all();
            tracing::trace!(%order_id, "Invalidated order list cache");
        }
    }
}
