//! Durable storage for fulfillment jobs.
//!
//! The order id is the job's idempotency key: enqueueing an order that
//! already has a job returns that job instead of creating another. A job that
//! failed before any credit was applied is re-armed with a fresh attempt
//! budget; a job that applied credits is never re-armed.

use async_trait::async_trait;
use std::time::Duration;

use super::{AppliedCredit, FulfillmentJob, FulfillmentRequest, JobStatus, JobStep};
use crate::db::errors::Result;
use crate::types::{JobId, OrderId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobQueue;
pub use postgres::PostgresJobQueue;

pub const JOB: &str = "FulfillmentJob";

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create the job for an order, or return the existing one.
    async fn enqueue(&self, request: &FulfillmentRequest, max_attempts: i32) -> Result<FulfillmentJob>;

    /// Claim up to `limit` due jobs and mark them running.
    ///
    /// Each claim counts as an attempt and hides the job for `lease`; a
    /// running job whose lease ran out is due again.
    async fn claim_due(&self, limit: i64, lease: Duration) -> Result<Vec<FulfillmentJob>>;

    /// Persist step progress and the cached apply-credit result
    async fn save_progress(&self, id: JobId, step: JobStep, applied: Option<&AppliedCredit>) -> Result<()>;

    /// Terminal success (`Completed` or `Skipped`)
    async fn finish(&self, id: JobId, status: JobStatus) -> Result<()>;

    /// Put a running job back in the queue after `delay`
    async fn retry_later(&self, id: JobId, error: &str, delay: Duration) -> Result<()>;

    /// Terminal failure
    async fn fail(&self, id: JobId, error: &str) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<FulfillmentJob>>;

    async fn get_by_order(&self, order_id: OrderId) -> Result<Option<FulfillmentJob>>;
}
