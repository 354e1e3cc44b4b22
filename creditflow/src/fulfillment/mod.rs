//! Credit fulfillment: the only path that applies purchased credits.
//!
//! ```text
//! webhook ingress / wallet success
//!   └─ FulfillmentTrigger::trigger(request)
//!        └─ JobQueue::enqueue()          // one job row per order, deduplicated
//!             └─ worker wakes (Notify) or polls
//!                  └─ JobQueue::claim_due()      // lease; crashed runs come back
//!                       └─ CreditFulfillment::run()
//!                            ├─ validate_order     Ledger::try_claim_for_crediting
//!                            ├─ apply_credit       Ledger::apply_credits (CAS)
//!                            └─ send_notification  Notifier
//! ```
//!
//! Delivery is at least once: a request may be triggered any number of times
//! and a job may run more than once. Exactly-once crediting rests on the
//! compare-and-set inside [`Ledger::apply_credits`](crate::db::ledger::Ledger::apply_credits),
//! not on the queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::db::errors::{DbError, Result};
use crate::db::models::orders::BalanceChange;
use crate::types::{FulfillmentSource, JobId, OrderId, UserId};

pub mod job;
pub mod queue;
pub mod worker;

pub use job::CreditFulfillment;
pub use queue::JobQueue;
pub use worker::FulfillmentWorker;

/// Request to apply an order's credits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentRequest {
    pub order_id: OrderId,
    pub user_id: UserId,
    /// Credits the caller expects; the order's own count is what gets applied
    pub credits: i64,
    pub source: FulfillmentSource,
}

/// Entry point used by the payment paths to ask for credits to be applied.
#[async_trait]
pub trait FulfillmentTrigger: Send + Sync {
    async fn trigger(&self, request: FulfillmentRequest) -> Result<()>;
}

/// Trigger backed by the durable job queue. Wakes the worker after enqueueing.
pub struct QueueTrigger {
    queue: Arc<dyn JobQueue>,
    max_attempts: i32,
    wake: Arc<Notify>,
}

impl QueueTrigger {
    pub fn new(queue: Arc<dyn JobQueue>, max_attempts: i32, wake: Arc<Notify>) -> Self {
        Self {
            queue,
            max_attempts,
            wake,
        }
    }
}

#[async_trait]
impl FulfillmentTrigger for QueueTrigger {
    async fn trigger(&self, request: FulfillmentRequest) -> Result<()> {
        let job = self.queue.enqueue(&request, self.max_attempts).await?;
        tracing::info!(
            order_id = %request.order_id,
            job_id = %job.id,
            source = %request.source,
            credits = request.credits,
            status = %job.status,
            "Credit fulfillment triggered"
        );
        self.wake.notify_one();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    /// Credits had already been applied by another run
    Skipped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

/// The next step a job has to run. Persisted after every side-effecting step
/// so a retry resumes where the last run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    ValidateOrder,
    ApplyCredit,
    SendNotification,
    Finished,
}

impl JobStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidateOrder => "validate_order",
            Self::ApplyCredit => "apply_credit",
            Self::SendNotification => "send_notification",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStep {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "validate_order" => Ok(Self::ValidateOrder),
            "apply_credit" => Ok(Self::ApplyCredit),
            "send_notification" => Ok(Self::SendNotification),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("Unknown job step: {s}")),
        }
    }
}

/// Cached result of the apply-credit step: everything the notification
/// needs, so a resumed job never re-reads a balance that may have moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCredit {
    pub balance: BalanceChange,
    pub amount: Decimal,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Durable fulfillment job record
#[derive(Debug, Clone, PartialEq)]
pub struct FulfillmentJob {
    pub id: JobId,
    /// Idempotency key: one job per order
    pub order_id: OrderId,
    pub user_id: UserId,
    pub credits: i64,
    pub source: FulfillmentSource,
    pub status: JobStatus,
    pub step: JobStep,
    /// Runs started so far, including the current one
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub applied: Option<AppliedCredit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FulfillmentJob {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// How a job run ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// This run applied the credits and sent the confirmation
    Completed(AppliedCredit),
    /// Nothing to do: credits were already applied
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Transient fault; the job is rescheduled while attempts remain
    #[error("retryable: {0}")]
    Retryable(String),
    /// Retrying cannot help; the job terminates immediately
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn message(&self) -> &str {
        match self {
            JobError::Retryable(m) | JobError::Fatal(m) => m,
        }
    }
}

/// Missing rows and rows the domain cannot read are data problems; anything
/// else from storage is assumed transient.
impl From<DbError> for JobError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { .. } | DbError::Corrupt { .. } => JobError::Fatal(err.to_string()),
            other => JobError::Retryable(other.to_string()),
        }
    }
}
