//! In-memory job queue for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{JOB, JobQueue};
use crate::db::errors::{DbError, Result};
use crate::fulfillment::{AppliedCredit, FulfillmentJob, FulfillmentRequest, JobStatus, JobStep};
use crate::types::{JobId, OrderId};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, FulfillmentJob>,
    by_order: HashMap<OrderId, JobId>,
}

impl State {
    fn job_mut(&mut self, id: JobId) -> Result<&mut FulfillmentJob> {
        self.jobs.get_mut(&id).ok_or(DbError::not_found(JOB))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<State>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs (test helper)
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(super) fn deadline_after(delay: Duration) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, request: &FulfillmentRequest, max_attempts: i32) -> Result<FulfillmentJob> {
        let mut state = self.state.lock();
        let now = Utc::now();

        if let Some(id) = state.by_order.get(&request.order_id).copied() {
            let job = state.job_mut(id)?;
            if job.status == JobStatus::Failed && job.applied.is_none() {
                job.status = JobStatus::Queued;
                job.step = JobStep::ValidateOrder;
                job.attempts = 0;
                job.max_attempts = max_attempts;
                job.next_attempt_at = now;
                job.updated_at = now;
            }
            return Ok(job.clone());
        }

        let job = FulfillmentJob {
            id: Uuid::new_v4(),
            order_id: request.order_id,
            user_id: request.user_id,
            credits: request.credits,
            source: request.source,
            status: JobStatus::Queued,
            step: JobStep::ValidateOrder,
            attempts: 0,
            max_attempts,
            next_attempt_at: now,
            last_error: None,
            applied: None,
            created_at: now,
            updated_at: now,
        };
        state.by_order.insert(job.order_id, job.id);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_due(&self, limit: i64, lease: Duration) -> Result<Vec<FulfillmentJob>> {
        let mut state = self.state.lock();
        let now = Utc::now();

        // A run that died on its final attempt has nothing left to retry with
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running && job.next_attempt_at <= now && job.attempts_exhausted() {
                job.status = JobStatus::Failed;
                job.last_error = Some("lease expired on final attempt".to_string());
                job.updated_at = now;
            }
        }

        let mut due: Vec<&mut FulfillmentJob> = state
            .jobs
            .values_mut()
            .filter(|job| matches!(job.status, JobStatus::Queued | JobStatus::Running) && job.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|job| (job.next_attempt_at, job.created_at));

        let deadline = deadline_after(lease);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|job| {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.next_attempt_at = deadline;
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn save_progress(&self, id: JobId, step: JobStep, applied: Option<&AppliedCredit>) -> Result<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.step = step;
        if let Some(applied) = applied {
            job.applied = Some(applied.clone());
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finish(&self, id: JobId, status: JobStatus) -> Result<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.status = status;
        job.last_error = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn retry_later(&self, id: JobId, error: &str, delay: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.status = JobStatus::Queued;
        job.last_error = Some(error.to_string());
        job.next_attempt_at = deadline_after(delay);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<FulfillmentJob>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn get_by_order(&self, order_id: OrderId) -> Result<Option<FulfillmentJob>> {
        let state = self.state.lock();
        Ok(state.by_order.get(&order_id).and_then(|id| state.jobs.get(id)).cloned())
    }
}
