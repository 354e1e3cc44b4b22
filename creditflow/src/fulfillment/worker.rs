//! Background worker that drains the fulfillment queue.
//!
//! Each tick claims a batch of due jobs, runs them as independent tasks and
//! records the result:
//!
//! - `Completed` / `Skipped` finish the job
//! - `Fatal` fails it immediately
//! - `Retryable` reschedules it with backoff until `max_attempts` is used up
//!
//! The worker sleeps for `poll_interval` between ticks, or less when a
//! trigger wakes it. On shutdown it finishes the batch in hand; anything
//! claimed but unfinished becomes due again when its lease expires.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::FulfillmentConfig;
use crate::fulfillment::{CreditFulfillment, FulfillmentJob, JobError, JobOutcome, JobQueue, JobStatus};
use crate::metrics;

pub struct FulfillmentWorker {
    queue: Arc<dyn JobQueue>,
    fulfillment: Arc<CreditFulfillment>,
    config: FulfillmentConfig,
    wake: Arc<Notify>,
}

impl FulfillmentWorker {
    pub fn new(queue: Arc<dyn JobQueue>, fulfillment: Arc<CreditFulfillment>, config: FulfillmentConfig, wake: Arc<Notify>) -> Self {
        Self {
            queue,
            fulfillment,
            config,
            wake,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Starting fulfillment worker"
        );

        loop {
            let processed = self.tick().await;

            // A full batch means more work is probably waiting
            if processed < self.config.batch_size as usize {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.wake.notified() => {}
                    _ = shutdown.cancelled() => {
                        tracing::info!("Fulfillment worker shutting down");
                        return;
                    }
                }
            } else if shutdown.is_cancelled() {
                tracing::info!("Fulfillment worker shutting down");
                return;
            }
        }
    }

    /// Claim and run one batch of due jobs. Returns how many were claimed.
    pub async fn tick(&self) -> usize {
        let jobs = match self.queue.claim_due(self.config.batch_size, self.config.lease).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to claim fulfillment jobs");
                return 0;
            }
        };

        if jobs.is_empty() {
            tracing::trace!("No fulfillment jobs due");
            return 0;
        }

        let claimed = jobs.len();
        tracing::debug!(count = claimed, "Claimed fulfillment jobs");

        let mut join_set = JoinSet::new();
        for job in jobs {
            let queue = self.queue.clone();
            let fulfillment = self.fulfillment.clone();
            let config = self.config.clone();
            join_set.spawn(async move { process(job, queue.as_ref(), &fulfillment, &config).await });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Fulfillment task panicked");
            }
        }

        claimed
    }

    /// Tick until nothing is due. Jobs rescheduled into the future are left
    /// for later.
    pub async fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let claimed = self.tick().await;
            if claimed == 0 {
                return total;
            }
            total += claimed;
        }
    }
}

async fn process(mut job: FulfillmentJob, queue: &dyn JobQueue, fulfillment: &CreditFulfillment, config: &FulfillmentConfig) {
    let source = job.source.as_str();
    let result = fulfillment.run(&mut job, queue).await;

    let recorded = match result {
        Ok(JobOutcome::Completed(_)) => {
            metrics::record_fulfillment_outcome(source, "completed");
            queue.finish(job.id, JobStatus::Completed).await
        }
        Ok(JobOutcome::Skipped) => {
            metrics::record_fulfillment_outcome(source, "skipped");
            queue.finish(job.id, JobStatus::Skipped).await
        }
        Err(JobError::Fatal(error)) => {
            metrics::record_fulfillment_outcome(source, "failed");
            tracing::error!(job_id = %job.id, order_id = %job.order_id, step = %job.step, %error, "Fulfillment job failed permanently");
            queue.fail(job.id, &error).await
        }
        Err(JobError::Retryable(error)) if job.attempts_exhausted() => {
            metrics::record_fulfillment_outcome(source, "exhausted");
            tracing::error!(
                job_id = %job.id,
                order_id = %job.order_id,
                attempts = job.attempts,
                %error,
                "Fulfillment job exhausted its retries"
            );
            queue.fail(job.id, &format!("retries exhausted: {error}")).await
        }
        Err(JobError::Retryable(error)) => {
            metrics::record_fulfillment_outcome(source, "retried");
            let delay = config.backoff_after(job.attempts);
            tracing::warn!(
                job_id = %job.id,
                order_id = %job.order_id,
                attempts = job.attempts,
                retry_in = ?delay,
                %error,
                "Fulfillment job will be retried"
            );
            queue.retry_later(job.id, &error, delay).await
        }
    };

    if let Err(e) = recorded {
        // The lease will hand the job out again
        tracing::warn!(job_id = %job.id, error = %e, "Failed to record fulfillment job result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopInvalidator;
    use crate::db::ledger::{Ledger, in_memory::InMemoryLedger};
    use crate::db::models::orders::{Order, OrderCreateDBRequest};
    use crate::fulfillment::queue::InMemoryJobQueue;
    use crate::fulfillment::{FulfillmentRequest, FulfillmentTrigger, QueueTrigger};
    use crate::notifications::LogNotifier;
    use crate::test_utils::{FaultyLedger, create_test_package, create_test_user};
    use crate::types::{FulfillmentSource, OrderStatus, PaymentPlatform};
    use std::time::Duration;

    struct Harness {
        ledger: InMemoryLedger,
        faulty: FaultyLedger,
        queue: Arc<InMemoryJobQueue>,
        trigger: QueueTrigger,
        worker: Arc<FulfillmentWorker>,
    }

    fn harness() -> Harness {
        let ledger = InMemoryLedger::new();
        let faulty = FaultyLedger::new(ledger.clone());
        let queue = Arc::new(InMemoryJobQueue::new());
        let wake = Arc::new(Notify::new());
        let config = FulfillmentConfig {
            retry_backoff: vec![Duration::ZERO],
            ..Default::default()
        };
        let fulfillment = Arc::new(CreditFulfillment::new(
            Arc::new(faulty.clone()),
            Arc::new(LogNotifier),
            Arc::new(NoopInvalidator),
        ));
        let trigger = QueueTrigger::new(queue.clone(), config.max_attempts, wake.clone());
        let worker = Arc::new(FulfillmentWorker::new(queue.clone(), fulfillment, config, wake));
        Harness {
            ledger,
            faulty,
            queue,
            trigger,
            worker,
        }
    }

    async fn paid_order(ledger: &InMemoryLedger) -> Order {
        let user = create_test_user(ledger, 5).await;
        let package = create_test_package(ledger).await;
        ledger
            .create_order(&OrderCreateDBRequest {
                user_id: user.id,
                package_id: package.id,
                amount: package.price,
                credits: package.total_credits(),
                platform: PaymentPlatform::HostedCheckout,
                phone: None,
                status: OrderStatus::Processing,
            })
            .await
            .unwrap()
    }

    fn request(order: &Order) -> FulfillmentRequest {
        FulfillmentRequest {
            order_id: order.id,
            user_id: order.user_id,
            credits: order.credits,
            source: FulfillmentSource::Checkout,
        }
    }

    async fn balance(ledger: &InMemoryLedger, order: &Order) -> i64 {
        ledger.get_user(order.user_id).await.unwrap().unwrap().credits
    }

    #[tokio::test]
    async fn test_many_triggers_credit_once() {
        let h = harness();
        let order = paid_order(&h.ledger).await;

        for _ in 0..5 {
            h.trigger.trigger(request(&order)).await.unwrap();
        }
        assert_eq!(h.queue.len(), 1);

        h.worker.run_until_idle().await;
        h.trigger.trigger(request(&order)).await.unwrap();
        h.worker.run_until_idle().await;

        assert_eq!(balance(&h.ledger, &order).await, 125);
        let job = h.queue.get_by_order(order.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_nonexistent_order_fails_without_retry() {
        let h = harness();
        let order = paid_order(&h.ledger).await;
        let mut ghost = request(&order);
        ghost.order_id = uuid::Uuid::new_v4();

        h.trigger.trigger(ghost.clone()).await.unwrap();
        h.worker.run_until_idle().await;

        let job = h.queue.get_by_order(ghost.order_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(balance(&h.ledger, &order).await, 5);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let h = harness();
        let order = paid_order(&h.ledger).await;
        h.faulty.fail_next_applies(2);

        h.trigger.trigger(request(&order)).await.unwrap();
        h.worker.run_until_idle().await;

        let job = h.queue.get_by_order(order.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(balance(&h.ledger, &order).await, 125);
    }

    #[test_log::test(tokio::test)]
    async fn test_retries_are_bounded() {
        let h = harness();
        let order = paid_order(&h.ledger).await;
        h.faulty.fail_next_applies(10);

        h.trigger.trigger(request(&order)).await.unwrap();
        h.worker.run_until_idle().await;

        let job = h.queue.get_by_order(order.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.last_error.unwrap().starts_with("retries exhausted"));
        assert_eq!(balance(&h.ledger, &order).await, 5);
        assert!(!h.faulty.inner().get_order(order.id).await.unwrap().unwrap().credits_added);
    }

    #[tokio::test]
    async fn test_run_wakes_on_trigger_and_stops_on_shutdown() {
        let h = harness();
        let order = paid_order(&h.ledger).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(h.worker.clone().run(shutdown.clone()));

        h.trigger.trigger(request(&order)).await.unwrap();

        let mut credited = false;
        for _ in 0..50 {
            if balance(&h.ledger, &order).await == 125 {
                credited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(credited, "worker should pick up the job without waiting for the poll interval");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
