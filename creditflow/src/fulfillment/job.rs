//! The credit fulfillment job as an explicit step machine.
//!
//! ```text
//! ValidateOrder ──credits already added──▶ Skipped
//!      │
//!      ▼
//! ApplyCredit ──CAS lost to another run──▶ Skipped
//!      │ (progress + AppliedCredit persisted)
//!      ▼
//! SendNotification
//!      │ (progress persisted)
//!      ▼
//! Finished ──▶ Completed
//! ```
//!
//! Each side-effecting step persists its progress before the next one runs.
//! A retried job resumes at the first unfinished step, and the notification
//! reads the balance captured when credits were applied.

use std::sync::Arc;

use crate::{
    cache::CacheInvalidator,
    db::{
        errors::DbError,
        ledger::{Ledger, USER},
        models::orders::{ClaimOutcome, CreditApplication},
    },
    fulfillment::{AppliedCredit, FulfillmentJob, JobError, JobOutcome, JobQueue, JobStep},
    metrics,
    notifications::{Notifier, PaymentSuccessNotice},
    types::OrderStatus,
};

pub struct CreditFulfillment {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    cache: Arc<dyn CacheInvalidator>,
}

enum StepResult {
    Next(JobStep),
    Skip,
}

impl CreditFulfillment {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Arc<dyn Notifier>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { ledger, notifier, cache }
    }

    /// Run `job` from its current step to a terminal outcome.
    ///
    /// `job` is updated in place as steps complete, and progress is written
    /// through `queue` so another run can pick up from the same point.
    #[tracing::instrument(skip_all, fields(job_id = %job.id, order_id = %job.order_id, source = %job.source, attempt = job.attempts))]
    pub async fn run(&self, job: &mut FulfillmentJob, queue: &dyn JobQueue) -> Result<JobOutcome, JobError> {
        loop {
            let result = match job.step {
                JobStep::ValidateOrder => self.validate_order(job).await?,
                JobStep::ApplyCredit => self.apply_credit(job).await?,
                JobStep::SendNotification => self.send_notification(job).await?,
                JobStep::Finished => {
                    return job
                        .applied
                        .clone()
                        .map(JobOutcome::Completed)
                        .ok_or_else(|| JobError::Fatal("finished job has no applied credit".to_string()));
                }
            };

            match result {
                StepResult::Skip => return Ok(JobOutcome::Skipped),
                StepResult::Next(step) => {
                    queue.save_progress(job.id, step, job.applied.as_ref()).await.map_err(|e| {
                        // Storage trouble is transient even if the job row is what went missing
                        JobError::Retryable(format!("save progress: {e}"))
                    })?;
                    job.step = step;
                }
            }
        }
    }

    async fn validate_order(&self, job: &FulfillmentJob) -> Result<StepResult, JobError> {
        let order = match self.ledger.try_claim_for_crediting(job.order_id).await {
            Ok(ClaimOutcome::Claimable(order)) => order,
            Ok(ClaimOutcome::AlreadyProcessed(_)) => {
                tracing::info!("Credits already added for order, skipping");
                return Ok(StepResult::Skip);
            }
            Err(e @ DbError::NotFound { .. }) => {
                tracing::error!("Fulfillment triggered for an order that does not exist");
                return Err(JobError::Fatal(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if order.user_id != job.user_id {
            tracing::error!(order_user_id = %order.user_id, job_user_id = %job.user_id, "Fulfillment user does not own the order");
            return Err(JobError::Fatal("fulfillment user does not own the order".to_string()));
        }
        if order.status == OrderStatus::Failed {
            tracing::error!("Fulfillment triggered for a failed order");
            return Err(JobError::Fatal("order is failed".to_string()));
        }
        if order.credits != job.credits {
            tracing::warn!(order_credits = order.credits, requested_credits = job.credits, "Requested credits differ from order, applying order credits");
        }

        Ok(StepResult::Next(JobStep::ApplyCredit))
    }

    async fn apply_credit(&self, job: &mut FulfillmentJob) -> Result<StepResult, JobError> {
        let user = match self.ledger.get_user(job.user_id).await? {
            Some(user) => user,
            None => {
                tracing::error!(user_id = %job.user_id, "Fulfillment user not found");
                return Err(JobError::Fatal(DbError::not_found(USER).to_string()));
            }
        };

        match self.ledger.apply_credits(job.order_id).await? {
            CreditApplication::Applied { order, balance } => {
                tracing::info!(
                    credits = balance.credits_added,
                    previous_balance = balance.previous_balance,
                    new_balance = balance.new_balance,
                    "Credits added for order"
                );
                metrics::record_credits_granted(job.source.as_str(), balance.credits_added);
                self.cache.order_changed(order.id).await;

                job.applied = Some(AppliedCredit {
                    balance,
                    amount: order.amount,
                    email: user.email,
                    display_name: user.display_name,
                });
                Ok(StepResult::Next(JobStep::SendNotification))
            }
            CreditApplication::AlreadyApplied(_) => {
                tracing::info!("Another run applied the credits first, skipping");
                Ok(StepResult::Skip)
            }
            CreditApplication::NotCreditable(order) => {
                tracing::error!(status = %order.status, "Order no longer owes credits");
                Err(JobError::Fatal(format!("order is {} and cannot be credited", order.status)))
            }
        }
    }

    async fn send_notification(&self, job: &FulfillmentJob) -> Result<StepResult, JobError> {
        let applied = job
            .applied
            .as_ref()
            .ok_or_else(|| JobError::Fatal("notification step reached without applied credit".to_string()))?;

        let Some(email) = applied.email.clone().filter(|e| !e.trim().is_empty()) else {
            tracing::warn!("User has no email address, cannot send payment confirmation");
            return Err(JobError::Fatal("recipient email address missing".to_string()));
        };

        let notice = PaymentSuccessNotice {
            to_email: email,
            to_name: applied.display_name.clone(),
            order_id: job.order_id,
            amount: applied.amount,
            credits: applied.balance.credits_added,
            new_balance: applied.balance.new_balance,
        };

        // Billing is already done; a failed send is reported, never retried
        if let Err(e) = self.notifier.payment_succeeded(&notice).await {
            tracing::error!(error = %e, "Failed to send payment confirmation");
            return Err(JobError::Fatal(format!("send notification: {e}")));
        }

        Ok(StepResult::Next(JobStep::Finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopInvalidator;
    use crate::db::ledger::in_memory::InMemoryLedger;
    use crate::db::models::{
        orders::{Order, OrderCreateDBRequest},
        packages::PackageCreateDBRequest,
        users::{User, UserCreateDBRequest},
    };
    use crate::errors::Error;
    use crate::fulfillment::queue::InMemoryJobQueue;
    use crate::fulfillment::{FulfillmentRequest, JobStatus};
    use crate::notifications::LogNotifier;
    use crate::test_utils::FaultyLedger;
    use crate::types::{FulfillmentSource, PaymentPlatform};
    use async_trait::async_trait;
    use futures::future::join_all;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    /// Records notices; optionally fails every send
    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<PaymentSuccessNotice>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn payment_succeeded(&self, notice: &PaymentSuccessNotice) -> Result<(), Error> {
            if self.fail {
                return Err(Error::Internal {
                    operation: "send SMTP email: connection refused".to_string(),
                });
            }
            self.sent.lock().push(notice.clone());
            Ok(())
        }
    }

    async fn seed(ledger: &InMemoryLedger, email: Option<&str>) -> (User, Order) {
        let user = ledger
            .create_user(&UserCreateDBRequest {
                email: email.map(str::to_string),
                display_name: Some("Buyer".to_string()),
                credits: 5,
            })
            .await
            .unwrap();
        let package = ledger
            .create_package(&PackageCreateDBRequest {
                name: "Starter".to_string(),
                price: Decimal::new(2000, 2),
                credits: 100,
                bonus_credits: 20,
                is_active: true,
            })
            .await
            .unwrap();
        let order = ledger
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
            .unwrap();
        (user, order)
    }

    async fn job_for(queue: &InMemoryJobQueue, order: &Order) -> FulfillmentJob {
        queue
            .enqueue(
                &FulfillmentRequest {
                    order_id: order.id,
                    user_id: order.user_id,
                    credits: order.credits,
                    source: FulfillmentSource::Checkout,
                },
                3,
            )
            .await
            .unwrap()
    }

    fn fulfillment(ledger: &InMemoryLedger, notifier: Arc<dyn Notifier>) -> CreditFulfillment {
        CreditFulfillment::new(Arc::new(ledger.clone()), notifier, Arc::new(NoopInvalidator))
    }

    async fn balance(ledger: &InMemoryLedger, user: &User) -> i64 {
        ledger.get_user(user.id).await.unwrap().unwrap().credits
    }

    #[tokio::test]
    async fn test_run_applies_credits_and_notifies() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let (user, order) = seed(&ledger, Some("buyer@example.com")).await;
        let mut job = job_for(&queue, &order).await;

        let outcome = fulfillment(&ledger, notifier.clone()).run(&mut job, &queue).await.unwrap();

        let JobOutcome::Completed(applied) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(applied.balance.previous_balance, 5);
        assert_eq!(applied.balance.new_balance, 125);
        assert_eq!(balance(&ledger, &user).await, 125);
        assert_eq!(job.step, JobStep::Finished);

        let sent = notifier.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].new_balance, 125);
        assert_eq!(sent[0].credits, 120);

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.step, JobStep::Finished);
        assert_eq!(stored.applied, Some(applied));
    }

    #[tokio::test]
    async fn test_repeated_and_concurrent_runs_credit_once() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let (user, order) = seed(&ledger, Some("buyer@example.com")).await;
        let job = job_for(&queue, &order).await;
        let fulfillment = fulfillment(&ledger, Arc::new(LogNotifier));

        let runs = join_all((0..6).map(|_| {
            let mut copy = job.clone();
            let fulfillment = &fulfillment;
            let queue = &queue;
            async move { fulfillment.run(&mut copy, queue).await }
        }))
        .await;

        let completed = runs.iter().filter(|r| matches!(r, Ok(JobOutcome::Completed(_)))).count();
        let skipped = runs.iter().filter(|r| matches!(r, Ok(JobOutcome::Skipped))).count();
        assert_eq!(completed, 1);
        assert_eq!(skipped, 5);
        assert_eq!(balance(&ledger, &user).await, 125);

        // A later redelivery finds the order already credited
        let mut late = job.clone();
        assert_eq!(fulfillment.run(&mut late, &queue).await.unwrap(), JobOutcome::Skipped);
        assert!(ledger.get_order(order.id).await.unwrap().unwrap().credits_added);
    }

    #[tokio::test]
    async fn test_missing_order_is_fatal() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let (user, _) = seed(&ledger, Some("buyer@example.com")).await;
        let mut job = queue
            .enqueue(
                &FulfillmentRequest {
                    order_id: uuid::Uuid::new_v4(),
                    user_id: user.id,
                    credits: 120,
                    source: FulfillmentSource::Checkout,
                },
                3,
            )
            .await
            .unwrap();

        let err = fulfillment(&ledger, Arc::new(LogNotifier)).run(&mut job, &queue).await.unwrap_err();

        assert!(matches!(err, JobError::Fatal(_)));
        assert_eq!(balance(&ledger, &user).await, 5);
    }

    #[tokio::test]
    async fn test_foreign_user_is_fatal() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let (user, order) = seed(&ledger, Some("buyer@example.com")).await;
        let mut job = job_for(&queue, &order).await;
        job.user_id = uuid::Uuid::new_v4();

        let err = fulfillment(&ledger, Arc::new(LogNotifier)).run(&mut job, &queue).await.unwrap_err();

        assert!(matches!(err, JobError::Fatal(ref m) if m.contains("does not own")));
        assert_eq!(balance(&ledger, &user).await, 5);
        assert!(!ledger.get_order(order.id).await.unwrap().unwrap().credits_added);
    }

    #[tokio::test]
    async fn test_missing_user_is_fatal() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let (user, order) = seed(&ledger, Some("buyer@example.com")).await;
        let mut job = job_for(&queue, &order).await;
        let faulty = FaultyLedger::new(ledger.clone());
        faulty.hide_users();

        let err = CreditFulfillment::new(Arc::new(faulty), Arc::new(LogNotifier), Arc::new(NoopInvalidator))
            .run(&mut job, &queue)
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Fatal(ref m) if m.contains("User not found")));
        assert_eq!(job.step, JobStep::ApplyCredit);
        assert_eq!(balance(&ledger, &user).await, 5);
    }

    #[tokio::test]
    async fn test_transient_storage_error_is_retryable() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let (user, order) = seed(&ledger, Some("buyer@example.com")).await;
        let mut job = job_for(&queue, &order).await;
        let faulty = FaultyLedger::new(ledger.clone());
        faulty.fail_next_applies(1);
        let fulfillment = CreditFulfillment::new(Arc::new(faulty), Arc::new(LogNotifier), Arc::new(NoopInvalidator));

        let err = fulfillment.run(&mut job, &queue).await.unwrap_err();
        assert!(matches!(err, JobError::Retryable(_)));
        assert_eq!(balance(&ledger, &user).await, 5);

        // The retry resumes at the step that failed
        assert_eq!(queue.get(job.id).await.unwrap().unwrap().step, JobStep::ApplyCredit);
        assert!(matches!(fulfillment.run(&mut job, &queue).await, Ok(JobOutcome::Completed(_))));
        assert_eq!(balance(&ledger, &user).await, 125);
    }

    #[tokio::test]
    async fn test_notification_failure_is_fatal_after_billing() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let (user, order) = seed(&ledger, Some("buyer@example.com")).await;
        let mut job = job_for(&queue, &order).await;

        let err = fulfillment(&ledger, notifier).run(&mut job, &queue).await.unwrap_err();

        assert!(matches!(err, JobError::Fatal(_)));
        assert_eq!(balance(&ledger, &user).await, 125);
        assert_eq!(job.step, JobStep::SendNotification);
        let order = ledger.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert!(order.credits_added);
    }

    #[tokio::test]
    async fn test_missing_email_is_fatal() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let (user, order) = seed(&ledger, None).await;
        let mut job = job_for(&queue, &order).await;

        let err = fulfillment(&ledger, Arc::new(LogNotifier)).run(&mut job, &queue).await.unwrap_err();

        assert!(matches!(err, JobError::Fatal(ref m) if m.contains("email")));
        assert_eq!(balance(&ledger, &user).await, 125);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let ledger = InMemoryLedger::new();
        let queue = InMemoryJobQueue::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let (user, order) = seed(&ledger, Some("buyer@example.com")).await;
        let mut job = job_for(&queue, &order).await;

        // A previous run credited the balance and died before notifying
        let CreditApplication::Applied {
            order: credited,
            balance: applied_balance,
        } = ledger.apply_credits(order.id).await.unwrap()
        else {
            panic!("expected credits to apply");
        };
        job.step = JobStep::SendNotification;
        job.applied = Some(AppliedCredit {
            balance: applied_balance,
            amount: credited.amount,
            email: Some("buyer@example.com".to_string()),
            display_name: None,
        });

        let outcome = fulfillment(&ledger, notifier.clone()).run(&mut job, &queue).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Completed(_)));
        assert_eq!(balance(&ledger, &user).await, 125);
        assert_eq!(notifier.sent.lock()[0].new_balance, 125);
        assert_eq!(queue.get(job.id).await.unwrap().unwrap().status, JobStatus::Queued);
    }
}
