//! Test utilities for integration testing (available with `test-utils` feature).

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::{CacheConfig, CheckoutConfig, Config, DummyCheckoutConfig, FulfillmentConfig};
use crate::db::errors::{DbError, Result};
use crate::db::ledger::{Ledger, in_memory::InMemoryLedger};
use crate::db::models::{
    orders::{BalanceChange, ClaimOutcome, CompletedOrderCreateDBRequest, CreditApplication, Order, OrderCreateDBRequest, OrderFilter, OrderPage},
    packages::{CreditPackage, PackageCreateDBRequest},
    users::{User, UserCreateDBRequest},
};
use crate::fulfillment::{FulfillmentWorker, queue::InMemoryJobQueue};
use crate::payment_providers::signing;
use crate::types::{OrderId, PackageId, UserId};

/// Secret the test checkout gateway verifies webhooks with
pub const TEST_WEBHOOK_SECRET: &str = "whsec_test";

pub fn create_test_config() -> Config {
    let mut config = Config {
        dashboard_url: "https://app.example.com".to_string(),
        fulfillment: FulfillmentConfig {
            // Tests drive the worker by hand
            enabled: false,
            retry_backoff: vec![std::time::Duration::ZERO],
            ..Default::default()
        },
        cache: CacheConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    config.payment.checkout = Some(CheckoutConfig::Dummy(DummyCheckoutConfig {
        webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        ..Default::default()
    }));
    config
}

/// The full HTTP stack over in-memory storage
pub struct TestApp {
    pub server: axum_test::TestServer,
    pub ledger: InMemoryLedger,
    pub queue: Arc<InMemoryJobQueue>,
    /// Not running; call `run_until_idle` to process queued fulfillment
    pub worker: Arc<FulfillmentWorker>,
}

pub fn create_test_app(config: Config) -> TestApp {
    let ledger = InMemoryLedger::new();
    let queue = Arc::new(InMemoryJobQueue::new());
    let (state, worker) =
        crate::build_services(&config, Arc::new(ledger.clone()), queue.clone()).expect("Failed to build services");
    let server = axum_test::TestServer::new(crate::build_router(state)).expect("Failed to create test server");
    TestApp {
        server,
        ledger,
        queue,
        worker,
    }
}

/// Signature header for `body`, signed now with [`TEST_WEBHOOK_SECRET`]
pub fn sign_webhook(body: &[u8]) -> String {
    signing::signature_header(TEST_WEBHOOK_SECRET, chrono::Utc::now().timestamp(), body).expect("HMAC accepts any key length")
}

/// `checkout.session.completed` for a paid session
pub fn checkout_completed_event(session_id: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": format!("evt_{}", uuid::Uuid::new_v4().simple()),
        "type": "checkout.session.completed",
        "data": {"object": {
            "id": session_id,
            "payment_status": "paid",
            "payment_intent": "pi_test"
        }}
    }))
    .expect("event serializes")
}

/// `payment_intent.payment_failed` for one declined attempt on an order
pub fn payment_declined_event(order_id: OrderId, message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": format!("evt_{}", uuid::Uuid::new_v4().simple()),
        "type": "payment_intent.payment_failed",
        "data": {"object": {
            "id": "pi_test",
            "metadata": {"order_id": order_id.to_string()},
            "last_payment_error": {"message": message}
        }}
    }))
    .expect("event serializes")
}

/// Create a user with the given balance
pub async fn create_test_user(ledger: &dyn Ledger, credits: i64) -> User {
    ledger
        .create_user(&UserCreateDBRequest {
            email: Some(format!("user-{}@example.com", uuid::Uuid::new_v4().simple())),
            display_name: Some("Test User".to_string()),
            credits,
        })
        .await
        .expect("Failed to create test user")
}

/// The $20 package worth 100 + 20 bonus credits
pub async fn create_test_package(ledger: &dyn Ledger) -> CreditPackage {
    ledger
        .create_package(&PackageCreateDBRequest {
            name: "Starter".to_string(),
            price: Decimal::new(2000, 2),
            credits: 100,
            bonus_credits: 20,
            is_active: true,
        })
        .await
        .expect("Failed to create test package")
}

/// Ledger wrapper that injects faults in front of an [`InMemoryLedger`].
///
/// - `hide_users` makes every user lookup miss
/// - `fail_next_applies(n)` makes the next `n` credit applications fail with
///   a transient storage error, without touching the inner ledger
#[derive(Clone)]
pub struct FaultyLedger {
    inner: InMemoryLedger,
    hide_users: Arc<AtomicBool>,
    apply_failures: Arc<AtomicUsize>,
}

impl FaultyLedger {
    pub fn new(inner: InMemoryLedger) -> Self {
        Self {
            inner,
            hide_users: Arc::new(AtomicBool::new(false)),
            apply_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn hide_users(&self) {
        self.hide_users.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_applies(&self, n: usize) {
        self.apply_failures.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryLedger {
        &self.inner
    }
}

#[async_trait]
impl Ledger for FaultyLedger {
    async fn create_package(&self, request: &PackageCreateDBRequest) -> Result<CreditPackage> {
        self.inner.create_package(request).await
    }

    async fn get_package(&self, id: PackageId) -> Result<Option<CreditPackage>> {
        self.inner.get_package(id).await
    }

    async fn list_active_packages(&self) -> Result<Vec<CreditPackage>> {
        self.inner.list_active_packages().await
    }

    async fn create_user(&self, request: &UserCreateDBRequest) -> Result<User> {
        self.inner.create_user(request).await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        if self.hide_users.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get_user(id).await
    }

    async fn create_order(&self, request: &OrderCreateDBRequest) -> Result<Order> {
        self.inner.create_order(request).await
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        self.inner.get_order(id).await
    }

    async fn find_order_by_session(&self, session_ref: &str) -> Result<Option<Order>> {
        self.inner.find_order_by_session(session_ref).await
    }

    async fn mark_session_created(&self, id: OrderId, session_ref: &str) -> Result<Order> {
        self.inner.mark_session_created(id, session_ref).await
    }

    async fn mark_paid(&self, id: OrderId, transaction_ref: Option<&str>) -> Result<Order> {
        self.inner.mark_paid(id, transaction_ref).await
    }

    async fn mark_failed(&self, id: OrderId, reason: &str) -> Result<Order> {
        self.inner.mark_failed(id, reason).await
    }

    async fn note_declined_attempt(&self, id: OrderId, reason: &str) -> Result<Order> {
        self.inner.note_declined_attempt(id, reason).await
    }

    async fn try_claim_for_crediting(&self, id: OrderId) -> Result<ClaimOutcome> {
        self.inner.try_claim_for_crediting(id).await
    }

    async fn apply_credits(&self, id: OrderId) -> Result<CreditApplication> {
        let injected = self
            .apply_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DbError::Other(anyhow::anyhow!("connection reset by peer")));
        }
        self.inner.apply_credits(id).await
    }

    async fn create_completed_order(&self, request: &CompletedOrderCreateDBRequest) -> Result<(Order, BalanceChange)> {
        self.inner.create_completed_order(request).await
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<OrderPage> {
        self.inner.list_orders(filter).await
    }

    async fn list_user_orders(&self, user_id: UserId, limit: i64) -> Result<Vec<Order>> {
        self.inner.list_user_orders(user_id, limit).await
    }
}
