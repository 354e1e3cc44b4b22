//! Payment initiation and confirmation.
//!
//! - [`PaymentInitiator`] creates the order and dispatches it to a rail
//! - [`ingress::WebhookIngress`] turns signed checkout webhooks into ledger
//!   writes and fulfillment triggers
//! - [`classifier`] maps raw gateway payloads onto a normalized outcome
//!
//! Neither path applies credits itself (the manual grant aside). Both hand a
//! [`FulfillmentRequest`] to the fulfillment trigger and let the job's
//! compare-and-set settle any race between them.

use bon::Builder;
use std::sync::Arc;
use url::Url;

use crate::{
    cache::CacheInvalidator,
    db::{
        ledger::Ledger,
        models::{
            orders::{CompletedOrderCreateDBRequest, Order, OrderCreateDBRequest},
            packages::CreditPackage,
            users::User,
        },
    },
    fulfillment::{FulfillmentRequest, FulfillmentTrigger},
    metrics,
    payment_providers::{CheckoutGateway, CheckoutRequest, PaymentError, Result, WalletCharge, WalletGateway},
    types::{FulfillmentSource, OrderStatus, PackageId, PaymentPlatform, UserId, abbrev_uuid},
};

pub mod classifier;
pub mod ingress;

use classifier::{Outcome, classify_wallet_response};

/// A customer's request to buy a package
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub user_id: UserId,
    pub package_id: PackageId,
    /// Raw platform name; unknown values are rejected before anything is written
    pub platform: String,
    pub phone: Option<String>,
    /// Overrides for the checkout redirect targets. Must share the origin of
    /// the configured defaults.
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// What the customer gets back after a successful initiation
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentInitiated {
    pub order: Order,
    pub message: String,
    pub session_id: Option<String>,
    pub redirect_url: Option<String>,
    pub transaction_id: Option<String>,
}

impl PaymentInitiated {
    fn new(order: Order, message: impl Into<String>) -> Self {
        Self {
            order,
            message: message.into(),
            session_id: None,
            redirect_url: None,
            transaction_id: None,
        }
    }
}

/// Creates orders and dispatches them to the rail the customer picked.
///
/// Every call writes at most one order row. Only `Manual` moves a balance
/// directly; wallet successes go through the fulfillment trigger.
#[derive(Builder)]
pub struct PaymentInitiator {
    ledger: Arc<dyn Ledger>,
    checkout: Option<Arc<dyn CheckoutGateway>>,
    wallet: Option<Arc<dyn WalletGateway>>,
    fulfillment: Arc<dyn FulfillmentTrigger>,
    cache: Arc<dyn CacheInvalidator>,
    #[builder(into)]
    success_url: String,
    #[builder(into)]
    cancel_url: String,
}

impl PaymentInitiator {
    #[tracing::instrument(skip_all, fields(user_id = %abbrev_uuid(&request.user_id), platform = %request.platform))]
    pub async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentInitiated> {
        let result = self.dispatch(request).await;

        match &result {
            Ok(initiated) => {
                metrics::record_order_created(initiated.order.platform.as_str(), initiated.order.status.as_str());
                tracing::info!(
                    order_id = %initiated.order.id,
                    status = %initiated.order.status,
                    credits = initiated.order.credits,
                    "Payment initiated"
                );
            }
            Err(e) => {
                let platform = request.platform.parse::<PaymentPlatform>().map(|p| p.as_str()).unwrap_or("unknown");
                metrics::record_payment_error(platform, e.code());
                tracing::warn!(code = e.code(), error = %e, "Payment initiation failed");
            }
        }
        result
    }

    async fn dispatch(&self, request: &PaymentRequest) -> Result<PaymentInitiated> {
        let platform: PaymentPlatform = request
            .platform
            .parse()
            .map_err(|_| PaymentError::UnsupportedPlatform(request.platform.clone()))?;

        // Configuration problems come before any lookup
        let supported = match platform {
            PaymentPlatform::HostedCheckout => self.checkout.is_some(),
            PaymentPlatform::MobileWalletA | PaymentPlatform::MobileWalletB | PaymentPlatform::MobileWalletC => self.wallet.is_some(),
            PaymentPlatform::Manual | PaymentPlatform::DeferredBank => true,
        };
        if !supported {
            return Err(PaymentError::ProviderNotConfigured(platform));
        }

        let phone = request.phone.as_deref().map(str::trim).filter(|p| !p.is_empty());
        if platform.is_mobile_wallet() && phone.is_none() {
            return Err(PaymentError::PhoneNumberRequired(platform));
        }

        let package = self
            .ledger
            .get_package(request.package_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| PaymentError::PackageNotFound(request.package_id.to_string()))?;
        let user = self
            .ledger
            .get_user(request.user_id)
            .await?
            .ok_or_else(|| PaymentError::UserNotFound(request.user_id.to_string()))?;

        match platform {
            PaymentPlatform::HostedCheckout => self.hosted_checkout(request, &user, &package).await,
            PaymentPlatform::MobileWalletA | PaymentPlatform::MobileWalletB | PaymentPlatform::MobileWalletC => {
                // Checked above
                let phone = phone.unwrap_or_default();
                self.mobile_wallet(platform, phone, &user, &package).await
            }
            PaymentPlatform::Manual => self.manual(&user, &package).await,
            PaymentPlatform::DeferredBank => self.deferred_bank(&user, &package).await,
        }
    }

    async fn create_order(&self, user: &User, package: &CreditPackage, platform: PaymentPlatform, phone: Option<&str>, status: OrderStatus) -> Result<Order> {
        let order = self
            .ledger
            .create_order(&OrderCreateDBRequest {
                user_id: user.id,
                package_id: package.id,
                amount: package.price,
                credits: package.total_credits(),
                platform,
                phone: phone.map(str::to_string),
                status,
            })
            .await?;
        self.cache.order_changed(order.id).await;
        Ok(order)
    }

    async fn hosted_checkout(&self, request: &PaymentRequest, user: &User, package: &CreditPackage) -> Result<PaymentInitiated> {
        let gateway = self.checkout.as_ref().ok_or(PaymentError::ProviderNotConfigured(PaymentPlatform::HostedCheckout))?;
        let success_url = redirect_target(request.success_url.as_deref(), &self.success_url)?;
        let cancel_url = redirect_target(request.cancel_url.as_deref(), &self.cancel_url)?;

        let order = self.create_order(user, package, PaymentPlatform::HostedCheckout, None, OrderStatus::Pending).await?;

        let session = gateway
            .create_checkout_session(CheckoutRequest {
                order: &order,
                package,
                success_url: &success_url,
                cancel_url: &cancel_url,
                customer_email: user.email.as_deref(),
            })
            .await;
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "Failed to create checkout session");
                self.ledger.mark_failed(order.id, "checkout session creation failed").await?;
                self.cache.order_changed(order.id).await;
                return Err(e);
            }
        };

        let order = self.ledger.mark_session_created(order.id, &session.session_id).await?;
        self.cache.order_changed(order.id).await;
        tracing::debug!(order_id = %order.id, session_id = %session.session_id, "Checkout session recorded");

        Ok(PaymentInitiated {
            session_id: Some(session.session_id),
            redirect_url: Some(session.url),
            ..PaymentInitiated::new(order, "Checkout session created")
        })
    }

    async fn mobile_wallet(&self, platform: PaymentPlatform, phone: &str, user: &User, package: &CreditPackage) -> Result<PaymentInitiated> {
        let gateway = self.wallet.as_ref().ok_or(PaymentError::ProviderNotConfigured(platform))?;

        let order = self.create_order(user, package, platform, Some(phone), OrderStatus::Processing).await?;

        let charge = WalletCharge {
            order_id: order.id,
            platform,
            amount: order.amount,
            credits: order.credits,
            phone: phone.to_string(),
        };
        let response = gateway.charge(&charge).await.inspect_err(|e| {
            // Outcome unknown: the order stays processing for reconciliation
            tracing::error!(order_id = %order.id, error = %e, "Wallet charge did not complete");
        })?;

        let result = classify_wallet_response(&response);
        match result.outcome {
            Outcome::Succeeded => {
                let order = self.ledger.mark_paid(order.id, result.transaction_ref.as_deref()).await?;
                self.cache.order_changed(order.id).await;

                self.fulfillment
                    .trigger(FulfillmentRequest {
                        order_id: order.id,
                        user_id: order.user_id,
                        credits: order.credits,
                        source: FulfillmentSource::Local,
                    })
                    .await
                    .inspect_err(|e| {
                        tracing::error!(order_id = %order.id, error = %e, "Wallet payment succeeded but fulfillment could not be triggered");
                    })?;

                Ok(PaymentInitiated {
                    transaction_id: result.transaction_ref,
                    ..PaymentInitiated::new(order, "Payment successful, credits are being added")
                })
            }
            Outcome::Failed => {
                let reason = result.reason.unwrap_or_else(|| "wallet payment failed".to_string());
                self.ledger.mark_failed(order.id, &reason).await?;
                self.cache.order_changed(order.id).await;
                Err(PaymentError::WalletDeclined {
                    code: response.response_code,
                    message: response.response_msg,
                })
            }
            Outcome::Pending => Ok(PaymentInitiated {
                transaction_id: result.transaction_ref,
                ..PaymentInitiated::new(order, "Payment is being processed")
            }),
        }
    }

    async fn manual(&self, user: &User, package: &CreditPackage) -> Result<PaymentInitiated> {
        let (order, balance) = self
            .ledger
            .create_completed_order(&CompletedOrderCreateDBRequest::manual(user.id, package.id, package.price, package.total_credits()))
            .await?;
        self.cache.order_changed(order.id).await;
        metrics::record_credits_granted(FulfillmentSource::Admin.as_str(), balance.credits_added);

        tracing::info!(
            order_id = %order.id,
            credits = balance.credits_added,
            new_balance = balance.new_balance,
            "Manual grant applied"
        );

        Ok(PaymentInitiated {
            transaction_id: order.external_transaction_ref.clone(),
            ..PaymentInitiated::new(order, "Credits added")
        })
    }

    async fn deferred_bank(&self, user: &User, package: &CreditPackage) -> Result<PaymentInitiated> {
        let order = self.create_order(user, package, PaymentPlatform::DeferredBank, None, OrderStatus::Processing).await?;
        Ok(PaymentInitiated::new(order, "Awaiting bank transfer"))
    }
}

/// Use `requested` if it points at the same origin as `default`
fn redirect_target(requested: Option<&str>, default: &str) -> Result<String> {
    let Some(requested) = requested.filter(|r| !r.is_empty()) else {
        return Ok(default.to_string());
    };

    let parse = |s: &str| Url::parse(s).map_err(|e| PaymentError::InvalidData(format!("invalid redirect URL: {e}")));
    if parse(requested)?.origin() != parse(default)?.origin() {
        return Err(PaymentError::InvalidData("redirect URL must point at the dashboard".to_string()));
    }
    Ok(requested.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopInvalidator;
    use crate::config::{DummyCheckoutConfig, DummyWalletConfig};
    use crate::db::ledger::in_memory::InMemoryLedger;
    use crate::db::models::orders::OrderFilter;
    use crate::fulfillment::JobQueue;
    use crate::fulfillment::queue::InMemoryJobQueue;
    use crate::fulfillment::QueueTrigger;
    use crate::payment_providers::dummy::{DummyCheckout, DummyWallet};
    use crate::payment_providers::{CheckoutSession, WalletResponse};
    use crate::test_utils::{create_test_package, create_test_user};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use tokio::sync::Notify;

    const SUCCESS_URL: &str = "https://app.example.com/payment/success?session_id={CHECKOUT_SESSION_ID}";
    const CANCEL_URL: &str = "https://app.example.com/payment/cancel";

    struct Fixture {
        ledger: InMemoryLedger,
        queue: Arc<InMemoryJobQueue>,
        initiator: PaymentInitiator,
    }

    fn fixture_with(checkout: Option<Arc<dyn CheckoutGateway>>, wallet: Option<Arc<dyn WalletGateway>>) -> Fixture {
        let ledger = InMemoryLedger::new();
        let queue = Arc::new(InMemoryJobQueue::new());
        let trigger = Arc::new(QueueTrigger::new(queue.clone(), 3, Arc::new(Notify::new())));
        let initiator = PaymentInitiator::builder()
            .ledger(Arc::new(ledger.clone()))
            .maybe_checkout(checkout)
            .maybe_wallet(wallet)
            .fulfillment(trigger)
            .cache(Arc::new(NoopInvalidator))
            .success_url(SUCCESS_URL)
            .cancel_url(CANCEL_URL)
            .build();
        Fixture { ledger, queue, initiator }
    }

    fn fixture() -> Fixture {
        fixture_with(
            Some(Arc::new(DummyCheckout::from(DummyCheckoutConfig::default()))),
            Some(Arc::new(DummyWallet::from(DummyWalletConfig {
                decline_numbers: vec!["0700000000".to_string()],
            }))),
        )
    }

    async fn request(f: &Fixture, platform: &str) -> PaymentRequest {
        let user = create_test_user(&f.ledger, 5).await;
        let package = create_test_package(&f.ledger).await;
        PaymentRequest {
            user_id: user.id,
            package_id: package.id,
            platform: platform.to_string(),
            phone: None,
            success_url: None,
            cancel_url: None,
        }
    }

    async fn balance(f: &Fixture, user_id: UserId) -> i64 {
        f.ledger.get_user(user_id).await.unwrap().unwrap().credits
    }

    #[tokio::test]
    async fn test_hosted_checkout_returns_redirect_without_crediting() {
        let f = fixture();
        let request = request(&f, "hosted_checkout").await;

        let initiated = f.initiator.initiate(&request).await.unwrap();

        assert_eq!(initiated.order.status, OrderStatus::Processing);
        assert_eq!(initiated.order.credits, 120);
        assert!(!initiated.order.credits_added);
        let session_id = initiated.session_id.unwrap();
        assert_eq!(initiated.order.external_session_ref.as_deref(), Some(session_id.as_str()));
        assert!(initiated.redirect_url.unwrap().contains(&session_id));
        assert_eq!(balance(&f, request.user_id).await, 5);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_manual_is_completed_synchronously() {
        let f = fixture();
        let request = request(&f, "manual").await;

        let initiated = f.initiator.initiate(&request).await.unwrap();

        assert_eq!(initiated.order.status, OrderStatus::Completed);
        assert!(initiated.order.credits_added);
        assert!(initiated.transaction_id.unwrap().starts_with("MANUAL-"));
        assert_eq!(balance(&f, request.user_id).await, 125);
    }

    #[tokio::test]
    async fn test_unknown_platform_writes_nothing() {
        let f = fixture();
        let request = request(&f, "paypal").await;

        let err = f.initiator.initiate(&request).await.unwrap_err();

        assert_eq!(err.code(), "UNSUPPORTED_PAYMENT_PLATFORM");
        assert_eq!(f.ledger.order_count(), 0);
    }

    #[tokio::test]
    async fn test_wallet_requires_phone() {
        let f = fixture();
        let mut request = request(&f, "mobile_wallet_a").await;
        request.phone = Some("   ".to_string());

        let err = f.initiator.initiate(&request).await.unwrap_err();

        assert_eq!(err.code(), "PHONE_NUMBER_REQUIRED");
        assert_eq!(f.ledger.order_count(), 0);
    }

    #[tokio::test]
    async fn test_wallet_success_triggers_fulfillment() {
        let f = fixture();
        let mut request = request(&f, "mobile_wallet_b").await;
        request.phone = Some("0711111111".to_string());

        let initiated = f.initiator.initiate(&request).await.unwrap();

        assert_eq!(initiated.order.status, OrderStatus::Processing);
        assert!(initiated.transaction_id.unwrap().starts_with("dummy_tx_"));
        let job = f.queue.get_by_order(initiated.order.id).await.unwrap().unwrap();
        assert_eq!(job.source, FulfillmentSource::Local);
        assert_eq!(job.credits, 120);
        // Credits arrive with the job, not the request
        assert_eq!(balance(&f, request.user_id).await, 5);
    }

    #[tokio::test]
    async fn test_wallet_decline_fails_order() {
        let f = fixture();
        let mut request = request(&f, "mobile_wallet_c").await;
        request.phone = Some("0700000000".to_string());

        let err = f.initiator.initiate(&request).await.unwrap_err();

        assert_eq!(err.code(), "WALLET_PAYMENT_FAILED");
        let page = f.ledger.list_orders(&OrderFilter { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.orders[0].status, OrderStatus::Failed);
        assert!(f.queue.is_empty());
    }

    struct UnreachableWallet;

    #[async_trait]
    impl WalletGateway for UnreachableWallet {
        async fn charge(&self, _charge: &WalletCharge) -> Result<WalletResponse> {
            Err(PaymentError::ProviderApi("connection timed out".to_string()))
        }
    }

    #[tokio::test]
    async fn test_wallet_transport_error_leaves_order_processing() {
        let f = fixture_with(None, Some(Arc::new(UnreachableWallet)));
        let mut request = request(&f, "mobile_wallet_a").await;
        request.phone = Some("0711111111".to_string());

        let err = f.initiator.initiate(&request).await.unwrap_err();

        assert_eq!(err.code(), "PAYMENT_PROCESSING_ERROR");
        let page = f.ledger.list_orders(&OrderFilter { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.orders[0].status, OrderStatus::Processing);
    }

    struct BrokenCheckout;

    #[async_trait]
    impl CheckoutGateway for BrokenCheckout {
        async fn create_checkout_session(&self, _request: CheckoutRequest<'_>) -> Result<CheckoutSession> {
            Err(PaymentError::ProviderApi("502 from gateway".to_string()))
        }

        fn verify_webhook(&self, _signature: Option<&str>, _body: &[u8]) -> Result<()> {
            Err(PaymentError::SignatureMissing)
        }
    }

    #[tokio::test]
    async fn test_checkout_session_failure_fails_order() {
        let f = fixture_with(Some(Arc::new(BrokenCheckout)), None);
        let request = request(&f, "hosted_checkout").await;

        let err = f.initiator.initiate(&request).await.unwrap_err();

        assert_eq!(err.code(), "PAYMENT_PROCESSING_ERROR");
        let page = f.ledger.list_orders(&OrderFilter { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.orders[0].status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_writes_nothing() {
        let f = fixture_with(None, None);
        let request = request(&f, "hosted_checkout").await;

        let err = f.initiator.initiate(&request).await.unwrap_err();

        assert_eq!(err.code(), "PAYMENT_PROVIDER_NOT_CONFIGURED");
        assert_eq!(f.ledger.order_count(), 0);
    }

    #[tokio::test]
    async fn test_inactive_package_is_not_found() {
        let f = fixture();
        let mut request = request(&f, "deferred_bank").await;
        let retired = f
            .ledger
            .create_package(&crate::db::models::packages::PackageCreateDBRequest {
                name: "Retired".to_string(),
                price: Decimal::new(500, 2),
                credits: 20,
                bonus_credits: 0,
                is_active: false,
            })
            .await
            .unwrap();
        request.package_id = retired.id;

        let err = f.initiator.initiate(&request).await.unwrap_err();
        assert_eq!(err.code(), "PACKAGE_NOT_FOUND");

        request.package_id = create_test_package(&f.ledger).await.id;
        let initiated = f.initiator.initiate(&request).await.unwrap();
        assert_eq!(initiated.order.status, OrderStatus::Processing);
        assert_eq!(initiated.order.platform, PaymentPlatform::DeferredBank);
    }

    #[test]
    fn test_redirect_target_must_share_origin() {
        assert_eq!(redirect_target(None, CANCEL_URL).unwrap(), CANCEL_URL);
        assert_eq!(
            redirect_target(Some("https://app.example.com/billing"), CANCEL_URL).unwrap(),
            "https://app.example.com/billing"
        );
        assert!(redirect_target(Some("https://evil.example.net/"), CANCEL_URL).is_err());
        assert!(redirect_target(Some("not a url"), CANCEL_URL).is_err());
    }
}
