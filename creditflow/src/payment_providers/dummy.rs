//! Dummy gateways for development and tests
//!
//! `DummyCheckout` hands out a local redirect URL and verifies webhooks with
//! the same signature scheme as the real checkout gateway, so the webhook
//! path can be driven end to end with a locally signed event.
//! `DummyWallet` approves every charge except for configured phone numbers.

use async_trait::async_trait;
use std::time::Duration;

use crate::{
    config::{DummyCheckoutConfig, DummyWalletConfig},
    payment_providers::{CheckoutGateway, CheckoutRequest, CheckoutSession, Result, WalletCharge, WalletGateway, WalletResponse, signing},
};

pub struct DummyCheckout {
    webhook_secret: String,
    webhook_tolerance: Duration,
}

impl From<DummyCheckoutConfig> for DummyCheckout {
    fn from(config: DummyCheckoutConfig) -> Self {
        Self {
            webhook_secret: config.webhook_secret,
            webhook_tolerance: config.webhook_tolerance,
        }
    }
}

#[async_trait]
impl CheckoutGateway for DummyCheckout {
    async fn create_checkout_session(&self, request: CheckoutRequest<'_>) -> Result<CheckoutSession> {
        let session_id = format!("dummy_session_{}", uuid::Uuid::new_v4().simple());
        let url = request.success_url.replace("{CHECKOUT_SESSION_ID}", &session_id);

        tracing::info!(order_id = %request.order.id, session_id = %session_id, "Dummy provider created checkout session");

        Ok(CheckoutSession { session_id, url })
    }

    fn verify_webhook(&self, signature: Option<&str>, body: &[u8]) -> Result<()> {
        signing::verify_webhook(signature, body, &self.webhook_secret, self.webhook_tolerance)
    }
}

pub struct DummyWallet {
    decline_numbers: Vec<String>,
}

impl From<DummyWalletConfig> for DummyWallet {
    fn from(config: DummyWalletConfig) -> Self {
        Self {
            decline_numbers: config.decline_numbers,
        }
    }
}

#[async_trait]
impl WalletGateway for DummyWallet {
    async fn charge(&self, charge: &WalletCharge) -> Result<WalletResponse> {
        if self.decline_numbers.iter().any(|n| n == &charge.phone) {
            tracing::info!(order_id = %charge.order_id, "Dummy wallet declined charge");
            return Ok(WalletResponse {
                response_code: Some("5206".to_string()),
                response_msg: Some("RCS_USER_REJECTED".to_string()),
                transaction_id: None,
                reference_id: Some(charge.order_id.to_string()),
            });
        }

        Ok(WalletResponse {
            response_code: Some("2001".to_string()),
            response_msg: Some("RCS_SUCCESS".to_string()),
            transaction_id: Some(format!("dummy_tx_{}", uuid::Uuid::new_v4().simple())),
            reference_id: Some(charge.order_id.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PaymentPlatform;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_dummy_wallet_declines_configured_numbers() {
        let wallet = DummyWallet::from(DummyWalletConfig {
            decline_numbers: vec!["000".to_string()],
        });
        let mut charge = WalletCharge {
            order_id: uuid::Uuid::new_v4(),
            platform: PaymentPlatform::MobileWalletC,
            amount: Decimal::new(500, 2),
            credits: 20,
            phone: "123".to_string(),
        };

        let approved = wallet.charge(&charge).await.unwrap();
        assert_eq!(approved.response_code.as_deref(), Some("2001"));

        charge.phone = "000".to_string();
        let declined = wallet.charge(&charge).await.unwrap();
        assert_eq!(declined.response_code.as_deref(), Some("5206"));
    }
}
