//! Stripe Checkout gateway
//!
//! Talks to the Checkout Sessions REST endpoint directly with form-encoded
//! requests. Only session creation and webhook verification are needed: the
//! payment outcome arrives through the webhook and is classified elsewhere.

use async_trait::async_trait;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::Deserialize;
use std::time::Duration;

use crate::{
    config::StripeConfig,
    payment_providers::{CheckoutGateway, CheckoutRequest, CheckoutSession, PaymentError, Result, signing},
};

/// Stripe payment provider
pub struct StripeCheckout {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    webhook_secret: String,
    webhook_tolerance: Duration,
    currency: String,
}

impl From<StripeConfig> for StripeCheckout {
    fn from(config: StripeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            webhook_secret: config.webhook_secret,
            webhook_tolerance: config.webhook_tolerance,
            currency: config.currency,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Convert a dollar amount into the smallest currency unit
fn to_minor_units(amount: Decimal) -> Result<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| PaymentError::InvalidData(format!("amount {amount} out of range")))
}

impl StripeCheckout {
    fn session_form(&self, request: &CheckoutRequest<'_>) -> Result<Vec<(String, String)>> {
        let order = request.order;
        let order_id = order.id.to_string();
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("success_url".into(), request.success_url.to_string()),
            ("cancel_url".into(), request.cancel_url.to_string()),
            ("client_reference_id".into(), order_id.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            ("line_items[0][price_data][currency]".into(), self.currency.clone()),
            ("line_items[0][price_data][unit_amount]".into(), to_minor_units(order.amount)?.to_string()),
            ("line_items[0][price_data][product_data][name]".into(), request.package.name.clone()),
            (
                "line_items[0][price_data][product_data][description]".into(),
                format!("{} credits", order.credits),
            ),
            ("metadata[order_id]".into(), order_id.clone()),
            ("metadata[user_id]".into(), order.user_id.to_string()),
            ("metadata[package_id]".into(), order.package_id.to_string()),
            ("metadata[credits]".into(), order.credits.to_string()),
            // Copied onto the payment intent so payment_intent.* events correlate too
            ("payment_intent_data[metadata][order_id]".into(), order_id),
        ];
        if let Some(email) = request.customer_email {
            form.push(("customer_email".into(), email.to_string()));
        }
        Ok(form)
    }
}

#[async_trait]
impl CheckoutGateway for StripeCheckout {
    async fn create_checkout_session(&self, request: CheckoutRequest<'_>) -> Result<CheckoutSession> {
        let form = self.session_form(&request)?;

        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", format!("checkout-{}", request.order.id))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(order_id = %request.order.id, "Failed to reach Stripe: {:?}", e);
                PaymentError::ProviderApi(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<ErrorResponse>()
                .await
                .ok()
                .map(|e| format!("{}: {}", e.error.kind.unwrap_or_default(), e.error.message.unwrap_or_default()))
                .unwrap_or_default();
            tracing::error!(order_id = %request.order.id, %status, "Failed to create Stripe checkout session: {}", detail);
            return Err(PaymentError::ProviderApi(format!("Stripe returned {status}: {detail}")));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::ProviderApi(format!("Invalid checkout session response: {e}")))?;

        let url = session.url.ok_or_else(|| {
            tracing::error!(session_id = %session.id, "Checkout session missing URL");
            PaymentError::ProviderApi("Checkout session missing URL".to_string())
        })?;

        tracing::info!(order_id = %request.order.id, session_id = %session.id, "Created checkout session");

        Ok(CheckoutSession {
            session_id: session.id,
            url,
        })
    }

    fn verify_webhook(&self, signature: Option<&str>, body: &[u8]) -> Result<()> {
        signing::verify_webhook(signature, body, &self.webhook_secret, self.webhook_tolerance)
    }
}
