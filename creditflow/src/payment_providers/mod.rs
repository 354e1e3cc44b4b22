//! Payment gateway abstraction layer
//!
//! Two gateway families sit behind traits:
//!
//! - [`CheckoutGateway`]: hosted card checkout. Creates a checkout session the
//!   customer is redirected to, and verifies the signed webhooks the gateway
//!   sends back once the payment settles.
//! - [`WalletGateway`]: mobile-money wallets. A single synchronous charge
//!   call whose response is classified immediately.
//!
//! The gateways only move bytes. Deciding what a response means for an order
//! is the job of [`crate::payments::classifier`].

use async_trait::async_trait;
use axum::http::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    config::{CheckoutConfig, WalletConfig},
    db::{
        errors::DbError,
        models::{orders::Order, packages::CreditPackage},
    },
    types::{OrderId, PaymentPlatform},
};

pub mod dummy;
pub mod mobile_wallet;
pub mod signing;
pub mod stripe;

/// Create the hosted checkout gateway from configuration
///
/// This is the single point where we convert config into gateway instances.
/// Adding a new provider requires adding a match arm here.
pub fn create_checkout_gateway(config: CheckoutConfig) -> Box<dyn CheckoutGateway> {
    match config {
        CheckoutConfig::Stripe(stripe_config) => Box::new(stripe::StripeCheckout::from(stripe_config)),
        CheckoutConfig::Dummy(dummy_config) => Box::new(dummy::DummyCheckout::from(dummy_config)),
    }
}

/// Create the mobile wallet gateway from configuration
pub fn create_wallet_gateway(config: WalletConfig) -> Result<Box<dyn WalletGateway>> {
    Ok(match config {
        WalletConfig::Merchant(merchant) => Box::new(mobile_wallet::MobileWalletClient::new(merchant)?),
        WalletConfig::Dummy(dummy_config) => Box::new(dummy::DummyWallet::from(dummy_config)),
    })
}

/// Result type for payment operations
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Errors that can occur while initiating or confirming a payment.
///
/// Each variant carries the machine-readable code the API returns.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Phone number is required for {0} payments")]
    PhoneNumberRequired(PaymentPlatform),

    #[error("Unsupported payment platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Credit package {0} not found")]
    PackageNotFound(String),

    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("No payment provider configured for {0}")]
    ProviderNotConfigured(PaymentPlatform),

    #[error("Wallet payment declined (code {code:?}): {message:?}")]
    WalletDeclined { code: Option<String>, message: Option<String> },

    #[error("Payment provider API error: {0}")]
    ProviderApi(String),

    #[error("Invalid payment data: {0}")]
    InvalidData(String),

    #[error("Webhook signature header is missing")]
    SignatureMissing,

    #[error("Webhook signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl PaymentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::PhoneNumberRequired(_) | PaymentError::UnsupportedPlatform(_) | PaymentError::InvalidData(_) => {
                StatusCode::BAD_REQUEST
            }
            PaymentError::SignatureMissing | PaymentError::SignatureInvalid(_) => StatusCode::BAD_REQUEST,
            PaymentError::PackageNotFound(_) | PaymentError::UserNotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::ProviderNotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            PaymentError::WalletDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            PaymentError::ProviderApi(_) => StatusCode::BAD_GATEWAY,
            PaymentError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::PhoneNumberRequired(_) => "PHONE_NUMBER_REQUIRED",
            PaymentError::UnsupportedPlatform(_) => "UNSUPPORTED_PAYMENT_PLATFORM",
            PaymentError::PackageNotFound(_) => "PACKAGE_NOT_FOUND",
            PaymentError::UserNotFound(_) => "USER_NOT_FOUND",
            PaymentError::ProviderNotConfigured(_) => "PAYMENT_PROVIDER_NOT_CONFIGURED",
            PaymentError::WalletDeclined { .. } => "WALLET_PAYMENT_FAILED",
            PaymentError::InvalidData(_) => "BAD_REQUEST",
            PaymentError::ProviderApi(_) | PaymentError::Database(_) => "PAYMENT_PROCESSING_ERROR",
            PaymentError::SignatureMissing => "WEBHOOK_SIGNATURE_MISSING",
            PaymentError::SignatureInvalid(_) => "WEBHOOK_SIGNATURE_INVALID",
        }
    }

    /// Message safe to show the customer
    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ProviderApi(_) | PaymentError::Database(_) => "Failed to process payment".to_string(),
            PaymentError::WalletDeclined { message, .. } => match message {
                Some(m) => format!("Mobile wallet payment failed: {m}"),
                None => "Mobile wallet payment failed".to_string(),
            },
            PaymentError::SignatureInvalid(_) => "Webhook signature verification failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Everything the hosted checkout page needs to render one order
#[derive(Debug, Clone)]
pub struct CheckoutRequest<'a> {
    pub order: &'a Order,
    pub package: &'a CreditPackage,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
    pub customer_email: Option<&'a str>,
}

/// A checkout session created at the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

/// Hosted checkout gateway
///
/// Implementors provide checkout sessions and webhook authentication for one
/// hosted card checkout provider.
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    /// Create a checkout session for an order.
    ///
    /// The session must carry the order id in its metadata so a webhook can be
    /// correlated even if the session reference was never persisted.
    async fn create_checkout_session(&self, request: CheckoutRequest<'_>) -> Result<CheckoutSession>;

    /// Authenticate a webhook delivery against the raw, unparsed body.
    ///
    /// Returns `SignatureMissing` or `SignatureInvalid`; nothing about the
    /// body is trusted until this succeeds.
    fn verify_webhook(&self, signature: Option<&str>, body: &[u8]) -> Result<()>;
}

/// One synchronous mobile wallet charge
#[derive(Debug, Clone)]
pub struct WalletCharge {
    pub order_id: OrderId,
    pub platform: PaymentPlatform,
    pub amount: Decimal,
    pub credits: i64,
    /// Payer account number (phone)
    pub phone: String,
}

/// Raw response from a wallet gateway
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletResponse {
    #[serde(default)]
    pub response_code: Option<String>,
    #[serde(default)]
    pub response_msg: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
}

/// Mobile wallet gateway
#[async_trait]
pub trait WalletGateway: Send + Sync {
    /// Charge the payer. Transport failures are errors; a declined charge is
    /// a successful call whose response classifies as failed.
    async fn charge(&self, charge: &WalletCharge) -> Result<WalletResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_response_tolerates_missing_fields() {
        let response: WalletResponse = serde_json::from_str(r#"{"responseCode":"2001"}"#).unwrap();
        assert_eq!(response.response_code.as_deref(), Some("2001"));
        assert_eq!(response.transaction_id, None);
    }

    #[test]
    fn test_provider_errors_hide_details() {
        let err = PaymentError::ProviderApi("stripe returned 500: internal".to_string());
        assert_eq!(err.code(), "PAYMENT_PROCESSING_ERROR");
        assert_eq!(err.user_message(), "Failed to process payment");
    }
}
