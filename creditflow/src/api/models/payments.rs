use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::payments::PaymentInitiated;
use crate::types::{OrderId, OrderStatus, PackageId};

/// Payment initiation request.
///
/// `platform` is a plain string so that an unknown value reaches the
/// initiator and is answered with `UNSUPPORTED_PAYMENT_PLATFORM`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCreate {
    #[schema(value_type = String, format = "uuid")]
    pub package_id: PackageId,
    /// One of `hosted_checkout`, `mobile_wallet_a`, `mobile_wallet_b`,
    /// `mobile_wallet_c`, `manual` (admins only), `deferred_bank`
    pub platform: String,
    /// Payer phone number, required for mobile wallets
    #[serde(default, alias = "phone")]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub success: bool,
    pub message: String,
    #[schema(value_type = String, format = "uuid")]
    pub order_id: OrderId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[schema(value_type = f64)]
    pub amount: Decimal,
    pub credits: i64,
    pub status: OrderStatus,
}

impl From<PaymentInitiated> for PaymentResponse {
    fn from(initiated: PaymentInitiated) -> Self {
        Self {
            success: true,
            message: initiated.message,
            order_id: initiated.order.id,
            session_id: initiated.session_id,
            redirect_url: initiated.redirect_url,
            transaction_id: initiated.transaction_id,
            amount: initiated.order.amount,
            credits: initiated.order.credits,
            status: initiated.order.status,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PaymentHistoryQuery {
    /// Maximum number of orders to return (default: 20, max: 100)
    #[serde(default)]
    pub limit: Option<i64>,
}

impl PaymentHistoryQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }
}

/// Acknowledgement returned to the checkout gateway
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookReceived {
    pub received: bool,
}
