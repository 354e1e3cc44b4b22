use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;
use crate::db::models::orders::Order;
use crate::types::{OrderId, OrderStatus, PackageId, PaymentPlatform, UserId};

/// An order as reported to its owner and to the back office
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: OrderId,
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    #[schema(value_type = String, format = "uuid")]
    pub package_id: PackageId,
    #[schema(value_type = f64)]
    pub amount: Decimal,
    pub credits: i64,
    pub platform: PaymentPlatform,
    pub status: OrderStatus,
    pub credits_added: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_session_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_transaction_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            package_id: order.package_id,
            amount: order.amount,
            credits: order.credits,
            platform: order.platform,
            status: order.status,
            credits_added: order.credits_added,
            external_session_ref: order.external_session_ref,
            external_transaction_ref: order.external_transaction_ref,
            failure_reason: order.failure_reason,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Query parameters for the admin order list
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListOrdersQuery {
    pub status: Option<OrderStatus>,
    pub platform: Option<PaymentPlatform>,
    /// Only orders placed by this user
    #[param(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,

    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,
}

/// Back-office grant of one package to a user
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ManualGrantCreate {
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    #[schema(value_type = String, format = "uuid")]
    pub package_id: PackageId,
}
