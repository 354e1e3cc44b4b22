//! Database models for orders.

use crate::types::{OrderId, OrderStatus, PackageId, PaymentPlatform, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One attempt to purchase a credit package.
///
/// `amount` and `credits` are fixed when the order is created. The external
/// references are write-once: the first non-empty value sticks.
/// `credits_added` only ever moves from `false` to `true`, and implies
/// `status == Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub package_id: PackageId,
    pub amount: Decimal,
    pub credits: i64,
    pub platform: PaymentPlatform,
    pub status: OrderStatus,
    pub phone: Option<String>,
    pub external_session_ref: Option<String>,
    pub external_transaction_ref: Option<String>,
    pub credits_added: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Database request for creating a new order through a gateway
#[derive(Debug, Clone)]
pub struct OrderCreateDBRequest {
    pub user_id: UserId,
    pub package_id: PackageId,
    pub amount: Decimal,
    pub credits: i64,
    pub platform: PaymentPlatform,
    pub phone: Option<String>,
    /// Initial state; the ledger only accepts `Pending` or `Processing` here
    pub status: OrderStatus,
}

/// Database request for an order that is paid and credited in one step
#[derive(Debug, Clone)]
pub struct CompletedOrderCreateDBRequest {
    pub user_id: UserId,
    pub package_id: PackageId,
    pub amount: Decimal,
    pub credits: i64,
    pub platform: PaymentPlatform,
    pub transaction_ref: String,
}

impl CompletedOrderCreateDBRequest {
    /// Back-office grant with a generated `MANUAL-` transaction reference
    pub fn manual(user_id: UserId, package_id: PackageId, amount: Decimal, credits: i64) -> Self {
        Self {
            user_id,
            package_id,
            amount,
            credits,
            platform: PaymentPlatform::Manual,
            transaction_ref: format!("MANUAL-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

/// Filter for listing orders
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OrderFilter {
    pub user_id: Option<UserId>,
    pub status: Option<OrderStatus>,
    pub platform: Option<PaymentPlatform>,
    pub skip: i64,
    pub limit: i64,
}

/// Result of the idempotency pre-check on an order
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Credits were applied by an earlier run
    AlreadyProcessed(Order),
    /// Credits are still owed
    Claimable(Order),
}

/// Balance movement recorded when credits are applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub user_id: UserId,
    pub previous_balance: i64,
    pub new_balance: i64,
    pub credits_added: i64,
}

/// Result of the compare-and-set credit application
#[derive(Debug, Clone, PartialEq)]
pub enum CreditApplication {
    /// This call flipped `credits_added` and moved the balance
    Applied { order: Order, balance: BalanceChange },
    /// Another run got there first; nothing changed
    AlreadyApplied(Order),
    /// The order is in a terminal state that does not owe credits
    NotCreditable(Order),
}

/// A paged slice of orders plus the total matching the filter
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub total: i64,
}
