//! The order ledger: single source of truth for orders, the package catalog
//! and user balances.
//!
//! Both confirmation paths (the synchronous gateway response and the signed
//! webhook) write through this trait, which makes it the serialization point
//! for exactly-once crediting. The one operation that moves a balance for a
//! purchase, [`Ledger::apply_credits`], is a compare-and-set on
//! `credits_added` executed in the same storage transaction as the balance
//! increment.
//!
//! Two implementations are provided:
//!
//! - [`postgres::PostgresLedger`]: production backend
//! - [`in_memory::InMemoryLedger`]: single-process backend used by tests and
//!   local development
//!
//! Lookups return `Ok(None)` for a missing row. Mutations on a missing order
//! return [`DbError::NotFound`](crate::db::errors::DbError::NotFound) with
//! `entity = "Order"` (or `"User"` for the balance side of a credit).

use async_trait::async_trait;

use crate::db::errors::Result;
use crate::db::models::{
    orders::{ClaimOutcome, CompletedOrderCreateDBRequest, CreditApplication, Order, OrderCreateDBRequest, OrderFilter, OrderPage, BalanceChange},
    packages::{CreditPackage, PackageCreateDBRequest},
    users::{User, UserCreateDBRequest},
};
use crate::types::{OrderId, PackageId, UserId};

pub mod in_memory;
pub mod postgres;

#[cfg(test)]
mod tests;

pub const ORDER: &str = "Order";
pub const USER: &str = "User";
pub const PACKAGE: &str = "CreditPackage";

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_package(&self, request: &PackageCreateDBRequest) -> Result<CreditPackage>;

    async fn get_package(&self, id: PackageId) -> Result<Option<CreditPackage>>;

    /// Active packages, cheapest first
    async fn list_active_packages(&self) -> Result<Vec<CreditPackage>>;

    async fn create_user(&self, request: &UserCreateDBRequest) -> Result<User>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    /// Insert a new order in `Pending` or `Processing`.
    ///
    /// # Errors
    /// - `CheckViolation` if the request asks for a terminal initial status
    /// - `ForeignKeyViolation` if the user or package does not exist
    async fn create_order(&self, request: &OrderCreateDBRequest) -> Result<Order>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// Find the order a hosted-checkout session belongs to
    async fn find_order_by_session(&self, session_ref: &str) -> Result<Option<Order>>;

    /// Record the gateway session reference and move `Pending` to `Processing`.
    ///
    /// Idempotent: an already recorded reference is never overwritten.
    async fn mark_session_created(&self, id: OrderId, session_ref: &str) -> Result<Order>;

    /// Record that the gateway confirmed payment.
    ///
    /// Moves `Pending` to `Processing` (credit still owed) and records the
    /// transaction reference if none is recorded yet. Safe to call repeatedly
    /// with the same or different references: the first write wins.
    async fn mark_paid(&self, id: OrderId, transaction_ref: Option<&str>) -> Result<Order>;

    /// Move a non-terminal order to `Failed`. Terminal orders are returned
    /// unchanged.
    async fn mark_failed(&self, id: OrderId, reason: &str) -> Result<Order>;

    /// Record why a payment attempt was declined without settling the order.
    ///
    /// The buyer may still retry within the same checkout session, so the
    /// status is left alone. Terminal orders are returned unchanged.
    async fn note_declined_attempt(&self, id: OrderId, reason: &str) -> Result<Order>;

    /// Idempotency pre-check: report whether credits were already applied.
    ///
    /// This is advisory only. The authoritative guard is the compare-and-set
    /// inside [`Ledger::apply_credits`], so two racing callers that both see
    /// `Claimable` still credit the balance once.
    async fn try_claim_for_crediting(&self, id: OrderId) -> Result<ClaimOutcome>;

    /// Atomically flip `credits_added` from `false` to `true`, complete the
    /// order and increment the owner's balance by the order's fixed credits.
    ///
    /// # Errors
    /// - `NotFound { entity: "Order" }` if the order does not exist
    /// - `NotFound { entity: "User" }` if the owner does not exist; nothing
    ///   is changed in that case
    async fn apply_credits(&self, id: OrderId) -> Result<CreditApplication>;

    /// Insert an order that is already `Completed` with credits applied, and
    /// increment the balance, in one step. Reserved for trusted grants.
    async fn create_completed_order(&self, request: &CompletedOrderCreateDBRequest) -> Result<(Order, BalanceChange)>;

    /// Newest first, filtered and paged
    async fn list_orders(&self, filter: &OrderFilter) -> Result<OrderPage>;

    /// Payment history for one user, newest first
    async fn list_user_orders(&self, user_id: UserId, limit: i64) -> Result<Vec<Order>>;
}
