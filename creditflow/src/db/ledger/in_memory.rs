//! In-memory ledger implementation.
//!
//! All state lives behind a single `parking_lot::RwLock`, so every operation
//! (including the credit compare-and-set and the balance increment) happens
//! under one write guard and is atomic with respect to concurrent callers.
//! Data is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{Ledger, ORDER, PACKAGE, USER};
use crate::db::errors::{DbError, Result, Violation};
use crate::db::models::{
    orders::{BalanceChange, ClaimOutcome, CompletedOrderCreateDBRequest, CreditApplication, Order, OrderCreateDBRequest, OrderFilter, OrderPage},
    packages::{CreditPackage, PackageCreateDBRequest},
    users::{User, UserCreateDBRequest},
};
use crate::types::{OrderId, OrderStatus, PackageId, UserId};

#[derive(Default)]
struct State {
    packages: HashMap<PackageId, CreditPackage>,
    users: HashMap<UserId, User>,
    orders: HashMap<OrderId, Order>,
}

impl State {
    fn order_mut(&mut self, id: OrderId) -> Result<&mut Order> {
        self.orders.get_mut(&id).ok_or(DbError::not_found(ORDER))
    }

    fn check_references(&self, user_id: UserId, package_id: PackageId) -> Result<()> {
        if !self.users.contains_key(&user_id) {
            return Err(foreign_key_violation("orders_user_id_fkey"));
        }
        if !self.packages.contains_key(&package_id) {
            return Err(foreign_key_violation("orders_package_id_fkey"));
        }
        Ok(())
    }
}

fn foreign_key_violation(constraint: &str) -> DbError {
    DbError::ForeignKeyViolation(Violation::new(
        "orders",
        constraint,
        format!("insert on table \"orders\" violates foreign key constraint \"{constraint}\""),
    ))
}

/// Write-once semantics for gateway references: keep a non-empty value.
fn set_once(slot: &mut Option<String>, value: Option<&str>) {
    if slot.as_deref().is_some_and(|s| !s.is_empty()) {
        return;
    }
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        *slot = Some(v.to_string());
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<State>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders (test helper)
    pub fn order_count(&self) -> usize {
        self.state.read().orders.len()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_package(&self, request: &PackageCreateDBRequest) -> Result<CreditPackage> {
        let package = CreditPackage {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            price: request.price,
            credits: request.credits,
            bonus_credits: request.bonus_credits,
            is_active: request.is_active,
            created_at: Utc::now(),
        };
        self.state.write().packages.insert(package.id, package.clone());
        Ok(package)
    }

    async fn get_package(&self, id: PackageId) -> Result<Option<CreditPackage>> {
        Ok(self.state.read().packages.get(&id).cloned())
    }

    async fn list_active_packages(&self) -> Result<Vec<CreditPackage>> {
        let mut packages: Vec<_> = self.state.read().packages.values().filter(|p| p.is_active).cloned().collect();
        packages.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.name.cmp(&b.name)));
        Ok(packages)
    }

    async fn create_user(&self, request: &UserCreateDBRequest) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            email: request.email.clone(),
            display_name: request.display_name.clone(),
            credits: request.credits,
            created_at: Utc::now(),
        };
        self.state.write().users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.state.read().users.get(&id).cloned())
    }

    async fn create_order(&self, request: &OrderCreateDBRequest) -> Result<Order> {
        if request.status.is_terminal() {
            return Err(DbError::CheckViolation(Violation::new(
                "orders",
                "orders_initial_status",
                format!("orders cannot be created in status {}", request.status),
            )));
        }

        let mut state = self.state.write();
        state.check_references(request.user_id, request.package_id)?;

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            package_id: request.package_id,
            amount: request.amount,
            credits: request.credits,
            platform: request.platform,
            status: request.status,
            phone: request.phone.clone(),
            external_session_ref: None,
            external_transaction_ref: None,
            credits_added: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().orders.get(&id).cloned())
    }

    async fn find_order_by_session(&self, session_ref: &str) -> Result<Option<Order>> {
        if session_ref.is_empty() {
            return Ok(None);
        }
        Ok(self
            .state
            .read()
            .orders
            .values()
            .find(|o| o.external_session_ref.as_deref() == Some(session_ref))
            .cloned())
    }

    async fn mark_session_created(&self, id: OrderId, session_ref: &str) -> Result<Order> {
        let mut state = self.state.write();
        let order = state.order_mut(id)?;
        set_once(&mut order.external_session_ref, Some(session_ref));
        if order.status == OrderStatus::Pending {
            order.status = OrderStatus::Processing;
        }
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn mark_paid(&self, id: OrderId, transaction_ref: Option<&str>) -> Result<Order> {
        let mut state = self.state.write();
        let order = state.order_mut(id)?;
        set_once(&mut order.external_transaction_ref, transaction_ref);
        if order.status == OrderStatus::Pending {
            order.status = OrderStatus::Processing;
        }
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn mark_failed(&self, id: OrderId, reason: &str) -> Result<Order> {
        let mut state = self.state.write();
        let order = state.order_mut(id)?;
        if order.status.can_transition_to(OrderStatus::Failed) {
            order.status = OrderStatus::Failed;
            order.failure_reason = Some(reason.to_string());
            order.updated_at = Utc::now();
        }
        Ok(order.clone())
    }

    async fn note_declined_attempt(&self, id: OrderId, reason: &str) -> Result<Order> {
        let mut state = self.state.write();
        let order = state.order_mut(id)?;
        if !order.status.is_terminal() {
            order.failure_reason = Some(reason.to_string());
            order.updated_at = Utc::now();
        }
        Ok(order.clone())
    }

    async fn try_claim_for_crediting(&self, id: OrderId) -> Result<ClaimOutcome> {
        let state = self.state.read();
        let order = state.orders.get(&id).ok_or(DbError::not_found(ORDER))?;
        Ok(if order.credits_added {
            ClaimOutcome::AlreadyProcessed(order.clone())
        } else {
            ClaimOutcome::Claimable(order.clone())
        })
    }

    async fn apply_credits(&self, id: OrderId) -> Result<CreditApplication> {
        let mut state = self.state.write();

        let order = state.orders.get(&id).ok_or(DbError::not_found(ORDER))?;
        if order.credits_added {
            return Ok(CreditApplication::AlreadyApplied(order.clone()));
        }
        if order.status.is_terminal() {
            return Ok(CreditApplication::NotCreditable(order.clone()));
        }
        let (user_id, credits) = (order.user_id, order.credits);

        // Balance first so a missing user leaves the order untouched
        let user = state.users.get_mut(&user_id).ok_or(DbError::not_found(USER))?;
        let previous_balance = user.credits;
        user.credits += credits;
        let balance = BalanceChange {
            user_id,
            previous_balance,
            new_balance: user.credits,
            credits_added: credits,
        };

        let order = state.order_mut(id)?;
        order.credits_added = true;
        order.status = OrderStatus::Completed;
        order.updated_at = Utc::now();

        Ok(CreditApplication::Applied {
            order: order.clone(),
            balance,
        })
    }

    async fn create_completed_order(&self, request: &CompletedOrderCreateDBRequest) -> Result<(Order, BalanceChange)> {
        let mut state = self.state.write();
        if !state.packages.contains_key(&request.package_id) {
            return Err(DbError::not_found(PACKAGE));
        }
        let user = state.users.get_mut(&request.user_id).ok_or(DbError::not_found(USER))?;
        let previous_balance = user.credits;
        user.credits += request.credits;
        let balance = BalanceChange {
            user_id: request.user_id,
            previous_balance,
            new_balance: user.credits,
            credits_added: request.credits,
        };

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            package_id: request.package_id,
            amount: request.amount,
            credits: request.credits,
            platform: request.platform,
            status: OrderStatus::Completed,
            phone: None,
            external_session_ref: None,
            external_transaction_ref: Some(request.transaction_ref.clone()),
            credits_added: true,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(order.id, order.clone());
        Ok((order, balance))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<OrderPage> {
        let state = self.state.read();
        let mut matching: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| filter.user_id.is_none_or(|u| o.user_id == u))
            .filter(|o| filter.status.is_none_or(|s| o.status == s))
            .filter(|o| filter.platform.is_none_or(|p| o.platform == p))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = matching.len() as i64;
        let orders = matching
            .into_iter()
            .skip(filter.skip.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(OrderPage { orders, total })
    }

    async fn list_user_orders(&self, user_id: UserId, limit: i64) -> Result<Vec<Order>> {
        let filter = OrderFilter {
            user_id: Some(user_id),
            limit,
            ..Default::default()
        };
        Ok(self.list_orders(&filter).await?.orders)
    }
}
