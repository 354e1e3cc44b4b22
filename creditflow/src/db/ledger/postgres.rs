//! PostgreSQL ledger implementation.
//!
//! Enum columns are stored as TEXT with CHECK constraints and mapped back
//! through `FromStr`; a value the domain does not know surfaces as
//! [`DbError::Corrupt`] instead of a panic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use super::{Ledger, ORDER, PACKAGE, USER};
use crate::db::errors::{DbError, Result, Violation};
use crate::db::models::{
    orders::{BalanceChange, ClaimOutcome, CompletedOrderCreateDBRequest, CreditApplication, Order, OrderCreateDBRequest, OrderFilter, OrderPage},
    packages::{CreditPackage, PackageCreateDBRequest},
    users::{User, UserCreateDBRequest},
};
use crate::types::{OrderId, PackageId, UserId, abbrev_uuid};

const ORDER_COLUMNS: &str = "id, user_id, package_id, amount, credits, platform, status, phone, \
     external_session_ref, external_transaction_ref, credits_added, failure_reason, created_at, updated_at";

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    package_id: Uuid,
    amount: Decimal,
    credits: i64,
    platform: String,
    status: String,
    phone: Option<String>,
    external_session_ref: Option<String>,
    external_transaction_ref: Option<String>,
    credits_added: bool,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = DbError;

    fn try_from(row: OrderRow) -> Result<Self> {
        let corrupt = |reason: String| DbError::Corrupt { entity: ORDER, reason };
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            package_id: row.package_id,
            amount: row.amount,
            credits: row.credits,
            platform: row.platform.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            phone: row.phone,
            external_session_ref: row.external_session_ref,
            external_transaction_ref: row.external_transaction_ref,
            credits_added: row.credits_added,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PackageRow {
    id: Uuid,
    name: String,
    price: Decimal,
    credits: i64,
    bonus_credits: i64,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<PackageRow> for CreditPackage {
    fn from(row: PackageRow) -> Self {
        CreditPackage {
            id: row.id,
            name: row.name,
            price: row.price,
            credits: row.credits,
            bonus_credits: row.bonus_credits,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: Option<String>,
    display_name: Option<String>,
    credits: i64,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            display_name: row.display_name,
            credits: row.credits,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_order<'e, E>(executor: E, id: OrderId) -> Result<Option<Order>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    /// Re-read an order after a conditional update matched nothing
    async fn require_order(&self, id: OrderId) -> Result<Order> {
        Self::fetch_order(&self.pool, id).await?.ok_or(DbError::not_found(ORDER))
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    #[instrument(skip(self, request), fields(name = %request.name), err)]
    async fn create_package(&self, request: &PackageCreateDBRequest) -> Result<CreditPackage> {
        let row = sqlx::query_as::<_, PackageRow>(
            r#"
            INSERT INTO credit_packages (id, name, price, credits, bonus_credits, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, price, credits, bonus_credits, is_active, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(request.price)
        .bind(request.credits)
        .bind(request.bonus_credits)
        .bind(request.is_active)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_package(&self, id: PackageId) -> Result<Option<CreditPackage>> {
        let row = sqlx::query_as::<_, PackageRow>(
            "SELECT id, name, price, credits, bonus_credits, is_active, created_at FROM credit_packages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_active_packages(&self) -> Result<Vec<CreditPackage>> {
        let rows = sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT id, name, price, credits, bonus_credits, is_active, created_at
            FROM credit_packages
            WHERE is_active
            ORDER BY price ASC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, request), err)]
    async fn create_user(&self, request: &UserCreateDBRequest) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, email, display_name, credits)
            VALUES ($1, $2, $3, $4)
            RETURNING id, email, display_name, credits, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.email)
        .bind(&request.display_name)
        .bind(request.credits)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT id, email, display_name, credits, created_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), platform = %request.platform), err)]
    async fn create_order(&self, request: &OrderCreateDBRequest) -> Result<Order> {
        if request.status.is_terminal() {
            return Err(DbError::CheckViolation(Violation::new(
                "orders",
                "orders_initial_status",
                format!("orders cannot be created in status {}", request.status),
            )));
        }

        let sql = format!(
            r#"
            INSERT INTO orders (id, user_id, package_id, amount, credits, platform, status, phone)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {ORDER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(request.user_id)
            .bind(request.package_id)
            .bind(request.amount)
            .bind(request.credits)
            .bind(request.platform.as_str())
            .bind(request.status.as_str())
            .bind(&request.phone)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Self::fetch_order(&self.pool, id).await
    }

    async fn find_order_by_session(&self, session_ref: &str) -> Result<Option<Order>> {
        if session_ref.is_empty() {
            return Ok(None);
        }
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE external_session_ref = $1");
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(session_ref)
            .fetch_optional(&self.pool)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    async fn mark_session_created(&self, id: OrderId, session_ref: &str) -> Result<Order> {
        let sql = format!(
            r#"
            UPDATE orders SET
                external_session_ref = COALESCE(NULLIF(external_session_ref, ''), NULLIF($2, '')),
                status = CASE WHEN status = 'pending' THEN 'processing' ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ORDER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .bind(session_ref)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::not_found(ORDER))?
            .try_into()
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    async fn mark_paid(&self, id: OrderId, transaction_ref: Option<&str>) -> Result<Order> {
        let sql = format!(
            r#"
            UPDATE orders SET
                external_transaction_ref = COALESCE(NULLIF(external_transaction_ref, ''), NULLIF($2, '')),
                status = CASE WHEN status = 'pending' THEN 'processing' ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ORDER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .bind(transaction_ref)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::not_found(ORDER))?
            .try_into()
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    async fn mark_failed(&self, id: OrderId, reason: &str) -> Result<Order> {
        let sql = format!(
            r#"
            UPDATE orders SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing') AND NOT credits_added
            RETURNING {ORDER_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(row) => row.try_into(),
            None => self.require_order(id).await,
        }
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    async fn note_declined_attempt(&self, id: OrderId, reason: &str) -> Result<Order> {
        let sql = format!(
            r#"
            UPDATE orders SET failure_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING {ORDER_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(row) => row.try_into(),
            None => self.require_order(id).await,
        }
    }

    async fn try_claim_for_crediting(&self, id: OrderId) -> Result<ClaimOutcome> {
        let order = self.require_order(id).await?;
        Ok(if order.credits_added {
            ClaimOutcome::AlreadyProcessed(order)
        } else {
            ClaimOutcome::Claimable(order)
        })
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    async fn apply_credits(&self, id: OrderId) -> Result<CreditApplication> {
        let mut tx = self.pool.begin().await?;

        // Compare-and-set: only one transaction can flip the flag
        let sql = format!(
            r#"
            UPDATE orders SET credits_added = TRUE, status = 'completed', updated_at = NOW()
            WHERE id = $1 AND NOT credits_added AND status IN ('pending', 'processing')
            RETURNING {ORDER_COLUMNS}
            "#
        );
        let claimed = sqlx::query_as::<_, OrderRow>(&sql).bind(id).fetch_optional(&mut *tx).await?;

        let order: Order = match claimed {
            Some(row) => row.try_into()?,
            None => {
                tx.rollback().await?;
                let order = self.require_order(id).await?;
                return Ok(if order.credits_added {
                    CreditApplication::AlreadyApplied(order)
                } else {
                    CreditApplication::NotCreditable(order)
                });
            }
        };

        let new_balance: Option<i64> = sqlx::query_scalar("UPDATE users SET credits = credits + $2 WHERE id = $1 RETURNING credits")
            .bind(order.user_id)
            .bind(order.credits)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(new_balance) = new_balance else {
            tx.rollback().await?;
            return Err(DbError::not_found(USER));
        };

        tx.commit().await?;

        let balance = BalanceChange {
            user_id: order.user_id,
            previous_balance: new_balance - order.credits,
            new_balance,
            credits_added: order.credits,
        };
        Ok(CreditApplication::Applied { order, balance })
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), credits = request.credits), err)]
    async fn create_completed_order(&self, request: &CompletedOrderCreateDBRequest) -> Result<(Order, BalanceChange)> {
        let mut tx = self.pool.begin().await?;

        let package_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM credit_packages WHERE id = $1)")
            .bind(request.package_id)
            .fetch_one(&mut *tx)
            .await?;
        if !package_exists {
            return Err(DbError::not_found(PACKAGE));
        }

        let new_balance: Option<i64> = sqlx::query_scalar("UPDATE users SET credits = credits + $2 WHERE id = $1 RETURNING credits")
            .bind(request.user_id)
            .bind(request.credits)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(new_balance) = new_balance else {
            return Err(DbError::not_found(USER));
        };

        let sql = format!(
            r#"
            INSERT INTO orders (
                id, user_id, package_id, amount, credits, platform, status,
                external_transaction_ref, credits_added
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'completed', $7, TRUE)
            RETURNING {ORDER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(request.user_id)
            .bind(request.package_id)
            .bind(request.amount)
            .bind(request.credits)
            .bind(request.platform.as_str())
            .bind(&request.transaction_ref)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        let balance = BalanceChange {
            user_id: request.user_id,
            previous_balance: new_balance - request.credits,
            new_balance,
            credits_added: request.credits,
        };
        Ok((row.try_into()?, balance))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<OrderPage> {
        let status = filter.status.map(|s| s.as_str());
        let platform = filter.platform.map(|p| p.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM orders
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR platform = $3)
            "#,
        )
        .bind(filter.user_id)
        .bind(status)
        .bind(platform)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR platform = $3)
            ORDER BY created_at DESC, id DESC
            OFFSET $4 LIMIT $5
            "#
        );
        let rows = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(filter.user_id)
            .bind(status)
            .bind(platform)
            .bind(filter.skip.max(0))
            .bind(filter.limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        let orders = rows.into_iter().map(Order::try_from).collect::<Result<Vec<_>>>()?;
        Ok(OrderPage { orders, total })
    }

    async fn list_user_orders(&self, user_id: UserId, limit: i64) -> Result<Vec<Order>> {
        let sql = format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(user_id)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Order::try_from).collect()
    }
}
