use futures::future::join_all;
use rstest::{fixture, rstest};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::Ledger;
use super::in_memory::InMemoryLedger;
use crate::db::errors::DbError;
use crate::db::models::{
    orders::{ClaimOutcome, CompletedOrderCreateDBRequest, CreditApplication, Order, OrderCreateDBRequest, OrderFilter},
    packages::{CreditPackage, PackageCreateDBRequest},
    users::{User, UserCreateDBRequest},
};
use crate::types::{OrderStatus, PaymentPlatform};

#[cfg(feature = "postgres-tests")]
use super::postgres::PostgresLedger;

#[fixture]
fn in_memory_ledger() -> InMemoryLedger {
    InMemoryLedger::new()
}

/// A $20 package worth 100 + 20 credits and a user holding 5 credits
async fn seed<L: Ledger>(ledger: &L) -> (User, CreditPackage) {
    let user = ledger
        .create_user(&UserCreateDBRequest {
            email: Some("buyer@example.com".to_string()),
            display_name: Some("Buyer".to_string()),
            credits: 5,
        })
        .await
        .unwrap();
    let package = ledger
        .create_package(&PackageCreateDBRequest {
            name: "Starter".to_string(),
            price: Decimal::new(2000, 2),
            credits: 100,
            bonus_credits: 20,
            is_active: true,
        })
        .await
        .unwrap();
    (user, package)
}

async fn new_order<L: Ledger>(ledger: &L, user: &User, package: &CreditPackage, platform: PaymentPlatform) -> Order {
    ledger
        .create_order(&OrderCreateDBRequest {
            user_id: user.id,
            package_id: package.id,
            amount: package.price,
            credits: package.total_credits(),
            platform,
            phone: None,
            status: OrderStatus::Pending,
        })
        .await
        .unwrap()
}

async fn balance<L: Ledger>(ledger: &L, user: &User) -> i64 {
    ledger.get_user(user.id).await.unwrap().unwrap().credits
}

async fn run_test_apply_credits_once<L: Ledger>(ledger: &L) {
    let (user, package) = seed(ledger).await;
    let order = new_order(ledger, &user, &package, PaymentPlatform::HostedCheckout).await;

    let first = ledger.apply_credits(order.id).await.unwrap();
    let CreditApplication::Applied { order: applied, balance: change } = first else {
        panic!("expected first application to apply, got {first:?}");
    };
    assert!(applied.credits_added);
    assert_eq!(applied.status, OrderStatus::Completed);
    assert_eq!(change.previous_balance, 5);
    assert_eq!(change.new_balance, 125);

    let second = ledger.apply_credits(order.id).await.unwrap();
    assert!(matches!(second, CreditApplication::AlreadyApplied(_)));
    assert_eq!(balance(ledger, &user).await, 125);

    let claim = ledger.try_claim_for_crediting(order.id).await.unwrap();
    assert!(matches!(claim, ClaimOutcome::AlreadyProcessed(_)));
}

#[rstest]
#[tokio::test]
async fn test_apply_credits_once(in_memory_ledger: InMemoryLedger) {
    run_test_apply_credits_once(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_apply_credits_once_postgres(pool: sqlx::PgPool) {
    run_test_apply_credits_once(&PostgresLedger::new(pool)).await;
}

async fn run_test_concurrent_apply_credits<L: Ledger>(ledger: &L) {
    let (user, package) = seed(ledger).await;
    let order = new_order(ledger, &user, &package, PaymentPlatform::HostedCheckout).await;

    let results = join_all((0..8).map(|_| ledger.apply_credits(order.id))).await;
    let applied = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| matches!(r, CreditApplication::Applied { .. }))
        .count();

    assert_eq!(applied, 1, "exactly one caller should win the compare-and-set");
    assert_eq!(balance(ledger, &user).await, 125);
}

#[rstest]
#[tokio::test]
async fn test_concurrent_apply_credits(in_memory_ledger: InMemoryLedger) {
    run_test_concurrent_apply_credits(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_concurrent_apply_credits_postgres(pool: sqlx::PgPool) {
    run_test_concurrent_apply_credits(&PostgresLedger::new(pool)).await;
}

async fn run_test_references_are_write_once<L: Ledger>(ledger: &L) {
    let (user, package) = seed(ledger).await;
    let order = new_order(ledger, &user, &package, PaymentPlatform::HostedCheckout).await;

    let order = ledger.mark_session_created(order.id, "cs_first").await.unwrap();
    assert_eq!(order.status, OrderStatus::Processing);
    let order = ledger.mark_session_created(order.id, "cs_second").await.unwrap();
    assert_eq!(order.external_session_ref.as_deref(), Some("cs_first"));

    let order = ledger.mark_paid(order.id, None).await.unwrap();
    assert_eq!(order.external_transaction_ref, None);
    let order = ledger.mark_paid(order.id, Some("pi_first")).await.unwrap();
    let order = ledger.mark_paid(order.id, Some("pi_second")).await.unwrap();
    assert_eq!(order.external_transaction_ref.as_deref(), Some("pi_first"));
    assert_eq!(order.status, OrderStatus::Processing);
    assert!(!order.credits_added);

    let found = ledger.find_order_by_session("cs_first").await.unwrap().unwrap();
    assert_eq!(found.id, order.id);
    assert!(ledger.find_order_by_session("cs_second").await.unwrap().is_none());
    assert!(ledger.find_order_by_session("").await.unwrap().is_none());
}

#[rstest]
#[tokio::test]
async fn test_references_are_write_once(in_memory_ledger: InMemoryLedger) {
    run_test_references_are_write_once(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_references_are_write_once_postgres(pool: sqlx::PgPool) {
    run_test_references_are_write_once(&PostgresLedger::new(pool)).await;
}

async fn run_test_terminal_states_do_not_move<L: Ledger>(ledger: &L) {
    let (user, package) = seed(ledger).await;

    let failed = new_order(ledger, &user, &package, PaymentPlatform::MobileWalletA).await;
    let failed = ledger.mark_failed(failed.id, "declined").await.unwrap();
    assert_eq!(failed.status, OrderStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("declined"));

    // A late success never resurrects a failed order
    let outcome = ledger.apply_credits(failed.id).await.unwrap();
    assert!(matches!(outcome, CreditApplication::NotCreditable(_)));
    assert_eq!(balance(ledger, &user).await, 5);

    let completed = new_order(ledger, &user, &package, PaymentPlatform::HostedCheckout).await;
    ledger.apply_credits(completed.id).await.unwrap();
    let still_completed = ledger.mark_failed(completed.id, "late failure").await.unwrap();
    assert_eq!(still_completed.status, OrderStatus::Completed);
    assert!(still_completed.credits_added);
    assert_eq!(still_completed.failure_reason, None);
}

#[rstest]
#[tokio::test]
async fn test_terminal_states_do_not_move(in_memory_ledger: InMemoryLedger) {
    run_test_terminal_states_do_not_move(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_terminal_states_do_not_move_postgres(pool: sqlx::PgPool) {
    run_test_terminal_states_do_not_move(&PostgresLedger::new(pool)).await;
}

async fn run_test_declined_attempt_keeps_order_open<L: Ledger>(ledger: &L) {
    let (user, package) = seed(ledger).await;
    let order = new_order(ledger, &user, &package, PaymentPlatform::HostedCheckout).await;

    let noted = ledger.note_declined_attempt(order.id, "Your card was declined.").await.unwrap();
    assert_eq!(noted.status, order.status);
    assert_eq!(noted.failure_reason.as_deref(), Some("Your card was declined."));

    // The retried attempt still pays out
    ledger.apply_credits(order.id).await.unwrap();
    assert_eq!(balance(ledger, &user).await, 125);

    let settled = ledger.note_declined_attempt(order.id, "late decline").await.unwrap();
    assert_eq!(settled.status, OrderStatus::Completed);
    assert_eq!(settled.failure_reason.as_deref(), Some("Your card was declined."));
}

#[rstest]
#[tokio::test]
async fn test_declined_attempt_keeps_order_open(in_memory_ledger: InMemoryLedger) {
    run_test_declined_attempt_keeps_order_open(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_declined_attempt_keeps_order_open_postgres(pool: sqlx::PgPool) {
    run_test_declined_attempt_keeps_order_open(&PostgresLedger::new(pool)).await;
}

async fn run_test_missing_order<L: Ledger>(ledger: &L) {
    let missing = Uuid::new_v4();
    assert!(ledger.get_order(missing).await.unwrap().is_none());
    assert!(matches!(
        ledger.apply_credits(missing).await,
        Err(DbError::NotFound { entity: "Order" })
    ));
    assert!(ledger.try_claim_for_crediting(missing).await.unwrap_err().is_not_found());
    assert!(ledger.mark_paid(missing, Some("pi")).await.unwrap_err().is_not_found());
}

#[rstest]
#[tokio::test]
async fn test_missing_order(in_memory_ledger: InMemoryLedger) {
    run_test_missing_order(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_missing_order_postgres(pool: sqlx::PgPool) {
    run_test_missing_order(&PostgresLedger::new(pool)).await;
}

async fn run_test_orders_cannot_start_terminal<L: Ledger>(ledger: &L) {
    let (user, package) = seed(ledger).await;
    let result = ledger
        .create_order(&OrderCreateDBRequest {
            user_id: user.id,
            package_id: package.id,
            amount: package.price,
            credits: package.total_credits(),
            platform: PaymentPlatform::Manual,
            phone: None,
            status: OrderStatus::Completed,
        })
        .await;
    assert!(matches!(result, Err(DbError::CheckViolation(_))));
}

#[rstest]
#[tokio::test]
async fn test_orders_cannot_start_terminal(in_memory_ledger: InMemoryLedger) {
    run_test_orders_cannot_start_terminal(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_orders_cannot_start_terminal_postgres(pool: sqlx::PgPool) {
    run_test_orders_cannot_start_terminal(&PostgresLedger::new(pool)).await;
}

async fn run_test_create_completed_order<L: Ledger>(ledger: &L) {
    let (user, package) = seed(ledger).await;
    let request = CompletedOrderCreateDBRequest::manual(user.id, package.id, package.price, package.total_credits());

    let (order, change) = ledger.create_completed_order(&request).await.unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
    assert!(order.credits_added);
    assert_eq!(order.platform, PaymentPlatform::Manual);
    assert!(order.external_transaction_ref.as_deref().unwrap().starts_with("MANUAL-"));
    assert_eq!(change.previous_balance, 5);
    assert_eq!(change.new_balance, 125);
    assert_eq!(balance(ledger, &user).await, 125);

    let unknown_user = CompletedOrderCreateDBRequest::manual(Uuid::new_v4(), package.id, package.price, 10);
    assert!(matches!(
        ledger.create_completed_order(&unknown_user).await,
        Err(DbError::NotFound { entity: "User" })
    ));
}

#[rstest]
#[tokio::test]
async fn test_create_completed_order(in_memory_ledger: InMemoryLedger) {
    run_test_create_completed_order(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_create_completed_order_postgres(pool: sqlx::PgPool) {
    run_test_create_completed_order(&PostgresLedger::new(pool)).await;
}

async fn run_test_list_orders_filters_and_pages<L: Ledger>(ledger: &L) {
    let (user, package) = seed(ledger).await;
    for _ in 0..3 {
        new_order(ledger, &user, &package, PaymentPlatform::HostedCheckout).await;
    }
    let wallet = new_order(ledger, &user, &package, PaymentPlatform::MobileWalletB).await;
    ledger.mark_failed(wallet.id, "declined").await.unwrap();

    let all = ledger
        .list_orders(&OrderFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.total, 4);
    assert_eq!(all.orders.len(), 4);

    let page = ledger
        .list_orders(&OrderFilter {
            platform: Some(PaymentPlatform::HostedCheckout),
            skip: 1,
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.orders.len(), 1);

    let failed = ledger
        .list_orders(&OrderFilter {
            status: Some(OrderStatus::Failed),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.total, 1);
    assert_eq!(failed.orders[0].id, wallet.id);

    let history = ledger.list_user_orders(user.id, 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].created_at >= history[1].created_at);
}

#[rstest]
#[tokio::test]
async fn test_list_orders_filters_and_pages(in_memory_ledger: InMemoryLedger) {
    run_test_list_orders_filters_and_pages(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_list_orders_filters_and_pages_postgres(pool: sqlx::PgPool) {
    run_test_list_orders_filters_and_pages(&PostgresLedger::new(pool)).await;
}

async fn run_test_catalog<L: Ledger>(ledger: &L) {
    let (_, starter) = seed(ledger).await;
    ledger
        .create_package(&PackageCreateDBRequest {
            name: "Retired".to_string(),
            price: Decimal::new(500, 2),
            credits: 10,
            bonus_credits: 0,
            is_active: false,
        })
        .await
        .unwrap();

    let active = ledger.list_active_packages().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, starter.id);
    assert_eq!(ledger.get_package(starter.id).await.unwrap().unwrap().total_credits(), 120);
}

#[rstest]
#[tokio::test]
async fn test_catalog(in_memory_ledger: InMemoryLedger) {
    run_test_catalog(&in_memory_ledger).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_catalog_postgres(pool: sqlx::PgPool) {
    run_test_catalog(&PostgresLedger::new(pool)).await;
}
