//! # creditflow: credit purchases with exactly-once fulfillment
//!
//! `creditflow` sells prepaid credit packages. A purchase creates an order in
//! the ledger, hands the customer off to a payment gateway, and credits the
//! account once the gateway confirms payment.
//!
//! ## Architecture
//!
//! - **Payment initiation** ([`payments::PaymentInitiator`]): validates the
//!   request and dispatches on the payment platform. Hosted checkout opens a
//!   gateway session; mobile wallets are charged synchronously; manual grants
//!   are credited directly by an admin; deferred bank transfers wait for an
//!   out-of-band confirmation.
//! - **Webhook ingress** ([`payments::ingress::WebhookIngress`]): verifies the
//!   gateway's signature, classifies the event, and moves the order. Paid
//!   orders are handed to fulfillment.
//! - **Fulfillment** ([`fulfillment`]): a durable job queue and worker that
//!   apply an order's credits. Jobs may run more than once; the ledger's
//!   compare-and-set on `credits_added` makes the balance change exactly once.
//! - **Ledger** ([`db::ledger::Ledger`]): Postgres-backed storage for users,
//!   packages and orders, with an in-memory implementation for tests.
//!
//! ## Request flow
//!
//! ```text
//! POST /api/v1/payments ──► PaymentInitiator ──► order (pending/processing)
//!                                 │
//!                                 └─► checkout session / wallet charge
//!
//! POST /api/v1/payments/webhook ──► WebhookIngress ──► order paid
//!                                                          │
//!                                     FulfillmentTrigger ◄─┘
//!                                          │
//!                             FulfillmentWorker ──► Ledger::apply_credits
//! ```
//!
//! Identity comes from headers set by the authenticating proxy in front of
//! the service; see [`auth`].

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod fulfillment;
pub mod metrics;
pub mod notifications;
pub mod openapi;
pub mod payment_providers;
pub mod payments;
pub mod telemetry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

use std::sync::Arc;

use axum::{
    Json, Router,
    routing::{get, post},
};
use bon::Builder;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};
use utoipa::OpenApi;

pub use config::Config;

use crate::{
    api::handlers::{orders, packages, payments as payment_handlers, webhooks},
    cache::{CacheInvalidator, OrderListCache},
    db::ledger::{Ledger, postgres::PostgresLedger},
    errors::Error,
    fulfillment::{CreditFulfillment, FulfillmentWorker, JobQueue, QueueTrigger, queue::PostgresJobQueue},
    notifications::{EmailNotifier, LogNotifier, Notifier},
    openapi::ApiDoc,
    payment_providers::{CheckoutGateway, WalletGateway, create_checkout_gateway, create_wallet_gateway},
    payments::{PaymentInitiator, ingress::WebhookIngress},
};

/// Shared state handed to every handler
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub ledger: Arc<dyn Ledger>,
    pub payments: Arc<PaymentInitiator>,
    pub webhooks: Arc<WebhookIngress>,
    pub order_cache: OrderListCache,
}

/// Get the database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Wire the payment paths and the fulfillment worker over the given storage.
///
/// The worker is returned unstarted: [`Application`] spawns it, tests drive
/// it by hand.
pub fn build_services(
    config: &Config,
    ledger: Arc<dyn Ledger>,
    queue: Arc<dyn JobQueue>,
) -> anyhow::Result<(AppState, Arc<FulfillmentWorker>)> {
    let checkout: Option<Arc<dyn CheckoutGateway>> = config.payment.checkout.clone().map(create_checkout_gateway).map(Arc::from);
    let wallet: Option<Arc<dyn WalletGateway>> = config.payment.wallet.clone().map(create_wallet_gateway).transpose()?.map(Arc::from);

    let notifier: Arc<dyn Notifier> = match &config.email {
        Some(email) => Arc::new(EmailNotifier::new(email, &config.dashboard_url)?),
        None => {
            info!("No email transport configured, payment confirmations will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let order_cache = OrderListCache::new(&config.cache);
    let invalidator: Arc<dyn CacheInvalidator> = Arc::new(order_cache.clone());

    let wake = Arc::new(Notify::new());
    let trigger = Arc::new(QueueTrigger::new(queue.clone(), config.fulfillment.max_attempts, wake.clone()));
    let fulfillment = Arc::new(CreditFulfillment::new(ledger.clone(), notifier, invalidator.clone()));
    let worker = Arc::new(FulfillmentWorker::new(queue, fulfillment, config.fulfillment.clone(), wake));

    let payments = PaymentInitiator::builder()
        .ledger(ledger.clone())
        .maybe_checkout(checkout.clone())
        .maybe_wallet(wallet)
        .fulfillment(trigger.clone())
        .cache(invalidator.clone())
        .success_url(config.success_url())
        .cancel_url(config.cancel_url())
        .build();

    let webhooks = WebhookIngress::new(ledger.clone(), checkout, trigger, invalidator);

    let state = AppState::builder()
        .config(config.clone())
        .ledger(ledger)
        .payments(Arc::new(payments))
        .webhooks(Arc::new(webhooks))
        .order_cache(order_cache)
        .build();

    Ok((state, worker))
}

async fn metrics_handler() -> Result<String, Error> {
    metrics::render().map_err(|e| Error::Internal {
        operation: format!("render metrics: {e}"),
    })
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/credit-packages", get(packages::list_packages))
        .route("/payments", post(payment_handlers::create_payment))
        .route("/payments/history", get(payment_handlers::payment_history))
        .route("/payments/webhook", post(webhooks::checkout_webhook));

    let admin = Router::new()
        .route("/orders", get(orders::list_orders))
        .route("/orders/manual", post(orders::create_manual_grant));

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .nest("/api/v1", public)
        .nest("/admin/api/v1", admin);

    if state.config.enable_metrics {
        router = router.route("/internal/metrics", get(metrics_handler));
    }

    router.with_state(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(config.database.acquire_timeout)
        .connect(&config.database.url)
        .await?;

    if config.database.run_migrations {
        info!("Running database migrations");
        migrator().run(&pool).await?;
    }

    Ok(pool)
}

/// Tasks that run alongside the HTTP server
pub struct BackgroundServices {
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl BackgroundServices {
    /// Cancel every task and wait for it to finish its current batch
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn start_background_services(config: &Config, worker: Arc<FulfillmentWorker>) -> BackgroundServices {
    let shutdown_token = CancellationToken::new();
    let mut background_tasks = Vec::new();

    if config.fulfillment.enabled {
        background_tasks.push(tokio::spawn(worker.run(shutdown_token.clone())));
    } else {
        info!("Fulfillment worker disabled; paid orders will queue until a worker runs");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
    }
}

pub struct Application {
    router: Router,
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting creditflow with configuration: {:#?}", config);

        let pool = setup_database(&config).await?;

        let ledger = Arc::new(PostgresLedger::new(pool.clone()));
        let queue = Arc::new(PostgresJobQueue::new(pool.clone()));
        let (state, worker) = build_services(&config, ledger, queue)?;

        let bg_services = start_background_services(&config, worker);
        let router = build_router(state);

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
        })
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "creditflow listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        Ok(())
    }
}
