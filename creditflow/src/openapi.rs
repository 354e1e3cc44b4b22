//! OpenAPI document, served at `/openapi.json`.
//!
//! Customer endpoints live under `/api/v1`, back-office endpoints under
//! `/admin/api/v1`; both are nested into one [`ApiDoc`].

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::api;
use crate::api::models::{
    orders::{ManualGrantCreate, OrderResponse},
    packages::PackageResponse,
    pagination::PaginatedResponse,
    payments::{PaymentCreate, PaymentResponse, WebhookReceived},
};
use crate::errors::ErrorBody;
use crate::types::{OrderStatus, PaymentPlatform};

/// Identity header set by the trusted upstream proxy
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "X-Creditflow-User",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    crate::auth::USER_HEADER,
                    "Caller id set by the authenticating proxy. Back-office calls also carry `x-creditflow-role: admin`.",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    paths(
        api::handlers::packages::list_packages,
        api::handlers::payments::create_payment,
        api::handlers::payments::payment_history,
        api::handlers::webhooks::checkout_webhook,
    ),
    components(schemas(PackageResponse, PaymentCreate, PaymentResponse, OrderResponse, WebhookReceived, ErrorBody, OrderStatus, PaymentPlatform)),
    tags(
        (name = "packages", description = "Credit package catalog"),
        (name = "payments", description = "Payment initiation, history and gateway webhooks"),
    )
)]
pub struct PublicApiDoc;

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    paths(api::handlers::orders::list_orders, api::handlers::orders::create_manual_grant),
    components(schemas(OrderResponse, ManualGrantCreate, PaymentResponse, PaginatedResponse<OrderResponse>, ErrorBody)),
    tags((name = "orders", description = "Order reporting and manual grants"))
)]
pub struct AdminApiDoc;

#[derive(OpenApi)]
#[openapi(
    info(title = "creditflow", description = "Credit purchases and exactly-once credit fulfillment"),
    nest(
        (path = "/api/v1", api = PublicApiDoc),
        (path = "/admin/api/v1", api = AdminApiDoc),
    )
)]
pub struct ApiDoc;
