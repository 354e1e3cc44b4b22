//! HTTP handlers for back-office order endpoints.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    api::models::{
        orders::{ListOrdersQuery, ManualGrantCreate, OrderResponse},
        pagination::PaginatedResponse,
        payments::PaymentResponse,
    },
    auth::AdminUser,
    db::models::orders::OrderFilter,
    errors::Result,
    payments::PaymentRequest,
    types::PaymentPlatform,
};

/// List orders, newest first
#[utoipa::path(
    get,
    path = "/orders",
    tag = "orders",
    summary = "List orders",
    params(ListOrdersQuery),
    responses(
        (status = 200, description = "A page of orders", body = PaginatedResponse<OrderResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin role required"),
    ),
    security(("X-Creditflow-User" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<PaginatedResponse<OrderResponse>>> {
    let filter = OrderFilter {
        user_id: query.user_id,
        status: query.status,
        platform: query.platform,
        skip: query.pagination.skip(),
        limit: query.pagination.limit(),
    };

    let ledger = state.ledger.clone();
    let page = state.order_cache.get_or_load(&filter, || async { ledger.list_orders(&filter).await }).await?;

    Ok(Json(PaginatedResponse::new(
        page.orders.into_iter().map(OrderResponse::from).collect(),
        page.total,
        filter.skip,
        filter.limit,
    )))
}

/// Grant a package's credits to a user without payment
#[utoipa::path(
    post,
    path = "/orders/manual",
    tag = "orders",
    summary = "Manual credit grant",
    description = "Records a completed manual order and adds its credits immediately.",
    request_body = ManualGrantCreate,
    responses(
        (status = 201, description = "Credits granted", body = PaymentResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Package or user not found", body = crate::errors::ErrorBody),
    ),
    security(("X-Creditflow-User" = []))
)]
#[tracing::instrument(skip_all, fields(admin_id = %admin.0.id))]
pub async fn create_manual_grant(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(data): Json<ManualGrantCreate>,
) -> Result<(StatusCode, Json<PaymentResponse>)> {
    let request = PaymentRequest {
        user_id: data.user_id,
        package_id: data.package_id,
        platform: PaymentPlatform::Manual.as_str().to_string(),
        phone: None,
        success_url: None,
        cancel_url: None,
    };
    let initiated = state.payments.initiate(&request).await?;

    Ok((StatusCode::CREATED, Json(PaymentResponse::from(initiated))))
}
