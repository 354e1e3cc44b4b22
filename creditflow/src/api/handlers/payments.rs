//! HTTP handlers for payment initiation and history.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    api::models::{
        orders::OrderResponse,
        payments::{PaymentCreate, PaymentHistoryQuery, PaymentResponse},
    },
    auth::CurrentUser,
    errors::{Error, Result},
    payments::PaymentRequest,
    types::PaymentPlatform,
};

/// Start a payment for one credit package
#[utoipa::path(
    post,
    path = "/payments",
    tag = "payments",
    summary = "Initiate a payment",
    description = "Creates an order and dispatches it to the requested payment platform. \
                   Hosted checkout returns a redirect URL; credits are added once the payment is confirmed.",
    request_body = PaymentCreate,
    responses(
        (status = 201, description = "Order created", body = PaymentResponse),
        (status = 400, description = "Unsupported platform or missing phone number", body = crate::errors::ErrorBody),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Mobile wallet declined the payment", body = crate::errors::ErrorBody),
        (status = 403, description = "Manual grants require the admin role"),
        (status = 404, description = "Package or user not found", body = crate::errors::ErrorBody),
        (status = 501, description = "No provider configured for the platform", body = crate::errors::ErrorBody),
        (status = 502, description = "Payment provider error", body = crate::errors::ErrorBody),
    ),
    security(("X-Creditflow-User" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %user.id))]
pub async fn create_payment(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(data): Json<PaymentCreate>,
) -> Result<(StatusCode, Json<PaymentResponse>)> {
    if matches!(data.platform.parse::<PaymentPlatform>(), Ok(PaymentPlatform::Manual)) && !user.is_admin {
        return Err(Error::Forbidden {
            message: "Manual payments can only be recorded by an admin".to_string(),
        });
    }

    let request = PaymentRequest {
        user_id: user.id,
        package_id: data.package_id,
        platform: data.platform,
        phone: data.phone_number,
        success_url: data.success_url,
        cancel_url: data.cancel_url,
    };
    let initiated = state.payments.initiate(&request).await?;

    Ok((StatusCode::CREATED, Json(PaymentResponse::from(initiated))))
}

/// The caller's orders, newest first
#[utoipa::path(
    get,
    path = "/payments/history",
    tag = "payments",
    summary = "Payment history",
    params(PaymentHistoryQuery),
    responses(
        (status = 200, description = "Orders placed by the caller", body = [OrderResponse]),
        (status = 401, description = "Unauthorized"),
    ),
    security(("X-Creditflow-User" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %user.id))]
pub async fn payment_history(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<PaymentHistoryQuery>,
) -> Result<Json<Vec<OrderResponse>>> {
    let orders = state.ledger.list_user_orders(user.id, query.limit()).await?;
    Ok(Json(orders.into_iter().map(OrderResponse::from).collect()))
}
