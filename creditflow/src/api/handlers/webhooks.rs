//! HTTP handler for the hosted checkout webhook.
//!
//! The body is taken as raw bytes: the signature covers the exact bytes the
//! gateway sent, so nothing may parse or re-encode them first.

use axum::{Json, body::Bytes, extract::State, http::HeaderMap};

use crate::{AppState, api::models::payments::WebhookReceived, errors::Result};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Receive a checkout event
#[utoipa::path(
    post,
    path = "/payments/webhook",
    tag = "payments",
    summary = "Checkout webhook",
    description = "Signed event from the hosted checkout gateway. Events that match no order are acknowledged.",
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Event acknowledged", body = WebhookReceived),
        (status = 400, description = "Signature missing or invalid", body = crate::errors::ErrorBody),
        (status = 500, description = "Event could not be recorded; the gateway should redeliver"),
        (status = 501, description = "No checkout gateway configured"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn checkout_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<WebhookReceived>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok());

    let ack = state.webhooks.handle(signature, &body).await?;
    tracing::debug!(ack = ack.as_str(), "Checkout webhook handled");

    Ok(Json(WebhookReceived { received: true }))
}
