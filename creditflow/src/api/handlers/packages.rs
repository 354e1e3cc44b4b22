//! HTTP handlers for the credit package catalog.

use axum::{Json, extract::State};

use crate::{AppState, api::models::packages::PackageResponse, errors::Result};

/// List active credit packages, cheapest first
#[utoipa::path(
    get,
    path = "/credit-packages",
    tag = "packages",
    summary = "List credit packages",
    responses(
        (status = 200, description = "Active packages", body = [PackageResponse]),
        (status = 500, description = "Internal server error"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_packages(State(state): State<AppState>) -> Result<Json<Vec<PackageResponse>>> {
    let packages = state.ledger.list_active_packages().await?;
    Ok(Json(packages.into_iter().map(PackageResponse::from).collect()))
}
