//! HTTP API: handlers and request/response models.
//!
//! - **Catalog** (`/api/v1/credit-packages`): active credit packages
//! - **Payments** (`/api/v1/payments/*`): initiation, history and the
//!   checkout webhook
//! - **Orders** (`/admin/api/v1/orders/*`): order reporting and manual grants
//!
//! All endpoints are documented with `utoipa`; the document is served at
//! `/openapi.json`.

pub mod handlers;
pub mod models;
